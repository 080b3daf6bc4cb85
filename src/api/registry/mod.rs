pub mod blobs;
pub mod catalog;
pub mod manifests;
pub mod uploads;

use std::str::FromStr;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use uuid::Uuid;

use crate::api::AppState;
use crate::auth::{bearer_challenge, Authorization, Scope};
use crate::auth::token::validate_token;
use crate::errors::{RegistryError, RegistryErrorCode, RegistryResult};
use crate::models::{is_valid_account_name, is_valid_repository_name};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v2/", get(api_version_check))
        .route("/v2/*rest", any(dispatch))
}

/// The repository part of a /v2 URL: `<account>/<repo>` where the repo may
/// itself contain slashes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoPath {
    pub account_name: String,
    pub repo_name: String,
}

impl RepoPath {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.account_name, self.repo_name)
    }
}

/// All shapes a /v2 path can take. Repository names may contain slashes, so
/// the standard per-segment routing cannot express these; we parse by hand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum V2Path {
    Catalog,
    UploadStart { repo: RepoPath },
    Upload { repo: RepoPath, upload_uuid: Uuid },
    Blob { repo: RepoPath, digest: String },
    Manifest { repo: RepoPath, reference: String },
    TagList { repo: RepoPath },
}

/// Parses the path below `/v2/`. The keyword (`blobs`, `manifests`, `tags`)
/// is searched from the right, since repository path components may collide
/// with the keywords themselves.
pub fn parse_v2_path(rest: &str) -> Option<V2Path> {
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    if rest == "_catalog" {
        return Some(V2Path::Catalog);
    }
    let segments: Vec<&str> = rest.split('/').collect();

    let repo_at = |keyword_index: usize| -> Option<RepoPath> {
        // Everything left of the keyword is `<account>/<repo...>`.
        if keyword_index < 2 {
            return None;
        }
        let account_name = segments[0].to_string();
        let repo_name = segments[1..keyword_index].join("/");
        if !is_valid_account_name(&account_name) || !is_valid_repository_name(&repo_name) {
            return None;
        }
        Some(RepoPath { account_name, repo_name })
    };

    for keyword_index in (0..segments.len()).rev() {
        match segments[keyword_index] {
            "blobs" => {
                let tail = &segments[keyword_index + 1..];
                match tail {
                    ["uploads"] => {
                        return repo_at(keyword_index).map(|repo| V2Path::UploadStart { repo })
                    }
                    ["uploads", raw_uuid] => {
                        let upload_uuid = Uuid::from_str(raw_uuid).ok()?;
                        return repo_at(keyword_index)
                            .map(|repo| V2Path::Upload { repo, upload_uuid });
                    }
                    [digest] => {
                        return repo_at(keyword_index).map(|repo| V2Path::Blob {
                            repo,
                            digest: digest.to_string(),
                        })
                    }
                    _ => continue,
                }
            }
            "manifests" => {
                if let [reference] = &segments[keyword_index + 1..] {
                    return repo_at(keyword_index).map(|repo| V2Path::Manifest {
                        repo,
                        reference: reference.to_string(),
                    });
                }
            }
            "tags" => {
                if let ["list"] = &segments[keyword_index + 1..] {
                    return repo_at(keyword_index).map(|repo| V2Path::TagList { repo });
                }
            }
            _ => {}
        }
    }
    None
}

/// GET /v2/ — the version check. Clients use the 401 challenge on this
/// endpoint to discover the token endpoint.
async fn api_version_check(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match authorize(&state, &headers, &[]).await {
        Ok(_) => (
            StatusCode::OK,
            [("Docker-Distribution-Api-Version", "registry/2.0")],
            "{}",
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let rest = uri.path().trim_start_matches("/v2/").to_string();
    let Some(path) = parse_v2_path(&rest) else {
        return RegistryError::new(RegistryErrorCode::NameInvalid).into_response();
    };
    let query = uri.query().unwrap_or("");

    let result: RegistryResult<Response> = match (path, method) {
        (V2Path::Catalog, Method::GET) => catalog::get_catalog(&state, &headers, query).await,
        (V2Path::TagList { repo }, Method::GET) => {
            catalog::get_tag_list(&state, &headers, &repo, query).await
        }
        (V2Path::UploadStart { repo }, Method::POST) => {
            uploads::start_upload(&state, &headers, &repo, query, body).await
        }
        (V2Path::Upload { repo, upload_uuid }, Method::PATCH) => {
            uploads::append_chunk(&state, &headers, &repo, upload_uuid, body).await
        }
        (V2Path::Upload { repo, upload_uuid }, Method::PUT) => {
            uploads::finish_upload(&state, &headers, &repo, upload_uuid, query, body).await
        }
        (V2Path::Upload { repo, upload_uuid }, Method::GET) => {
            uploads::get_upload_status(&state, &headers, &repo, upload_uuid).await
        }
        (V2Path::Upload { repo, upload_uuid }, Method::DELETE) => {
            uploads::abort_upload(&state, &headers, &repo, upload_uuid).await
        }
        (V2Path::Blob { repo, digest }, Method::GET) => {
            blobs::get_blob(&state, &headers, &repo, &digest, false).await
        }
        (V2Path::Blob { repo, digest }, Method::HEAD) => {
            blobs::get_blob(&state, &headers, &repo, &digest, true).await
        }
        (V2Path::Blob { repo, digest }, Method::DELETE) => {
            blobs::delete_blob(&state, &headers, &repo, &digest).await
        }
        (V2Path::Manifest { repo, reference }, Method::GET) => {
            manifests::get_manifest(&state, &headers, &repo, &reference, false).await
        }
        (V2Path::Manifest { repo, reference }, Method::HEAD) => {
            manifests::get_manifest(&state, &headers, &repo, &reference, true).await
        }
        (V2Path::Manifest { repo, reference }, Method::PUT) => {
            manifests::put_manifest(&state, &headers, &repo, &reference, body).await
        }
        (V2Path::Manifest { repo, reference }, Method::DELETE) => {
            manifests::delete_manifest(&state, &headers, &repo, &reference).await
        }
        _ => Err(RegistryError::new(RegistryErrorCode::Unsupported)),
    };

    result.unwrap_or_else(IntoResponse::into_response)
}

/// Validates the bearer token and requires every listed scope to be fully
/// granted. Missing or insufficient tokens get a 401 whose challenge mirrors
/// the scopes, so clients know what to request from the token endpoint.
pub(crate) async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    required_scopes: &[Scope],
) -> RegistryResult<Authorization> {
    let config = &state.config;
    let challenge = || {
        bearer_challenge(
            &config.api_public_hostname,
            &config.api_public_hostname,
            required_scopes,
        )
    };

    let raw_token = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| RegistryError::unauthorized_with_challenge(challenge()))?;

    let authz = validate_token(config, raw_token, &config.api_public_hostname)
        .or_else(|_| match &config.anycast_api_public_hostname {
            Some(anycast) => validate_token(config, raw_token, anycast),
            None => Err(crate::auth::token::TokenError::Invalid {
                raw_error_message: "not valid for any local audience".into(),
            }),
        })
        .map_err(|_| RegistryError::unauthorized_with_challenge(challenge()))?;

    for scope in required_scopes {
        for action in &scope.actions {
            if !authz
                .scopes
                .grants(&scope.resource_type, &scope.resource_name, action)
            {
                return Err(RegistryError::unauthorized_with_challenge(challenge()));
            }
        }
    }
    Ok(authz)
}

/// Loads the account or reports NAME_UNKNOWN the way the registry protocol
/// spells it.
pub(crate) async fn require_account(
    state: &AppState,
    account_name: &str,
) -> RegistryResult<crate::models::Account> {
    let mut conn = state.db.pool().acquire().await?;
    crate::db::queries::get_account(&mut *conn, account_name)
        .await?
        .ok_or_else(|| RegistryError::new(RegistryErrorCode::NameUnknown))
}

/// 429 with Retry-After when the rate-limit driver says no. Store failures
/// fail open; admission control must not take the registry down with it.
pub(crate) async fn enforce_rate_limit(
    state: &AppState,
    account_name: &str,
    action: crate::drivers::RateLimitAction,
    identity_name: &str,
    amount: u64,
) -> RegistryResult<()> {
    match state
        .drivers
        .rate_limit
        .check(account_name, action, identity_name, amount)
        .await
    {
        Ok(decision) if decision.allowed => Ok(()),
        Ok(decision) => Err(RegistryError::too_many_requests(decision.retry_after_seconds)),
        Err(err) => {
            warn!("rate-limit store failure, failing open: {err}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(account_name: &str, repo_name: &str) -> RepoPath {
        RepoPath {
            account_name: account_name.into(),
            repo_name: repo_name.into(),
        }
    }

    #[test]
    fn parses_all_v2_path_shapes() {
        assert_eq!(parse_v2_path("_catalog"), Some(V2Path::Catalog));
        assert_eq!(
            parse_v2_path("acc1/foo/blobs/uploads/"),
            Some(V2Path::UploadStart { repo: repo("acc1", "foo") })
        );
        assert_eq!(
            parse_v2_path("acc1/foo/bar/tags/list"),
            Some(V2Path::TagList { repo: repo("acc1", "foo/bar") })
        );
        assert_eq!(
            parse_v2_path("acc1/foo/manifests/latest"),
            Some(V2Path::Manifest {
                repo: repo("acc1", "foo"),
                reference: "latest".into()
            })
        );
        let uuid = Uuid::new_v4();
        assert_eq!(
            parse_v2_path(&format!("acc1/foo/blobs/uploads/{uuid}")),
            Some(V2Path::Upload { repo: repo("acc1", "foo"), upload_uuid: uuid })
        );
        assert_eq!(
            parse_v2_path("acc1/foo/blobs/sha256:abc"),
            Some(V2Path::Blob {
                repo: repo("acc1", "foo"),
                digest: "sha256:abc".into()
            })
        );
    }

    #[test]
    fn repo_names_may_contain_keywords() {
        // The rightmost keyword wins.
        assert_eq!(
            parse_v2_path("acc1/blobs/manifests/manifests/latest"),
            Some(V2Path::Manifest {
                repo: repo("acc1", "blobs/manifests"),
                reference: "latest".into()
            })
        );
    }

    #[test]
    fn rejects_malformed_paths() {
        assert_eq!(parse_v2_path("acc1"), None);
        // No repository between account and keyword.
        assert_eq!(parse_v2_path("acc1/manifests/latest"), None);
        assert_eq!(parse_v2_path("UPPER/foo/manifests/latest"), None);
        assert_eq!(parse_v2_path("acc1/foo/blobs/uploads/not-a-uuid"), None);
    }
}
