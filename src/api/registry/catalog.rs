use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::api::registry::{authorize, RepoPath};
use crate::api::AppState;
use crate::auth::Scope;
use crate::db::queries;
use crate::drivers::auth::{IdentityKind, Permission};
use crate::errors::{RegistryError, RegistryErrorCode, RegistryResult};
use crate::models::policies::RbacPermission;

const DEFAULT_PAGE_SIZE: i64 = 100;
const MAX_PAGE_SIZE: i64 = 1000;

#[derive(Debug, Default, Clone, Copy)]
pub struct Pagination<'a> {
    pub limit: i64,
    pub last: Option<&'a str>,
}

pub fn parse_pagination(query: &str) -> Pagination<'_> {
    let mut pagination = Pagination {
        limit: DEFAULT_PAGE_SIZE,
        last: None,
    };
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("n", raw)) => {
                if let Ok(n) = raw.parse::<i64>() {
                    pagination.limit = n.clamp(1, MAX_PAGE_SIZE);
                }
            }
            Some(("last", raw)) => {
                if !raw.is_empty() {
                    pagination.last = Some(raw);
                }
            }
            _ => {}
        }
    }
    pagination
}

#[derive(Serialize)]
struct CatalogResponse {
    repositories: Vec<String>,
}

#[derive(Serialize)]
struct TagListResponse {
    name: String,
    tags: Vec<String>,
}

/// GET `/v2/_catalog` — the full repository paths visible to this token,
/// lexically ordered, paginated with `?n=&last=`.
pub async fn get_catalog(
    state: &AppState,
    headers: &HeaderMap,
    query: &str,
) -> RegistryResult<Response> {
    let authz = authorize(state, headers, &[Scope::new("registry", "catalog", &["*"])]).await?;
    let pagination = parse_pagination(query);

    let mut conn = state.db.pool().acquire().await?;
    let accounts: Vec<crate::models::Account> =
        sqlx::query_as("SELECT * FROM accounts ORDER BY name")
            .fetch_all(&mut *conn)
            .await?;

    let mut repositories = Vec::new();
    'accounts: for account in accounts {
        let full_account_visible = match authz.identity.kind() {
            IdentityKind::Peer => true,
            IdentityKind::Anonymous => false,
            IdentityKind::Regular => authz
                .identity
                .has_permission(Permission::ViewAccount, &account.auth_tenant_id),
        };
        let anonymous_policies: Vec<_> = account
            .rbac_policies()
            .into_iter()
            .filter(|policy| {
                policy.grants(RbacPermission::AnonymousPull)
                    || policy.grants(RbacPermission::AnonymousFirstPull)
            })
            .collect();
        if !full_account_visible && anonymous_policies.is_empty() {
            continue;
        }

        let repos: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM repos WHERE account_name = $1 ORDER BY name")
                .bind(&account.name)
                .fetch_all(&mut *conn)
                .await?;
        for (repo_name,) in repos {
            let visible = full_account_visible
                || anonymous_policies
                    .iter()
                    .any(|policy| policy.matches(&repo_name, "", None));
            if !visible {
                continue;
            }
            let full_name = format!("{}/{repo_name}", account.name);
            if let Some(last) = pagination.last {
                if full_name.as_str() <= last {
                    continue;
                }
            }
            repositories.push(full_name);
            if repositories.len() as i64 > pagination.limit {
                break 'accounts;
            }
        }
    }

    let truncated = repositories.len() as i64 > pagination.limit;
    repositories.truncate(pagination.limit as usize);

    let mut response = (
        StatusCode::OK,
        axum::Json(CatalogResponse {
            repositories: repositories.clone(),
        }),
    )
        .into_response();
    if truncated {
        if let Some(last_entry) = repositories.last() {
            let link = format!(
                "</v2/_catalog?n={}&last={last_entry}>; rel=\"next\"",
                pagination.limit
            );
            if let Ok(value) = link.parse() {
                response.headers_mut().insert("Link", value);
            }
        }
    }
    Ok(response)
}

/// GET `/v2/<repo>/tags/list`.
pub async fn get_tag_list(
    state: &AppState,
    headers: &HeaderMap,
    repo: &RepoPath,
    query: &str,
) -> RegistryResult<Response> {
    authorize(state, headers, &[Scope::repository(&repo.full_name(), &["pull"])]).await?;
    let account = crate::api::registry::require_account(state, &repo.account_name).await?;
    let pagination = parse_pagination(query);

    let mut conn = state.db.pool().acquire().await?;
    let repo_row = queries::get_repo(&mut *conn, &account.name, &repo.repo_name)
        .await?
        .ok_or_else(|| RegistryError::new(RegistryErrorCode::NameUnknown))?;

    let tags: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM tags WHERE repo_id = $1 AND name > $2 ORDER BY name LIMIT $3",
    )
    .bind(repo_row.id)
    .bind(pagination.last.unwrap_or(""))
    .bind(pagination.limit + 1)
    .fetch_all(&mut *conn)
    .await?;

    let mut tags: Vec<String> = tags.into_iter().map(|(name,)| name).collect();
    let truncated = tags.len() as i64 > pagination.limit;
    tags.truncate(pagination.limit as usize);

    let mut response = (
        StatusCode::OK,
        axum::Json(TagListResponse {
            name: repo.full_name(),
            tags: tags.clone(),
        }),
    )
        .into_response();
    if truncated {
        if let Some(last_entry) = tags.last() {
            let link = format!(
                "</v2/{}/tags/list?n={}&last={last_entry}>; rel=\"next\"",
                repo.full_name(),
                pagination.limit
            );
            if let Ok(value) = link.parse() {
                response.headers_mut().insert("Link", value);
            }
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_parsing() {
        let pagination = parse_pagination("n=50&last=acc1/foo");
        assert_eq!(pagination.limit, 50);
        assert_eq!(pagination.last, Some("acc1/foo"));

        let default = parse_pagination("");
        assert_eq!(default.limit, DEFAULT_PAGE_SIZE);
        assert_eq!(default.last, None);

        // Out-of-range page sizes clamp instead of failing.
        assert_eq!(parse_pagination("n=999999").limit, MAX_PAGE_SIZE);
        assert_eq!(parse_pagination("n=0").limit, 1);
    }
}
