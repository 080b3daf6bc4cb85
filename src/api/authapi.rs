//! The token endpoint `/keppel/v1/auth` and the peering announcement
//! endpoint `/keppel/v1/auth/peering`.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::api::AppState;
use crate::auth::token::issue_token;
use crate::auth::{bearer_challenge, granted_account_actions, granted_repository_actions, Scope, ScopeSet};
use crate::db::queries;
use crate::drivers::auth::{AnonymousIdentity, AuthError, IdentityKind, PeerIdentity, UserIdentity};
use crate::errors::{RegistryError, RegistryResult};
use crate::models::Peer;
use crate::peering::PeeringRequest;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/keppel/v1/auth", get(issue_token_endpoint))
        .route("/keppel/v1/auth/peering", post(announce_peer_credentials))
}

#[derive(Deserialize)]
struct AuthQuery {
    service: Option<String>,
}

async fn issue_token_endpoint(
    State(state): State<AppState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    uri: axum::http::Uri,
) -> Response {
    match issue_token_inner(&state, query, &headers, &uri).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn issue_token_inner(
    state: &AppState,
    query: AuthQuery,
    headers: &HeaderMap,
    uri: &axum::http::Uri,
) -> RegistryResult<Response> {
    let config = &state.config;
    // Scopes can repeat, which Query<Vec<..>> does not model; parse by hand.
    let requested_scopes: Vec<Scope> = uri
        .query()
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| pair.strip_prefix("scope="))
        .filter_map(|raw| {
            let decoded: String =
                url::form_urlencoded::parse(format!("s={raw}").as_bytes())
                    .next()
                    .map(|(_, value)| value.into_owned())
                    .unwrap_or_default();
            decoded.parse().ok()
        })
        .collect();

    let Some(service) = query.service else {
        return Ok((StatusCode::BAD_REQUEST, "missing query parameter: service").into_response());
    };
    if service != config.api_public_hostname && !config.is_anycast_service(&service) {
        return Ok((
            StatusCode::BAD_REQUEST,
            "cannot issue tokens for this service",
        )
            .into_response());
    }

    // Anycast token requests for accounts that live elsewhere go to the
    // responsible peer; the issued token then names that peer as issuer.
    if config.is_anycast_service(&service) {
        for scope in &requested_scopes {
            if scope.resource_type != "repository" {
                continue;
            }
            let Some((account_name, _)) = scope.resource_name.split_once('/') else {
                continue;
            };
            let local = {
                let mut conn = state.db.pool().acquire().await?;
                queries::get_account(&mut *conn, account_name).await?
            };
            if local.is_some() {
                continue;
            }
            if let Some(primary) =
                crate::peering::find_responsible_peer(state, account_name).await?
            {
                return relay_token_request(state, &primary, uri, headers).await;
            }
        }
    }

    let identity = authenticate_request(state, headers).await.map_err(|err| match err {
        AuthError::TooManyRequests { retry_after_seconds } => {
            RegistryError::too_many_requests(retry_after_seconds)
        }
        _ => RegistryError::unauthorized_with_challenge(bearer_challenge(
            &config.api_public_hostname,
            &service,
            &requested_scopes,
        )),
    })?;

    let mut granted = ScopeSet::default();
    for scope in &requested_scopes {
        match scope.resource_type.as_str() {
            "repository" => {
                let Some((account_name, repo_name)) = scope.resource_name.split_once('/') else {
                    continue;
                };
                let account = {
                    let mut conn = state.db.pool().acquire().await?;
                    queries::get_account(&mut *conn, account_name).await?
                };
                let Some(account) = account else { continue };
                let actions = granted_repository_actions(
                    &account,
                    repo_name,
                    &scope.actions,
                    identity.as_ref(),
                    None,
                );
                granted.push_nonempty(Scope {
                    resource_type: scope.resource_type.clone(),
                    resource_name: scope.resource_name.clone(),
                    actions,
                });
            }
            "keppel_account" => {
                let account = {
                    let mut conn = state.db.pool().acquire().await?;
                    queries::get_account(&mut *conn, &scope.resource_name).await?
                };
                let Some(account) = account else { continue };
                let actions = granted_account_actions(&account, &scope.actions, identity.as_ref());
                granted.push_nonempty(Scope {
                    resource_type: scope.resource_type.clone(),
                    resource_name: scope.resource_name.clone(),
                    actions,
                });
            }
            "registry" if scope.resource_name == "catalog" => {
                // The catalog endpoint filters per-account; the scope itself
                // is free.
                granted.push_nonempty(Scope::new("registry", "catalog", &["*"]));
            }
            // `keppel_api:peer:access` and `keppel_api:anycast:access`.
            "keppel_api" => {
                let allow = match scope.resource_name.as_str() {
                    "peer" => identity.kind() == IdentityKind::Peer,
                    "anycast" => config.is_anycast_service(&service),
                    _ => false,
                };
                if allow && scope.contains_action("access") {
                    granted.push_nonempty(Scope {
                        resource_type: scope.resource_type.clone(),
                        resource_name: scope.resource_name.clone(),
                        actions: vec!["access".to_string()],
                    });
                }
            }
            _ => {}
        }
    }

    let issued = issue_token(config, identity.as_ref(), &service, granted)
        .map_err(RegistryError::internal)?;
    Ok((StatusCode::OK, Json(issued)).into_response())
}

/// Forwards an anycast token request verbatim to the peer that owns the
/// account, credentials included, and relays the answer.
async fn relay_token_request(
    state: &AppState,
    primary: &str,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
) -> RegistryResult<Response> {
    let url = format!(
        "https://{primary}/keppel/v1/auth?{}",
        uri.query().unwrap_or("")
    );
    let mut request = state.http.get(&url);
    if let Some(authorization) = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        request = request.header("Authorization", authorization);
    }
    let response = request.send().await.map_err(|err| {
        RegistryError::internal(format!("cannot relay token request to {primary}: {err}"))
    })?;
    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let body = response.bytes().await.map_err(|err| {
        RegistryError::internal(format!("cannot read relayed token response: {err}"))
    })?;
    Ok((status, [("Content-Type", "application/json")], body).into_response())
}

/// Resolves the caller of the auth endpoint: a peer presenting
/// `replication@<hostname>`, a user known to the auth driver, or anonymous.
async fn authenticate_request(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Box<dyn UserIdentity>, AuthError> {
    let Some((username, password)) = crate::drivers::auth::parse_basic_auth(headers) else {
        return Ok(Box::new(AnonymousIdentity));
    };

    if let Some(peer_hostname) = username.strip_prefix("replication@") {
        let peer: Option<Peer> = sqlx::query_as("SELECT * FROM peers WHERE hostname = $1")
            .bind(peer_hostname)
            .fetch_optional(state.db.pool())
            .await
            .map_err(|err| AuthError::Internal {
                raw_error_message: err.to_string(),
            })?;
        return match peer {
            Some(peer) if peer.matches_password(&password) => Ok(Box::new(PeerIdentity {
                peer_hostname: peer_hostname.to_string(),
            })),
            _ => Err(AuthError::Unauthorized),
        };
    }

    state.drivers.auth.authenticate_user(&username, &password).await
}

/// POST `/keppel/v1/auth/peering` — a peer announces the password it will
/// present to us from now on. The previous password stays valid so that
/// in-flight requests survive the rotation.
async fn announce_peer_credentials(
    State(state): State<AppState>,
    Json(request): Json<PeeringRequest>,
) -> Response {
    if !state.config.is_known_peer(&request.hostname) {
        return (StatusCode::FORBIDDEN, "unknown peer").into_response();
    }
    if request.password.is_empty() {
        return (StatusCode::BAD_REQUEST, "malformed attributes").into_response();
    }

    let hash = crate::models::peer::hash_password(&request.password);
    let result = sqlx::query(
        "INSERT INTO peers (hostname, their_current_password_hash)
         VALUES ($1, $2)
         ON CONFLICT (hostname) DO UPDATE
            SET their_previous_password_hash = peers.their_current_password_hash,
                their_current_password_hash = EXCLUDED.their_current_password_hash",
    )
    .bind(&request.hostname)
    .bind(&hash)
    .execute(state.db.pool())
    .await;

    match result {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            error!("cannot store peer credentials: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
