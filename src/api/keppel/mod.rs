//! The tenant-facing control plane under `/keppel/v1/`.

pub mod accounts;
pub mod quotas;
pub mod repos;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::api::AppState;
use crate::auth::token::validate_token;
use crate::drivers::auth::UserIdentity;
use crate::errors::RegistryError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/keppel/v1/accounts",
            get(accounts::list_accounts),
        )
        .route(
            "/keppel/v1/accounts/:name",
            get(accounts::get_account)
                .put(accounts::put_account)
                .delete(accounts::delete_account),
        )
        .route(
            "/keppel/v1/accounts/:name/sublease",
            axum::routing::post(accounts::issue_sublease),
        )
        .route(
            "/keppel/v1/accounts/:name/repositories",
            get(repos::list_repositories),
        )
        .route(
            "/keppel/v1/accounts/:name/repositories/*rest",
            axum::routing::any(repos::dispatch_repository_subpaths),
        )
        .route(
            "/keppel/v1/quotas/:tenant_id",
            get(quotas::get_quotas).put(quotas::put_quotas),
        )
        .route("/keppel/v1/peers", get(list_peers))
}

/// Authentication for the management API: either credentials the auth
/// driver understands directly (e.g. `X-Auth-Token`), or a bearer token
/// from our own auth endpoint.
pub(crate) async fn authorize_management(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Box<dyn UserIdentity>, Response> {
    let unauthorized = || (StatusCode::UNAUTHORIZED, "unauthorized").into_response();

    match state.drivers.auth.authenticate_from_request(headers).await {
        Ok(Some(identity)) => return Ok(identity),
        Ok(None) => {}
        Err(_) => return Err(unauthorized()),
    }

    let raw_token = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if let Some(raw_token) = raw_token {
        if let Ok(authz) = validate_token(&state.config, raw_token, &state.config.api_public_hostname)
        {
            return Ok(authz.identity);
        }
    }
    Err(unauthorized())
}

pub(crate) fn internal_error(err: impl std::fmt::Display) -> Response {
    RegistryError::internal(err).into_response()
}

#[derive(Serialize)]
struct PeerView {
    hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_peered_at: Option<i64>,
}

#[derive(Serialize)]
struct PeerListResponse {
    peers: Vec<PeerView>,
}

/// GET /keppel/v1/peers — the known fleet members. Credentials never leave
/// this endpoint, only hostnames and freshness.
async fn list_peers(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize_management(&state, &headers).await {
        return response;
    }
    let peers: Result<Vec<crate::models::Peer>, _> =
        sqlx::query_as("SELECT * FROM peers ORDER BY hostname")
            .fetch_all(state.db.pool())
            .await;
    match peers {
        Ok(peers) => Json(PeerListResponse {
            peers: peers
                .into_iter()
                .map(|peer| PeerView {
                    hostname: peer.hostname,
                    last_peered_at: peer.last_peered_at.map(|t| t.timestamp()),
                })
                .collect(),
        })
        .into_response(),
        Err(err) => internal_error(err),
    }
}
