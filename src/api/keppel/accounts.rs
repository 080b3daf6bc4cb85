use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::keppel::{authorize_management, internal_error};
use crate::api::AppState;
use crate::db::queries;
use crate::drivers::auth::{Permission, UserIdentity};
use crate::drivers::{ClaimResult, FederationError};
use crate::models::account::{AccountView, ReplicationView};
use crate::models::{is_valid_account_name, Account};

#[derive(Serialize)]
struct AccountListResponse {
    accounts: Vec<AccountView>,
}

#[derive(Serialize)]
struct AccountResponse {
    account: AccountView,
}

#[derive(Deserialize)]
pub struct PutAccountRequest {
    account: AccountView,
}

/// GET /keppel/v1/accounts
pub async fn list_accounts(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let identity = match authorize_management(&state, &headers).await {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let accounts: Vec<Account> = match sqlx::query_as("SELECT * FROM accounts ORDER BY name")
        .fetch_all(state.db.pool())
        .await
    {
        Ok(accounts) => accounts,
        Err(err) => return internal_error(err),
    };
    let visible: Vec<AccountView> = accounts
        .iter()
        .filter(|account| {
            identity.has_permission(Permission::ViewAccount, &account.auth_tenant_id)
        })
        .map(AccountView::from)
        .collect();
    Json(AccountListResponse { accounts: visible }).into_response()
}

/// GET /keppel/v1/accounts/:name
pub async fn get_account(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let identity = match authorize_management(&state, &headers).await {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    match load_visible_account(&state, &name, identity.as_ref()).await {
        Ok(account) => Json(AccountResponse {
            account: AccountView::from(&account),
        })
        .into_response(),
        Err(response) => response,
    }
}

async fn load_visible_account(
    state: &AppState,
    name: &str,
    identity: &dyn UserIdentity,
) -> Result<Account, Response> {
    let mut conn = match state.db.pool().acquire().await {
        Ok(conn) => conn,
        Err(err) => return Err(internal_error(err)),
    };
    let account = match queries::get_account(&mut *conn, name).await {
        Ok(account) => account,
        Err(err) => return Err(internal_error(err)),
    };
    match account {
        Some(account)
            if identity.has_permission(Permission::ViewAccount, &account.auth_tenant_id) =>
        {
            Ok(account)
        }
        _ => Err((StatusCode::NOT_FOUND, "no such account").into_response()),
    }
}

/// PUT /keppel/v1/accounts/:name — create or update. Creation performs the
/// federation claim first; replica creation consumes the sublease token
/// from the `X-Keppel-Sublease-Token` header.
pub async fn put_account(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PutAccountRequest>,
) -> Response {
    let identity = match authorize_management(&state, &headers).await {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let view = request.account;

    if !is_valid_account_name(&name) {
        return (StatusCode::BAD_REQUEST, "account name is invalid").into_response();
    }
    if !identity.has_permission(Permission::ChangeAccount, &view.auth_tenant_id) {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }
    if let Err(message) = state.drivers.auth.validate_tenant_id(&view.auth_tenant_id) {
        return (StatusCode::BAD_REQUEST, message).into_response();
    }
    for policy in &view.rbac_policies {
        if let Err(err) = policy.validate() {
            return (StatusCode::BAD_REQUEST, format!("invalid RBAC policy: {err}"))
                .into_response();
        }
    }
    for policy in &view.gc_policies {
        if let Err(err) = policy.validate() {
            return (StatusCode::BAD_REQUEST, format!("invalid GC policy: {err}")).into_response();
        }
    }

    let (upstream_peer, external_url, external_username, external_password) =
        match &view.replication {
            None => (None, None, None, None),
            Some(ReplicationView::OnFirstUse { upstream }) => {
                if !state.config.is_known_peer(upstream) {
                    return (StatusCode::UNPROCESSABLE_ENTITY, "unknown peer").into_response();
                }
                (Some(upstream.clone()), None, None, None)
            }
            Some(ReplicationView::FromExternalOnFirstUse { url, username, password }) => {
                if url.is_empty() {
                    return (StatusCode::BAD_REQUEST, "external upstream URL is empty")
                        .into_response();
                }
                (None, Some(url.clone()), username.clone(), password.clone())
            }
        };

    let existing = {
        let mut conn = match state.db.pool().acquire().await {
            Ok(conn) => conn,
            Err(err) => return internal_error(err),
        };
        match queries::get_account(&mut *conn, &name).await {
            Ok(existing) => existing,
            Err(err) => return internal_error(err),
        }
    };

    match existing {
        Some(existing) => {
            update_account(&state, existing, view, upstream_peer, external_url).await
        }
        None => {
            create_account(
                &state,
                &headers,
                name,
                view,
                upstream_peer,
                external_url,
                external_username,
                external_password,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn create_account(
    state: &AppState,
    headers: &HeaderMap,
    name: String,
    view: AccountView,
    upstream_peer: Option<String>,
    external_url: Option<String>,
    external_username: Option<String>,
    external_password: Option<String>,
) -> Response {
    let sublease_secret = headers
        .get("X-Keppel-Sublease-Token")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let is_replica_of_peer = upstream_peer.is_some();
    if is_replica_of_peer && sublease_secret.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            "creating a replica account requires an X-Keppel-Sublease-Token header",
        )
            .into_response();
    }

    // The name must be ours in the federation before the row may exist.
    let claim = state
        .drivers
        .federation
        .claim_account_name(
            &name,
            &state.config.api_public_hostname,
            if is_replica_of_peer {
                sublease_secret.as_deref()
            } else {
                None
            },
        )
        .await;
    match claim {
        Ok(ClaimResult::Succeeded) => {}
        Ok(ClaimResult::Failed { reason }) => {
            return (StatusCode::CONFLICT, format!("cannot claim account name: {reason}"))
                .into_response()
        }
        Err(err) => return internal_error(err),
    }

    let platform_filter_json = match &view.platform_filter {
        None => None,
        Some(filter) => match serde_json::to_string(filter) {
            Ok(json) => Some(json),
            Err(err) => return internal_error(err),
        },
    };
    let rbac_json = serde_json::to_string(&view.rbac_policies).unwrap_or_else(|_| "[]".into());
    let gc_json = serde_json::to_string(&view.gc_policies).unwrap_or_else(|_| "[]".into());

    let result = sqlx::query(
        "INSERT INTO accounts (name, auth_tenant_id, upstream_peer_hostname, external_peer_url,
                               external_peer_username, external_peer_password,
                               platform_filter_json, rbac_policies_json, gc_policies_json,
                               required_labels, in_maintenance, is_managed)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
    )
    .bind(&name)
    .bind(&view.auth_tenant_id)
    .bind(&upstream_peer)
    .bind(&external_url)
    .bind(&external_username)
    .bind(&external_password)
    .bind(&platform_filter_json)
    .bind(&rbac_json)
    .bind(&gc_json)
    .bind(&view.required_labels)
    .bind(view.in_maintenance)
    .bind(view.is_managed)
    .execute(state.db.pool())
    .await;
    if let Err(err) = result {
        return internal_error(err);
    }

    let mut conn = match state.db.pool().acquire().await {
        Ok(conn) => conn,
        Err(err) => return internal_error(err),
    };
    match queries::get_account(&mut *conn, &name).await {
        Ok(Some(account)) => (
            StatusCode::OK,
            Json(AccountResponse {
                account: AccountView::from(&account),
            }),
        )
            .into_response(),
        Ok(None) => internal_error("account vanished right after creation"),
        Err(err) => internal_error(err),
    }
}

async fn update_account(
    state: &AppState,
    existing: Account,
    view: AccountView,
    upstream_peer: Option<String>,
    external_url: Option<String>,
) -> Response {
    if existing.auth_tenant_id != view.auth_tenant_id {
        return (StatusCode::CONFLICT, "account tenant cannot be changed").into_response();
    }
    if existing.upstream_peer_hostname != upstream_peer
        || existing.external_peer_url != external_url
    {
        return (
            StatusCode::CONFLICT,
            "account replication mode cannot be changed",
        )
            .into_response();
    }
    // A replica's platform filter freezes on its first non-empty write.
    let new_filter = view.platform_filter.clone().unwrap_or_default();
    let existing_filter = existing.platform_filter();
    if !existing_filter.is_empty() && new_filter != existing_filter {
        return (
            StatusCode::CONFLICT,
            "platform filter is immutable once set",
        )
            .into_response();
    }

    let platform_filter_json = view
        .platform_filter
        .as_ref()
        .and_then(|filter| serde_json::to_string(filter).ok());
    let rbac_json = serde_json::to_string(&view.rbac_policies).unwrap_or_else(|_| "[]".into());
    let gc_json = serde_json::to_string(&view.gc_policies).unwrap_or_else(|_| "[]".into());

    let result = sqlx::query(
        "UPDATE accounts
         SET rbac_policies_json = $2, gc_policies_json = $3,
             platform_filter_json = COALESCE($4, platform_filter_json),
             required_labels = $5, in_maintenance = $6
         WHERE name = $1
         RETURNING name",
    )
    .bind(&existing.name)
    .bind(&rbac_json)
    .bind(&gc_json)
    .bind(&platform_filter_json)
    .bind(&view.required_labels)
    .bind(view.in_maintenance)
    .fetch_optional(state.db.pool())
    .await;
    if let Err(err) = result {
        return internal_error(err);
    }

    let mut conn = match state.db.pool().acquire().await {
        Ok(conn) => conn,
        Err(err) => return internal_error(err),
    };
    match queries::get_account(&mut *conn, &existing.name).await {
        Ok(Some(account)) => Json(AccountResponse {
            account: AccountView::from(&account),
        })
        .into_response(),
        Ok(None) => internal_error("account vanished during update"),
        Err(err) => internal_error(err),
    }
}

#[derive(Serialize)]
struct RemainingResources {
    repos: i64,
    manifests: i64,
    blobs: i64,
}

/// DELETE /keppel/v1/accounts/:name — only once nothing is left beneath
/// the account. A structured body reports what still blocks deletion.
pub async fn delete_account(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let identity = match authorize_management(&state, &headers).await {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let account = match load_visible_account(&state, &name, identity.as_ref()).await {
        Ok(account) => account,
        Err(response) => return response,
    };
    if !identity.has_permission(Permission::ChangeAccount, &account.auth_tenant_id) {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }

    let counts = async {
        let mut conn = state.db.pool().acquire().await?;
        let (manifests,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM manifests m JOIN repos r ON m.repo_id = r.id
             WHERE r.account_name = $1",
        )
        .bind(&name)
        .fetch_one(&mut *conn)
        .await?;
        let (blobs,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM blobs WHERE account_name = $1")
                .bind(&name)
                .fetch_one(&mut *conn)
                .await?;
        let (repos,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM repos WHERE account_name = $1")
                .bind(&name)
                .fetch_one(&mut *conn)
                .await?;
        Ok::<_, sqlx::Error>(RemainingResources { repos, manifests, blobs })
    }
    .await;
    let remaining = match counts {
        Ok(remaining) => remaining,
        Err(err) => return internal_error(err),
    };
    if remaining.manifests > 0 || remaining.blobs > 0 {
        return (StatusCode::CONFLICT, Json(remaining)).into_response();
    }

    // Give the name back before the row disappears; a refused forfeit (e.g.
    // replicas still attached) must leave the account intact.
    if let Err(err) = state
        .drivers
        .federation
        .forfeit_account_name(
            &account.name,
            &state.config.api_public_hostname,
            account.is_replica(),
        )
        .await
    {
        match err {
            FederationError::Conflict { message } => {
                return (StatusCode::CONFLICT, message).into_response()
            }
            other => return internal_error(other),
        }
    }

    // Empty repos go away together with the account (cascade).
    if let Err(err) = sqlx::query("DELETE FROM accounts WHERE name = $1")
        .bind(&name)
        .execute(state.db.pool())
        .await
    {
        return internal_error(err);
    }
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Serialize)]
struct SubleaseResponse {
    sublease_token: String,
}

/// POST /keppel/v1/accounts/:name/sublease — primary only.
pub async fn issue_sublease(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let identity = match authorize_management(&state, &headers).await {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let account = match load_visible_account(&state, &name, identity.as_ref()).await {
        Ok(account) => account,
        Err(response) => return response,
    };
    if !identity.has_permission(Permission::ChangeAccount, &account.auth_tenant_id) {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }
    if account.is_replica() {
        return (
            StatusCode::BAD_REQUEST,
            "replicas cannot issue sublease tokens",
        )
            .into_response();
    }

    match state
        .drivers
        .federation
        .issue_sublease_token_secret(&account.name)
        .await
    {
        Ok(secret) => Json(SubleaseResponse {
            sublease_token: secret,
        })
        .into_response(),
        Err(err) => internal_error(err),
    }
}
