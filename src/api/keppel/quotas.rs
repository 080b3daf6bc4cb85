use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::keppel::{authorize_management, internal_error};
use crate::api::AppState;
use crate::db::queries;
use crate::drivers::auth::Permission;

#[derive(Serialize)]
struct QuotaStatus {
    quota: i64,
    usage: i64,
}

#[derive(Serialize)]
struct QuotaResponse {
    manifests: QuotaStatus,
}

#[derive(Deserialize)]
pub struct PutQuotaRequest {
    manifests: PutQuotaValue,
}

#[derive(Deserialize)]
pub struct PutQuotaValue {
    quota: i64,
}

/// GET /keppel/v1/quotas/:tenant_id
pub async fn get_quotas(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let identity = match authorize_management(&state, &headers).await {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    if !identity.has_permission(Permission::ViewQuotas, &tenant_id) {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }

    let mut conn = match state.db.pool().acquire().await {
        Ok(conn) => conn,
        Err(err) => return internal_error(err),
    };
    let quota = match queries::get_quota(&mut *conn, &tenant_id).await {
        Ok(quota) => quota.map(|q| q.manifests).unwrap_or(0),
        Err(err) => return internal_error(err),
    };
    let usage = match queries::count_tenant_manifests(&mut *conn, &tenant_id).await {
        Ok(usage) => usage,
        Err(err) => return internal_error(err),
    };
    Json(QuotaResponse {
        manifests: QuotaStatus { quota, usage },
    })
    .into_response()
}

/// PUT /keppel/v1/quotas/:tenant_id
pub async fn put_quotas(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PutQuotaRequest>,
) -> Response {
    let identity = match authorize_management(&state, &headers).await {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    if !identity.has_permission(Permission::ChangeQuotas, &tenant_id) {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }
    let new_quota = request.manifests.quota;
    if new_quota < 0 {
        return (StatusCode::BAD_REQUEST, "quota may not be negative").into_response();
    }

    let mut conn = match state.db.pool().acquire().await {
        Ok(conn) => conn,
        Err(err) => return internal_error(err),
    };
    let usage = match queries::count_tenant_manifests(&mut *conn, &tenant_id).await {
        Ok(usage) => usage,
        Err(err) => return internal_error(err),
    };
    if new_quota < usage {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("quota may not be smaller than current usage ({usage} manifests)"),
        )
            .into_response();
    }

    let result = sqlx::query(
        "INSERT INTO quotas (auth_tenant_id, manifests) VALUES ($1, $2)
         ON CONFLICT (auth_tenant_id) DO UPDATE SET manifests = EXCLUDED.manifests",
    )
    .bind(&tenant_id)
    .bind(new_quota)
    .execute(&mut *conn)
    .await;
    match result {
        Ok(_) => Json(QuotaResponse {
            manifests: QuotaStatus {
                quota: new_quota,
                usage,
            },
        })
        .into_response(),
        Err(err) => internal_error(err),
    }
}
