//! The peer-only API under `/peer/v1/`: delegated pulls and replica sync.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::registry::authorize;
use crate::api::AppState;
use crate::auth::{Authorization, Scope};
use crate::db::queries;
use crate::errors::{RegistryError, RegistryErrorCode, RegistryResult};

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/peer/v1/delegatedpull/:host/v2/*rest",
            get(delegated_pull),
        )
        .route(
            "/peer/v1/sync-replica/:account/*repo",
            post(sync_replica),
        )
}

async fn authorize_peer(state: &AppState, headers: &HeaderMap) -> RegistryResult<Authorization> {
    let authz = authorize(
        state,
        headers,
        &[Scope::new("keppel_api", "peer", &["access"])],
    )
    .await?;
    if !authz.is_peer() {
        return Err(RegistryError::new(RegistryErrorCode::Denied)
            .with_message("this endpoint is only for peers"));
    }
    Ok(authz)
}

/// GET /peer/v1/delegatedpull/:host/v2/<repo>/manifests/<ref> — fetches an
/// upstream manifest on behalf of a peer that the upstream is
/// rate-limiting. The peer passes its upstream credentials along.
async fn delegated_pull(
    State(state): State<AppState>,
    Path((host, rest)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    match delegated_pull_inner(&state, &host, &rest, &headers).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn delegated_pull_inner(
    state: &AppState,
    host: &str,
    rest: &str,
    headers: &HeaderMap,
) -> RegistryResult<Response> {
    authorize_peer(state, headers).await?;

    let (repo_name, reference) = rest
        .rsplit_once("/manifests/")
        .ok_or_else(|| RegistryError::new(RegistryErrorCode::NameInvalid))?;
    let username = headers
        .get("X-Keppel-Delegated-Pull-Username")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let password = headers
        .get("X-Keppel-Delegated-Pull-Password")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let client = crate::replication::UpstreamClient::external(
        state.clone(),
        String::new(),
        host.to_string(),
        username,
        password,
    )
    .without_delegation();
    let (contents, media_type) = client.fetch_manifest(repo_name, reference).await?;

    Ok((
        StatusCode::OK,
        [
            ("Content-Type", media_type),
            (
                "Docker-Content-Digest",
                crate::digest::Digest::of_contents(&contents).to_string(),
            ),
        ],
        contents,
    )
        .into_response())
}

/// What a replica reports (and a primary returns) about one repo during
/// manifest sync.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReplicaSyncPayload {
    pub manifests: Vec<ManifestSyncEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestSyncEntry {
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pulled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<TagSyncEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TagSyncEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pulled_at: Option<DateTime<Utc>>,
}

/// POST /peer/v1/sync-replica/:account/*repo — the replica sends its view
/// (digests and pull timestamps); the primary merges the timestamps and
/// answers with the authoritative manifest list for the repo.
async fn sync_replica(
    State(state): State<AppState>,
    Path((account_name, repo_name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(payload): Json<ReplicaSyncPayload>,
) -> Response {
    match sync_replica_inner(&state, &account_name, &repo_name, &headers, payload).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn sync_replica_inner(
    state: &AppState,
    account_name: &str,
    repo_name: &str,
    headers: &HeaderMap,
    payload: ReplicaSyncPayload,
) -> RegistryResult<Response> {
    authorize_peer(state, headers).await?;

    let mut conn = state.db.pool().acquire().await?;
    let account = queries::get_account(&mut *conn, account_name)
        .await?
        .ok_or_else(|| RegistryError::new(RegistryErrorCode::NameUnknown))?;
    if account.is_replica() {
        return Err(RegistryError::new(RegistryErrorCode::Denied)
            .with_message("replica sync must target the primary account"));
    }
    let repo_row = queries::get_repo(&mut *conn, &account.name, repo_name)
        .await?
        .ok_or_else(|| RegistryError::new(RegistryErrorCode::NameUnknown))?;

    // Replica pulls count towards the primary's pull timestamps; GREATEST
    // keeps out-of-order payloads from moving them backwards.
    for entry in &payload.manifests {
        if let Some(last_pulled_at) = entry.last_pulled_at {
            crate::db::bump_last_pulled_at(&mut *conn, repo_row.id, &entry.digest, None, last_pulled_at)
                .await?;
        }
        for tag in &entry.tags {
            if let Some(last_pulled_at) = tag.last_pulled_at {
                sqlx::query(
                    "UPDATE tags SET last_pulled_at =
                         GREATEST(coalesce(last_pulled_at, to_timestamp(0)), $3)
                     WHERE repo_id = $1 AND name = $2",
                )
                .bind(repo_row.id)
                .bind(&tag.name)
                .bind(crate::db::whole_seconds(last_pulled_at))
                .execute(&mut *conn)
                .await?;
            }
        }
    }

    let manifests: Vec<crate::models::Manifest> =
        sqlx::query_as("SELECT * FROM manifests WHERE repo_id = $1 ORDER BY digest")
            .bind(repo_row.id)
            .fetch_all(&mut *conn)
            .await?;
    let tags: Vec<crate::models::Tag> =
        sqlx::query_as("SELECT * FROM tags WHERE repo_id = $1 ORDER BY name")
            .bind(repo_row.id)
            .fetch_all(&mut *conn)
            .await?;

    let response = ReplicaSyncPayload {
        manifests: manifests
            .into_iter()
            .map(|manifest| ManifestSyncEntry {
                tags: tags
                    .iter()
                    .filter(|tag| tag.digest == manifest.digest)
                    .map(|tag| TagSyncEntry {
                        name: tag.name.clone(),
                        last_pulled_at: tag.last_pulled_at,
                    })
                    .collect(),
                digest: manifest.digest,
                last_pulled_at: manifest.last_pulled_at,
            })
            .collect(),
    };
    Ok(Json(response).into_response())
}
