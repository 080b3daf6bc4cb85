use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::api::keppel::{authorize_management, internal_error};
use crate::api::registry::RepoPath;
use crate::api::AppState;
use crate::db::queries;
use crate::digest::Digest;
use crate::drivers::auth::{Permission, UserIdentity};
use crate::models::Account;

#[derive(Serialize)]
struct RepositoryView {
    name: String,
    manifest_count: i64,
    tag_count: i64,
    size_bytes: i64,
}

#[derive(Serialize)]
struct RepositoryListResponse {
    repositories: Vec<RepositoryView>,
}

#[derive(Serialize)]
struct TagView {
    name: String,
    pushed_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_pulled_at: Option<i64>,
}

#[derive(Serialize)]
struct ManifestView {
    digest: String,
    media_type: String,
    size_bytes: i64,
    pushed_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_pulled_at: Option<i64>,
    tags: Vec<TagView>,
    vuln_status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    gc_status: String,
}

#[derive(Serialize)]
struct ManifestListResponse {
    manifests: Vec<ManifestView>,
}

async fn account_for_viewing(
    state: &AppState,
    headers: &HeaderMap,
    account_name: &str,
) -> Result<(Account, Box<dyn UserIdentity>), Response> {
    let identity = authorize_management(state, headers).await?;
    let mut conn = state
        .db
        .pool()
        .acquire()
        .await
        .map_err(internal_error)?;
    let account = queries::get_account(&mut *conn, account_name)
        .await
        .map_err(internal_error)?;
    match account {
        Some(account)
            if identity.has_permission(Permission::ViewAccount, &account.auth_tenant_id) =>
        {
            Ok((account, identity))
        }
        _ => Err((StatusCode::NOT_FOUND, "no such account").into_response()),
    }
}

/// GET /keppel/v1/accounts/:name/repositories
pub async fn list_repositories(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let (account, _) = match account_for_viewing(&state, &headers, &name).await {
        Ok(found) => found,
        Err(response) => return response,
    };

    type Row = (String, i64, i64, Option<i64>);
    let rows: Result<Vec<Row>, _> = sqlx::query_as(
        "SELECT r.name,
                (SELECT COUNT(*) FROM manifests m WHERE m.repo_id = r.id),
                (SELECT COUNT(*) FROM tags t WHERE t.repo_id = r.id),
                (SELECT SUM(m.size_bytes) FROM manifests m WHERE m.repo_id = r.id)
         FROM repos r WHERE r.account_name = $1 ORDER BY r.name",
    )
    .bind(&account.name)
    .fetch_all(state.db.pool())
    .await;

    match rows {
        Ok(rows) => Json(RepositoryListResponse {
            repositories: rows
                .into_iter()
                .map(|(name, manifest_count, tag_count, size_bytes)| RepositoryView {
                    name,
                    manifest_count,
                    tag_count,
                    size_bytes: size_bytes.unwrap_or(0),
                })
                .collect(),
        })
        .into_response(),
        Err(err) => internal_error(err),
    }
}

/// Everything below /keppel/v1/accounts/:name/repositories/: the repo name
/// may contain slashes, so the tail is parsed by hand, like the /v2 paths.
pub async fn dispatch_repository_subpaths(
    State(state): State<AppState>,
    Path((name, rest)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    // Recognized tails: <repo>  <repo>/_manifests  <repo>/_manifests/<digest>
    //                   <repo>/_tags/<tag>
    let segments: Vec<&str> = rest.split('/').collect();

    if let Some(keyword_index) = segments.iter().rposition(|s| *s == "_manifests") {
        let repo_name = segments[..keyword_index].join("/");
        let tail = &segments[keyword_index + 1..];
        if method == Method::GET && tail.is_empty() {
            return list_manifests(&state, &headers, &name, &repo_name).await;
        }
        if method == Method::DELETE && tail.len() == 1 {
            return delete_manifest(&state, &headers, &name, &repo_name, tail[0]).await;
        }
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if let Some(keyword_index) = segments.iter().rposition(|s| *s == "_tags") {
        let repo_name = segments[..keyword_index].join("/");
        let tail = &segments[keyword_index + 1..];
        if method == Method::DELETE && tail.len() == 1 {
            return delete_tag(&state, &headers, &name, &repo_name, tail[0]).await;
        }
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if method == Method::DELETE {
        return delete_repository(&state, &headers, &name, &rest).await;
    }
    StatusCode::NOT_FOUND.into_response()
}

async fn list_manifests(
    state: &AppState,
    headers: &HeaderMap,
    account_name: &str,
    repo_name: &str,
) -> Response {
    let (account, _) = match account_for_viewing(state, headers, account_name).await {
        Ok(found) => found,
        Err(response) => return response,
    };
    let mut conn = match state.db.pool().acquire().await {
        Ok(conn) => conn,
        Err(err) => return internal_error(err),
    };
    let repo_row = match queries::get_repo(&mut *conn, &account.name, repo_name).await {
        Ok(Some(repo_row)) => repo_row,
        Ok(None) => return (StatusCode::NOT_FOUND, "no such repository").into_response(),
        Err(err) => return internal_error(err),
    };

    let manifests: Vec<crate::models::Manifest> = match sqlx::query_as(
        "SELECT * FROM manifests WHERE repo_id = $1 ORDER BY digest",
    )
    .bind(repo_row.id)
    .fetch_all(&mut *conn)
    .await
    {
        Ok(manifests) => manifests,
        Err(err) => return internal_error(err),
    };
    let tags: Vec<crate::models::Tag> =
        match sqlx::query_as("SELECT * FROM tags WHERE repo_id = $1 ORDER BY name")
            .bind(repo_row.id)
            .fetch_all(&mut *conn)
            .await
        {
            Ok(tags) => tags,
            Err(err) => return internal_error(err),
        };

    let views = manifests
        .into_iter()
        .map(|manifest| {
            let manifest_tags = tags
                .iter()
                .filter(|tag| tag.digest == manifest.digest)
                .map(|tag| TagView {
                    name: tag.name.clone(),
                    pushed_at: tag.pushed_at.timestamp(),
                    last_pulled_at: tag.last_pulled_at.map(|t| t.timestamp()),
                })
                .collect();
            ManifestView {
                digest: manifest.digest.clone(),
                media_type: manifest.media_type.clone(),
                size_bytes: manifest.size_bytes,
                pushed_at: manifest.pushed_at.timestamp(),
                last_pulled_at: manifest.last_pulled_at.map(|t| t.timestamp()),
                tags: manifest_tags,
                vuln_status: manifest.vuln_status.clone(),
                gc_status: manifest.gc_status_json.clone(),
            }
        })
        .collect();
    Json(ManifestListResponse { manifests: views }).into_response()
}

async fn require_delete_permission(
    state: &AppState,
    headers: &HeaderMap,
    account_name: &str,
) -> Result<Account, Response> {
    let (account, identity) = account_for_viewing(state, headers, account_name).await?;
    if !identity.has_permission(Permission::DeleteFromAccount, &account.auth_tenant_id) {
        return Err((StatusCode::FORBIDDEN, "forbidden").into_response());
    }
    Ok(account)
}

async fn delete_manifest(
    state: &AppState,
    headers: &HeaderMap,
    account_name: &str,
    repo_name: &str,
    raw_digest: &str,
) -> Response {
    let account = match require_delete_permission(state, headers, account_name).await {
        Ok(account) => account,
        Err(response) => return response,
    };
    let digest: Digest = match raw_digest.parse() {
        Ok(digest) => digest,
        Err(_) => return (StatusCode::BAD_REQUEST, "malformed digest").into_response(),
    };
    let repo = RepoPath {
        account_name: account.name.clone(),
        repo_name: repo_name.to_string(),
    };
    match crate::api::registry::manifests::delete_manifest_core(state, &account, &repo, &digest)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn delete_tag(
    state: &AppState,
    headers: &HeaderMap,
    account_name: &str,
    repo_name: &str,
    tag_name: &str,
) -> Response {
    let account = match require_delete_permission(state, headers, account_name).await {
        Ok(account) => account,
        Err(response) => return response,
    };
    let mut conn = match state.db.pool().acquire().await {
        Ok(conn) => conn,
        Err(err) => return internal_error(err),
    };
    let repo_row = match queries::get_repo(&mut *conn, &account.name, repo_name).await {
        Ok(Some(repo_row)) => repo_row,
        Ok(None) => return (StatusCode::NOT_FOUND, "no such repository").into_response(),
        Err(err) => return internal_error(err),
    };
    match sqlx::query("DELETE FROM tags WHERE repo_id = $1 AND name = $2")
        .bind(repo_row.id)
        .bind(tag_name)
        .execute(&mut *conn)
        .await
    {
        Ok(result) if result.rows_affected() > 0 => StatusCode::NO_CONTENT.into_response(),
        Ok(_) => (StatusCode::NOT_FOUND, "no such tag").into_response(),
        Err(err) => internal_error(err),
    }
}

async fn delete_repository(
    state: &AppState,
    headers: &HeaderMap,
    account_name: &str,
    repo_name: &str,
) -> Response {
    let account = match require_delete_permission(state, headers, account_name).await {
        Ok(account) => account,
        Err(response) => return response,
    };
    let mut conn = match state.db.pool().acquire().await {
        Ok(conn) => conn,
        Err(err) => return internal_error(err),
    };
    let repo_row = match queries::get_repo(&mut *conn, &account.name, repo_name).await {
        Ok(Some(repo_row)) => repo_row,
        Ok(None) => return (StatusCode::NOT_FOUND, "no such repository").into_response(),
        Err(err) => return internal_error(err),
    };
    let (manifests,): (i64,) =
        match sqlx::query_as("SELECT COUNT(*) FROM manifests WHERE repo_id = $1")
            .bind(repo_row.id)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(count) => count,
            Err(err) => return internal_error(err),
        };
    if manifests > 0 {
        return (
            StatusCode::CONFLICT,
            "repository still contains manifests",
        )
            .into_response();
    }
    match sqlx::query("DELETE FROM repos WHERE id = $1")
        .bind(repo_row.id)
        .execute(&mut *conn)
        .await
    {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal_error(err),
    }
}
