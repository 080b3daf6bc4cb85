//! Client-side peer plumbing: obtaining peer tokens, rotating the peer
//! credentials, and the anycast reverse proxy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::api::registry::RepoPath;
use crate::api::AppState;
use crate::drivers::FederationError;
use crate::errors::{RegistryError, RegistryErrorCode, RegistryResult};
use crate::models::Peer;

/// Obtains a short-lived token from a peer's auth endpoint, authenticating
/// as `replication@<our-hostname>` with the password we maintain for that
/// peer.
pub async fn get_peer_token(
    state: &AppState,
    peer_hostname: &str,
    scope: &str,
) -> RegistryResult<String> {
    let peer: Option<Peer> = sqlx::query_as("SELECT * FROM peers WHERE hostname = $1")
        .bind(peer_hostname)
        .fetch_optional(state.db.pool())
        .await?;
    let peer = peer.ok_or_else(|| {
        RegistryError::internal(format!("{peer_hostname} is not a known peer"))
    })?;
    if peer.our_password.is_empty() {
        return Err(RegistryError::internal(format!(
            "no credentials for peer {peer_hostname} yet; waiting for the first rotation"
        )));
    }

    let url = format!(
        "https://{peer_hostname}/keppel/v1/auth?service={peer_hostname}&scope={}",
        urlencode(scope)
    );
    let response = state
        .http
        .get(&url)
        .basic_auth(
            format!("replication@{}", state.config.api_public_hostname),
            Some(peer.our_password),
        )
        .send()
        .await
        .map_err(|err| RegistryError::internal(format!("peer token request failed: {err}")))?;
    if !response.status().is_success() {
        return Err(RegistryError::internal(format!(
            "peer token endpoint returned {}",
            response.status()
        )));
    }

    #[derive(Deserialize)]
    struct TokenResponse {
        token: String,
    }
    let body: TokenResponse = response.json().await.map_err(|err| {
        RegistryError::internal(format!("peer token response is malformed: {err}"))
    })?;
    Ok(body.token)
}

fn urlencode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

#[derive(Serialize, Deserialize)]
pub struct PeeringRequest {
    /// The hostname of the keppel announcing a fresh password.
    pub hostname: String,
    pub password: String,
}

/// One rotation step: picks the peer whose credentials are the oldest,
/// announces a fresh password to it, and records the success. Returns the
/// peer that was processed, if any was due.
pub async fn rotate_one_peer_credential(state: &AppState) -> Result<Option<String>, RegistryError> {
    let mut tx = state.db.begin().await?;
    let peer: Option<Peer> = sqlx::query_as(
        "SELECT * FROM peers
         ORDER BY last_peered_at ASC NULLS FIRST
         LIMIT 1
         FOR UPDATE SKIP LOCKED",
    )
    .fetch_optional(&mut *tx)
    .await?;
    let Some(peer) = peer else {
        return Ok(None);
    };

    // Only rotate credentials that are due (older than 10 minutes).
    if let Some(last) = peer.last_peered_at {
        if crate::db::now() - last < chrono::Duration::minutes(10) {
            return Ok(None);
        }
    }

    let new_password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();

    let url = format!("https://{}/keppel/v1/auth/peering", peer.hostname);
    let response = state
        .http
        .post(&url)
        .json(&PeeringRequest {
            hostname: state.config.api_public_hostname.clone(),
            password: new_password.clone(),
        })
        .send()
        .await
        .map_err(|err| RegistryError::internal(format!("peering announcement failed: {err}")))?;
    if !response.status().is_success() {
        return Err(RegistryError::internal(format!(
            "peer {} rejected the peering announcement with {}",
            peer.hostname,
            response.status()
        )));
    }

    sqlx::query(
        "UPDATE peers SET our_password = $2, last_peered_at = $3 WHERE hostname = $1",
    )
    .bind(&peer.hostname)
    .bind(&new_password)
    .bind(crate::db::now())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(Some(peer.hostname))
}

/// Looks up which peer owns the account, refusing self-loops.
pub async fn find_responsible_peer(
    state: &AppState,
    account_name: &str,
) -> RegistryResult<Option<String>> {
    let primary = match state
        .drivers
        .federation
        .find_primary_account(account_name)
        .await
    {
        Ok(hostname) => hostname,
        Err(FederationError::NoSuchPrimaryAccount) => return Ok(None),
        Err(err) => return Err(RegistryError::internal(err)),
    };
    if primary == state.config.api_public_hostname {
        // The federation says we own it, but the account row is gone. Do
        // not proxy to ourselves in circles.
        return Ok(None);
    }
    Ok(Some(primary))
}

/// Anycast fallback: the account is not ours, so find the primary and relay
/// the pull, with a peer token obtained on the fly. `subpath` is
/// `manifests/<reference>` or `blobs/<digest>`.
pub async fn proxy_anycast_pull(
    state: &AppState,
    repo: &RepoPath,
    subpath: &str,
    head_only: bool,
) -> RegistryResult<Response> {
    let primary = find_responsible_peer(state, &repo.account_name)
        .await?
        .ok_or_else(|| RegistryError::new(RegistryErrorCode::NameUnknown))?;

    let scope = format!("repository:{}:pull", repo.full_name());
    let token = get_peer_token(state, &primary, &scope).await?;
    let url = format!("https://{primary}/v2/{}/{subpath}", repo.full_name());
    let request = if head_only {
        state.http.head(&url)
    } else {
        state.http.get(&url)
    };
    let response = request
        .bearer_auth(token)
        .header("Accept", crate::manifest::media_types::ALL.join(", "))
        .send()
        .await
        .map_err(|err| RegistryError::internal(format!("anycast relay failed: {err}")))?;

    // Relayed blob bytes count against the anycast byte budget; the proxy
    // hop is the expensive part of anycast serving.
    if subpath.starts_with("blobs/") {
        let relayed_bytes = response.content_length().unwrap_or(1).max(1);
        match state
            .drivers
            .rate_limit
            .check(
                &repo.account_name,
                crate::drivers::RateLimitAction::AnycastBlobBytePull,
                "",
                relayed_bytes,
            )
            .await
        {
            Ok(decision) if !decision.allowed => {
                return Err(RegistryError::too_many_requests(decision.retry_after_seconds))
            }
            Ok(_) => {}
            Err(err) => warn!("rate-limit store failure, failing open: {err}"),
        }
    }

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = Vec::new();
    for name in ["Content-Type", "Docker-Content-Digest", "Content-Length"] {
        if let Some(value) = response.headers().get(name).and_then(|v| v.to_str().ok()) {
            headers.push((name, value.to_string()));
        }
    }
    let body = response
        .bytes()
        .await
        .map_err(|err| RegistryError::internal(format!("anycast relay read failed: {err}")))?;

    let mut relayed = (status, body).into_response();
    for (name, value) in headers {
        if let Ok(value) = value.parse() {
            relayed.headers_mut().insert(name, value);
        }
    }
    Ok(relayed)
}

/// Makes sure a `peers` row exists for every configured peer, so that
/// credential rotation has something to work on.
pub async fn ensure_peer_rows(state: &AppState) -> Result<(), sqlx::Error> {
    for hostname in &state.config.peer_hostnames {
        sqlx::query("INSERT INTO peers (hostname) VALUES ($1) ON CONFLICT (hostname) DO NOTHING")
            .bind(hostname)
            .execute(state.db.pool())
            .await?;
    }
    Ok(())
}
