//! HTTP client for pulling manifests and blobs from the upstream of a
//! replica account: either a peer keppel or an external registry.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::api::AppState;
use crate::digest::Digest;
use crate::errors::{RegistryError, RegistryErrorCode, RegistryResult};
use crate::manifest::media_types;

enum Mode {
    Peer {
        hostname: String,
    },
    External {
        /// `host` or `host/basepath`; the upstream repo is the basepath
        /// joined with the local repo name.
        base: String,
        username: Option<String>,
        password: Option<String>,
    },
}

impl Mode {
    fn host(&self) -> &str {
        match self {
            Mode::Peer { hostname } => hostname,
            Mode::External { base, .. } => base.split('/').next().unwrap_or(base),
        }
    }

    fn repo_name(&self, account_name: &str, repo_name: &str) -> String {
        match self {
            Mode::Peer { .. } => format!("{account_name}/{repo_name}"),
            Mode::External { base, .. } => match base.split_once('/') {
                Some((_, basepath)) => format!("{basepath}/{repo_name}"),
                None => repo_name.to_string(),
            },
        }
    }
}

pub struct UpstreamClient {
    state: AppState,
    account_name: String,
    mode: Mode,
    allow_delegation: bool,
}

pub type UpstreamByteStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

impl UpstreamClient {
    pub(crate) fn peer(state: AppState, account_name: String, hostname: String) -> Self {
        UpstreamClient {
            state,
            account_name,
            mode: Mode::Peer { hostname },
            allow_delegation: true,
        }
    }

    pub(crate) fn external(
        state: AppState,
        account_name: String,
        base: String,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        UpstreamClient {
            state,
            account_name,
            mode: Mode::External { base, username, password },
            allow_delegation: true,
        }
    }

    /// A delegate must never delegate onwards; that way lies a pull loop
    /// through the whole fleet.
    pub fn without_delegation(mut self) -> Self {
        self.allow_delegation = false;
        self
    }

    pub fn upstream_host(&self) -> &str {
        self.mode.host()
    }

    /// The repository path as the upstream knows it.
    pub fn upstream_repo_name(&self, repo_name: &str) -> String {
        self.mode.repo_name(&self.account_name, repo_name)
    }

    fn manifest_url(&self, repo_name: &str, reference: &str) -> String {
        format!(
            "https://{}/v2/{}/manifests/{reference}",
            self.upstream_host(),
            self.upstream_repo_name(repo_name)
        )
    }

    fn blob_url(&self, repo_name: &str, digest: &Digest) -> String {
        format!(
            "https://{}/v2/{}/blobs/{digest}",
            self.upstream_host(),
            self.upstream_repo_name(repo_name)
        )
    }

    async fn bearer_token_for(&self, repo_name: &str) -> RegistryResult<String> {
        match &self.mode {
            Mode::Peer { hostname } => {
                let scope = format!(
                    "repository:{}:pull",
                    self.upstream_repo_name(repo_name)
                );
                crate::peering::get_peer_token(&self.state, hostname, &scope).await
            }
            Mode::External { .. } => Err(RegistryError::internal(
                "external upstreams negotiate tokens per challenge",
            )),
        }
    }

    /// One GET against the upstream, with the token dance appropriate for
    /// the upstream kind.
    async fn get(&self, url: &str, repo_name: &str, accept: &str) -> RegistryResult<reqwest::Response> {
        let http = &self.state.http;
        match &self.mode {
            Mode::Peer { .. } => {
                let token = self.bearer_token_for(repo_name).await?;
                http.get(url)
                    .header("Accept", accept)
                    .bearer_auth(token)
                    .send()
                    .await
                    .map_err(|err| RegistryError::internal(format!("peer request failed: {err}")))
            }
            Mode::External { username, password, .. } => {
                // Try anonymously first; follow the Bearer challenge if the
                // upstream wants a token.
                let response = http
                    .get(url)
                    .header("Accept", accept)
                    .send()
                    .await
                    .map_err(|err| {
                        RegistryError::internal(format!("upstream request failed: {err}"))
                    })?;
                if response.status() != http::StatusCode::UNAUTHORIZED {
                    return Ok(response);
                }
                let challenge = response
                    .headers()
                    .get("Www-Authenticate")
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
                    .unwrap_or_default();
                let token = self
                    .fetch_external_token(&challenge, username.as_deref(), password.as_deref())
                    .await?;
                http.get(url)
                    .header("Accept", accept)
                    .bearer_auth(token)
                    .send()
                    .await
                    .map_err(|err| {
                        RegistryError::internal(format!("upstream request failed: {err}"))
                    })
            }
        }
    }

    async fn fetch_external_token(
        &self,
        challenge: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> RegistryResult<String> {
        let params = parse_bearer_challenge(challenge).ok_or_else(|| {
            RegistryError::internal(format!("cannot parse upstream auth challenge: {challenge}"))
        })?;
        let mut request = self.state.http.get(&params.realm).query(&params.query_pairs());
        if let (Some(username), Some(password)) = (username, password) {
            request = request.basic_auth(username, Some(password));
        }
        let response = request.send().await.map_err(|err| {
            RegistryError::internal(format!("upstream token endpoint failed: {err}"))
        })?;
        if !response.status().is_success() {
            return Err(RegistryError::internal(format!(
                "upstream token endpoint returned {}",
                response.status()
            )));
        }
        #[derive(serde::Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: Option<String>,
            #[serde(default)]
            access_token: Option<String>,
        }
        let body: TokenResponse = response.json().await.map_err(|err| {
            RegistryError::internal(format!("upstream token response is malformed: {err}"))
        })?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| RegistryError::internal("upstream token response carries no token"))
    }

    /// GET the manifest; returns (bytes, media type).
    pub async fn fetch_manifest(
        &self,
        repo_name: &str,
        reference: &str,
    ) -> RegistryResult<(Bytes, String)> {
        let accept = media_types::ALL.join(", ");
        let url = self.manifest_url(repo_name, reference);
        let response = self.get(&url, repo_name, &accept).await?;

        let response = match response.status() {
            status if status == http::StatusCode::TOO_MANY_REQUESTS && self.allow_delegation => {
                // The upstream is rate-limiting us; a peer may still have
                // budget. Hand the pull over.
                match self.delegated_pull(repo_name, reference).await {
                    Ok(delegated) => return Ok(delegated),
                    Err(delegation_err) => {
                        debug!("pull delegation failed, surfacing original 429: {delegation_err}");
                        return Err(upstream_error(status, response).await);
                    }
                }
            }
            status if !status.is_success() => return Err(upstream_error(status, response).await),
            _ => response,
        };

        let media_type = response
            .headers()
            .get("Content-Type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or(media_types::DOCKER_MANIFEST)
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        let contents = response.bytes().await.map_err(|err| {
            RegistryError::internal(format!("cannot read upstream manifest: {err}"))
        })?;
        Ok((contents, media_type))
    }

    /// GET the blob as a byte stream.
    pub async fn fetch_blob(
        &self,
        repo_name: &str,
        digest: &Digest,
    ) -> RegistryResult<UpstreamByteStream> {
        let url = self.blob_url(repo_name, digest);
        let response = self
            .get(&url, repo_name, "application/octet-stream")
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(upstream_error(status, response).await);
        }
        Ok(response.bytes_stream().boxed())
    }

    /// GET `/peer/v1/delegatedpull/<host>/v2/<repo>/manifests/<ref>` on a
    /// peer, passing our upstream credentials along.
    async fn delegated_pull(
        &self,
        repo_name: &str,
        reference: &str,
    ) -> RegistryResult<(Bytes, String)> {
        let Mode::External { username, password, .. } = &self.mode else {
            return Err(RegistryError::internal("pull delegation only applies to external upstreams"));
        };
        let Some(peer_hostname) = self.state.config.peer_hostnames.first().cloned() else {
            return Err(RegistryError::internal("no peer available for pull delegation"));
        };

        let upstream_repo = self.upstream_repo_name(repo_name);
        let token = crate::peering::get_peer_token(
            &self.state,
            &peer_hostname,
            "keppel_api:peer:access",
        )
        .await?;
        let url = format!(
            "https://{peer_hostname}/peer/v1/delegatedpull/{}/v2/{upstream_repo}/manifests/{reference}",
            self.upstream_host()
        );
        let mut request = self
            .state
            .http
            .get(&url)
            .bearer_auth(token)
            .header("Accept", media_types::ALL.join(", "));
        if let Some(username) = username {
            request = request.header("X-Keppel-Delegated-Pull-Username", username);
        }
        if let Some(password) = password {
            request = request.header("X-Keppel-Delegated-Pull-Password", password);
        }
        let response = request.send().await.map_err(|err| {
            RegistryError::internal(format!("delegated pull request failed: {err}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(upstream_error(status, response).await);
        }
        let media_type = response
            .headers()
            .get("Content-Type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or(media_types::DOCKER_MANIFEST)
            .to_string();
        let contents = response.bytes().await.map_err(|err| {
            RegistryError::internal(format!("cannot read delegated manifest: {err}"))
        })?;
        Ok((contents, media_type))
    }
}

/// Re-wraps an upstream registry error: status copied, code preserved when
/// the body carries one.
async fn upstream_error(status: reqwest::StatusCode, response: reqwest::Response) -> RegistryError {
    #[derive(serde::Deserialize)]
    struct UpstreamErrorBody {
        errors: Vec<UpstreamErrorEntry>,
    }
    #[derive(serde::Deserialize)]
    struct UpstreamErrorEntry {
        code: String,
        #[serde(default)]
        message: String,
    }

    let axum_status = axum::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
    match response.json::<UpstreamErrorBody>().await {
        Ok(body) if !body.errors.is_empty() => {
            let entry = &body.errors[0];
            RegistryError::new(crate::errors::code_from_str(&entry.code))
                .with_message(entry.message.clone())
                .with_status(axum_status)
        }
        _ => RegistryError::new(RegistryErrorCode::Unknown)
            .with_message(format!("upstream registry returned {status}"))
            .with_status(axum_status),
    }
}

struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(service) = &self.service {
            pairs.push(("service", service.clone()));
        }
        if let Some(scope) = &self.scope {
            pairs.push(("scope", scope.clone()));
        }
        pairs
    }
}

fn parse_bearer_challenge(challenge: &str) -> Option<BearerChallenge> {
    static PARAM: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(\w+)="([^"]*)""#).unwrap());
    let rest = challenge.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for capture in PARAM.captures_iter(rest) {
        match &capture[1] {
            "realm" => realm = Some(capture[2].to_string()),
            "service" => service = Some(capture[2].to_string()),
            "scope" => scope = Some(capture[2].to_string()),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_challenge_parsing() {
        let challenge = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#;
        let parsed = parse_bearer_challenge(challenge).unwrap();
        assert_eq!(parsed.realm, "https://auth.docker.io/token");
        assert_eq!(parsed.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            parsed.scope.as_deref(),
            Some("repository:library/alpine:pull")
        );

        assert!(parse_bearer_challenge("Basic realm=\"x\"").is_none());
        assert!(parse_bearer_challenge("Bearer nonsense").is_none());
    }

    #[test]
    fn upstream_repo_name_composition() {
        let peer = Mode::Peer { hostname: "px.example.org".into() };
        assert_eq!(peer.repo_name("acc2", "img"), "acc2/img");
        assert_eq!(peer.host(), "px.example.org");

        let hub = Mode::External {
            base: "registry-1.docker.io/library".into(),
            username: None,
            password: None,
        };
        assert_eq!(hub.repo_name("acc2", "alpine"), "library/alpine");
        assert_eq!(hub.host(), "registry-1.docker.io");

        let bare = Mode::External { base: "ghcr.io".into(), username: None, password: None };
        assert_eq!(bare.repo_name("acc2", "tools/cli"), "tools/cli");
    }
}
