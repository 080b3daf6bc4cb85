pub mod authapi;
pub mod keppel;
pub mod peer;
pub mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::config::RuntimeConfig;
use crate::db::Database;
use crate::drivers::Drivers;
use crate::errors::{RegistryError, RegistryErrorCode};
use crate::replication::ReplicationLocks;

/// Counters exposed on /metrics. Janitors and the panic handler feed them.
#[derive(Default)]
pub struct Counters {
    pub handler_panics: AtomicU64,
    pub janitor_runs: AtomicU64,
    pub janitor_failures: AtomicU64,
}

/// AppState: everything a request handler needs, threaded through axum.
/// Cloning is cheap; all members are shared handles.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RuntimeConfig>,
    pub db: Database,
    pub drivers: Drivers,
    pub http: reqwest::Client,
    pub replication_locks: Arc<ReplicationLocks>,
    pub counters: Arc<Counters>,
    /// Running sha256 state per in-flight upload. A cache only: uploads that
    /// resume on another process rebuild the state from storage.
    pub upload_hashers: Arc<std::sync::Mutex<std::collections::HashMap<uuid::Uuid, crate::digest::RunningDigest>>>,
}

impl AppState {
    pub fn new(config: RuntimeConfig, db: Database, drivers: Drivers) -> Self {
        let mut http = reqwest::Client::builder().user_agent("keppel");
        if config.insecure_debug {
            http = http.danger_accept_invalid_certs(true);
        }
        AppState {
            config: Arc::new(config),
            db,
            drivers,
            http: http.build().expect("reqwest client construction cannot fail"),
            replication_locks: Arc::new(ReplicationLocks::default()),
            counters: Arc::new(Counters::default()),
            upload_hashers: Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
        }
    }
}

pub fn make_router(state: AppState) -> Router {
    let panic_counter = state.counters.clone();
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
        .merge(registry::router())
        .merge(authapi::router())
        .merge(keppel::router())
        .merge(peer::router())
        .layer(CatchPanicLayer::custom(move |panic_payload: Box<dyn std::any::Any + Send>| {
            panic_counter.handler_panics.fetch_add(1, Ordering::Relaxed);
            let message = panic_payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic payload of unknown type".into());
            error!("panic while serving request: {message}");
            RegistryError::new(RegistryErrorCode::Unknown)
                .with_status(StatusCode::INTERNAL_SERVER_ERROR)
                .into_response()
        }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthcheck() -> &'static str {
    "ok"
}

async fn metrics(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Response {
    let counters = &state.counters;
    let body = format!(
        "# TYPE keppel_handler_panics counter\n\
         keppel_handler_panics {}\n\
         # TYPE keppel_janitor_runs counter\n\
         keppel_janitor_runs {}\n\
         # TYPE keppel_janitor_failures counter\n\
         keppel_janitor_failures {}\n",
        counters.handler_panics.load(Ordering::Relaxed),
        counters.janitor_runs.load(Ordering::Relaxed),
        counters.janitor_failures.load(Ordering::Relaxed),
    );
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// Serves the API until SIGINT/SIGTERM, then stops accepting requests and
/// gives in-flight ones the configured grace period before aborting them.
pub async fn serve(state: AppState, listener: tokio::net::TcpListener) -> std::io::Result<()> {
    // Credential rotation needs a row per configured peer to work on.
    crate::peering::ensure_peer_rows(&state)
        .await
        .map_err(std::io::Error::other)?;

    let grace = state.config.shutdown_grace;
    let app = make_router(state);

    let shutdown = tokio_util::sync::CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested; draining requests for up to {grace:?}");
        signal_token.cancel();
    });

    let server = axum::serve(listener, app).with_graceful_shutdown({
        let token = shutdown.clone();
        async move { token.cancelled().await }
    });
    tokio::select! {
        result = server => result,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!("grace period elapsed; aborting remaining requests");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let interrupt = async {
        tokio::signal::ctrl_c().await.ok();
    };
    let terminate = async {
        #[cfg(unix)]
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("cannot install SIGTERM handler")
            .recv()
            .await;
        #[cfg(not(unix))]
        std::future::pending::<()>().await;
    };
    tokio::select! {
        _ = interrupt => {},
        _ = terminate => {},
    }
}
