//! Shared plumbing for the integration suites. Everything runs against the
//! real router with in-memory drivers; only the metadata database is
//! external, and the suites skip themselves unless `KEPPEL_TEST_DB_URL`
//! points at a throwaway PostgreSQL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use tower::ServiceExt;

use keppel::api::{make_router, AppState};
use keppel::config::RuntimeConfig;
use keppel::db::Database;
use keppel::drivers::auth::{Permission, TrivialAuthDriver};
use keppel::drivers::federation::StoreBackedFederationDriver;
use keppel::drivers::inbound_cache::LocalInboundCache;
use keppel::drivers::rate_limit::NoopRateLimitDriver;
use keppel::drivers::storage::in_memory::InMemoryStorage;
use keppel::drivers::{account_management::TrivialAccountManagementDriver, Drivers};

pub const HOSTNAME: &str = "registry.example.org";
pub const USER: &str = "jane";
pub const PASSWORD: &str = "secret";

const RSA_PRIVATE_KEY: &str = include_str!("test_issuer_key.pem");
const RSA_PUBLIC_KEY: &str = include_str!("test_issuer_cert.pem");

fn full_grants(tenant: &str) -> HashMap<String, Vec<Permission>> {
    let mut grants = HashMap::new();
    grants.insert(
        tenant.to_string(),
        vec![
            Permission::ViewAccount,
            Permission::PullFromAccount,
            Permission::PushToAccount,
            Permission::DeleteFromAccount,
            Permission::ChangeAccount,
            Permission::ViewQuotas,
            Permission::ChangeQuotas,
        ],
    );
    grants
}

fn config(database_url: String) -> RuntimeConfig {
    RuntimeConfig {
        api_public_hostname: HOSTNAME.into(),
        anycast_api_public_hostname: None,
        database_url,
        issuer_key_pem: RSA_PRIVATE_KEY.into(),
        issuer_public_key_pem: RSA_PUBLIC_KEY.into(),
        redis_url: None,
        peer_hostnames: Vec::new(),
        auth_driver: "trivial".into(),
        storage_driver: "in-memory".into(),
        federation_driver: "in-memory".into(),
        federation_chain: Vec::new(),
        inbound_cache_driver: "local".into(),
        rate_limit_driver: "noop".into(),
        account_management_driver: "trivial".into(),
        storage_path: None,
        trivy_url: None,
        trivy_token: None,
        managed_accounts_path: None,
        blob_sweep_grace: Duration::from_secs(0),
        shutdown_grace: Duration::from_secs(10),
        insecure_debug: false,
    }
}

/// The tenant that `jane` has full permissions on for this test run.
pub fn unique_tenant() -> String {
    format!("tenant-{}", &uuid_hex()[..12])
}

pub fn unique_account() -> String {
    format!("t{}", &uuid_hex()[..12])
}

fn uuid_hex() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub struct TestHarness {
    pub state: AppState,
    pub app: axum::Router,
    pub tenant: String,
    /// Direct handle on the storage backing the harness, for assertions
    /// about stored objects.
    pub storage: Arc<InMemoryStorage>,
}

/// None (= skip the test) when no test database is configured.
pub async fn harness() -> Option<TestHarness> {
    let Ok(database_url) = std::env::var("KEPPEL_TEST_DB_URL") else {
        eprintln!("skipping: KEPPEL_TEST_DB_URL is not set");
        return None;
    };
    let tenant = unique_tenant();
    let db = Database::connect(&database_url, 5)
        .await
        .expect("cannot connect to KEPPEL_TEST_DB_URL");
    let storage = Arc::new(InMemoryStorage::new());
    let drivers = Drivers {
        auth: Arc::new(TrivialAuthDriver::new().with_user(USER, PASSWORD, full_grants(&tenant))),
        storage: storage.clone(),
        federation: Arc::new(StoreBackedFederationDriver::in_memory()),
        inbound_cache: Arc::new(LocalInboundCache::new()),
        rate_limit: Arc::new(NoopRateLimitDriver),
        account_management: Arc::new(TrivialAccountManagementDriver),
    };
    let state = AppState::new(config(database_url), db, drivers);
    let app = make_router(state.clone());
    Some(TestHarness { state, app, tenant, storage })
}

impl TestHarness {
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.app
            .clone()
            .oneshot(request)
            .await
            .expect("router never fails")
    }

    pub fn basic_auth(&self) -> String {
        use base64::prelude::{Engine, BASE64_STANDARD};
        format!(
            "Basic {}",
            BASE64_STANDARD.encode(format!("{USER}:{PASSWORD}"))
        )
    }

    /// Creates a primary account owned by the test tenant through the
    /// management API.
    pub async fn create_account(&self, name: &str) {
        let body = serde_json::json!({
            "account": {
                "name": name,
                "auth_tenant_id": self.tenant,
            }
        });
        let response = self
            .request(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/keppel/v1/accounts/{name}"))
                    .header("Authorization", self.basic_auth())
                    .header("Content-Type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), 200, "account creation failed");
    }

    /// Fetches a registry bearer token for the given scopes.
    pub async fn registry_token(&self, scopes: &[&str]) -> String {
        let scope_params: Vec<String> = scopes
            .iter()
            .map(|scope| format!("scope={}", urlencode(scope)))
            .collect();
        let uri = format!(
            "/keppel/v1/auth?service={HOSTNAME}&{}",
            scope_params.join("&")
        );
        let response = self
            .request(
                Request::builder()
                    .uri(uri)
                    .header("Authorization", self.basic_auth())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), 200, "token issuance failed");
        let body = read_json(response).await;
        body["token"].as_str().expect("token field").to_string()
    }
}

pub fn urlencode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

pub async fn read_body(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body read never fails")
        .to_bytes()
        .to_vec()
}

pub async fn read_json(response: Response<Body>) -> serde_json::Value {
    let raw = read_body(response).await;
    serde_json::from_slice(&raw).expect("response is JSON")
}
