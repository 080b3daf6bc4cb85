//! Control-plane exercises: account lifecycle, sublease issuance, repo and
//! tag management. Needs KEPPEL_TEST_DB_URL; skips itself without it.

mod common;

use axum::body::Body;
use axum::http::Request;
use serde_json::json;

use common::read_json;

#[tokio::test]
async fn account_lifecycle() {
    let Some(harness) = common::harness().await else { return };
    let account = common::unique_account();
    harness.create_account(&account).await;

    // Creating the same account again is an update, not an error.
    harness.create_account(&account).await;

    let response = harness
        .request(
            Request::builder()
                .uri(format!("/keppel/v1/accounts/{account}"))
                .header("Authorization", harness.basic_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = read_json(response).await;
    assert_eq!(body["account"]["name"], account);
    assert_eq!(body["account"]["auth_tenant_id"], harness.tenant);

    let response = harness
        .request(
            Request::builder()
                .uri("/keppel/v1/accounts")
                .header("Authorization", harness.basic_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let body = read_json(response).await;
    let names: Vec<&str> = body["accounts"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|entry| entry["name"].as_str())
        .collect();
    assert!(names.contains(&account.as_str()));

    // An empty account deletes cleanly.
    let response = harness
        .request(
            Request::builder()
                .method("DELETE")
                .uri(format!("/keppel/v1/accounts/{account}"))
                .header("Authorization", harness.basic_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 204);

    let response = harness
        .request(
            Request::builder()
                .uri(format!("/keppel/v1/accounts/{account}"))
                .header("Authorization", harness.basic_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn accounts_require_valid_names_and_tenants() {
    let Some(harness) = common::harness().await else { return };

    let body = json!({"account": {"name": "UPPER", "auth_tenant_id": harness.tenant}});
    let response = harness
        .request(
            Request::builder()
                .method("PUT")
                .uri("/keppel/v1/accounts/UPPER")
                .header("Authorization", harness.basic_auth())
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 400);

    // A tenant the user has no ChangeAccount permission on is forbidden.
    let account = common::unique_account();
    let body = json!({"account": {"name": account, "auth_tenant_id": "foreign-tenant"}});
    let response = harness
        .request(
            Request::builder()
                .method("PUT")
                .uri(format!("/keppel/v1/accounts/{account}"))
                .header("Authorization", harness.basic_auth())
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn sublease_issuance_is_primary_only() {
    let Some(harness) = common::harness().await else { return };
    let account = common::unique_account();
    harness.create_account(&account).await;

    let response = harness
        .request(
            Request::builder()
                .method("POST")
                .uri(format!("/keppel/v1/accounts/{account}/sublease"))
                .header("Authorization", harness.basic_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = read_json(response).await;
    let secret = body["sublease_token"].as_str().unwrap();
    assert!(!secret.is_empty());

    // The secret is consumable exactly once through the federation driver.
    use keppel::drivers::ClaimResult;
    let claim = harness
        .state
        .drivers
        .federation
        .claim_account_name(&account, "replica.example.org", Some(secret))
        .await
        .unwrap();
    assert_eq!(claim, ClaimResult::Succeeded);
    let claim = harness
        .state
        .drivers
        .federation
        .claim_account_name(&account, "another.example.org", Some(secret))
        .await
        .unwrap();
    assert!(matches!(claim, ClaimResult::Failed { .. }));
}

#[tokio::test]
async fn quota_endpoint_round_trip() {
    let Some(harness) = common::harness().await else { return };

    let response = harness
        .request(
            Request::builder()
                .uri(format!("/keppel/v1/quotas/{}", harness.tenant))
                .header("Authorization", harness.basic_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = read_json(response).await;
    assert_eq!(body["manifests"]["quota"], 0);
    assert_eq!(body["manifests"]["usage"], 0);

    let response = harness
        .request(
            Request::builder()
                .method("PUT")
                .uri(format!("/keppel/v1/quotas/{}", harness.tenant))
                .header("Authorization", harness.basic_auth())
                .header("Content-Type", "application/json")
                .body(Body::from(json!({"manifests": {"quota": 100}}).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = read_json(response).await;
    assert_eq!(body["manifests"]["quota"], 100);

    let response = harness
        .request(
            Request::builder()
                .method("PUT")
                .uri(format!("/keppel/v1/quotas/{}", harness.tenant))
                .header("Authorization", harness.basic_auth())
                .header("Content-Type", "application/json")
                .body(Body::from(json!({"manifests": {"quota": -1}}).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn anonymous_management_requests_are_rejected() {
    let Some(harness) = common::harness().await else { return };
    let response = harness
        .request(
            Request::builder()
                .uri("/keppel/v1/accounts")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn healthcheck_answers_ok() {
    let Some(harness) = common::harness().await else { return };
    let response = harness
        .request(
            Request::builder()
                .uri("/healthcheck")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(common::read_body(response).await, b"ok");
}
