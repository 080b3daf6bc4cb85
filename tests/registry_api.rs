//! End-to-end exercises of the registry V2 surface against the real router.
//! Needs KEPPEL_TEST_DB_URL; each test skips itself quietly without it.

mod common;

use axum::body::Body;
use axum::http::Request;
use serde_json::json;

use common::{read_body, read_json, HOSTNAME};

const HELLO_WORLD_DIGEST: &str =
    "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

#[tokio::test]
async fn chunked_blob_push_and_pull() {
    let Some(harness) = common::harness().await else { return };
    let account = common::unique_account();
    harness.create_account(&account).await;
    let repo = format!("{account}/foo");
    let token = harness
        .registry_token(&[&format!("repository:{repo}:pull,push")])
        .await;

    // POST starts the upload.
    let response = harness
        .request(
            Request::builder()
                .method("POST")
                .uri(format!("/v2/{repo}/blobs/uploads/"))
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 202);
    let location = response.headers()["Location"].to_str().unwrap().to_string();
    assert_eq!(response.headers()["Range"].to_str().unwrap(), "0-0");

    // Two PATCH chunks.
    let response = harness
        .request(
            Request::builder()
                .method("PATCH")
                .uri(&location)
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::from("hello"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 202);
    assert_eq!(response.headers()["Range"].to_str().unwrap(), "0-4");

    let response = harness
        .request(
            Request::builder()
                .method("PATCH")
                .uri(&location)
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::from(" world"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 202);
    assert_eq!(response.headers()["Range"].to_str().unwrap(), "0-10");

    // PUT with the digest finalizes.
    let response = harness
        .request(
            Request::builder()
                .method("PUT")
                .uri(format!("{location}?digest={HELLO_WORLD_DIGEST}"))
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 201);
    assert_eq!(
        response.headers()["Docker-Content-Digest"].to_str().unwrap(),
        HELLO_WORLD_DIGEST
    );

    // The blob is pullable and byte-identical.
    let response = harness
        .request(
            Request::builder()
                .uri(format!("/v2/{repo}/blobs/{HELLO_WORLD_DIGEST}"))
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(read_body(response).await, b"hello world");
}

#[tokio::test]
async fn upload_with_wrong_digest_is_rejected() {
    let Some(harness) = common::harness().await else { return };
    let account = common::unique_account();
    harness.create_account(&account).await;
    let repo = format!("{account}/foo");
    let token = harness
        .registry_token(&[&format!("repository:{repo}:pull,push")])
        .await;

    let bogus = "sha256:0000000000000000000000000000000000000000000000000000000000000000";
    let response = harness
        .request(
            Request::builder()
                .method("POST")
                .uri(format!("/v2/{repo}/blobs/uploads/?digest={bogus}"))
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::from("some bytes"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 400);
    let body = read_json(response).await;
    assert_eq!(body["errors"][0]["code"], "DIGEST_INVALID");
}

#[tokio::test]
async fn manifest_with_missing_blob_is_rejected() {
    let Some(harness) = common::harness().await else { return };
    let account = common::unique_account();
    harness.create_account(&account).await;
    let repo = format!("{account}/foo");
    let token = harness
        .registry_token(&[&format!("repository:{repo}:pull,push")])
        .await;

    let missing = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": missing,
            "size": 10,
        },
        "layers": [],
    });
    let response = harness
        .request(
            Request::builder()
                .method("PUT")
                .uri(format!("/v2/{repo}/manifests/latest"))
                .header("Authorization", format!("Bearer {token}"))
                .header("Content-Type", "application/vnd.oci.image.manifest.v1+json")
                .body(Body::from(manifest.to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 400);
    let body = read_json(response).await;
    assert_eq!(body["errors"][0]["code"], "MANIFEST_BLOB_UNKNOWN");
}

async fn push_blob(harness: &common::TestHarness, repo: &str, token: &str, contents: &[u8]) -> String {
    let digest = keppel::digest::Digest::of_contents(contents).to_string();
    let response = harness
        .request(
            Request::builder()
                .method("POST")
                .uri(format!("/v2/{repo}/blobs/uploads/?digest={digest}"))
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::from(contents.to_vec()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 201, "monolithic blob push failed");
    digest
}

#[tokio::test]
async fn manifest_push_pull_and_tag_list() {
    let Some(harness) = common::harness().await else { return };
    let account = common::unique_account();
    harness.create_account(&account).await;
    let repo = format!("{account}/app");
    let token = harness
        .registry_token(&[&format!("repository:{repo}:pull,push")])
        .await;

    let config_digest = push_blob(&harness, &repo, &token, b"{\"os\":\"linux\"}").await;
    let layer_digest = push_blob(&harness, &repo, &token, b"layer-bytes").await;

    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": 14,
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": layer_digest,
            "size": 11,
        }],
    })
    .to_string();

    let response = harness
        .request(
            Request::builder()
                .method("PUT")
                .uri(format!("/v2/{repo}/manifests/v1.0"))
                .header("Authorization", format!("Bearer {token}"))
                .header("Content-Type", "application/vnd.oci.image.manifest.v1+json")
                .body(Body::from(manifest.clone()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 201);
    let manifest_digest = response.headers()["Docker-Content-Digest"]
        .to_str()
        .unwrap()
        .to_string();

    // Pull by tag returns the canonical bytes.
    let response = harness
        .request(
            Request::builder()
                .uri(format!("/v2/{repo}/manifests/v1.0"))
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["Docker-Content-Digest"].to_str().unwrap(),
        manifest_digest
    );
    assert_eq!(read_body(response).await, manifest.as_bytes());

    // The tag shows up in the list.
    let response = harness
        .request(
            Request::builder()
                .uri(format!("/v2/{repo}/tags/list"))
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = read_json(response).await;
    assert_eq!(body["name"], repo);
    assert_eq!(body["tags"], json!(["v1.0"]));
}

#[tokio::test]
async fn cross_repo_mount_shares_bytes_within_account() {
    let Some(harness) = common::harness().await else { return };
    let account = common::unique_account();
    harness.create_account(&account).await;
    let source_repo = format!("{account}/foo");
    let target_repo = format!("{account}/bar");
    let token = harness
        .registry_token(&[
            &format!("repository:{source_repo}:pull,push"),
            &format!("repository:{target_repo}:pull,push"),
        ])
        .await;

    let digest = push_blob(&harness, &source_repo, &token, b"shared bytes").await;
    let blobs_before = harness_storage_blob_count(&harness);

    let response = harness
        .request(
            Request::builder()
                .method("POST")
                .uri(format!(
                    "/v2/{target_repo}/blobs/uploads/?mount={digest}&from={source_repo}"
                ))
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 201);

    // No new storage object appeared; the blob is still pullable from both.
    assert_eq!(harness_storage_blob_count(&harness), blobs_before);
    for repo in [&source_repo, &target_repo] {
        let response = harness
            .request(
                Request::builder()
                    .uri(format!("/v2/{repo}/blobs/{digest}"))
                    .header("Authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(read_body(response).await, b"shared bytes");
    }
}

fn harness_storage_blob_count(harness: &common::TestHarness) -> usize {
    harness.storage.blob_count()
}

#[tokio::test]
async fn unauthenticated_requests_get_a_challenge() {
    let Some(harness) = common::harness().await else { return };
    let response = harness
        .request(
            Request::builder()
                .uri("/v2/")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 401);
    let challenge = response.headers()["Www-Authenticate"].to_str().unwrap();
    assert!(challenge.starts_with(&format!(
        "Bearer realm=\"https://{HOSTNAME}/keppel/v1/auth\""
    )));
}

#[tokio::test]
async fn tokens_do_not_grant_foreign_repos() {
    let Some(harness) = common::harness().await else { return };
    let account = common::unique_account();
    harness.create_account(&account).await;
    let repo = format!("{account}/foo");
    let other_repo = format!("{account}/other");
    let token = harness
        .registry_token(&[&format!("repository:{repo}:pull,push")])
        .await;

    let response = harness
        .request(
            Request::builder()
                .method("POST")
                .uri(format!("/v2/{other_repo}/blobs/uploads/"))
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn manifest_quota_is_enforced() {
    let Some(harness) = common::harness().await else { return };
    let account = common::unique_account();
    harness.create_account(&account).await;
    let repo = format!("{account}/app");

    // Allow exactly one manifest for this tenant.
    let response = harness
        .request(
            Request::builder()
                .method("PUT")
                .uri(format!("/keppel/v1/quotas/{}", harness.tenant))
                .header("Authorization", harness.basic_auth())
                .header("Content-Type", "application/json")
                .body(Body::from(json!({"manifests": {"quota": 1}}).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 200);

    let token = harness
        .registry_token(&[&format!("repository:{repo}:pull,push")])
        .await;
    let config_digest = push_blob(&harness, &repo, &token, b"{}").await;

    let push_manifest = |tag: &str, layer: String| {
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": 2,
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": layer,
                "size": 7,
            }],
        });
        Request::builder()
            .method("PUT")
            .uri(format!("/v2/{repo}/manifests/{tag}"))
            .header("Authorization", format!("Bearer {token}"))
            .header("Content-Type", "application/vnd.oci.image.manifest.v1+json")
            .body(Body::from(manifest.to_string()))
            .unwrap()
    };

    let layer1 = push_blob(&harness, &repo, &token, b"layer-1").await;
    let response = harness.request(push_manifest("one", layer1)).await;
    assert_eq!(response.status(), 201);

    let layer2 = push_blob(&harness, &repo, &token, b"layer-2").await;
    let response = harness.request(push_manifest("two", layer2)).await;
    assert_eq!(response.status(), 403);
    let body = read_json(response).await;
    assert_eq!(body["errors"][0]["code"], "DENIED");
}

#[tokio::test]
async fn manifest_delete_removes_tags_and_orphans_blobs() {
    let Some(harness) = common::harness().await else { return };
    let account = common::unique_account();
    harness.create_account(&account).await;
    let repo = format!("{account}/app");
    let token = harness
        .registry_token(&[&format!("repository:{repo}:pull,push,delete")])
        .await;

    let config_digest = push_blob(&harness, &repo, &token, b"{}").await;
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": 2,
        },
        "layers": [],
    })
    .to_string();
    let response = harness
        .request(
            Request::builder()
                .method("PUT")
                .uri(format!("/v2/{repo}/manifests/latest"))
                .header("Authorization", format!("Bearer {token}"))
                .header("Content-Type", "application/vnd.oci.image.manifest.v1+json")
                .body(Body::from(manifest))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 201);
    let digest = response.headers()["Docker-Content-Digest"]
        .to_str()
        .unwrap()
        .to_string();

    let response = harness
        .request(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v2/{repo}/manifests/{digest}"))
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 202);

    // Pulling by the old tag now fails, and the tag list is empty.
    let response = harness
        .request(
            Request::builder()
                .uri(format!("/v2/{repo}/manifests/latest"))
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), 404);
    let response = harness
        .request(
            Request::builder()
                .uri(format!("/v2/{repo}/tags/list"))
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let body = read_json(response).await;
    assert_eq!(body["tags"], json!([]));
}
