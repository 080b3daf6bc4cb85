use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Blob: a content-addressed byte sequence, unique per (account, digest).
/// The bytes live in the storage backend under `storage_id`.
#[derive(Clone, Debug, FromRow)]
pub struct Blob {
    pub id: i64,
    pub account_name: String,
    pub digest: String,
    pub size_bytes: i64,
    pub storage_id: String,
    pub media_type: String,
    pub pushed_at: DateTime<Utc>,
    pub validated_at: DateTime<Utc>,
    pub validation_error_message: String,
    /// Set when the last mount disappears; the blob sweep deletes the blob
    /// once this moment has passed.
    pub can_be_deleted_at: Option<DateTime<Utc>>,
    /// Why vulnerability scanning cannot cover manifests using this blob
    /// (e.g. layer exceeds the scanner's size limit).
    pub blocks_vuln_scanning_reason: Option<String>,
    pub next_validation_at: DateTime<Utc>,
}

/// BlobMount: makes a blob reachable inside one repository of its account.
#[derive(Clone, Debug, FromRow)]
pub struct BlobMount {
    pub blob_id: i64,
    pub repo_id: i64,
    /// Set when no manifest in the repo references the blob anymore; the
    /// mount sweep removes the mount once this moment has passed.
    pub can_be_deleted_at: Option<DateTime<Utc>>,
}

/// Upload: an in-flight chunked blob upload.
#[derive(Clone, Debug, FromRow)]
pub struct Upload {
    pub repo_id: i64,
    pub uuid: Uuid,
    pub storage_id: String,
    pub size_bytes: i64,
    /// Digest of the bytes received so far.
    pub digest: String,
    pub num_chunks: i32,
    pub updated_at: DateTime<Utc>,
}

/// PendingBlob: a blob that a replica account has promised to serve but has
/// not finished replicating yet.
#[derive(Clone, Debug, FromRow)]
pub struct PendingBlob {
    pub account_name: String,
    pub digest: String,
    /// The repo through which the blob is reachable upstream.
    pub repo_name: String,
    pub reason: String,
    pub since: DateTime<Utc>,
    pub num_failures: i32,
    pub next_check_at: DateTime<Utc>,
}

/// UnknownBlob: an object found in storage without a matching database row.
/// Deleted by the storage sweep after a grace period.
#[derive(Clone, Debug, FromRow)]
pub struct UnknownBlob {
    pub account_name: String,
    pub storage_id: String,
    pub can_be_deleted_at: DateTime<Utc>,
}
