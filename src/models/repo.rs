use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Repository: a named collection of manifests and blob mounts below an
/// account. Created lazily on first push or first replica pull.
#[derive(Clone, Debug, FromRow)]
pub struct Repository {
    pub id: i64,
    pub account_name: String,
    pub name: String,
    pub next_blob_mount_sweep_at: Option<DateTime<Utc>>,
    pub next_manifest_sync_at: Option<DateTime<Utc>>,
    pub next_gc_at: Option<DateTime<Utc>>,
}

impl Repository {
    /// The repository path as it appears in registry URLs,
    /// i.e. `<account>/<name>`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.account_name, self.name)
    }
}
