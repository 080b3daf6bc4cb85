use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

/// Manifest: a JSON document naming blobs and/or submanifests, unique per
/// (repo, digest). The canonical bytes live in the storage backend.
#[derive(Clone, Debug, FromRow)]
pub struct Manifest {
    pub repo_id: i64,
    pub digest: String,
    pub media_type: String,
    pub size_bytes: i64,
    pub pushed_at: DateTime<Utc>,
    pub validated_at: DateTime<Utc>,
    pub validation_error_message: String,
    pub last_pulled_at: Option<DateTime<Utc>>,
    pub next_validation_at: DateTime<Utc>,
    /// JSON object of image config labels; empty until validation extracted
    /// them.
    pub labels_json: String,
    pub min_layer_created_at: Option<DateTime<Utc>>,
    pub max_layer_created_at: Option<DateTime<Utc>>,
    /// JSON report of the last GC run that considered this manifest, for
    /// user visibility.
    pub gc_status_json: String,
    pub vuln_status: String,
    pub vuln_scan_error_message: String,
    pub next_vuln_check_at: Option<DateTime<Utc>>,
}

impl Manifest {
    pub fn vulnerability_status(&self) -> VulnStatus {
        VulnStatus::from_str(&self.vuln_status).unwrap_or(VulnStatus::Unknown)
    }
}

/// VulnStatus: aggregate result of vulnerability scanning for a manifest
/// (worst across its layers and submanifests).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Display, EnumString)]
#[strum(serialize_all = "PascalCase")]
pub enum VulnStatus {
    Unknown,
    Pending,
    Unsupported,
    Error,
    Clean,
    Low,
    Medium,
    High,
    Critical,
}

impl VulnStatus {
    /// The aggregate of two statuses is the more severe one, except that any
    /// non-result (Pending/Error/Unsupported) taints the aggregate.
    pub fn merge(self, other: VulnStatus) -> VulnStatus {
        use VulnStatus::*;
        match (self, other) {
            (Unknown, status) | (status, Unknown) => status,
            (Pending, _) | (_, Pending) => Pending,
            (Error, _) | (_, Error) => Error,
            (Unsupported, _) | (_, Unsupported) => Unsupported,
            (a, b) => a.max(b),
        }
    }
}

/// ManifestBlobRef: the manifest references this blob within the same repo.
/// A matching BlobMount exists for as long as this row does.
#[derive(Clone, Debug, FromRow)]
pub struct ManifestBlobRef {
    pub repo_id: i64,
    pub manifest_digest: String,
    pub blob_id: i64,
}

/// ManifestManifestRef: the parent index references the child manifest
/// within the same repo.
#[derive(Clone, Debug, FromRow)]
pub struct ManifestManifestRef {
    pub repo_id: i64,
    pub parent_digest: String,
    pub child_digest: String,
}

/// Tag: mutable pointer from a human-readable name to a manifest digest.
#[derive(Clone, Debug, FromRow)]
pub struct Tag {
    pub repo_id: i64,
    pub name: String,
    pub digest: String,
    pub pushed_at: DateTime<Utc>,
    pub last_pulled_at: Option<DateTime<Utc>>,
}

/// UnknownManifest: a manifest object found in storage without a database
/// row. Deleted by the storage sweep after a grace period.
#[derive(Clone, Debug, FromRow)]
pub struct UnknownManifest {
    pub account_name: String,
    pub repo_name: String,
    pub digest: String,
    pub can_be_deleted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vuln_status_round_trips_through_strings() {
        for status in [
            VulnStatus::Pending,
            VulnStatus::Clean,
            VulnStatus::Critical,
            VulnStatus::Unsupported,
        ] {
            assert_eq!(VulnStatus::from_str(&status.to_string()), Ok(status));
        }
    }

    #[test]
    fn vuln_status_merge_prefers_non_results_then_severity() {
        assert_eq!(
            VulnStatus::Clean.merge(VulnStatus::High),
            VulnStatus::High
        );
        assert_eq!(
            VulnStatus::Critical.merge(VulnStatus::Pending),
            VulnStatus::Pending
        );
        assert_eq!(
            VulnStatus::Unknown.merge(VulnStatus::Low),
            VulnStatus::Low
        );
    }
}
