use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Peer: another keppel in the fleet. We present `our_password` to them as
/// `replication@<our-hostname>`; they present theirs, which we only keep
/// hashed. Passwords rotate every few minutes, so the previous hash stays
/// valid during the overlap.
#[derive(Clone, Debug, FromRow)]
pub struct Peer {
    pub hostname: String,
    pub our_password: String,
    pub their_current_password_hash: String,
    pub their_previous_password_hash: String,
    pub last_peered_at: Option<DateTime<Utc>>,
}

impl Peer {
    pub fn matches_password(&self, presented: &str) -> bool {
        let hash = crate::models::peer::hash_password(presented);
        !hash.is_empty()
            && (hash == self.their_current_password_hash
                || hash == self.their_previous_password_hash)
    }
}

pub fn hash_password(password: &str) -> String {
    if password.is_empty() {
        return String::new();
    }
    crate::digest::Digest::of_contents(password.as_bytes()).hex()
}

/// Quota: per-tenant limits across all of the tenant's accounts.
#[derive(Clone, Debug, FromRow)]
pub struct Quota {
    pub auth_tenant_id: String,
    pub manifests: i64,
}

impl Quota {
    pub fn default_for(auth_tenant_id: &str) -> Self {
        Quota {
            auth_tenant_id: auth_tenant_id.into(),
            manifests: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_check_accepts_current_and_previous() {
        let peer = Peer {
            hostname: "peer.example.org".into(),
            our_password: "irrelevant".into(),
            their_current_password_hash: hash_password("new-secret"),
            their_previous_password_hash: hash_password("old-secret"),
            last_peered_at: None,
        };
        assert!(peer.matches_password("new-secret"));
        assert!(peer.matches_password("old-secret"));
        assert!(!peer.matches_password("wrong"));
        assert!(!peer.matches_password(""));
    }
}
