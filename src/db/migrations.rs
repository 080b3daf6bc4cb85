//! Schema migrations, applied in ascending order at startup. Downgrades are
//! not supported; a migration that needs to be undone gets a successor.

pub struct Migration {
    pub version: i32,
    pub sql: &'static str,
}

pub const ALL: &[Migration] = &[
    Migration {
        version: 1,
        sql: r#"
            CREATE TABLE accounts (
                name TEXT PRIMARY KEY,
                auth_tenant_id TEXT NOT NULL,
                upstream_peer_hostname TEXT,
                external_peer_url TEXT,
                external_peer_username TEXT,
                external_peer_password TEXT,
                platform_filter_json TEXT,
                rbac_policies_json TEXT NOT NULL DEFAULT '[]',
                gc_policies_json TEXT NOT NULL DEFAULT '[]',
                required_labels TEXT,
                in_maintenance BOOLEAN NOT NULL DEFAULT FALSE,
                is_managed BOOLEAN NOT NULL DEFAULT FALSE,
                next_blob_sweep_at TIMESTAMPTZ,
                next_storage_sweep_at TIMESTAMPTZ,
                next_federation_announcement_at TIMESTAMPTZ
            );

            CREATE TABLE repos (
                id BIGSERIAL PRIMARY KEY,
                account_name TEXT NOT NULL REFERENCES accounts(name) ON DELETE CASCADE,
                name TEXT NOT NULL,
                next_blob_mount_sweep_at TIMESTAMPTZ,
                next_manifest_sync_at TIMESTAMPTZ,
                next_gc_at TIMESTAMPTZ,
                UNIQUE (account_name, name)
            );

            CREATE TABLE blobs (
                id BIGSERIAL PRIMARY KEY,
                account_name TEXT NOT NULL REFERENCES accounts(name) ON DELETE CASCADE,
                digest TEXT NOT NULL,
                size_bytes BIGINT NOT NULL,
                storage_id TEXT NOT NULL,
                media_type TEXT NOT NULL DEFAULT '',
                pushed_at TIMESTAMPTZ NOT NULL,
                validated_at TIMESTAMPTZ NOT NULL,
                validation_error_message TEXT NOT NULL DEFAULT '',
                can_be_deleted_at TIMESTAMPTZ,
                blocks_vuln_scanning_reason TEXT,
                next_validation_at TIMESTAMPTZ NOT NULL,
                UNIQUE (account_name, digest)
            );

            CREATE TABLE blob_mounts (
                blob_id BIGINT NOT NULL REFERENCES blobs(id) ON DELETE CASCADE,
                repo_id BIGINT NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
                can_be_deleted_at TIMESTAMPTZ,
                PRIMARY KEY (blob_id, repo_id)
            );

            CREATE TABLE uploads (
                repo_id BIGINT NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
                uuid UUID NOT NULL,
                storage_id TEXT NOT NULL,
                size_bytes BIGINT NOT NULL DEFAULT 0,
                digest TEXT NOT NULL DEFAULT '',
                num_chunks INTEGER NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (repo_id, uuid)
            );

            CREATE TABLE manifests (
                repo_id BIGINT NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
                digest TEXT NOT NULL,
                media_type TEXT NOT NULL,
                size_bytes BIGINT NOT NULL,
                pushed_at TIMESTAMPTZ NOT NULL,
                validated_at TIMESTAMPTZ NOT NULL,
                validation_error_message TEXT NOT NULL DEFAULT '',
                last_pulled_at TIMESTAMPTZ,
                next_validation_at TIMESTAMPTZ NOT NULL,
                labels_json TEXT NOT NULL DEFAULT '',
                min_layer_created_at TIMESTAMPTZ,
                max_layer_created_at TIMESTAMPTZ,
                gc_status_json TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (repo_id, digest)
            );

            CREATE TABLE manifest_blob_refs (
                repo_id BIGINT NOT NULL,
                manifest_digest TEXT NOT NULL,
                blob_id BIGINT NOT NULL REFERENCES blobs(id),
                PRIMARY KEY (repo_id, manifest_digest, blob_id),
                FOREIGN KEY (repo_id, manifest_digest)
                    REFERENCES manifests(repo_id, digest) ON DELETE CASCADE
            );

            CREATE TABLE manifest_manifest_refs (
                repo_id BIGINT NOT NULL,
                parent_digest TEXT NOT NULL,
                child_digest TEXT NOT NULL,
                PRIMARY KEY (repo_id, parent_digest, child_digest),
                FOREIGN KEY (repo_id, parent_digest)
                    REFERENCES manifests(repo_id, digest) ON DELETE CASCADE
            );

            CREATE TABLE tags (
                repo_id BIGINT NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                digest TEXT NOT NULL,
                pushed_at TIMESTAMPTZ NOT NULL,
                last_pulled_at TIMESTAMPTZ,
                PRIMARY KEY (repo_id, name)
            );

            CREATE TABLE peers (
                hostname TEXT PRIMARY KEY,
                our_password TEXT NOT NULL DEFAULT '',
                their_current_password_hash TEXT NOT NULL DEFAULT '',
                their_previous_password_hash TEXT NOT NULL DEFAULT '',
                last_peered_at TIMESTAMPTZ
            );

            CREATE TABLE quotas (
                auth_tenant_id TEXT PRIMARY KEY,
                manifests BIGINT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        sql: r#"
            CREATE TABLE pending_blobs (
                account_name TEXT NOT NULL REFERENCES accounts(name) ON DELETE CASCADE,
                digest TEXT NOT NULL,
                repo_name TEXT NOT NULL DEFAULT '',
                reason TEXT NOT NULL DEFAULT '',
                since TIMESTAMPTZ NOT NULL,
                num_failures INTEGER NOT NULL DEFAULT 0,
                next_check_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (account_name, digest)
            );

            CREATE TABLE unknown_blobs (
                account_name TEXT NOT NULL REFERENCES accounts(name) ON DELETE CASCADE,
                storage_id TEXT NOT NULL,
                can_be_deleted_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (account_name, storage_id)
            );

            CREATE TABLE unknown_manifests (
                account_name TEXT NOT NULL REFERENCES accounts(name) ON DELETE CASCADE,
                repo_name TEXT NOT NULL,
                digest TEXT NOT NULL,
                can_be_deleted_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (account_name, repo_name, digest)
            );
        "#,
    },
    Migration {
        version: 3,
        sql: r#"
            ALTER TABLE manifests ADD COLUMN vuln_status TEXT NOT NULL DEFAULT 'Pending';
            ALTER TABLE manifests ADD COLUMN vuln_scan_error_message TEXT NOT NULL DEFAULT '';
            ALTER TABLE manifests ADD COLUMN next_vuln_check_at TIMESTAMPTZ;
            CREATE INDEX manifests_next_vuln_check_at_idx ON manifests (next_vuln_check_at);
            CREATE INDEX manifests_next_validation_at_idx ON manifests (next_validation_at);
            CREATE INDEX blobs_next_validation_at_idx ON blobs (next_validation_at);
            CREATE INDEX uploads_updated_at_idx ON uploads (updated_at);
        "#,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_strictly_ascending() {
        let versions: Vec<i32> = ALL.iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
    }
}
