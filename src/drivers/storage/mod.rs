pub mod filesystem;
pub mod in_memory;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use rand::RngCore;
use thiserror::Error;

#[derive(Clone, Error, Debug)]
pub enum StorageError {
    #[error("object `{key}` does not exist in storage")]
    ObjectDoesNotExist { key: String },
    #[error("storage I/O error on `{key}`: {raw_error_message}")]
    Io { key: String, raw_error_message: String },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::ObjectDoesNotExist { .. })
    }
}

pub type BlobStream = BoxStream<'static, Result<Bytes, StorageError>>;

pub struct BlobContents {
    pub size_bytes: u64,
    pub stream: BlobStream,
}

impl BlobContents {
    /// Drains the stream into memory. Manifest-sized payloads only.
    pub async fn into_bytes(self) -> Result<Bytes, StorageError> {
        use futures::TryStreamExt;
        let chunks: Vec<Bytes> = self.stream.try_collect().await?;
        Ok(chunks.concat().into())
    }
}

/// What a storage sweep sees in the backend for one account.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageContents {
    /// Storage IDs of all finalized blobs.
    pub blobs: Vec<String>,
    /// (repo name, digest) of all stored manifests.
    pub manifests: Vec<(String, String)>,
}

/// StorageDriver: the blob/manifest byte store. One container per account;
/// all operations address objects relative to it. Drivers never see the
/// database.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Appends one chunk to an in-progress blob upload. Chunk numbers are
    /// monotone starting at 1.
    async fn append_to_blob(
        &self,
        account_name: &str,
        storage_id: &str,
        chunk_number: u32,
        chunk: Bytes,
    ) -> Result<(), StorageError>;

    /// Assembles the chunks written so far into the final blob object.
    async fn finalize_blob(
        &self,
        account_name: &str,
        storage_id: &str,
        num_chunks: u32,
    ) -> Result<(), StorageError>;

    /// Discards an unfinished upload and all its chunks.
    async fn abort_blob_upload(
        &self,
        account_name: &str,
        storage_id: &str,
        num_chunks: u32,
    ) -> Result<(), StorageError>;

    async fn read_blob(
        &self,
        account_name: &str,
        storage_id: &str,
    ) -> Result<BlobContents, StorageError>;

    /// Reads back the chunks of an unfinished upload in order. Used to
    /// rebuild the running digest when an upload resumes on a process that
    /// did not serve the earlier chunks.
    async fn read_uploaded_chunks(
        &self,
        account_name: &str,
        storage_id: &str,
        num_chunks: u32,
    ) -> Result<BlobContents, StorageError>;

    /// A client-facing URL for the blob, if the backend can serve one
    /// directly. `None` means the caller must stream through `read_blob`.
    async fn url_for_blob(
        &self,
        account_name: &str,
        storage_id: &str,
    ) -> Result<Option<String>, StorageError>;

    async fn delete_blob(&self, account_name: &str, storage_id: &str) -> Result<(), StorageError>;

    async fn write_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        contents: Bytes,
    ) -> Result<(), StorageError>;

    async fn read_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
    ) -> Result<Bytes, StorageError>;

    async fn delete_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
    ) -> Result<(), StorageError>;

    /// Enumerates everything in the account's container, for reconciliation
    /// against the database.
    async fn list_storage_contents(
        &self,
        account_name: &str,
    ) -> Result<StorageContents, StorageError>;
}

/// Storage IDs are opaque to everyone but the driver; 64 hex chars avoids
/// collisions without coordination.
pub fn generate_storage_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `_blobs/<ID[0:2]>/<ID[2:4]>/<ID[4:]>` — fan-out to keep directory
/// listings bounded on filesystem-like backends.
pub fn blob_object_key(storage_id: &str) -> String {
    if storage_id.len() < 4 {
        return format!("_blobs/{storage_id}");
    }
    format!(
        "_blobs/{}/{}/{}",
        &storage_id[0..2],
        &storage_id[2..4],
        &storage_id[4..]
    )
}

pub fn chunk_object_key(storage_id: &str, chunk_number: u32) -> String {
    if storage_id.len() < 4 {
        return format!("_chunks/{storage_id}/{chunk_number:010}");
    }
    format!(
        "_chunks/{}/{}/{}/{chunk_number:010}",
        &storage_id[0..2],
        &storage_id[2..4],
        &storage_id[4..]
    )
}

pub fn manifest_object_key(repo_name: &str, digest: &str) -> String {
    format!("{repo_name}/_manifests/{digest}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_follow_the_stable_layout() {
        let id = "aabbccddee";
        assert_eq!(blob_object_key(id), "_blobs/aa/bb/ccddee");
        assert_eq!(chunk_object_key(id, 7), "_chunks/aa/bb/ccddee/0000000007");
        assert_eq!(
            manifest_object_key("foo/bar", "sha256:123"),
            "foo/bar/_manifests/sha256:123"
        );
    }

    #[test]
    fn storage_ids_are_64_hex_chars() {
        let id = generate_storage_id();
        assert_eq!(id.len(), 64);
        assert!(id.bytes().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, generate_storage_id());
    }
}
