use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use super::{BlobContents, StorageContents, StorageDriver, StorageError};

#[derive(Default)]
struct Container {
    /// storage id -> finalized blob bytes
    blobs: HashMap<String, Bytes>,
    /// storage id -> chunk number -> chunk bytes
    chunks: HashMap<String, HashMap<u32, Bytes>>,
    /// (repo name, digest) -> manifest bytes
    manifests: HashMap<(String, String), Bytes>,
}

/// InMemoryStorage: keeps everything in process memory. The backend for all
/// unit and API tests.
#[derive(Default)]
pub struct InMemoryStorage {
    containers: Mutex<HashMap<String, Container>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        InMemoryStorage::default()
    }

    fn with_container<T>(&self, account_name: &str, body: impl FnOnce(&mut Container) -> T) -> T {
        let mut containers = self.containers.lock().unwrap();
        body(containers.entry(account_name.to_string()).or_default())
    }

    /// Test helper: the number of stored blob objects across all accounts.
    pub fn blob_count(&self) -> usize {
        self.containers
            .lock()
            .unwrap()
            .values()
            .map(|container| container.blobs.len())
            .sum()
    }
}

fn not_found(key: impl Into<String>) -> StorageError {
    StorageError::ObjectDoesNotExist { key: key.into() }
}

#[async_trait]
impl StorageDriver for InMemoryStorage {
    async fn append_to_blob(
        &self,
        account_name: &str,
        storage_id: &str,
        chunk_number: u32,
        chunk: Bytes,
    ) -> Result<(), StorageError> {
        self.with_container(account_name, |container| {
            container
                .chunks
                .entry(storage_id.to_string())
                .or_default()
                .insert(chunk_number, chunk);
        });
        Ok(())
    }

    async fn finalize_blob(
        &self,
        account_name: &str,
        storage_id: &str,
        num_chunks: u32,
    ) -> Result<(), StorageError> {
        self.with_container(account_name, |container| {
            let chunks = container
                .chunks
                .remove(storage_id)
                .ok_or_else(|| not_found(super::chunk_object_key(storage_id, 1)))?;
            let mut assembled = Vec::new();
            for chunk_number in 1..=num_chunks {
                let chunk = chunks
                    .get(&chunk_number)
                    .ok_or_else(|| not_found(super::chunk_object_key(storage_id, chunk_number)))?;
                assembled.extend_from_slice(chunk);
            }
            container
                .blobs
                .insert(storage_id.to_string(), assembled.into());
            Ok(())
        })
    }

    async fn abort_blob_upload(
        &self,
        account_name: &str,
        storage_id: &str,
        _num_chunks: u32,
    ) -> Result<(), StorageError> {
        self.with_container(account_name, |container| {
            container.chunks.remove(storage_id);
        });
        Ok(())
    }

    async fn read_blob(
        &self,
        account_name: &str,
        storage_id: &str,
    ) -> Result<BlobContents, StorageError> {
        let contents = self.with_container(account_name, |container| {
            container.blobs.get(storage_id).cloned()
        });
        let contents = contents.ok_or_else(|| not_found(super::blob_object_key(storage_id)))?;
        Ok(BlobContents {
            size_bytes: contents.len() as u64,
            stream: futures::stream::once(async move { Ok(contents) }).boxed(),
        })
    }

    async fn read_uploaded_chunks(
        &self,
        account_name: &str,
        storage_id: &str,
        num_chunks: u32,
    ) -> Result<BlobContents, StorageError> {
        let assembled = self.with_container(account_name, |container| {
            let chunks = container
                .chunks
                .get(storage_id)
                .ok_or_else(|| not_found(super::chunk_object_key(storage_id, 1)))?;
            let mut assembled = Vec::new();
            for chunk_number in 1..=num_chunks {
                let chunk = chunks
                    .get(&chunk_number)
                    .ok_or_else(|| not_found(super::chunk_object_key(storage_id, chunk_number)))?;
                assembled.extend_from_slice(chunk);
            }
            Ok::<_, StorageError>(assembled)
        })?;
        let contents: Bytes = assembled.into();
        Ok(BlobContents {
            size_bytes: contents.len() as u64,
            stream: futures::stream::once(async move { Ok(contents) }).boxed(),
        })
    }

    async fn url_for_blob(
        &self,
        _account_name: &str,
        _storage_id: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(None)
    }

    async fn delete_blob(&self, account_name: &str, storage_id: &str) -> Result<(), StorageError> {
        self.with_container(account_name, |container| {
            container
                .blobs
                .remove(storage_id)
                .map(|_| ())
                .ok_or_else(|| not_found(super::blob_object_key(storage_id)))
        })
    }

    async fn write_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        contents: Bytes,
    ) -> Result<(), StorageError> {
        self.with_container(account_name, |container| {
            container
                .manifests
                .insert((repo_name.to_string(), digest.to_string()), contents);
        });
        Ok(())
    }

    async fn read_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
    ) -> Result<Bytes, StorageError> {
        self.with_container(account_name, |container| {
            container
                .manifests
                .get(&(repo_name.to_string(), digest.to_string()))
                .cloned()
        })
        .ok_or_else(|| not_found(super::manifest_object_key(repo_name, digest)))
    }

    async fn delete_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
    ) -> Result<(), StorageError> {
        self.with_container(account_name, |container| {
            container
                .manifests
                .remove(&(repo_name.to_string(), digest.to_string()))
                .map(|_| ())
                .ok_or_else(|| not_found(super::manifest_object_key(repo_name, digest)))
        })
    }

    async fn list_storage_contents(
        &self,
        account_name: &str,
    ) -> Result<StorageContents, StorageError> {
        Ok(self.with_container(account_name, |container| {
            let mut contents = StorageContents {
                blobs: container.blobs.keys().cloned().collect(),
                manifests: container
                    .manifests
                    .keys()
                    .map(|(repo_name, digest)| (repo_name.clone(), digest.clone()))
                    .collect(),
            };
            contents.blobs.sort();
            contents.manifests.sort();
            contents
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::storage::generate_storage_id;

    #[tokio::test]
    async fn chunked_blob_round_trip() {
        let storage = InMemoryStorage::new();
        let id = generate_storage_id();
        storage
            .append_to_blob("acc1", &id, 1, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        storage
            .append_to_blob("acc1", &id, 2, Bytes::from_static(b" world"))
            .await
            .unwrap();
        storage.finalize_blob("acc1", &id, 2).await.unwrap();

        let contents = storage.read_blob("acc1", &id).await.unwrap();
        assert_eq!(contents.size_bytes, 11);
        assert_eq!(contents.into_bytes().await.unwrap().as_ref(), b"hello world");

        storage.delete_blob("acc1", &id).await.unwrap();
        assert!(storage.read_blob("acc1", &id).await.is_err());
    }

    #[tokio::test]
    async fn finalize_requires_all_chunks() {
        let storage = InMemoryStorage::new();
        let id = generate_storage_id();
        storage
            .append_to_blob("acc1", &id, 2, Bytes::from_static(b"no chunk one"))
            .await
            .unwrap();
        let err = storage.finalize_blob("acc1", &id, 2).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn listing_reflects_stored_objects() {
        let storage = InMemoryStorage::new();
        storage
            .write_manifest("acc1", "foo", "sha256:abc", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let contents = storage.list_storage_contents("acc1").await.unwrap();
        assert_eq!(
            contents.manifests,
            vec![("foo".to_string(), "sha256:abc".to_string())]
        );
        assert!(contents.blobs.is_empty());
    }
}
