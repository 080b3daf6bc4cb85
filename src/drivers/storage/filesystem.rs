use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::{BlobContents, StorageContents, StorageDriver, StorageError};

/// FilesystemStorage: one directory per account under a fixed root. The
/// object layout matches the documented stable naming, so an operator can
/// inspect the tree directly.
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FilesystemStorage { root: root.into() }
    }

    fn object_path(&self, account_name: &str, key: &str) -> PathBuf {
        self.root.join(account_name).join(key)
    }
}

fn io_error(key: &str, err: std::io::Error) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::ObjectDoesNotExist { key: key.into() }
    } else {
        StorageError::Io {
            key: key.into(),
            raw_error_message: err.to_string(),
        }
    }
}

async fn write_file(path: &Path, key: &str, contents: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| io_error(key, err))?;
    }
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|err| io_error(key, err))?;
    file.write_all(contents).await.map_err(|err| io_error(key, err))?;
    file.flush().await.map_err(|err| io_error(key, err))?;
    Ok(())
}

#[async_trait]
impl StorageDriver for FilesystemStorage {
    async fn append_to_blob(
        &self,
        account_name: &str,
        storage_id: &str,
        chunk_number: u32,
        chunk: Bytes,
    ) -> Result<(), StorageError> {
        let key = super::chunk_object_key(storage_id, chunk_number);
        write_file(&self.object_path(account_name, &key), &key, &chunk).await
    }

    async fn finalize_blob(
        &self,
        account_name: &str,
        storage_id: &str,
        num_chunks: u32,
    ) -> Result<(), StorageError> {
        let blob_key = super::blob_object_key(storage_id);
        let blob_path = self.object_path(account_name, &blob_key);
        if let Some(parent) = blob_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error(&blob_key, err))?;
        }
        let mut blob_file = tokio::fs::File::create(&blob_path)
            .await
            .map_err(|err| io_error(&blob_key, err))?;
        for chunk_number in 1..=num_chunks {
            let chunk_key = super::chunk_object_key(storage_id, chunk_number);
            let chunk = tokio::fs::read(self.object_path(account_name, &chunk_key))
                .await
                .map_err(|err| io_error(&chunk_key, err))?;
            blob_file
                .write_all(&chunk)
                .await
                .map_err(|err| io_error(&blob_key, err))?;
        }
        blob_file.flush().await.map_err(|err| io_error(&blob_key, err))?;
        self.abort_blob_upload(account_name, storage_id, num_chunks).await
    }

    async fn abort_blob_upload(
        &self,
        account_name: &str,
        storage_id: &str,
        num_chunks: u32,
    ) -> Result<(), StorageError> {
        for chunk_number in 1..=num_chunks {
            let chunk_key = super::chunk_object_key(storage_id, chunk_number);
            match tokio::fs::remove_file(self.object_path(account_name, &chunk_key)).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_error(&chunk_key, err)),
            }
        }
        Ok(())
    }

    async fn read_blob(
        &self,
        account_name: &str,
        storage_id: &str,
    ) -> Result<BlobContents, StorageError> {
        let key = super::blob_object_key(storage_id);
        let path = self.object_path(account_name, &key);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| io_error(&key, err))?;
        let size_bytes = file
            .metadata()
            .await
            .map_err(|err| io_error(&key, err))?
            .len();
        let stream = ReaderStream::new(file)
            .map(move |result| {
                result.map_err(|err| StorageError::Io {
                    key: "blob stream".into(),
                    raw_error_message: err.to_string(),
                })
            })
            .boxed();
        Ok(BlobContents { size_bytes, stream })
    }

    async fn read_uploaded_chunks(
        &self,
        account_name: &str,
        storage_id: &str,
        num_chunks: u32,
    ) -> Result<BlobContents, StorageError> {
        let mut assembled = Vec::new();
        for chunk_number in 1..=num_chunks {
            let chunk_key = super::chunk_object_key(storage_id, chunk_number);
            let chunk = tokio::fs::read(self.object_path(account_name, &chunk_key))
                .await
                .map_err(|err| io_error(&chunk_key, err))?;
            assembled.extend_from_slice(&chunk);
        }
        let contents = Bytes::from(assembled);
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
        // Local files cannot be handed out as URLs.
        Ok(None)
    }

    async fn delete_blob(&self, account_name: &str, storage_id: &str) -> Result<(), StorageError> {
        let key = super::blob_object_key(storage_id);
        tokio::fs::remove_file(self.object_path(account_name, &key))
            .await
            .map_err(|err| io_error(&key, err))
    }

    async fn write_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
        contents: Bytes,
    ) -> Result<(), StorageError> {
        let key = super::manifest_object_key(repo_name, digest);
        write_file(&self.object_path(account_name, &key), &key, &contents).await
    }

    async fn read_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
    ) -> Result<Bytes, StorageError> {
        let key = super::manifest_object_key(repo_name, digest);
        tokio::fs::read(self.object_path(account_name, &key))
            .await
            .map(Bytes::from)
            .map_err(|err| io_error(&key, err))
    }

    async fn delete_manifest(
        &self,
        account_name: &str,
        repo_name: &str,
        digest: &str,
    ) -> Result<(), StorageError> {
        let key = super::manifest_object_key(repo_name, digest);
        tokio::fs::remove_file(self.object_path(account_name, &key))
            .await
            .map_err(|err| io_error(&key, err))
    }

    async fn list_storage_contents(
        &self,
        account_name: &str,
    ) -> Result<StorageContents, StorageError> {
        let account_root = self.root.join(account_name);
        let listing = tokio::task::spawn_blocking(move || list_account_dir(&account_root))
            .await
            .map_err(|err| StorageError::Io {
                key: account_name.to_string(),
                raw_error_message: err.to_string(),
            })?;
        listing.map_err(|err| StorageError::Io {
            key: account_name.to_string(),
            raw_error_message: err.to_string(),
        })
    }
}

fn list_account_dir(account_root: &Path) -> Result<StorageContents, std::io::Error> {
    let mut contents = StorageContents::default();
    if !account_root.exists() {
        return Ok(contents);
    }
    collect(account_root, account_root, &mut contents)?;
    contents.blobs.sort();
    contents.manifests.sort();
    Ok(contents)
}

fn collect(
    account_root: &Path,
    dir: &Path,
    contents: &mut StorageContents,
) -> Result<(), std::io::Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect(account_root, &path, contents)?;
            continue;
        }
        let relative = path
            .strip_prefix(account_root)
            .expect("walk stays below account root");
        let components: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        match components.split_first() {
            Some((first, rest)) if first == "_blobs" => {
                contents.blobs.push(rest.concat());
            }
            Some((first, _)) if first == "_chunks" => {
                // In-flight uploads are not finalized objects.
            }
            _ => {
                // Anything else must be <repo>/_manifests/<digest>.
                if components.len() >= 3
                    && components[components.len() - 2] == "_manifests"
                {
                    let repo_name = components[..components.len() - 2].join("/");
                    let digest = components[components.len() - 1].clone();
                    contents.manifests.push((repo_name, digest));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::storage::generate_storage_id;

    #[tokio::test]
    async fn blob_lifecycle_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(tmp.path());
        let id = generate_storage_id();

        storage
            .append_to_blob("acc1", &id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        storage
            .append_to_blob("acc1", &id, 2, Bytes::from_static(b"disk"))
            .await
            .unwrap();
        storage.finalize_blob("acc1", &id, 2).await.unwrap();

        let contents = storage.read_blob("acc1", &id).await.unwrap();
        assert_eq!(contents.into_bytes().await.unwrap().as_ref(), b"hello disk");

        // Chunks are gone after finalize; only the blob object remains.
        let listing = storage.list_storage_contents("acc1").await.unwrap();
        assert_eq!(listing.blobs, vec![id.clone()]);
        assert!(listing.manifests.is_empty());
    }

    #[tokio::test]
    async fn manifest_layout_includes_nested_repos() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(tmp.path());
        storage
            .write_manifest("acc1", "library/alpine", "sha256:abc", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let listing = storage.list_storage_contents("acc1").await.unwrap();
        assert_eq!(
            listing.manifests,
            vec![("library/alpine".to_string(), "sha256:abc".to_string())]
        );
    }
}
