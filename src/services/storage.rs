use anyhow::{Result, anyhow};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};

pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Durable object storage for accepted files. Writes are atomic: an object
/// is either fully present under its key or absent.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Copies the local file at `source` to `key`
    async fn put_file(&self, key: &str, source: &Path) -> Result<()>;
    async fn open_object(&self, key: &str) -> Result<ObjectReader>;
    async fn delete_file(&self, key: &str) -> Result<()>;
    async fn file_exists(&self, key: &str) -> Result<bool>;
}

/// Filesystem-backed storage rooted at a directory
pub struct LocalStorageService {
    root: PathBuf,
}

impl LocalStorageService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(anyhow!("Invalid storage key: {}", key));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl StorageService for LocalStorageService {
    async fn put_file(&self, key: &str, source: &Path) -> Result<()> {
        let dest = self.path_for(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write beside the destination, then rename into place
        let partial = dest.with_extension("partial");
        if let Err(e) = tokio::fs::copy(source, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&partial, &dest).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn open_object(&self, key: &str) -> Result<ObjectReader> {
        let file = tokio::fs::File::open(self.path_for(key)?).await?;
        Ok(Box::pin(file))
    }

    async fn delete_file(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)?).await?)
    }
}

/// S3-compatible storage (MinIO)
pub struct S3StorageService {
    client: Client,
    bucket: String,
}

impl S3StorageService {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    async fn upload_parts(&self, key: &str, upload_id: &str, source: &Path) -> Result<Vec<CompletedPart>> {
        let mut file = tokio::fs::File::open(source).await?;
        let mut chunk_index = 1;
        let mut completed_parts = Vec::new();

        // 10MB parts keep memory bounded for multi-GB files
        let chunk_size = 10 * 1024 * 1024;
        let mut buffer = vec![0u8; chunk_size];

        loop {
            let mut n = 0;
            while n < chunk_size {
                let read = file.read(&mut buffer[n..]).await?;
                if read == 0 {
                    break;
                }
                n += read;
            }

            if n == 0 && chunk_index > 1 {
                break;
            }

            let upload_part_res = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .body(ByteStream::from(buffer[..n].to_vec()))
                .part_number(chunk_index)
                .send()
                .await?;

            completed_parts.push(
                CompletedPart::builder()
                    .e_tag(upload_part_res.e_tag().unwrap_or_default())
                    .part_number(chunk_index)
                    .build(),
            );

            chunk_index += 1;
            if n < chunk_size {
                break;
            }
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl StorageService for S3StorageService {
    async fn put_file(&self, key: &str, source: &Path) -> Result<()> {
        let multipart_upload_res = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;

        let upload_id = multipart_upload_res
            .upload_id()
            .ok_or_else(|| anyhow!("No upload ID"))?
            .to_string();

        let completed = match self.upload_parts(key, &upload_id, source).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(anyhow::Error::from)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = completed {
            tracing::error!("S3 upload of {} failed, aborting: {}", key, e);
            let _ = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await;
            return Err(e);
        }
        Ok(())
    }

    async fn open_object(&self, key: &str) -> Result<ObjectReader> {
        let res = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        Ok(Box::pin(res.body.into_async_read()))
    }

    async fn delete_file(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        Ok(())
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        let res = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match res {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(anyhow!(service_error))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_put_open_delete() {
        let root = tempfile::tempdir().unwrap();
        let source = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(source.path(), b"payload").unwrap();

        let storage = LocalStorageService::new(root.path());
        storage
            .put_file("uploads/2026-01-01/abc", source.path())
            .await
            .unwrap();
        assert!(storage.file_exists("uploads/2026-01-01/abc").await.unwrap());
        assert!(!root.path().join("uploads/2026-01-01/abc.partial").exists());

        let mut reader = storage.open_object("uploads/2026-01-01/abc").await.unwrap();
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"payload");

        storage.delete_file("uploads/2026-01-01/abc").await.unwrap();
        assert!(!storage.file_exists("uploads/2026-01-01/abc").await.unwrap());
        // Deleting twice is fine
        storage.delete_file("uploads/2026-01-01/abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_rejects_traversal() {
        let root = tempfile::tempdir().unwrap();
        let storage = LocalStorageService::new(root.path());
        assert!(storage.file_exists("../etc/passwd").await.is_err());
        assert!(storage.file_exists("/abs").await.is_err());
    }

    #[tokio::test]
    async fn test_local_missing_source_leaves_nothing() {
        let root = tempfile::tempdir().unwrap();
        let storage = LocalStorageService::new(root.path());
        let missing = root.path().join("nope");
        assert!(storage.put_file("uploads/x", &missing).await.is_err());
        assert!(!storage.file_exists("uploads/x").await.unwrap());
    }
}
