use crate::models::FileArtifact;
use crate::services::error::PipelineError;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const BUFFER_SIZE: usize = 64 * 1024;

/// Bytes inspected for MIME detection
const SNIFF_LEN: usize = 8192;

/// Consumes `reader` once, computing the SHA-256 digest while writing the
/// bytes to a private temporary file under `temp_dir`.
///
/// The size limit is enforced both on the declared size (before any file is
/// created) and while streaming. On any failure the partial temporary file
/// is removed.
pub async fn hash_upload<R>(
    mut reader: R,
    original_name: &str,
    declared_size: Option<u64>,
    size_limit: u64,
    temp_dir: &Path,
    cancel: &CancellationToken,
) -> Result<FileArtifact, PipelineError>
where
    R: AsyncRead + Unpin,
{
    if declared_size.is_some_and(|s| s > size_limit) {
        return Err(PipelineError::TooLarge { limit: size_limit });
    }

    let (std_file, temp_path) = tempfile::Builder::new()
        .prefix("upload-")
        .tempfile_in(temp_dir)
        .map_err(|e| temp_failure("create", temp_dir, e))?
        .into_parts();
    let mut file = tokio::fs::File::from_std(std_file);

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut head: Vec<u8> = Vec::with_capacity(SNIFF_LEN);
    let mut total: u64 = 0;

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(PipelineError::Transport("upload cancelled".to_string()));
            }
            read = reader.read(&mut buffer) => {
                read.map_err(|e| {
                    tracing::warn!("⚠️ Upload stream for '{}' failed: {}", original_name, e);
                    PipelineError::Transport(e.to_string())
                })?
            }
        };
        if n == 0 {
            break;
        }

        total += n as u64;
        if total > size_limit {
            tracing::warn!(
                "⚠️ Upload '{}' exceeded limit of {} bytes mid-stream",
                original_name,
                size_limit
            );
            return Err(PipelineError::TooLarge { limit: size_limit });
        }

        let chunk = &buffer[..n];
        hasher.update(chunk);
        if head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - head.len()).min(n);
            head.extend_from_slice(&chunk[..take]);
        }
        file.write_all(chunk)
            .await
            .map_err(|e| temp_failure("write", &temp_path, e))?;
    }

    file.flush()
        .await
        .map_err(|e| temp_failure("flush", &temp_path, e))?;
    drop(file);

    let digest = hex::encode(hasher.finalize());
    let mime = infer::get(&head)
        .map(|kind| kind.mime_type().to_string())
        .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());

    tracing::debug!(
        "Hashed '{}': {} bytes, sha256={}, mime={}",
        original_name,
        total,
        digest,
        mime
    );

    Ok(FileArtifact::new(
        digest,
        total,
        original_name.to_string(),
        mime,
        temp_path,
    ))
}

fn temp_failure(step: &str, path: &Path, err: std::io::Error) -> PipelineError {
    tracing::error!("Temp file {} failed at {}: {}", step, path.display(), err);
    PipelineError::StorageUnavailable(format!("temp file {}", step))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::hash::calculate_hash;

    fn temp_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_hash_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"hello world";
        let artifact = hash_upload(
            &data[..],
            "hello.txt",
            None,
            1024,
            dir.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(artifact.digest, calculate_hash(data));
        assert_eq!(artifact.size_bytes, 11);
        assert_eq!(artifact.mime_type_guess, "application/octet-stream");
        assert_eq!(
            std::fs::read(artifact.temporary_storage_path()).unwrap(),
            data
        );

        // Dropping the artifact removes its temporary file
        let path = artifact.temporary_storage_path().to_path_buf();
        drop(artifact);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_mime_sniffing() {
        let dir = tempfile::tempdir().unwrap();
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        let artifact = hash_upload(
            &png[..],
            "pic.png",
            None,
            1024,
            dir.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(artifact.mime_type_guess, "image/png");
    }

    #[tokio::test]
    async fn test_declared_oversize_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let err = hash_upload(
            &b"x"[..],
            "big.bin",
            Some(2048),
            1024,
            dir.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err, PipelineError::TooLarge { limit: 1024 });
        assert_eq!(temp_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_streamed_oversize_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![7u8; 200 * 1024];
        let err = hash_upload(
            &data[..],
            "big.bin",
            None,
            100 * 1024,
            dir.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::TooLarge { .. }));
        assert_eq!(temp_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_cancelled_upload() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = hash_upload(&b"data"[..], "a.txt", None, 1024, dir.path(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Transport(_)));
        assert_eq!(temp_files(dir.path()), 0);
    }
}
