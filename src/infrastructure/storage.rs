use crate::config::GatewayConfig;
use crate::services::storage::{LocalStorageService, S3StorageService, StorageService};
use anyhow::Context;
use aws_sdk_s3::config::Region;
use std::env;
use std::sync::Arc;
use tracing::info;

pub async fn setup_storage(config: &GatewayConfig) -> anyhow::Result<Arc<dyn StorageService>> {
    match config.storage_backend.to_lowercase().as_str() {
        "s3" | "minio" => setup_s3().await,
        "local" => {
            tokio::fs::create_dir_all(&config.storage_root)
                .await
                .with_context(|| format!("creating {}", config.storage_root.display()))?;
            info!("📁 Local storage: {}", config.storage_root.display());
            Ok(Arc::new(LocalStorageService::new(config.storage_root.clone())))
        }
        other => anyhow::bail!("Unknown STORAGE_BACKEND '{}'", other),
    }
}

async fn setup_s3() -> anyhow::Result<Arc<dyn StorageService>> {
    let endpoint_url = env::var("MINIO_ENDPOINT").context("MINIO_ENDPOINT must be set")?;
    let access_key = env::var("MINIO_ACCESS_KEY").context("MINIO_ACCESS_KEY must be set")?;
    let secret_key = env::var("MINIO_SECRET_KEY").context("MINIO_SECRET_KEY must be set")?;
    let bucket = env::var("MINIO_BUCKET").context("MINIO_BUCKET must be set")?;

    info!("☁️  S3 Storage: {} (Bucket: {})", endpoint_url, bucket);

    let aws_config = aws_config::from_env()
        .endpoint_url(&endpoint_url)
        .region(Region::new("us-east-1"))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            access_key, secret_key, None, None, "static",
        ))
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();

    let s3_client = aws_sdk_s3::Client::from_conf(s3_config);
    Ok(Arc::new(S3StorageService::new(s3_client, bucket)))
}
