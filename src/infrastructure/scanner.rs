use crate::config::GatewayConfig;
use crate::services::reputation::{VirusTotalOptions, VirusTotalScanner};
use crate::services::scanner::Scanner;
use std::sync::Arc;
use tracing::info;

/// Local malware scanner, or `None` when virus scanning is disabled
pub async fn setup_local_scanner(config: &GatewayConfig) -> Option<Arc<dyn Scanner>> {
    if !config.enable_virus_scan {
        tracing::warn!("⚠️  Local virus scanning disabled");
        return None;
    }

    let scanner_service = crate::services::scanner::create_scanner(
        &config.virus_scanner_type,
        &config.clamav_host,
        config.clamav_port,
    );

    // Warm up scanner connection
    if scanner_service.health_check().await {
        info!("🦠 Virus scanner connected successfully");
    } else {
        tracing::warn!(
            "⚠️  Virus scanner unreachable! Uploads will be rejected or allowed depending on policy."
        );
    }

    Some(scanner_service.into())
}

/// VirusTotal scanner, or `None` when no API key is configured
pub fn setup_reputation_scanner(config: &GatewayConfig) -> anyhow::Result<Option<Arc<dyn Scanner>>> {
    let Some(api_key) = config.virustotal_api_key.clone() else {
        info!("🔎 VirusTotal not configured, reputation checks will be skipped");
        return Ok(None);
    };

    let scanner = VirusTotalScanner::new(
        api_key,
        VirusTotalOptions {
            base_url: config.virustotal_base_url.clone(),
            requests_per_minute: config.virustotal_requests_per_minute,
            submit_max_size: config.virustotal_submit_max_size,
            poll_attempts: config.virustotal_poll_attempts,
            poll_interval: config.virustotal_poll_interval,
        },
    )?;
    info!(
        "🔎 VirusTotal enabled ({} requests/min)",
        config.virustotal_requests_per_minute
    );
    Ok(Some(Arc::new(scanner)))
}
