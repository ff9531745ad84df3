use crate::models::{FileArtifact, ScanFinding, ScanOutcome, ScanSource};
use anyhow::{Result, anyhow};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Result of a single scanner inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    /// No threats detected
    Clean,
    /// Flagged but not conclusively malicious
    Suspicious { reason: String },
    /// File is infected with malware
    Infected { threat_name: String },
    /// Scan could not be completed
    Error { reason: String },
    /// No verdict, and asking again would give the same answer
    Inconclusive { reason: String },
}

impl ScanResult {
    fn into_finding(self, source: ScanSource) -> ScanFinding {
        match self {
            ScanResult::Clean => ScanFinding::new(source, ScanOutcome::Clean, ""),
            ScanResult::Suspicious { reason } => {
                ScanFinding::new(source, ScanOutcome::Suspicious, reason)
            }
            ScanResult::Infected { threat_name } => {
                ScanFinding::new(source, ScanOutcome::Blocked, threat_name)
            }
            ScanResult::Error { reason } => ScanFinding::new(source, ScanOutcome::Error, reason),
            ScanResult::Inconclusive { reason } => {
                ScanFinding::new(source, ScanOutcome::Error, reason).final_answer()
            }
        }
    }
}

/// Capability shared by the local malware scanner and the reputation scanner
#[async_trait::async_trait]
pub trait Scanner: Send + Sync {
    /// Which pipeline check this scanner fills
    fn source(&self) -> ScanSource;

    /// Inspect the artifact. Implementations should poll `cancel` between
    /// blocking steps and return early when it fires.
    async fn inspect(&self, artifact: &FileArtifact, cancel: &CancellationToken)
    -> Result<ScanResult>;

    /// Check if the scanner is available/healthy
    async fn health_check(&self) -> bool;

    /// Runs `inspect` under a deadline and cancellation, always producing a
    /// finding. Timeouts, cancellation and adapter errors become `Error`.
    async fn scan(
        &self,
        artifact: &FileArtifact,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ScanFinding {
        let source = self.source();
        let started = Instant::now();

        let result = tokio::select! {
            _ = cancel.cancelled() => ScanResult::Error { reason: "cancelled".to_string() },
            res = tokio::time::timeout(timeout, self.inspect(artifact, cancel)) => match res {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    tracing::warn!("⚠️ {} scan failed: {}", source.display_name(), e);
                    ScanResult::Error { reason: e.to_string() }
                }
                Err(_) => {
                    tracing::warn!(
                        "⏱️ {} scan timed out after {:?}",
                        source.display_name(),
                        timeout
                    );
                    ScanResult::Error { reason: "timeout".to_string() }
                }
            },
        };

        result
            .into_finding(source)
            .with_latency(started.elapsed().as_millis() as u64)
    }
}

/// ClamAV scanner using TCP socket (clamd)
///
/// Docker command to run ClamAV:
/// ```bash
/// docker run -d --name clamav -p 3310:3310 clamav/clamav:latest
/// ```
pub struct ClamAvScanner {
    host: String,
    port: u16,
}

impl ClamAvScanner {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        TcpStream::connect(&addr)
            .await
            .map_err(|e| anyhow!("Failed to connect to ClamAV at {}: {}", addr, e))
    }
}

/// Parses a clamd INSTREAM reply such as `stream: OK` or
/// `stream: Eicar-Test-Signature FOUND`.
pub fn parse_clamd_response(raw: &[u8]) -> Option<ScanResult> {
    let response = String::from_utf8_lossy(raw);
    let response = response.trim_end_matches('\0').trim();
    if response.is_empty() {
        return None;
    }

    if response.ends_with("FOUND") {
        let threat = response
            .split_once(':')
            .map(|(_, rest)| rest)
            .unwrap_or(response)
            .trim()
            .trim_end_matches("FOUND")
            .trim();
        let threat_name = if threat.is_empty() {
            "Unknown threat".to_string()
        } else {
            threat.to_string()
        };
        return Some(ScanResult::Infected { threat_name });
    }
    if response.ends_with("ERROR") || response.contains("ERROR") {
        if response.contains("size limit exceeded") {
            return Some(ScanResult::Inconclusive {
                reason: format!(
                    "ClamAV limit exceeded: {}. Please increase StreamMaxLength in clamd.conf",
                    response
                ),
            });
        }
        return Some(ScanResult::Error {
            reason: response.to_string(),
        });
    }
    if response.ends_with("OK") {
        return Some(ScanResult::Clean);
    }
    None
}

fn is_complete_response(raw: &[u8]) -> bool {
    let resp = String::from_utf8_lossy(raw);
    let resp = resp.trim_end_matches('\0').trim_end();
    resp.ends_with("FOUND") || resp.ends_with("OK") || resp.contains("ERROR")
}

#[async_trait::async_trait]
impl Scanner for ClamAvScanner {
    fn source(&self) -> ScanSource {
        ScanSource::LocalScanner
    }

    async fn inspect(
        &self,
        artifact: &FileArtifact,
        cancel: &CancellationToken,
    ) -> Result<ScanResult> {
        let mut reader = tokio::fs::File::open(artifact.temporary_storage_path())
            .await
            .map_err(|e| anyhow!("Failed to open artifact for scanning: {}", e))?;
        let mut stream = self.connect().await?;

        // Use INSTREAM command for streaming data to clamd
        // Format: zINSTREAM\0 <length:u32 big-endian> <data> ... <0:u32>
        stream.write_all(b"zINSTREAM\0").await?;

        const CHUNK_SIZE: usize = 4 * 1024 * 1024; // 4MB chunks for better socket responsiveness
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut read_buf = [0u8; 1024];
        let mut response = Vec::new();
        let mut total_sent: u64 = 0;
        let mut write_done = false;
        let mut write_error: Option<std::io::Error> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(ScanResult::Error { reason: "cancelled".to_string() });
                }

                // clamd may answer early, e.g. when StreamMaxLength is hit
                read_res = stream.read(&mut read_buf) => {
                    match read_res {
                        Ok(0) => break,
                        Ok(n) => {
                            response.extend_from_slice(&read_buf[..n]);
                            if is_complete_response(&response) {
                                if !write_done {
                                    tracing::debug!("ClamAV sent early response after {} bytes", total_sent);
                                }
                                break;
                            }
                        }
                        Err(e) => {
                            if response.is_empty() {
                                return Err(anyhow!("ClamAV read error: {}", e));
                            }
                            break;
                        }
                    }
                }

                chunk = reader.read(&mut buffer), if !write_done => {
                    let n = chunk.map_err(|e| anyhow!("Failed to read artifact: {}", e))?;
                    if n == 0 {
                        // Zero-length chunk terminates the stream
                        if let Err(e) = stream.write_all(&0u32.to_be_bytes()).await {
                            tracing::warn!("Failed to send end-of-stream: {}", e);
                        }
                        let _ = stream.flush().await;
                        write_done = true;
                        tracing::debug!("Finished sending data to ClamAV ({} bytes)", total_sent);
                    } else {
                        let len = (n as u32).to_be_bytes();
                        let sent = async {
                            stream.write_all(&len).await?;
                            stream.write_all(&buffer[..n]).await
                        }
                        .await;
                        match sent {
                            Ok(()) => {
                                total_sent += n as u64;
                                if total_sent % (100 * 1024 * 1024) == 0 {
                                    tracing::info!("Scan progress: {} MB sent to ClamAV...", total_sent / 1024 / 1024);
                                }
                            }
                            Err(e) => {
                                tracing::warn!("ClamAV write error: {}", e);
                                write_error = Some(e);
                                write_done = true;
                            }
                        }
                    }
                }
            }
        }

        if let Some(result) = parse_clamd_response(&response) {
            tracing::debug!("ClamAV result for {}: {:?}", artifact.digest, result);
            return Ok(result);
        }

        if let Some(e) = write_error {
            return Err(anyhow!(
                "ClamAV write error: {}. ClamAV closed connection without sending a result.",
                e
            ));
        }

        Err(anyhow!(
            "ClamAV returned no response (total sent: {} bytes)",
            total_sent
        ))
    }

    async fn health_check(&self) -> bool {
        match self.connect().await {
            Ok(mut stream) => {
                if stream.write_all(b"zPING\0").await.is_err() {
                    return false;
                }
                if stream.flush().await.is_err() {
                    return false;
                }

                let mut response = [0u8; 16];
                match stream.read(&mut response).await {
                    Ok(n) => String::from_utf8_lossy(&response[..n]).contains("PONG"),
                    Err(_) => false,
                }
            }
            Err(_) => false,
        }
    }
}

/// No-op scanner for development/testing
pub struct NoOpScanner;

#[async_trait::async_trait]
impl Scanner for NoOpScanner {
    fn source(&self) -> ScanSource {
        ScanSource::LocalScanner
    }

    async fn inspect(
        &self,
        _artifact: &FileArtifact,
        _cancel: &CancellationToken,
    ) -> Result<ScanResult> {
        tracing::warn!("NoOpScanner: Skipping virus scan (development mode)");
        Ok(ScanResult::Clean)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Factory function to create the local scanner based on config
pub fn create_scanner(scanner_type: &str, host: &str, port: u16) -> Box<dyn Scanner> {
    match scanner_type.to_lowercase().as_str() {
        "clamav" => Box::new(ClamAvScanner::new(host.to_string(), port)),
        "noop" | "none" | "disabled" => Box::new(NoOpScanner),
        _ => {
            tracing::warn!("Unknown scanner type '{}', using NoOpScanner", scanner_type);
            Box::new(NoOpScanner)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn artifact() -> FileArtifact {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"test content").unwrap();
        FileArtifact::new(
            crate::utils::hash::calculate_hash(b"test content"),
            12,
            "a.txt".to_string(),
            "text/plain".to_string(),
            file.into_temp_path(),
        )
    }

    struct SleepyScanner;

    #[async_trait::async_trait]
    impl Scanner for SleepyScanner {
        fn source(&self) -> ScanSource {
            ScanSource::ReputationScanner
        }

        async fn inspect(&self, _: &FileArtifact, _: &CancellationToken) -> Result<ScanResult> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ScanResult::Clean)
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_parse_clamd_response() {
        assert_eq!(parse_clamd_response(b"stream: OK\0"), Some(ScanResult::Clean));
        assert_eq!(
            parse_clamd_response(b"stream: Eicar-Test-Signature FOUND\0"),
            Some(ScanResult::Infected {
                threat_name: "Eicar-Test-Signature".to_string()
            })
        );
        assert!(matches!(
            parse_clamd_response(b"INSTREAM size limit exceeded. ERROR\0"),
            Some(ScanResult::Inconclusive { reason }) if reason.contains("StreamMaxLength")
        ));
        assert!(matches!(
            parse_clamd_response(b"stream: lstat() failed. ERROR\0"),
            Some(ScanResult::Error { .. })
        ));
        assert_eq!(parse_clamd_response(b""), None);
        assert_eq!(parse_clamd_response(b"stream: "), None);
    }

    #[tokio::test]
    async fn test_noop_scanner() {
        let finding = NoOpScanner
            .scan(&artifact(), Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert_eq!(finding.outcome, ScanOutcome::Clean);
        assert_eq!(finding.source, ScanSource::LocalScanner);
        assert!(NoOpScanner.health_check().await);
    }

    #[tokio::test]
    async fn test_timeout_becomes_error() {
        let finding = SleepyScanner
            .scan(&artifact(), Duration::from_millis(20), &CancellationToken::new())
            .await;
        assert_eq!(finding.outcome, ScanOutcome::Error);
        assert_eq!(finding.detail, "timeout");
    }

    #[tokio::test]
    async fn test_cancellation_becomes_error() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let finding = SleepyScanner
            .scan(&artifact(), Duration::from_secs(10), &cancel)
            .await;
        assert_eq!(finding.outcome, ScanOutcome::Error);
        assert_eq!(finding.detail, "cancelled");
    }

    #[tokio::test]
    async fn test_unreachable_clamav_is_error() {
        // Port 1 is reserved and refuses connections on test hosts
        let scanner = ClamAvScanner::new("127.0.0.1".to_string(), 1);
        let finding = scanner
            .scan(&artifact(), Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert_eq!(finding.outcome, ScanOutcome::Error);
        assert!(!scanner.health_check().await);
    }

    #[tokio::test]
    async fn test_create_scanner() {
        let scanner = create_scanner("noop", "127.0.0.1", 3310);
        assert!(scanner.health_check().await);

        let scanner = create_scanner("disabled", "127.0.0.1", 3310);
        assert!(scanner.health_check().await);
    }
}
