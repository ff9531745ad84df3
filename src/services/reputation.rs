use crate::models::{FileArtifact, ScanSource};
use crate::services::scanner::{ScanResult, Scanner};
use anyhow::{Result, anyhow};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Takes a token, or returns how long until one is available
    fn try_acquire(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let seconds = (1.0 - self.tokens) / self.refill_rate;
            Err(Duration::from_secs_f64(seconds.max(0.0)))
        }
    }
}

/// Request budget for the VirusTotal API, shared by all sessions
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn per_minute(requests: u32) -> Self {
        let capacity = f64::from(requests.max(1));
        Self {
            bucket: Mutex::new(TokenBucket::new(capacity, capacity / 60.0)),
        }
    }

    /// Waits until a request may be sent
    pub async fn acquire(&self) {
        loop {
            let wait = match self.bucket.lock().await.try_acquire() {
                Ok(()) => return,
                Err(wait) => wait,
            };
            tracing::debug!("VirusTotal rate limit reached, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Takes a token without waiting
    pub async fn try_acquire(&self) -> bool {
        self.bucket.lock().await.try_acquire().is_ok()
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AnalysisStats {
    #[serde(default)]
    pub malicious: u32,
    #[serde(default)]
    pub suspicious: u32,
    #[serde(default)]
    pub undetected: u32,
    #[serde(default)]
    pub harmless: u32,
}

impl AnalysisStats {
    pub fn total(&self) -> u32 {
        self.malicious + self.suspicious + self.undetected + self.harmless
    }

    pub fn classify(&self) -> ScanResult {
        if self.malicious > 0 {
            ScanResult::Infected {
                threat_name: format!(
                    "{} of {} engines flagged this file as malicious",
                    self.malicious,
                    self.total()
                ),
            }
        } else if self.suspicious > 0 {
            ScanResult::Suspicious {
                reason: format!(
                    "{} of {} engines flagged this file as suspicious",
                    self.suspicious,
                    self.total()
                ),
            }
        } else {
            ScanResult::Clean
        }
    }
}

#[derive(Deserialize)]
struct FileReport {
    data: FileReportData,
}

#[derive(Deserialize)]
struct FileReportData {
    attributes: FileAttributes,
}

#[derive(Deserialize)]
struct FileAttributes {
    #[serde(default)]
    last_analysis_stats: AnalysisStats,
}

#[derive(Deserialize)]
struct UploadReply {
    data: UploadReplyData,
}

#[derive(Deserialize)]
struct UploadReplyData {
    id: String,
}

#[derive(Deserialize)]
struct AnalysisReply {
    data: AnalysisData,
}

#[derive(Deserialize)]
struct AnalysisData {
    attributes: AnalysisAttributes,
}

#[derive(Deserialize)]
struct AnalysisAttributes {
    status: String,
    #[serde(default)]
    stats: AnalysisStats,
}

#[derive(Debug, Clone)]
pub struct VirusTotalOptions {
    pub base_url: String,
    pub requests_per_minute: u32,
    pub submit_max_size: u64,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
}

/// Reputation lookups against the VirusTotal v3 API
pub struct VirusTotalScanner {
    client: reqwest::Client,
    api_key: String,
    options: VirusTotalOptions,
    limiter: RateLimiter,
}

impl VirusTotalScanner {
    pub fn new(api_key: String, options: VirusTotalOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_key,
            limiter: RateLimiter::per_minute(options.requests_per_minute),
            options: VirusTotalOptions {
                base_url: options.base_url.trim_end_matches('/').to_string(),
                ..options
            },
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.options.base_url, path)
    }

    /// `Ok(None)` when VirusTotal has never seen the file
    async fn lookup(&self, digest: &str) -> Result<Option<AnalysisStats>> {
        self.limiter.acquire().await;
        let response = self
            .client
            .get(self.endpoint(&format!("files/{}", digest)))
            .header("x-apikey", &self.api_key)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let report: FileReport = response.json().await?;
                Ok(Some(report.data.attributes.last_analysis_stats))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(anyhow!("VirusTotal lookup failed with status {}", status)),
        }
    }

    async fn submit(&self, artifact: &FileArtifact) -> Result<String> {
        let bytes = tokio::fs::read(artifact.temporary_storage_path()).await?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name(artifact.original_name.clone());
        let form = reqwest::multipart::Form::new().part("file", part);

        self.limiter.acquire().await;
        let response = self
            .client
            .post(self.endpoint("files"))
            .header("x-apikey", &self.api_key)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        let reply: UploadReply = response.json().await?;
        Ok(reply.data.id)
    }

    /// `Ok(None)` while the analysis is still queued
    async fn analysis(&self, analysis_id: &str) -> Result<Option<AnalysisStats>> {
        self.limiter.acquire().await;
        let reply: AnalysisReply = self
            .client
            .get(self.endpoint(&format!("analyses/{}", analysis_id)))
            .header("x-apikey", &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if reply.data.attributes.status == "completed" {
            Ok(Some(reply.data.attributes.stats))
        } else {
            Ok(None)
        }
    }
}

#[async_trait::async_trait]
impl Scanner for VirusTotalScanner {
    fn source(&self) -> ScanSource {
        ScanSource::ReputationScanner
    }

    async fn inspect(
        &self,
        artifact: &FileArtifact,
        cancel: &CancellationToken,
    ) -> Result<ScanResult> {
        // 1. Hash lookup
        if let Some(stats) = self.lookup(&artifact.digest).await? {
            return Ok(stats.classify());
        }

        // 2. Unknown file: submit if small enough
        if artifact.size_bytes > self.options.submit_max_size {
            tracing::info!(
                "VirusTotal has no report for {} and file is too large to submit",
                artifact.digest
            );
            return Ok(ScanResult::Inconclusive {
                reason: "unknown".to_string(),
            });
        }
        let analysis_id = self.submit(artifact).await?;
        tracing::info!("📨 Submitted {} to VirusTotal (analysis {})", artifact.digest, analysis_id);

        // 3. Poll for the analysis
        for attempt in 1..=self.options.poll_attempts {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(ScanResult::Error { reason: "cancelled".to_string() });
                }
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
            if let Some(stats) = self.analysis(&analysis_id).await? {
                return Ok(stats.classify());
            }
            tracing::debug!(
                "VirusTotal analysis {} pending (attempt {}/{})",
                analysis_id,
                attempt,
                self.options.poll_attempts
            );
        }

        Ok(ScanResult::Error {
            reason: "pending".to_string(),
        })
    }

    async fn health_check(&self) -> bool {
        !self.api_key.is_empty()
    }
}
