use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// How the gateway treats a scan stage that could not reach a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Inconclusive required checks block the upload
    FailClosed,
    /// Inconclusive required checks are allowed with a warning
    FailOpen,
}

impl FailurePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "closed" | "fail_closed" | "fail-closed" => Some(Self::FailClosed),
            "open" | "fail_open" | "fail-open" => Some(Self::FailOpen),
            _ => None,
        }
    }
}

/// Gateway configuration for uploads, scanning and storage
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum file size in bytes (default: 5 GiB)
    pub max_file_size: u64,

    /// Extensions accepted at upload (lowercase, with leading dot)
    pub allowed_extensions: Vec<String>,

    /// Extensions rejected by the blacklist stage (lowercase, with leading dot)
    pub blocked_extensions: Vec<String>,

    /// Enable the local malware scanner (default: true)
    pub enable_virus_scan: bool,

    /// Virus scanner type: "clamav" or "noop" (default: "clamav")
    pub virus_scanner_type: String,

    /// ClamAV host (default: "127.0.0.1")
    pub clamav_host: String,

    /// ClamAV port (default: 3310)
    pub clamav_port: u16,

    /// ClamAV stage timeout (default: 300s)
    pub clamav_timeout: Duration,

    /// VirusTotal API key; reputation checks are skipped without one
    pub virustotal_api_key: Option<String>,

    /// VirusTotal API base (default: "https://www.virustotal.com/api/v3")
    pub virustotal_base_url: String,

    /// VirusTotal stage timeout (default: 120s)
    pub virustotal_timeout: Duration,

    /// VirusTotal request budget (default: 4 per minute, public API tier)
    pub virustotal_requests_per_minute: u32,

    /// Largest unknown file submitted for analysis (default: 32 MiB)
    pub virustotal_submit_max_size: u64,

    /// Analysis polls after a submission (default: 5)
    pub virustotal_poll_attempts: u32,

    /// Delay between analysis polls (default: 20s)
    pub virustotal_poll_interval: Duration,

    /// Treatment of inconclusive required checks (default: fail closed)
    pub failure_policy: FailurePolicy,

    /// Whether the reputation check must be conclusive (default: false)
    pub require_reputation_scan: bool,

    /// Retries for a scan stage that returned an error (default: 1)
    pub scan_max_retries: u32,

    /// Base backoff between scan retries (default: 500ms)
    pub scan_retry_backoff: Duration,

    /// Storage backend: "local" or "s3" (default: "local")
    pub storage_backend: String,

    /// Root directory of the local storage backend
    pub storage_root: PathBuf,

    /// Directory for in-flight temporary artifacts
    pub temp_dir: PathBuf,

    /// Public base URL used to build download links
    pub public_base_url: String,

    /// Lifetime of an upload session (default: 72h)
    pub session_ttl: Duration,

    /// How long finished sessions stay queryable (default: 60min)
    pub session_retention: Duration,

    /// Lifetime of a stored file and its download link (default: 72h)
    pub file_retention: Duration,

    /// Denylist snapshot refresh interval (default: 300s)
    pub denylist_refresh_interval: Duration,

    /// Days of scan log history kept (default: 365)
    pub scan_log_retention_days: i64,

    /// CORS origins; empty allows any origin
    pub allowed_origins: Vec<String>,
}

pub const DEFAULT_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024; // 5 GiB

const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    ".pdf", ".docx", ".xlsx", ".zip", ".jpg", ".jpeg", ".png", ".mp4", ".avi", ".mov", ".mkv",
    ".webm", ".txt", ".csv", ".json", ".xml",
];

const DEFAULT_BLOCKED_EXTENSIONS: &[&str] = &[
    ".exe", ".bat", ".cmd", ".com", ".scr", ".pif", ".msi", ".vbs", ".js", ".jar", ".ps1",
];

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed_extensions: to_strings(DEFAULT_ALLOWED_EXTENSIONS),
            blocked_extensions: to_strings(DEFAULT_BLOCKED_EXTENSIONS),
            enable_virus_scan: true,
            virus_scanner_type: "clamav".to_string(),
            clamav_host: "127.0.0.1".to_string(),
            clamav_port: 3310,
            clamav_timeout: Duration::from_secs(300),
            virustotal_api_key: None,
            virustotal_base_url: "https://www.virustotal.com/api/v3".to_string(),
            virustotal_timeout: Duration::from_secs(120),
            virustotal_requests_per_minute: 4,
            virustotal_submit_max_size: 32 * 1024 * 1024, // 32 MiB
            virustotal_poll_attempts: 5,
            virustotal_poll_interval: Duration::from_secs(20),
            failure_policy: FailurePolicy::FailClosed,
            require_reputation_scan: false,
            scan_max_retries: 1,
            scan_retry_backoff: Duration::from_millis(500),
            storage_backend: "local".to_string(),
            storage_root: PathBuf::from("./data/uploads"),
            temp_dir: env::temp_dir(),
            public_base_url: "http://localhost:8000".to_string(),
            session_ttl: Duration::from_secs(72 * 3600),
            session_retention: Duration::from_secs(60 * 60),
            file_retention: Duration::from_secs(72 * 3600),
            denylist_refresh_interval: Duration::from_secs(300),
            scan_log_retention_days: 365,
            allowed_origins: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_file_size: parse_env("MAX_FILE_SIZE").unwrap_or(default.max_file_size),

            allowed_extensions: env::var("ALLOWED_EXTENSIONS")
                .map(|v| parse_extensions(&v))
                .unwrap_or(default.allowed_extensions),

            blocked_extensions: env::var("BLOCKED_EXTENSIONS")
                .map(|v| parse_extensions(&v))
                .unwrap_or(default.blocked_extensions),

            enable_virus_scan: env::var("ENABLE_VIRUS_SCAN")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(default.enable_virus_scan),

            virus_scanner_type: env::var("VIRUS_SCANNER_TYPE")
                .unwrap_or(default.virus_scanner_type),

            clamav_host: env::var("CLAMAV_HOST").unwrap_or(default.clamav_host),

            clamav_port: parse_env("CLAMAV_PORT").unwrap_or(default.clamav_port),

            clamav_timeout: parse_env("CLAMAV_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(default.clamav_timeout),

            virustotal_api_key: env::var("VIRUSTOTAL_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),

            virustotal_base_url: env::var("VIRUSTOTAL_BASE_URL")
                .unwrap_or(default.virustotal_base_url),

            virustotal_timeout: parse_env("VIRUSTOTAL_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(default.virustotal_timeout),

            virustotal_requests_per_minute: parse_env("VIRUSTOTAL_REQUESTS_PER_MINUTE")
                .unwrap_or(default.virustotal_requests_per_minute),

            virustotal_submit_max_size: parse_env("VIRUSTOTAL_SUBMIT_MAX_SIZE")
                .unwrap_or(default.virustotal_submit_max_size),

            virustotal_poll_attempts: parse_env("VIRUSTOTAL_POLL_ATTEMPTS")
                .unwrap_or(default.virustotal_poll_attempts),

            virustotal_poll_interval: parse_env("VIRUSTOTAL_POLL_INTERVAL")
                .map(Duration::from_secs)
                .unwrap_or(default.virustotal_poll_interval),

            failure_policy: env::var("SCAN_FAILURE_POLICY")
                .ok()
                .and_then(|v| FailurePolicy::parse(&v))
                .unwrap_or(default.failure_policy),

            require_reputation_scan: env::var("REQUIRE_REPUTATION_SCAN")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(default.require_reputation_scan),

            scan_max_retries: parse_env("SCAN_MAX_RETRIES").unwrap_or(default.scan_max_retries),

            scan_retry_backoff: parse_env("SCAN_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(default.scan_retry_backoff),

            storage_backend: env::var("STORAGE_BACKEND").unwrap_or(default.storage_backend),

            storage_root: env::var("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.storage_root),

            temp_dir: env::var("UPLOAD_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.temp_dir),

            public_base_url: env::var("SERVICE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(default.public_base_url),

            session_ttl: parse_env("SESSION_TTL_HOURS")
                .map(|h: u64| Duration::from_secs(h * 3600))
                .unwrap_or(default.session_ttl),

            session_retention: parse_env("SESSION_RETENTION_MINUTES")
                .map(|m: u64| Duration::from_secs(m * 60))
                .unwrap_or(default.session_retention),

            file_retention: parse_env("URL_EXPIRY_HOURS")
                .map(|h: u64| Duration::from_secs(h * 3600))
                .unwrap_or(default.file_retention),

            denylist_refresh_interval: parse_env("DENYLIST_REFRESH_SECS")
                .map(Duration::from_secs)
                .unwrap_or(default.denylist_refresh_interval),

            scan_log_retention_days: parse_env("SCAN_LOG_RETENTION_DAYS")
                .unwrap_or(default.scan_log_retention_days),

            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty() && o != "*")
                        .collect()
                })
                .unwrap_or(default.allowed_origins),
        }
    }

    /// Create config for development (no local scanner, fail open)
    pub fn development() -> Self {
        Self {
            enable_virus_scan: false,
            virus_scanner_type: "noop".to_string(),
            failure_policy: FailurePolicy::FailOpen,
            scan_retry_backoff: Duration::from_millis(50),
            ..Self::default()
        }
    }

    /// Create config for production (strict scanning)
    pub fn production() -> Self {
        Self {
            enable_virus_scan: true,
            virus_scanner_type: "clamav".to_string(),
            clamav_host: env::var("CLAMAV_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            clamav_port: parse_env("CLAMAV_PORT").unwrap_or(3310),
            virustotal_api_key: env::var("VIRUSTOTAL_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            failure_policy: FailurePolicy::FailClosed,
            ..Self::default()
        }
    }

    /// Whether `filename` carries an extension from the upload allowlist
    pub fn is_extension_allowed(&self, filename: &str) -> bool {
        match crate::utils::validation::extension_of(filename) {
            Some(ext) => self.allowed_extensions.iter().any(|a| *a == ext),
            None => false,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_extensions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .map(|e| if e.starts_with('.') { e } else { format!(".{}", e) })
        .collect()
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.max_file_size, 5_368_709_120);
        assert_eq!(config.clamav_timeout, Duration::from_secs(300));
        assert_eq!(config.failure_policy, FailurePolicy::FailClosed);
        assert!(config.enable_virus_scan);
        assert!(!config.require_reputation_scan);
        assert_eq!(config.virus_scanner_type, "clamav");
    }

    #[test]
    fn test_development_config() {
        let config = GatewayConfig::development();
        assert!(!config.enable_virus_scan);
        assert_eq!(config.virus_scanner_type, "noop");
        assert_eq!(config.failure_policy, FailurePolicy::FailOpen);
    }

    #[test]
    fn test_production_config() {
        let config = GatewayConfig::production();
        assert!(config.enable_virus_scan);
        assert_eq!(config.virus_scanner_type, "clamav");
        assert_eq!(config.failure_policy, FailurePolicy::FailClosed);
    }

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!(FailurePolicy::parse("open"), Some(FailurePolicy::FailOpen));
        assert_eq!(
            FailurePolicy::parse(" Fail-Closed "),
            Some(FailurePolicy::FailClosed)
        );
        assert_eq!(FailurePolicy::parse("maybe"), None);
    }

    #[test]
    fn test_parse_extensions() {
        assert_eq!(
            parse_extensions("PDF, .zip,,txt"),
            vec![".pdf", ".zip", ".txt"]
        );
    }

    #[test]
    fn test_extension_allowlist() {
        let config = GatewayConfig::default();
        assert!(config.is_extension_allowed("report.PDF"));
        assert!(config.is_extension_allowed("archive.tar.zip"));
        assert!(!config.is_extension_allowed("setup.exe"));
        assert!(!config.is_extension_allowed("README"));
    }
}
