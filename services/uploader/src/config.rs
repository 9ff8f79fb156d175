use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the upload service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Upload endpoint configuration
    #[serde(default)]
    pub upload: UploadConfig,
    /// Capture configuration
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Progress bus configuration
    #[serde(default)]
    pub bus: BusConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// How long shutdown waits for in-flight uploads
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Remote upload endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Multipart POST endpoint
    #[serde(default = "default_endpoint_url")]
    pub endpoint_url: String,
    /// Whole-request timeout in seconds (0 disables it)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Body chunk size; progress is reported once per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,
    /// Transfers running at once; further dispatches queue behind them
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// Scan for missing files and orphaned uploads at startup
    #[serde(default = "default_true")]
    pub reconcile_on_startup: bool,
}

/// Capture configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Directory captured images are written to
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
    /// Program that writes a single image to stdout (e.g. `libcamera-still`)
    pub command: Option<String>,
    /// Arguments passed to the capture program
    #[serde(default)]
    pub args: Vec<String>,
}

/// Progress bus configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Per-subscriber buffer size
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "upload-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_database_url() -> String {
    "sqlite://data/images.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_endpoint_url() -> String {
    "https://www.clippr.ai/api/upload".to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_chunk_size() -> usize {
    64 * 1024 // 64KB
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_image_dir() -> PathBuf {
    PathBuf::from("data/images")
}

fn default_bus_capacity() -> usize {
    256
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/uploader").required(false))
            .add_source(config::File::with_name("/etc/uploader/uploader").required(false))
            // UPLOADER__UPLOAD__ENDPOINT_URL -> upload.endpoint_url
            .add_source(
                config::Environment::with_prefix("UPLOADER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get shutdown grace period as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_grace_secs)
    }
}

impl UploadConfig {
    /// Request timeout, `None` when disabled
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint_url: default_endpoint_url(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            chunk_size_bytes: default_chunk_size(),
            upload_concurrency: default_upload_concurrency(),
            reconcile_on_startup: true,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            image_dir: default_image_dir(),
            command: None,
            args: Vec::new(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}
