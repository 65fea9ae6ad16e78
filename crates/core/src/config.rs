//! Configuration management for spmigrate

use crate::error::{Error, Result};
use crate::retry::{BackoffStrategy, RetryPolicy};
use crate::transport::{ConflictBehavior, DriveAddressing};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration directory name
const CONFIG_DIR: &str = "spmigrate";

/// Configuration file name
const CONFIG_FILE: &str = "config.toml";

/// Upload fragments must be a multiple of this many bytes (320 KiB)
pub const FRAGMENT_ALIGNMENT: u64 = 320 * 1024;

/// Largest fragment the upload endpoint accepts in one request
pub const MAX_CHUNK_SIZE: u64 = 60 * 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub graph: GraphConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    pub advanced: Option<AdvancedConfig>,
    pub logging: Option<LoggingConfig>,
}

/// Microsoft Graph application credentials and target drive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,

    /// SharePoint site whose default document library receives the files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,

    /// Explicit drive; takes precedence over `site_id`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drive_id: Option<String>,

    #[serde(default = "default_authority_host")]
    pub authority_host: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_scope")]
    pub scope: String,
}

/// Upload behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_destination_root")]
    pub destination_root: String,
    /// Fragment size in MB (default: 5)
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_uploads: usize,
    #[serde(default)]
    pub conflict_behavior: ConflictBehavior,
    /// Insert a `<timestamp>` folder below the destination root for folder runs
    #[serde(default = "default_true")]
    pub timestamp_folders: bool,
    /// Whole-file attempts for transient failures
    #[serde(default = "default_file_attempts")]
    pub file_attempts: u32,
    #[serde(default = "default_max_rate_limit_pauses")]
    pub max_rate_limit_pauses: u32,
    #[serde(default)]
    pub send_auth_to_upload_url: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            destination_root: default_destination_root(),
            chunk_size_mb: default_chunk_size_mb(),
            max_concurrent_uploads: default_max_concurrent(),
            conflict_behavior: ConflictBehavior::default(),
            timestamp_folders: true,
            file_attempts: default_file_attempts(),
            max_rate_limit_pauses: default_max_rate_limit_pauses(),
            send_auth_to_upload_url: false,
            state_dir: None,
        }
    }
}

/// Advanced configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base retry delay in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Upper bound for a single retry delay in milliseconds
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay: u64,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Seconds before expiry at which a cached token is refreshed
    #[serde(default = "default_token_expiry_margin")]
    pub token_expiry_margin: u64,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            max_retry_delay: default_max_retry_delay(),
            backoff: BackoffStrategy::default(),
            token_expiry_margin: default_token_expiry_margin(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Directory for per-run log files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

// Default values
fn default_authority_host() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_scope() -> String {
    "https://graph.microsoft.com/.default".to_string()
}

fn default_destination_root() -> String {
    "Documents/Migration".to_string()
}

fn default_chunk_size_mb() -> u64 {
    5
}

fn default_max_concurrent() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_file_attempts() -> u32 {
    3
}

fn default_max_rate_limit_pauses() -> u32 {
    8
}

fn default_timeout() -> u64 {
    900 // 15 minutes, large fragments on slow links
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2000
}

fn default_max_retry_delay() -> u64 {
    10_000
}

fn default_token_expiry_margin() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl ConfigFile {
    /// Build a configuration from the environment variables the migration
    /// scripts have always used. Returns `None` when credentials are missing.
    pub fn from_env() -> Option<Self> {
        let tenant_id = env_var("MS_TENANT_ID")?;
        let client_id = env_var("MS_CLIENT_ID")?;
        let client_secret = env_var("MS_CLIENT_SECRET")?;

        let mut config = ConfigFile {
            graph: GraphConfig {
                tenant_id,
                client_id,
                client_secret,
                site_id: None,
                drive_id: None,
                authority_host: default_authority_host(),
                base_url: default_base_url(),
                scope: default_scope(),
            },
            upload: UploadConfig::default(),
            advanced: None,
            logging: None,
        };
        config.apply_env_overrides();
        Some(config)
    }

    /// Environment wins over the file for the values operators tweak per run
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_var("MS_TENANT_ID") {
            self.graph.tenant_id = v;
        }
        if let Some(v) = env_var("MS_CLIENT_ID") {
            self.graph.client_id = v;
        }
        if let Some(v) = env_var("MS_CLIENT_SECRET") {
            self.graph.client_secret = v;
        }
        if let Some(v) = env_var("MS_SITE_ID") {
            self.graph.site_id = Some(v);
        }
        if let Some(v) = env_var("MS_DRIVE_ID") {
            self.graph.drive_id = Some(v);
        }
        if let Some(v) = env_var("SP_ROOT") {
            self.upload.destination_root = v;
        }
        if let Some(workers) = env_var("WORKER").and_then(|w| w.parse::<usize>().ok()) {
            self.upload.max_concurrent_uploads = workers;
        }
    }

    /// Addressing mode derived from the configured identifiers
    pub fn addressing(&self) -> Result<DriveAddressing> {
        match (&self.graph.drive_id, &self.graph.site_id) {
            (Some(drive_id), _) if !drive_id.is_empty() => Ok(DriveAddressing::Drive {
                drive_id: drive_id.clone(),
            }),
            (_, Some(site_id)) if !site_id.is_empty() => Ok(DriveAddressing::Site {
                site_id: site_id.clone(),
            }),
            _ => Err(Error::Config(
                "Neither site_id nor drive_id is configured".to_string(),
            )),
        }
    }

    pub fn advanced(&self) -> AdvancedConfig {
        self.advanced.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Fragment size in bytes, saturating for absurd settings
    pub fn chunk_size(&self) -> u64 {
        self.upload.chunk_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let advanced = self.advanced();
        RetryPolicy {
            max_retries: advanced.max_retries,
            base_delay: Duration::from_millis(advanced.retry_delay),
            max_delay: Duration::from_millis(advanced.max_retry_delay),
            strategy: advanced.backoff,
        }
    }

    /// Directory holding resume records
    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.upload.state_dir {
            return Ok(dir.clone());
        }
        let base = dirs::state_dir()
            .or_else(|| home_dir().map(|h| h.join(".local").join("state")))
            .ok_or_else(|| Error::Config("Cannot determine state directory".to_string()))?;
        Ok(base.join(CONFIG_DIR).join("sessions"))
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let home = home_dir().ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))?;
    let config_dir = home.join(".config").join(CONFIG_DIR);

    // Create directory if it doesn't exist
    if !config_dir.exists() {
        fs::create_dir_all(&config_dir).map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
    }

    Ok(config_dir)
}

/// Get the configuration file path
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE))
}

/// Load configuration from the default location
pub fn load_config() -> Result<ConfigFile> {
    load_config_from(&get_config_path()?)
}

/// Load configuration from `path`, falling back to the environment when the
/// file does not exist.
pub fn load_config_from(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        return ConfigFile::from_env().ok_or_else(|| Error::ConfigNotFound(path.to_path_buf()));
    }

    let content = fs::read_to_string(path).map_err(|e| {
        Error::InvalidConfig(format!("Failed to read config file: {}", e))
    })?;

    let mut config: ConfigFile = toml::from_str(&content).map_err(|e| {
        Error::InvalidConfig(format!("Failed to parse config file: {}", e))
    })?;

    config.apply_env_overrides();
    Ok(config)
}

/// Save configuration to the default location
pub fn save_config(config: &ConfigFile) -> Result<()> {
    save_config_to(config, &get_config_path()?)
}

/// Save configuration to `path`
pub fn save_config_to(config: &ConfigFile, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config).map_err(|e| {
        Error::InvalidConfig(format!("Failed to serialize config: {}", e))
    })?;

    fs::write(path, content).map_err(|e| {
        Error::Config(format!("Failed to write config file: {}", e))
    })?;

    // Set secure permissions on config file (read/write for owner only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }

    Ok(())
}

/// Validate configuration
pub fn validate_config(config: &ConfigFile) -> Result<()> {
    let graph = &config.graph;
    if graph.tenant_id.is_empty() || graph.client_id.is_empty() || graph.client_secret.is_empty() {
        return Err(Error::Config(
            "tenant_id, client_id and client_secret must all be set".to_string(),
        ));
    }

    config.addressing()?;

    let chunk_size = config.chunk_size();
    if chunk_size > MAX_CHUNK_SIZE {
        return Err(Error::InvalidInput(format!(
            "chunk_size_mb cannot exceed 60, got {}",
            config.upload.chunk_size_mb
        )));
    }
    if chunk_size == 0 || chunk_size % FRAGMENT_ALIGNMENT != 0 {
        return Err(Error::InvalidInput(format!(
            "chunk_size_mb must be a multiple of 5 (fragments must align to 320 KiB), got {}",
            config.upload.chunk_size_mb
        )));
    }

    if config.upload.max_concurrent_uploads == 0 {
        return Err(Error::InvalidInput(
            "max_concurrent_uploads must be at least 1".to_string(),
        ));
    }

    if config.upload.file_attempts == 0 {
        return Err(Error::InvalidInput("file_attempts must be at least 1".to_string()));
    }

    let advanced = config.advanced();
    if advanced.retry_delay > advanced.max_retry_delay {
        return Err(Error::InvalidInput(
            "retry_delay cannot exceed max_retry_delay".to_string(),
        ));
    }

    Ok(())
}

/// Check if configuration exists
pub fn config_exists() -> bool {
    get_config_path().map(|p| p.exists()).unwrap_or(false)
}

/// Public alias for ConfigFile (used by lib.rs)
pub use ConfigFile as Config;
