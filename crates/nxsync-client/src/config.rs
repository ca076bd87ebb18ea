use crate::proxy::ProxySettings;
use crate::tiers::RateLimit;
use crate::util::{env_f64, env_string, env_u64};
use anyhow::{Context, Result};
use jsonschema::{validator_for, Validator};
use nxsync_ratelimit::StrategyKind;
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_REPOSITORY: &str = "default";
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_BLOB_TIMEOUT_SECS: u64 = 60;

fn default_repository() -> String {
    DEFAULT_REPOSITORY.to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_blob_timeout() -> u64 {
    DEFAULT_BLOB_TIMEOUT_SECS
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ServerConfig {
    /// Base URL of the content server, e.g. <https://cloud.example.com/nuxeo/>
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    #[serde(default = "default_repository")]
    pub repository: String,
    /// Timeout for control requests; 0 falls back to the default.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Timeout for requests carrying a blob; 0 falls back to the default.
    #[serde(default = "default_blob_timeout")]
    pub blob_timeout_secs: u64,
    /// Where upload scratch files are created (system temp dir when unset)
    #[serde(default)]
    pub upload_tmp_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user: String::new(),
            device_id: String::new(),
            client_version: default_client_version(),
            repository: default_repository(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            blob_timeout_secs: DEFAULT_BLOB_TIMEOUT_SECS,
            upload_tmp_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(match self.timeout_secs {
            0 => DEFAULT_TIMEOUT_SECS,
            s => s,
        })
    }

    pub fn blob_timeout(&self) -> Duration {
        Duration::from_secs(match self.blob_timeout_secs {
            0 => DEFAULT_BLOB_TIMEOUT_SECS,
            s => s,
        })
    }

    pub fn upload_tmp_dir(&self) -> PathBuf {
        self.upload_tmp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct TransferConfig {
    /// Upload limit in KB/s; unset or non-positive means unlimited.
    #[serde(default)]
    pub upload_rate_limit: Option<f64>,
    /// Download limit in KB/s; unset or non-positive means unlimited.
    #[serde(default)]
    pub download_rate_limit: Option<f64>,
    /// Fairness between workers sharing a limited bucket.
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Waits longer than this between two grants are logged as warnings.
    #[serde(default)]
    pub read_timeout_secs: Option<u64>,
}

impl TransferConfig {
    pub fn upload_limit(&self) -> RateLimit {
        RateLimit::from_kbps(self.upload_rate_limit)
    }

    pub fn download_limit(&self) -> RateLimit {
        RateLimit::from_kbps(self.download_rate_limit)
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(nxsync_ratelimit::DEFAULT_READ_TIMEOUT)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub proxy: ProxySettings,
}

static CONFIG_SCHEMA: Lazy<Result<Validator, String>> = Lazy::new(|| {
    let schema_value = config_schema_json().map_err(|e| e.to_string())?;
    validator_for(&schema_value).map_err(|e| e.to_string())
});

/// Returns the JSON schema describing the configuration structure.
pub fn config_schema_json() -> Result<serde_json::Value> {
    let schema = schemars::schema_for!(Config);
    Ok(serde_json::to_value(&schema)?)
}

pub fn write_schema_file(path: impl AsRef<Path>) -> Result<()> {
    let schema_json = config_schema_json()?;
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)?;
    Ok(())
}

/// Parses and validates TOML without consulting the environment.
pub fn from_toml_str(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validator = CONFIG_SCHEMA
        .as_ref()
        .map_err(|e| anyhow::anyhow!("config schema: {e}"))?;
    let validation_errors: Vec<_> = validator
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    Ok(cfg)
}

/// Reads `path`, validates it and applies `NXSYNC_*` overrides.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let mut cfg = from_toml_str(&content).with_context(|| format!("invalid config {}", path.display()))?;
    cfg.apply_env_overrides()?;
    Ok(cfg)
}

impl Config {
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(url) = env_string("NXSYNC_SERVER_URL") {
            self.server.url = url;
        }
        if let Some(user) = env_string("NXSYNC_USER") {
            self.server.user = user;
        }
        if let Some(device) = env_string("NXSYNC_DEVICE_ID") {
            self.server.device_id = device;
        }
        if let Some(repo) = env_string("NXSYNC_REPOSITORY") {
            self.server.repository = repo;
        }
        if let Some(secs) = env_u64("NXSYNC_TIMEOUT_SECS") {
            self.server.timeout_secs = secs;
        }
        if let Some(secs) = env_u64("NXSYNC_BLOB_TIMEOUT_SECS") {
            self.server.blob_timeout_secs = secs;
        }
        if let Some(dir) = env_string("NXSYNC_UPLOAD_TMP_DIR") {
            self.server.upload_tmp_dir = Some(PathBuf::from(dir));
        }
        if let Some(rate) = env_f64("NXSYNC_UPLOAD_RATE_LIMIT") {
            self.transfer.upload_rate_limit = Some(rate);
        }
        if let Some(rate) = env_f64("NXSYNC_DOWNLOAD_RATE_LIMIT") {
            self.transfer.download_rate_limit = Some(rate);
        }
        if let Some(kind) = env_string("NXSYNC_FAIRNESS") {
            self.transfer.strategy = kind
                .parse()
                .with_context(|| "NXSYNC_FAIRNESS".to_string())?;
        }
        Ok(())
    }

    /// Checks the fields a client cannot start without.
    pub fn validate(&self) -> Result<()> {
        if self.server.url.trim().is_empty() {
            anyhow::bail!("server.url is required");
        }
        url::Url::parse(&self.server.url)
            .with_context(|| format!("server.url '{}'", self.server.url))?;
        if self.server.user.trim().is_empty() {
            anyhow::bail!("server.user is required");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyMode;
    use serial_test::serial;

    const SAMPLE: &str = r#"
[server]
url = "https://cloud.example.com/nuxeo"
user = "alice"
device_id = "d3v1c3"
timeout_secs = 5

[transfer]
upload_rate_limit = 250.0
strategy = "wait_priority"

[proxy]
mode = "manual"
server = "proxy.local"
port = 3128
"#;

    fn clear_env() {
        for key in [
            "NXSYNC_SERVER_URL",
            "NXSYNC_USER",
            "NXSYNC_DEVICE_ID",
            "NXSYNC_REPOSITORY",
            "NXSYNC_TIMEOUT_SECS",
            "NXSYNC_BLOB_TIMEOUT_SECS",
            "NXSYNC_UPLOAD_TMP_DIR",
            "NXSYNC_UPLOAD_RATE_LIMIT",
            "NXSYNC_DOWNLOAD_RATE_LIMIT",
            "NXSYNC_FAIRNESS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn parses_sample_with_defaults() {
        let cfg = from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.server.user, "alice");
        assert_eq!(cfg.server.repository, "default");
        assert_eq!(cfg.server.timeout(), Duration::from_secs(5));
        assert_eq!(cfg.server.blob_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.transfer.strategy, StrategyKind::WaitPriority);
        assert_eq!(cfg.transfer.upload_limit(), RateLimit::KbPerSec(250.0));
        assert_eq!(cfg.transfer.download_limit(), RateLimit::Unlimited);
        assert_eq!(cfg.proxy.mode, ProxyMode::Manual);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn schema_rejects_wrong_types() {
        let err = from_toml_str("[server]\ntimeout_secs = \"soon\"\n").unwrap_err();
        assert!(!err.to_string().is_empty());
        assert!(from_toml_str("[transfer]\nstrategy = \"fastest\"\n").is_err());
    }

    #[test]
    fn zero_timeouts_fall_back_to_defaults() {
        let cfg = from_toml_str("[server]\ntimeout_secs = 0\nblob_timeout_secs = 0\n").unwrap();
        assert_eq!(cfg.server.timeout(), Duration::from_secs(20));
        assert_eq!(cfg.server.blob_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.transfer.read_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn validate_requires_url_and_user() {
        assert!(Config::default().validate().is_err());
        let mut cfg = Config::default();
        cfg.server.url = "not a url".into();
        cfg.server.user = "alice".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    #[serial]
    fn env_overrides_win_over_file() {
        clear_env();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nxsync.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        std::env::set_var("NXSYNC_USER", "bob");
        std::env::set_var("NXSYNC_DOWNLOAD_RATE_LIMIT", "1200");
        std::env::set_var("NXSYNC_FAIRNESS", "round-robin");
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.server.user, "bob");
        assert_eq!(cfg.transfer.download_limit(), RateLimit::KbPerSec(1200.0));
        assert_eq!(cfg.transfer.strategy, StrategyKind::RoundRobin);

        std::env::set_var("NXSYNC_FAIRNESS", "fastest");
        assert!(load_config(&path).is_err());
        clear_env();
    }

    #[test]
    fn schema_file_is_written() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("schema.json");
        write_schema_file(&path).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(written.get("properties").is_some());
    }
}
