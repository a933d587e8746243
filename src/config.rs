//! Configuration loader and validator for the sync service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub shopify: Shopify,
    pub sendgrid: Sendgrid,
    pub analytics: Analytics,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub bind_addr: String,
    pub poll_interval_ms: u64,
    pub page_size: u32,
}

/// Shopify Admin API settings shared by all tenants (per-tenant credentials
/// live on the tenant rows).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shopify {
    pub api_version: String,
    pub webhook_secret: String,
}

/// Outbound notification provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sendgrid {
    pub api_key: String,
    pub from_email: String,
}

/// External segmentation process invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Analytics {
    pub python_bin: String,
    pub script: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance. Required values fail fast at startup.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.bind_addr.trim().is_empty() {
        return Err(ConfigError::Invalid("app.bind_addr must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.page_size == 0 {
        return Err(ConfigError::Invalid("app.page_size must be > 0"));
    }

    if cfg.shopify.api_version.trim().is_empty() {
        return Err(ConfigError::Invalid("shopify.api_version must be non-empty"));
    }
    if cfg.shopify.webhook_secret.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "shopify.webhook_secret must be non-empty",
        ));
    }

    if cfg.sendgrid.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("sendgrid.api_key must be non-empty"));
    }
    if cfg.sendgrid.from_email.trim().is_empty() {
        return Err(ConfigError::Invalid("sendgrid.from_email must be non-empty"));
    }

    if cfg.analytics.python_bin.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "analytics.python_bin must be non-empty",
        ));
    }
    if cfg.analytics.script.trim().is_empty() {
        return Err(ConfigError::Invalid("analytics.script must be non-empty"));
    }

    Ok(())
}

/// Example YAML configuration, also used by the config tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  bind_addr: "0.0.0.0:8080"
  poll_interval_ms: 500
  page_size: 10

shopify:
  api_version: "2024-01"
  webhook_secret: "YOUR_SHOPIFY_WEBHOOK_SECRET"

sendgrid:
  api_key: "YOUR_SENDGRID_API_KEY"
  from_email: "noreply@example.com"

analytics:
  python_bin: "python3"
  script: "./mlModel/customer_segmentation.py"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_webhook_secret() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.shopify.webhook_secret = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("webhook_secret")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_page_size() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.page_size = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("page_size")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_sendgrid_and_analytics() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sendgrid.api_key = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.analytics.script = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.page_size, 10);
        assert_eq!(cfg.shopify.api_version, "2024-01");
    }
}
