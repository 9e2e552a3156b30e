//! Configuration loader and validator for the canteen sync client.
use crate::model::{PortalFeatures, SecurityMode};
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
    Invalid(String),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub portals: Vec<Portal>,
    pub credentials: Vec<Credential>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub data_dir: String,
    /// Upper bound for one plugin session, in seconds.
    pub plugin_timeout_secs: u64,
}

/// One remote canteen portal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Portal {
    pub id: i64,
    pub name: String,
    /// Registry key of the plugin that speaks this portal's protocol.
    pub plugin: String,
    /// Base URL of the portal.
    pub reference: String,
    #[serde(default = "default_security")]
    pub security: SecurityMode,
    #[serde(default)]
    pub features: PortalFlags,
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    pub notify_new_menu: bool,
}

/// Portal capabilities, spelled out per flag so the YAML stays readable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortalFlags {
    #[serde(default)]
    pub group_full_sync: bool,
    #[serde(default)]
    pub food_stock: bool,
    #[serde(default)]
    pub remaining_food: bool,
    #[serde(default)]
    pub multiple_orders: bool,
    #[serde(default)]
    pub one_order_per_group: bool,
}

impl PortalFlags {
    pub fn to_features(&self) -> PortalFeatures {
        let mut bits = 0;
        if self.group_full_sync {
            bits |= PortalFeatures::GROUP_FULL_SYNC;
        }
        if self.food_stock {
            bits |= PortalFeatures::FOOD_STOCK;
        }
        if self.remaining_food {
            bits |= PortalFeatures::REMAINING_FOOD;
        }
        if self.multiple_orders {
            bits |= PortalFeatures::MULTIPLE_ORDERS;
        }
        if self.one_order_per_group {
            bits |= PortalFeatures::ONE_ORDER_PER_GROUP;
        }
        PortalFeatures(bits)
    }
}

/// One login identity against a portal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub id: i64,
    pub portal: i64,
    /// Credentials sharing a group share ordering restrictions.
    #[serde(default)]
    pub group: i64,
    pub name: String,
    #[serde(default)]
    pub secret: String,
    /// Minor currency units; 0 disables the low-credit notification.
    #[serde(default)]
    pub low_credit_threshold: i64,
    #[serde(default = "default_true")]
    pub notify_credit_increase: bool,
    #[serde(default = "default_true")]
    pub notify_low_credit: bool,
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
}

fn default_security() -> SecurityMode {
    SecurityMode::TrustTrusted
}

fn default_true() -> bool {
    true
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

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty".into()));
    }
    if cfg.app.plugin_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "app.plugin_timeout_secs must be > 0".into(),
        ));
    }

    for portal in &cfg.portals {
        if portal.name.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "portals[{}].name must be non-empty",
                portal.id
            )));
        }
        if portal.plugin.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "portals[{}].plugin must be non-empty",
                portal.id
            )));
        }
        if portal.reference.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "portals[{}].reference must be non-empty",
                portal.id
            )));
        }
        if cfg.portals.iter().filter(|p| p.id == portal.id).count() > 1 {
            return Err(ConfigError::Invalid(format!(
                "duplicate portal id {}",
                portal.id
            )));
        }
    }

    for credential in &cfg.credentials {
        if credential.name.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "credentials[{}].name must be non-empty",
                credential.id
            )));
        }
        if !cfg.portals.iter().any(|p| p.id == credential.portal) {
            return Err(ConfigError::Invalid(format!(
                "credentials[{}].portal {} is not a configured portal",
                credential.id, credential.portal
            )));
        }
        if cfg
            .credentials
            .iter()
            .filter(|c| c.id == credential.id)
            .count()
            > 1
        {
            return Err(ConfigError::Invalid(format!(
                "duplicate credential id {}",
                credential.id
            )));
        }
    }

    Ok(())
}

/// Example configuration document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  plugin_timeout_secs: 120

portals:
  - id: 1
    name: "School canteen"
    plugin: "icanteen"
    reference: "https://jidelna.example.cz/faces/login.jsp"
    security: trust_trusted
    features:
      food_stock: true
      one_order_per_group: true

credentials:
  - id: 1
    portal: 1
    group: 1
    name: "novak"
    secret: "hunter2"
    low_credit_threshold: 5000
"#
}
