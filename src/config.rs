use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::{AllocationError, AllocationResult};

const ENV_PREFIX: &str = "CREDIT_ALLOC_";
const CONFIG_PATH_VAR: &str = "CREDIT_ALLOC_CONFIG_PATH";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AllocationConfig {
    pub store: StoreConfig,
    pub log: LogConfig,
    /// Recorded as `created_by` on criteria recreated without a username.
    pub system_user: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub flush_on_write: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    pub level: String,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            log: LogConfig::default(),
            system_user: "system".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("credit_allocation.db"),
            flush_on_write: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AllocationConfig {
    pub fn validate(&self) -> AllocationResult<()> {
        if self.store.path.as_os_str().is_empty() {
            return Err(AllocationError::Config("store.path must not be empty".into()));
        }
        if self.system_user.trim().is_empty() {
            return Err(AllocationError::Config("system_user must not be empty".into()));
        }
        Ok(())
    }
}

/// Defaults, then the TOML file named by `CREDIT_ALLOC_CONFIG_PATH`, then
/// `CREDIT_ALLOC_*` variables (`__` separates nested keys).
pub fn load_config() -> AllocationResult<AllocationConfig> {
    let mut figment = Figment::from(Serialized::defaults(AllocationConfig::default()));

    if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
        figment = merge_config_file(figment, Path::new(&path))?;
    }
    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    load_config_from(figment)
}

fn merge_config_file(figment: Figment, path: &Path) -> AllocationResult<Figment> {
    match path.extension().and_then(|s| s.to_str()) {
        Some("toml") => Ok(figment.merge(Toml::file(path))),
        _ => Err(AllocationError::Config(format!(
            "unsupported config file {} (expected .toml)",
            path.display()
        ))),
    }
}

pub fn load_config_from(figment: Figment) -> AllocationResult<AllocationConfig> {
    let cfg: AllocationConfig = figment
        .extract()
        .map_err(|e| AllocationError::Config(e.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
}
