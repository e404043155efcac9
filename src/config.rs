//! Float configuration and engine settings.

use crate::error::Result;
use crate::units::Unit;
use async_trait::async_trait;
use config::{Config, ConfigError, Environment, File};
use log::warn;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Per-float split parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatConfig {
    pub client_id: String,
    pub float_id: String,
    /// Fraction of each accrual taken as the bonus pool fee, in `[0, 1]`.
    pub bonus_pool_share: Decimal,
    /// Entity id of the bonus pool pseudo-account.
    pub bonus_pool_tracker: String,
    /// Fraction of each accrual taken as the client company fee, in `[0, 1]`.
    pub client_co_share: Decimal,
    /// Entity id of the client company share pseudo-account.
    pub client_co_share_tracker: String,
    pub currency: String,
    #[serde(default)]
    pub unit: Unit,
}

/// The configuration key-value store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fails with [`EngineError::FloatNotConfigured`](crate::EngineError::FloatNotConfigured)
    /// when nothing is stored for the float.
    async fn fetch_float_config(&self, client_id: &str, float_id: &str) -> Result<FloatConfig>;
}

/// Environment variable naming an alternative settings file.
pub const CONFIG_PATH_VAR: &str = "FLOAT_ENGINE_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config/float-engine.toml";

/// Engine-wide settings, loaded from file then environment.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
    #[serde(default = "default_cache_key_prefix")]
    pub cache_key_prefix: String,
    /// Upper bound on account rows returned by a capitalization preview.
    #[serde(default = "default_preview_sample_size")]
    pub preview_sample_size: usize,
    /// Where audit CSVs are written; export is skipped when unset.
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    /// Float configs served by the in-memory config store.
    #[serde(default)]
    pub floats: Vec<FloatConfig>,
}

fn default_cache_ttl_seconds() -> u64 {
    300
}

fn default_poll_interval_millis() -> u64 {
    250
}

fn default_cache_key_prefix() -> String {
    "float".to_string()
}

fn default_preview_sample_size() -> usize {
    10
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            cache_ttl_seconds: default_cache_ttl_seconds(),
            poll_interval_millis: default_poll_interval_millis(),
            cache_key_prefix: default_cache_key_prefix(),
            preview_sample_size: default_preview_sample_size(),
            archive_dir: None,
            floats: Vec::new(),
        }
    }
}

impl EngineSettings {
    /// Loads settings from `config/float-engine.toml` (or the file named by
    /// `FLOAT_ENGINE_CONFIG`), overridden by `FLOAT_ENGINE__*` variables.
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let explicit = std::env::var(CONFIG_PATH_VAR).is_ok();

        let settings = Config::builder()
            .add_source(File::with_name(&path).required(explicit))
            .add_source(Environment::with_prefix("FLOAT_ENGINE").separator("__"))
            .build()?;

        let loaded: EngineSettings = settings.try_deserialize()?;
        if loaded.floats.is_empty() {
            warn!("No floats configured in {}", path);
        }
        Ok(loaded)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }
}
