use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::{
    retry::Backoff,
    storage::{self, StorageManager},
};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_API_ADDR: &str = "http://localhost:8000";
const DEFAULT_PROGRESS_PATH: &str = "/ws/search";
/// Face embeddings closer than this (L2) are treated as the same person
const DEFAULT_DEDUP_THRESHOLD: f32 = 0.6;
const DEFAULT_TOP_K: u32 = 20;
const DEFAULT_GENERATOR: &str = "dalle";
const DEFAULT_COLLECTION_NAME: &str = "My Photos";
const DEFAULT_READINESS_INTERVAL_MS: u64 = 1000;
const DEFAULT_READINESS_MAX_ATTEMPTS: u32 = 30;

/// How long to keep probing the backend before the first search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_readiness_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_readiness_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_READINESS_INTERVAL_MS,
            max_attempts: DEFAULT_READINESS_MAX_ATTEMPTS,
        }
    }
}

impl ReadinessConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(Duration::from_millis(self.interval_ms), self.max_attempts)
    }
}

fn default_readiness_interval_ms() -> u64 {
    DEFAULT_READINESS_INTERVAL_MS
}

fn default_readiness_max_attempts() -> u32 {
    DEFAULT_READINESS_MAX_ATTEMPTS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// HTTP address of the search API
    #[serde(default = "default_api_addr")]
    pub api_addr: String,

    /// WebSocket path the progress channel lives under
    #[serde(default = "default_progress_path")]
    pub progress_path: String,

    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f32,

    /// Results requested for text and generate searches
    #[serde(default = "default_top_k")]
    pub top_k: u32,

    /// Image generator used by generate searches
    #[serde(default = "default_generator")]
    pub generator: String,

    /// Name of the collection created when none exists yet
    #[serde(default = "default_collection_name")]
    pub default_collection_name: String,

    #[serde(default)]
    pub readiness: ReadinessConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_addr: default_api_addr(),
            progress_path: default_progress_path(),
            dedup_threshold: DEFAULT_DEDUP_THRESHOLD,
            top_k: DEFAULT_TOP_K,
            generator: default_generator(),
            default_collection_name: default_collection_name(),
            readiness: ReadinessConfig::default(),
            base_path: String::new(),
        }
    }
}

fn default_api_addr() -> String {
    DEFAULT_API_ADDR.to_string()
}

fn default_progress_path() -> String {
    DEFAULT_PROGRESS_PATH.to_string()
}

fn default_dedup_threshold() -> f32 {
    DEFAULT_DEDUP_THRESHOLD
}

fn default_top_k() -> u32 {
    DEFAULT_TOP_K
}

fn default_generator() -> String {
    DEFAULT_GENERATOR.to_string()
}

fn default_collection_name() -> String {
    DEFAULT_COLLECTION_NAME.to_string()
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.dedup_threshold > 0.0 && self.dedup_threshold.is_finite()) {
            bail!(
                "dedup_threshold must be a positive number, got {}",
                self.dedup_threshold
            );
        }

        if self.top_k == 0 {
            bail!("top_k must be greater than 0");
        }

        if !self.progress_path.starts_with('/') {
            bail!(
                "progress_path must start with '/', got '{}'",
                self.progress_path
            );
        }

        url::Url::parse(&self.api_addr)
            .with_context(|| format!("api_addr is not a valid url: '{}'", self.api_addr))?;

        if self.readiness.max_attempts == 0 {
            bail!("readiness.max_attempts must be greater than 0");
        }

        Ok(())
    }

    pub fn load_with(base_path: &str) -> anyhow::Result<Self> {
        let store = storage::BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(
                CONFIG_FILE,
                serde_yml::to_string(&Self::default())?.as_bytes(),
            )?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_string();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }
}
