//! Configuration module for capstream.
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Every key is optional; command line flags override what the file says.
//!
//! # Example
//!
//! ```toml
//! [census]
//! root_endpoint = "${CENSUS_ROOT_ENDPOINT}"
//! timeout_ms = 30000
//!
//! [pipeline]
//! world_id = 13
//! correlator_parallelism = 4
//!
//! [retry]
//! max_retries = 6
//! base_delay_ms = 1000
//! ```

use crate::census::http::{DEFAULT_NAMESPACE, DEFAULT_ROOT_ENDPOINT};
use crate::dedup::DEFAULT_DEDUP_CAPACITY;
use crate::pipeline::PipelineSettings;
use crate::resolve::DEFAULT_FACILITY_CACHE_CAPACITY;
use crate::retry::{RetryPolicy, DEFAULT_MAX_RETRIES};
use crate::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_CORRELATOR_PARALLELISM, DEFAULT_WORLD_ID, PAGE_SIZE};
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default config location, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config/capstream.toml";

/// Environment variable overriding [`DEFAULT_CONFIG_PATH`]
pub const CONFIG_PATH_ENV: &str = "CAPSTREAM_CONFIG";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CapstreamConfig {
    #[serde(default)]
    pub census: CensusConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Census endpoint configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CensusConfig {
    #[serde(default = "default_root_endpoint")]
    pub root_endpoint: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for CensusConfig {
    fn default() -> Self {
        Self {
            root_endpoint: default_root_endpoint(),
            namespace: default_namespace(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl CensusConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_root_endpoint() -> String {
    DEFAULT_ROOT_ENDPOINT.to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_timeout_ms() -> u64 {
    30000
}

/// Pipeline sizing
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_world_id")]
    pub world_id: u32,

    #[serde(default = "default_correlator_parallelism")]
    pub correlator_parallelism: usize,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    #[serde(default = "default_facility_cache_capacity")]
    pub facility_cache_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            world_id: default_world_id(),
            correlator_parallelism: default_correlator_parallelism(),
            channel_capacity: default_channel_capacity(),
            dedup_capacity: default_dedup_capacity(),
            facility_cache_capacity: default_facility_cache_capacity(),
        }
    }
}

impl PipelineConfig {
    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            page_size: PAGE_SIZE,
            correlator_parallelism: self.correlator_parallelism,
            channel_capacity: self.channel_capacity,
            dedup_capacity: self.dedup_capacity,
            facility_cache_capacity: self.facility_cache_capacity,
        }
    }
}

fn default_world_id() -> u32 {
    DEFAULT_WORLD_ID
}

fn default_correlator_parallelism() -> usize {
    DEFAULT_CORRELATOR_PARALLELISM
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_dedup_capacity() -> usize {
    DEFAULT_DEDUP_CAPACITY
}

fn default_facility_cache_capacity() -> usize {
    DEFAULT_FACILITY_CACHE_CAPACITY
}

/// Backoff configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.base_delay_ms))
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_base_delay_ms() -> u64 {
    1000
}

impl CapstreamConfig {
    /// Load configuration from the default path or CAPSTREAM_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            debug!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("Parsing TOML configuration");
        let config: CapstreamConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            root_endpoint = %config.census.root_endpoint,
            world_id = config.pipeline.world_id,
            correlator_parallelism = config.pipeline.correlator_parallelism,
            max_retries = config.retry.max_retries,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = &self.census.root_endpoint;
        if endpoint.contains("${") {
            warn!(
                root_endpoint = %endpoint,
                "Census endpoint contains unsubstituted environment variable"
            );
        }
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "census.root_endpoint '{}' must start with http:// or https://",
                endpoint
            )));
        }

        if self.census.namespace.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "census.namespace must not be empty".to_string(),
            ));
        }

        if self.census.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "census.timeout_ms must be greater than zero".to_string(),
            ));
        }

        let sizes = [
            ("pipeline.correlator_parallelism", self.pipeline.correlator_parallelism),
            ("pipeline.channel_capacity", self.pipeline.channel_capacity),
            ("pipeline.dedup_capacity", self.pipeline.dedup_capacity),
            ("pipeline.facility_cache_capacity", self.pipeline.facility_cache_capacity),
        ];
        for (key, value) in sizes {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than zero",
                    key
                )));
            }
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}
