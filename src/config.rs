//! DAG engine configuration.
//!
//! Handles parsing and management of `dagrunner.toml` files, following the
//! same load/find/save shape as a typical project config loader.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config file not found: {0}")]
    NotFound(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Recognised configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagConfig {
    /// Directory to load backend plug-ins from.
    #[serde(default)]
    pub backends_path: Option<String>,

    /// Worker threads per device queue.
    #[serde(default = "default_threads_per_queue")]
    pub threads_per_queue: usize,

    /// Intra-op parallelism hint passed through to backends.
    #[serde(default)]
    pub intra_op_parallelism: Option<usize>,

    /// Inter-op parallelism hint passed through to backends.
    #[serde(default)]
    pub inter_op_parallelism: Option<usize>,

    /// Byte size for splitting large model payloads on persistence.
    #[serde(default = "default_model_chunk_size")]
    pub model_chunk_size: usize,

    /// Default per-DAG execution timeout in milliseconds, used when a
    /// client-supplied TIMEOUT is absent.
    #[serde(default = "default_model_execution_timeout_ms")]
    pub model_execution_timeout_ms: u64,

    /// Optional cap, in MB, on backend memory usage.
    #[serde(default)]
    pub backend_memory_limit_mb: Option<usize>,

    /// Emit bracketed-tag lifecycle logging to stderr.
    #[serde(default)]
    pub verbose: bool,
}

fn default_threads_per_queue() -> usize {
    1
}

fn default_model_chunk_size() -> usize {
    511 * 1024 * 1024
}

fn default_model_execution_timeout_ms() -> u64 {
    5000
}

/// Floor below which `model_execution_timeout_ms` is never allowed to sink.
pub const MODEL_EXECUTION_TIMEOUT_FLOOR_MS: u64 = 1000;

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            backends_path: None,
            threads_per_queue: default_threads_per_queue(),
            intra_op_parallelism: None,
            inter_op_parallelism: None,
            model_chunk_size: default_model_chunk_size(),
            model_execution_timeout_ms: default_model_execution_timeout_ms(),
            backend_memory_limit_mb: None,
            verbose: false,
        }
    }
}

impl DagConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let mut config: DagConfig = toml::from_str(&content)?;
        config.clamp();
        Ok(config)
    }

    /// Load configuration from the current directory or its parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir().map_err(ConfigError::Io)?;
        Self::find_and_load(&cwd)
    }

    /// Search upward from `start_dir` for `dagrunner.toml`, falling back to
    /// defaults if none is found.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join("dagrunner.toml");
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                return Ok(Self::default());
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Enforce the documented floor on the model execution timeout.
    fn clamp(&mut self) {
        if self.model_execution_timeout_ms < MODEL_EXECUTION_TIMEOUT_FLOOR_MS {
            self.model_execution_timeout_ms = MODEL_EXECUTION_TIMEOUT_FLOOR_MS;
        }
        if self.threads_per_queue == 0 {
            self.threads_per_queue = 1;
        }
    }
}
