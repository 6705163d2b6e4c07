//! JIT configuration, loaded from an `[jit]`-style TOML document.
//!
//! Every field has a default, so an empty document is a valid configuration.
//!
//! ```toml
//! enabled = true
//! batch_compile_workers = 4
//! drain_retry_limit = 8
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid jit config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct JitConfig {
    /// Master switch. A disabled runtime still attaches code that was
    /// compiled before it was disabled.
    pub enabled: bool,
    /// Worker threads for batch compilation. 0 compiles the batch serially
    /// on the calling thread.
    pub batch_compile_workers: usize,
    /// How many times the drain phase re-attempts a unit that keeps asking
    /// for a retry before declining it.
    pub drain_retry_limit: u32,
    pub record_compile_times: bool,
    /// Enables [`JitRuntime::multithreaded_compile_test`](crate::JitRuntime::multithreaded_compile_test).
    pub multithreaded_compile_test: bool,
    /// Static units are compiled regardless of the eligibility filter.
    pub compile_all_static_functions: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_compile_workers: 0,
            drain_retry_limit: 8,
            record_compile_times: true,
            multithreaded_compile_test: false,
            compile_all_static_functions: false,
        }
    }
}

impl JitConfig {
    /// Parse and validate a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate config from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.drain_retry_limit == 0 {
            return Err(ConfigError::Invalid(
                "drain_retry_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
