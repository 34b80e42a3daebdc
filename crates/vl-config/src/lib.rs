#![warn(missing_docs)]

//! # vl-config
//!
//! Configuration loading for vlsandbox hosts.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! allow_generator_functions = false
//! max_heap_mb = 64
//! timeout_ms = 500
//! prelude = "globalThis.apiBase = '${API_BASE}';"
//!
//! [expose]
//! ambient = ["Math", "JSON", "apiBase"]
//! undefined = ["missing"]
//! logger = "log"
//!
//! [expose.values]
//! limit = 10
//! user = { name = "ada", roles = ["admin"] }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level vlsandbox configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VlConfig {
    /// Sandbox construction settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Names to expose to the snippet before it runs.
    #[serde(default)]
    pub expose: ExposeConfig,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Accept `function*` generators during screening.
    #[serde(default)]
    pub allow_generator_functions: Option<bool>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Execution timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Trusted script run in the realm before the global names are read.
    #[serde(default)]
    pub prelude: Option<String>,
}

/// Exposures applied to every run.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExposeConfig {
    /// Ambient globals to expose under their own names.
    #[serde(default)]
    pub ambient: Vec<String>,

    /// Host values to expose, keyed by binding name.
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,

    /// Names to bind to `undefined`.
    #[serde(default)]
    pub undefined: Vec<String>,

    /// Name to bind the host logger function to.
    #[serde(default)]
    pub logger: Option<String>,
}

impl ExposeConfig {
    /// Every configured binding name, in the order the host applies them.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ambient
            .iter()
            .map(String::as_str)
            .chain(self.values.keys().map(String::as_str))
            .chain(self.undefined.iter().map(String::as_str))
            .chain(self.logger.as_deref())
    }
}

impl VlConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: VlConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sandbox.max_heap_mb == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_heap_mb must be greater than 0".into(),
            ));
        }
        if self.sandbox.timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.timeout_ms must be greater than 0; omit it to disable the timeout".into(),
            ));
        }

        let mut seen = HashSet::new();
        for name in self.expose.names() {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "expose: binding names must not be empty".into(),
                ));
            }
            if !seen.insert(name) {
                return Err(ConfigError::Invalid(format!(
                    "expose: '{}' is configured more than once",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}
