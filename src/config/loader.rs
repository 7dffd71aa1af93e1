//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into an [`EngineConfig`], layer
//! `THOUGHT_*` environment overrides on top, and run validation before
//! returning. This is the entry point for loading engine configuration at
//! startup.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//! - An override that does not parse names its variable in the error
//!
//! ## Environment overrides
//!
//! | Variable | Field |
//! |----------|-------|
//! | `THOUGHT_WORKER_POOL_SIZE` | `worker_pool_size` |
//! | `THOUGHT_DEFAULT_TIMEOUT_MS` | `default_timeout_ms` |
//! | `THOUGHT_CANCEL_GRACE_MS` | `cancel_grace_ms` |
//! | `THOUGHT_ALLOWED_CAPABILITIES` | `allowed_capabilities`, comma-separated |
//! | `THOUGHT_RETRY_MAX_ATTEMPTS` | `retry.max_attempts` |
//! | `THOUGHT_STATE_DIR` | `state_dir`; empty means in-memory |
//!
//! Other `THOUGHT_*` variables are left to the binary.
//!
//! ## NOT Responsible For
//! - Defining the config schema (that belongs to `mod.rs`)

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;

use super::validation::{self, ConfigError};
use super::EngineConfig;

/// Prefix shared by every override variable.
pub const ENV_PREFIX: &str = "THOUGHT_";

/// Load an [`EngineConfig`] from a TOML file.
///
/// # Returns
///
/// - `Ok(EngineConfig)` if the file is readable, well-formed, and valid.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```rust,ignore
/// use thought_orchestrator::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("engine.toml"))?;
/// println!("workers: {}", config.worker_pool_size);
/// ```
pub fn load_from_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load an [`EngineConfig`] from a TOML string.
///
/// `source_name` identifies the input in error messages.
///
/// # Errors
///
/// - [`ConfigError::Parse`] if the TOML is malformed.
/// - [`ConfigError::Validation`] if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validate(&config)?;
    Ok(config)
}

/// Apply `THOUGHT_*` overrides from `vars` to `config`, then validate.
///
/// Pass `std::env::vars()` in a binary; tests pass a fixed list.
///
/// # Errors
///
/// - [`ConfigError::InvalidField`] if an override does not parse.
/// - [`ConfigError::Validation`] if the result breaks a semantic constraint.
///
/// # Panics
///
/// This function never panics.
pub fn with_env_overrides<I, K, V>(mut config: EngineConfig, vars: I) -> Result<EngineConfig, ConfigError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    for (key, value) in vars {
        let (key, value) = (key.as_ref(), value.as_ref());
        let Some(setting) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        match setting {
            "WORKER_POOL_SIZE" => config.worker_pool_size = parse_override(key, value)?,
            "DEFAULT_TIMEOUT_MS" => config.default_timeout_ms = parse_override(key, value)?,
            "CANCEL_GRACE_MS" => config.cancel_grace_ms = parse_override(key, value)?,
            "RETRY_MAX_ATTEMPTS" => config.retry.max_attempts = parse_override(key, value)?,
            "ALLOWED_CAPABILITIES" => {
                config.allowed_capabilities = value
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "STATE_DIR" => {
                config.state_dir = Some(value.trim())
                    .filter(|dir| !dir.is_empty())
                    .map(PathBuf::from);
            }
            _ => continue,
        }
        debug!(variable = key, "config: environment override applied");
    }

    validate(&config)?;
    Ok(config)
}

fn parse_override<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidField {
        field: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
    validation::validate(config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })
}
