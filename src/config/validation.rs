//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`EngineConfig`] that cannot
//! be expressed through the type system alone (range checks, cross-field
//! invariants, capability syntax).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::EngineConfig;
use crate::thought::Capability;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "retry.base_delay_ms").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Largest accepted worker pool.
pub const MAX_WORKER_POOL_SIZE: usize = 1024;

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Validate all semantic constraints on an [`EngineConfig`].
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &EngineConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Scheduling ───────────────────────────────────────────────────
    if !(1..=MAX_WORKER_POOL_SIZE).contains(&config.worker_pool_size) {
        errors.push(invalid(
            "worker_pool_size",
            config.worker_pool_size,
            "must be between 1 and 1024",
        ));
    }

    if config.default_timeout_ms == 0 {
        errors.push(invalid("default_timeout_ms", 0, "must be greater than 0"));
    }

    if config.event_buffer == 0 {
        errors.push(invalid("event_buffer", 0, "must be at least 1"));
    }

    // ── Retry defaults ───────────────────────────────────────────────
    if config.retry.max_attempts == 0 {
        errors.push(invalid("retry.max_attempts", 0, "must be at least 1"));
    }

    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        errors.push(invalid(
            "retry.base_delay_ms",
            config.retry.base_delay_ms,
            "must be \u{2264} retry.max_delay_ms",
        ));
    }

    // ── Capability allow-list ────────────────────────────────────────
    for (i, raw) in config.allowed_capabilities.iter().enumerate() {
        if raw.parse::<Capability>().is_err() {
            errors.push(invalid(
                &format!("allowed_capabilities[{i}]"),
                format!("'{raw}'"),
                "not a supported capability",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(e: &ConfigError) -> Option<&str> {
        match e {
            ConfigError::InvalidField { field, .. } => Some(field.as_str()),
            _ => None,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&EngineConfig::default()).is_ok());
    }

    #[test]
    fn test_worker_pool_bounds() {
        for size in [0, MAX_WORKER_POOL_SIZE + 1] {
            let config = EngineConfig::default().with_worker_pool_size(size);
            let errors = validate(&config).expect_err("test: pool out of range");
            assert_eq!(field_of(&errors[0]), Some("worker_pool_size"));
        }
        assert!(validate(&EngineConfig::default().with_worker_pool_size(1024)).is_ok());
    }

    #[test]
    fn test_zero_timeout_and_buffer_rejected() {
        let config = EngineConfig {
            default_timeout_ms: 0,
            event_buffer: 0,
            ..EngineConfig::default()
        };
        let errors = validate(&config).expect_err("test: zero values");
        let fields: Vec<_> = errors.iter().filter_map(field_of).collect();
        assert_eq!(fields, vec!["default_timeout_ms", "event_buffer"]);
    }

    #[test]
    fn test_retry_rules_collect_all_errors() {
        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        config.retry.base_delay_ms = 10_000;
        config.retry.max_delay_ms = 10;
        let errors = validate(&config).expect_err("test: bad retry");
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_bad_capability_names_index() {
        let config = EngineConfig::default().with_capabilities(["llm.call", "root"]);
        let errors = validate(&config).expect_err("test: bad capability");
        assert_eq!(field_of(&errors[0]), Some("allowed_capabilities[1]"));
        assert!(errors[0].to_string().contains("'root'"));
    }
}
