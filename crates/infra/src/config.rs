//! Runtime configuration.
//!
//! Values come from environment variables and fall back to defaults:
//!
//! | variable | default | meaning |
//! |---|---|---|
//! | `DCB_RESERVATION_EXPIRY_SECS` | 30 | lifetime of an unconfirmed write reservation |
//! | `DCB_SAFE_WINDOW_MS` | 20000 | delivery-delay bound used for safe-view thresholds |
//! | `DCB_STORE_TIMEOUT_MS` | 5000 | limit on a single event store call |

use std::time::Duration;

use anyhow::Context;
use thiserror::Error;

pub const RESERVATION_EXPIRY_VAR: &str = "DCB_RESERVATION_EXPIRY_SECS";
pub const SAFE_WINDOW_VAR: &str = "DCB_SAFE_WINDOW_MS";
pub const STORE_TIMEOUT_VAR: &str = "DCB_STORE_TIMEOUT_MS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected a non-negative integer, got '{value}'")]
    NotANumber { var: &'static str, value: String },

    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcbConfig {
    pub reservation_expiry: Duration,
    pub safe_window: Duration,
    pub store_call_timeout: Duration,
}

impl Default for DcbConfig {
    fn default() -> Self {
        Self {
            reservation_expiry: Duration::from_secs(30),
            safe_window: Duration::from_secs(20),
            store_call_timeout: Duration::from_secs(5),
        }
    }
}

impl DcbConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            reservation_expiry: read(&lookup, RESERVATION_EXPIRY_VAR, Duration::from_secs)?
                .unwrap_or(defaults.reservation_expiry),
            safe_window: read(&lookup, SAFE_WINDOW_VAR, Duration::from_millis)?
                .unwrap_or(defaults.safe_window),
            store_call_timeout: read(&lookup, STORE_TIMEOUT_VAR, Duration::from_millis)?
                .unwrap_or(defaults.store_call_timeout),
        })
    }

    /// Process-edge loader: environment values with context on failure.
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::from_env().context("invalid DCB configuration")?;
        tracing::info!(
            reservation_expiry_ms = config.reservation_expiry.as_millis() as u64,
            safe_window_ms = config.safe_window.as_millis() as u64,
            store_call_timeout_ms = config.store_call_timeout.as_millis() as u64,
            "loaded DCB configuration"
        );
        Ok(config)
    }
}

fn read(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    unit: fn(u64) -> Duration,
) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let value: u64 = raw.trim().parse().map_err(|_| ConfigError::NotANumber {
        var,
        value: raw.clone(),
    })?;
    if value == 0 {
        return Err(ConfigError::Zero { var });
    }
    Ok(Some(unit(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        assert_eq!(DcbConfig::from_lookup(lookup(&[])).unwrap(), DcbConfig::default());
    }

    #[test]
    fn overrides_are_parsed_in_their_units() {
        let config = DcbConfig::from_lookup(lookup(&[
            (RESERVATION_EXPIRY_VAR, "10"),
            (SAFE_WINDOW_VAR, " 1500 "),
            (STORE_TIMEOUT_VAR, "250"),
        ]))
        .unwrap();
        assert_eq!(config.reservation_expiry, Duration::from_secs(10));
        assert_eq!(config.safe_window, Duration::from_millis(1500));
        assert_eq!(config.store_call_timeout, Duration::from_millis(250));
    }

    #[test]
    fn rejects_zero_and_garbage() {
        assert_eq!(
            DcbConfig::from_lookup(lookup(&[(RESERVATION_EXPIRY_VAR, "0")])),
            Err(ConfigError::Zero {
                var: RESERVATION_EXPIRY_VAR
            })
        );
        assert!(matches!(
            DcbConfig::from_lookup(lookup(&[(SAFE_WINDOW_VAR, "soon")])),
            Err(ConfigError::NotANumber { .. })
        ));
    }
}
