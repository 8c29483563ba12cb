//! Environment-backed runtime configuration for the invoice store.

use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use resilience_core::{
    DEFAULT_DEBOUNCE_WINDOW_MS, DEFAULT_DIAGNOSTICS_CAPACITY, HealthPolicy, RetryPolicy,
};
use thiserror::Error;

use crate::fallback::FallbackPolicy;

const DEFAULT_READ_TIMEOUT_MS: u64 = 8_000;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 15_000;

/// Tuning for every resilience component the store wires together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub retry: RetryPolicy,
    pub debounce_window_ms: u64,
    pub health: HealthPolicy,
    /// Per-attempt deadline for `list`.
    pub read_timeout_ms: u64,
    /// Per-attempt deadline for `add`, `update` and `delete`.
    pub write_timeout_ms: u64,
    pub fallback: FallbackPolicy,
    pub diagnostics_capacity: usize,
    /// Directory of the local durable store. `None` keeps it in memory.
    pub local_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            debounce_window_ms: DEFAULT_DEBOUNCE_WINDOW_MS,
            health: HealthPolicy::default(),
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            fallback: FallbackPolicy::default(),
            diagnostics_capacity: DEFAULT_DIAGNOSTICS_CAPACITY,
            local_dir: None,
        }
    }
}

impl StoreConfig {
    /// Parse configuration from `INVOICE_SYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let default_health = defaults.health;

        let max_attempts = parse_or(
            "INVOICE_SYNC_RETRY_MAX_ATTEMPTS",
            defaults.retry.max_attempts(),
            &mut lookup,
        )?;
        let base_delay_ms = parse_or(
            "INVOICE_SYNC_RETRY_BASE_DELAY_MS",
            defaults.retry.base_delay_ms(),
            &mut lookup,
        )?;
        let max_delay_ms = parse_or(
            "INVOICE_SYNC_RETRY_MAX_DELAY_MS",
            defaults.retry.max_delay_ms(),
            &mut lookup,
        )?;
        let debounce_window_ms = parse_or(
            "INVOICE_SYNC_DEBOUNCE_WINDOW_MS",
            defaults.debounce_window_ms,
            &mut lookup,
        )?;
        let max_retries = parse_or(
            "INVOICE_SYNC_HEALTH_MAX_RETRIES",
            default_health.max_retries,
            &mut lookup,
        )?;
        let base_backoff_ms = parse_or(
            "INVOICE_SYNC_HEALTH_BASE_BACKOFF_MS",
            default_health.base_backoff_ms,
            &mut lookup,
        )?;
        let max_backoff_ms = parse_or(
            "INVOICE_SYNC_HEALTH_MAX_BACKOFF_MS",
            default_health.max_backoff_ms,
            &mut lookup,
        )?;
        let read_timeout_ms = parse_or(
            "INVOICE_SYNC_READ_TIMEOUT_MS",
            defaults.read_timeout_ms,
            &mut lookup,
        )?;
        let write_timeout_ms = parse_or(
            "INVOICE_SYNC_WRITE_TIMEOUT_MS",
            defaults.write_timeout_ms,
            &mut lookup,
        )?;
        let probe_timeout_ms = parse_or(
            "INVOICE_SYNC_PROBE_TIMEOUT_MS",
            default_health.probe_timeout_ms,
            &mut lookup,
        )?;
        let offer_after = parse_or(
            "INVOICE_SYNC_FALLBACK_OFFER_AFTER",
            defaults.fallback.offer_after,
            &mut lookup,
        )?;
        let switch_after = parse_or(
            "INVOICE_SYNC_FALLBACK_SWITCH_AFTER",
            defaults.fallback.switch_after,
            &mut lookup,
        )?;
        let diagnostics_capacity = parse_or(
            "INVOICE_SYNC_DIAGNOSTICS_CAPACITY",
            defaults.diagnostics_capacity,
            &mut lookup,
        )?;
        let local_dir = optional_trimmed_env("INVOICE_SYNC_LOCAL_DIR", &mut lookup).map(PathBuf::from);

        at_least_one("INVOICE_SYNC_RETRY_MAX_ATTEMPTS", u64::from(max_attempts))?;
        at_least_one("INVOICE_SYNC_RETRY_BASE_DELAY_MS", base_delay_ms)?;
        at_least_one("INVOICE_SYNC_DEBOUNCE_WINDOW_MS", debounce_window_ms)?;
        at_least_one("INVOICE_SYNC_HEALTH_MAX_RETRIES", u64::from(max_retries))?;
        at_least_one("INVOICE_SYNC_HEALTH_BASE_BACKOFF_MS", base_backoff_ms)?;
        at_least_one("INVOICE_SYNC_READ_TIMEOUT_MS", read_timeout_ms)?;
        at_least_one("INVOICE_SYNC_WRITE_TIMEOUT_MS", write_timeout_ms)?;
        at_least_one("INVOICE_SYNC_PROBE_TIMEOUT_MS", probe_timeout_ms)?;
        at_least_one("INVOICE_SYNC_FALLBACK_OFFER_AFTER", u64::from(offer_after))?;
        at_least_one("INVOICE_SYNC_DIAGNOSTICS_CAPACITY", diagnostics_capacity as u64)?;

        if max_delay_ms < base_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "INVOICE_SYNC_RETRY_MAX_DELAY_MS",
                value: max_delay_ms.to_string(),
                reason: format!("must be at least the base delay ({base_delay_ms})"),
            });
        }
        if max_backoff_ms < base_backoff_ms {
            return Err(ConfigError::InvalidValue {
                key: "INVOICE_SYNC_HEALTH_MAX_BACKOFF_MS",
                value: max_backoff_ms.to_string(),
                reason: format!("must be at least the base backoff ({base_backoff_ms})"),
            });
        }
        if switch_after < offer_after {
            return Err(ConfigError::InvalidValue {
                key: "INVOICE_SYNC_FALLBACK_SWITCH_AFTER",
                value: switch_after.to_string(),
                reason: format!("must be at least the offer threshold ({offer_after})"),
            });
        }

        Ok(Self {
            retry: RetryPolicy::new(base_delay_ms, max_delay_ms, max_attempts),
            debounce_window_ms,
            health: HealthPolicy {
                max_retries,
                base_backoff_ms,
                max_backoff_ms,
                probe_timeout_ms,
            },
            read_timeout_ms,
            write_timeout_ms,
            fallback: FallbackPolicy {
                offer_after,
                switch_after,
            },
            diagnostics_capacity,
            local_dir,
        })
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        reason: err.to_string(),
        value,
    })
}

fn at_least_one(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(())
}
