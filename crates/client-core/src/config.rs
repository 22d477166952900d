//! Environment-backed runtime tuning for the client core.

use std::{env, time::Duration};

use thiserror::Error;

use crate::retry::BackoffPolicy;

const DEFAULT_PAGE_SIZE: u16 = 20;
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;
const DEFAULT_BREAKER_THRESHOLD: u32 = 5;
const DEFAULT_BREAKER_TIMEOUT_MS: u64 = 30_000;

/// Tunables consumed by the client context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Page size requested for list loads.
    pub page_size: u16,
    /// Conversation poll tick interval.
    pub poll_interval_ms: u64,
    /// Retry budget for resilient calls (total attempts = retries + 1).
    pub max_retries: u32,
    /// Base backoff delay.
    pub base_delay_ms: u64,
    /// Backoff growth factor per attempt.
    pub backoff_multiplier: u32,
    /// Consecutive failures before the breaker opens.
    pub breaker_threshold: u32,
    /// Breaker cooldown before a trial call is admitted.
    pub breaker_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            breaker_threshold: DEFAULT_BREAKER_THRESHOLD,
            breaker_timeout_ms: DEFAULT_BREAKER_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    /// Parse configuration from `MARKETFRONT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let config = Self {
            page_size: parse_or("MARKETFRONT_PAGE_SIZE", DEFAULT_PAGE_SIZE, &mut lookup)?,
            poll_interval_ms: parse_or(
                "MARKETFRONT_POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
                &mut lookup,
            )?,
            max_retries: parse_or("MARKETFRONT_MAX_RETRIES", DEFAULT_MAX_RETRIES, &mut lookup)?,
            base_delay_ms: parse_or(
                "MARKETFRONT_BASE_DELAY_MS",
                DEFAULT_BASE_DELAY_MS,
                &mut lookup,
            )?,
            backoff_multiplier: parse_or(
                "MARKETFRONT_BACKOFF_MULTIPLIER",
                DEFAULT_BACKOFF_MULTIPLIER,
                &mut lookup,
            )?,
            breaker_threshold: parse_or(
                "MARKETFRONT_BREAKER_THRESHOLD",
                DEFAULT_BREAKER_THRESHOLD,
                &mut lookup,
            )?,
            breaker_timeout_ms: parse_or(
                "MARKETFRONT_BREAKER_TIMEOUT_MS",
                DEFAULT_BREAKER_TIMEOUT_MS,
                &mut lookup,
            )?,
        };

        for (key, value, ok) in [
            ("MARKETFRONT_PAGE_SIZE", config.page_size as u64, config.page_size >= 1),
            (
                "MARKETFRONT_POLL_INTERVAL_MS",
                config.poll_interval_ms,
                config.poll_interval_ms >= 1,
            ),
            (
                "MARKETFRONT_BACKOFF_MULTIPLIER",
                config.backoff_multiplier as u64,
                config.backoff_multiplier >= 1,
            ),
            (
                "MARKETFRONT_BREAKER_THRESHOLD",
                config.breaker_threshold as u64,
                config.breaker_threshold >= 1,
            ),
        ] {
            if !ok {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: value.to_string(),
                    reason: "must be at least 1".to_owned(),
                });
            }
        }

        Ok(config)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base_delay_ms, self.backoff_multiplier, self.max_retries)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn breaker_timeout(&self) -> Duration {
        Duration::from_millis(self.breaker_timeout_ms)
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

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key).filter(|value| !value.trim().is_empty()) else {
        return Ok(default);
    };
    value
        .trim()
        .parse::<T>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<ClientConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        ClientConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = config_from_pairs(&[]).expect("defaults should parse");
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn overrides_are_parsed_and_applied() {
        let config = config_from_pairs(&[
            ("MARKETFRONT_PAGE_SIZE", "50"),
            ("MARKETFRONT_POLL_INTERVAL_MS", "2000"),
            ("MARKETFRONT_MAX_RETRIES", "1"),
            ("MARKETFRONT_BREAKER_THRESHOLD", "2"),
        ])
        .expect("overrides should parse");

        assert_eq!(config.page_size, 50);
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.breaker_threshold, 2);
        assert_eq!(config.base_delay_ms, DEFAULT_BASE_DELAY_MS);
    }

    #[test]
    fn rejects_unparseable_values() {
        let err = config_from_pairs(&[("MARKETFRONT_PAGE_SIZE", "lots")])
            .expect_err("invalid number should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "MARKETFRONT_PAGE_SIZE",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_where_a_minimum_applies() {
        let err = config_from_pairs(&[("MARKETFRONT_BREAKER_THRESHOLD", "0")])
            .expect_err("zero threshold should fail");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config =
            config_from_pairs(&[("MARKETFRONT_PAGE_SIZE", "  ")]).expect("blank should parse");
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
    }
}
