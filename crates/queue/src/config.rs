//! Process-level runtime configuration.
//!
//! Per-project behaviour lives in `QueueSettings`; this only covers timing of
//! the background tasks.

use std::time::Duration;

use leadflow_core::{QueueError, QueueResult};

pub const TICK_INTERVAL_VAR: &str = "LEADFLOW_TICK_INTERVAL_SECS";
pub const DISPATCH_TIMEOUT_VAR: &str = "LEADFLOW_DISPATCH_TIMEOUT_SECS";
pub const METRICS_INTERVAL_VAR: &str = "LEADFLOW_METRICS_INTERVAL_SECS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Period of the scheduling tick.
    pub tick_interval: Duration,
    /// Upper bound for a single gateway send.
    pub dispatch_timeout: Duration,
    /// Period of the metrics refresher.
    pub metrics_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            dispatch_timeout: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(60),
        }
    }
}

impl RuntimeConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> QueueResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their default.
    pub fn from_lookup<F>(lookup: F) -> QueueResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            tick_interval: seconds(&lookup, TICK_INTERVAL_VAR, defaults.tick_interval)?,
            dispatch_timeout: seconds(&lookup, DISPATCH_TIMEOUT_VAR, defaults.dispatch_timeout)?,
            metrics_interval: seconds(&lookup, METRICS_INTERVAL_VAR, defaults.metrics_interval)?,
        })
    }
}

fn seconds<F>(lookup: &F, key: &str, default: Duration) -> QueueResult<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(QueueError::configuration(format!("{key} must be positive"))),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => Err(QueueError::configuration(format!(
            "{key} must be a whole number of seconds, got {raw:?}"
        ))),
    }
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
    fn unset_keys_use_defaults() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (TICK_INTERVAL_VAR, "5"),
            (DISPATCH_TIMEOUT_VAR, " 10 "),
        ]))
        .unwrap();

        assert_eq!(config.tick_interval, Duration::from_secs(5));
        assert_eq!(config.dispatch_timeout, Duration::from_secs(10));
        assert_eq!(config.metrics_interval, Duration::from_secs(60));
    }

    #[test]
    fn zero_and_garbage_are_rejected() {
        for value in ["0", "-3", "ten"] {
            let err = RuntimeConfig::from_lookup(lookup(&[(METRICS_INTERVAL_VAR, value)])).unwrap_err();
            assert!(matches!(err, QueueError::Configuration(_)), "{value}");
        }
    }
}
