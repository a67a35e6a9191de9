//! Informer configuration. Defaults can be overridden programmatically or via `KMIRROR_*` env vars.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff for transient source failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// First delay (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound of a single delay (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive failures tolerated before giving up (0 means unlimited)
    #[serde(default)]
    pub max_retries: usize,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base_delay_ms: default_base_delay_ms(), max_delay_ms: default_max_delay_ms(), max_retries: 0 }
    }
}

impl BackoffPolicy {
    pub fn base_delay(&self) -> Duration { Duration::from_millis(self.base_delay_ms) }
    pub fn max_delay(&self) -> Duration { Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InformerConfig {
    /// Period between resyncs of the local store to handlers (0 disables).
    #[serde(default)]
    pub resync_ms: u64,

    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Install the namespace index on every informer store.
    #[serde(default = "default_namespace_index")]
    pub namespace_index: bool,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self { resync_ms: 0, backoff: BackoffPolicy::default(), namespace_index: default_namespace_index() }
    }
}

impl InformerConfig {
    /// Defaults overridden by `KMIRROR_RESYNC_SECS`, `KMIRROR_WATCH_BACKOFF_BASE_MS`,
    /// `KMIRROR_WATCH_BACKOFF_MAX_SECS` and `KMIRROR_WATCH_MAX_RETRIES`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = env_parse::<u64>("KMIRROR_RESYNC_SECS") {
            cfg.resync_ms = secs.saturating_mul(1000);
        }
        if let Some(ms) = env_parse::<u64>("KMIRROR_WATCH_BACKOFF_BASE_MS") {
            cfg.backoff.base_delay_ms = ms;
        }
        if let Some(secs) = env_parse::<u64>("KMIRROR_WATCH_BACKOFF_MAX_SECS") {
            cfg.backoff.max_delay_ms = secs.saturating_mul(1000);
        }
        if let Some(n) = env_parse::<usize>("KMIRROR_WATCH_MAX_RETRIES") {
            cfg.backoff.max_retries = n;
        }
        cfg
    }

    pub fn with_resync(mut self, period: Duration) -> Self {
        self.resync_ms = period.as_millis() as u64;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn resync_period(&self) -> Option<Duration> {
        if self.resync_ms == 0 { None } else { Some(Duration::from_millis(self.resync_ms)) }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

fn default_base_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_namespace_index() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_disable_resync_and_keep_namespace_index() {
        let cfg = InformerConfig::default();
        assert_eq!(cfg.resync_period(), None);
        assert!(cfg.namespace_index);
        assert_eq!(cfg.backoff.max_retries, 0);
        assert_eq!(cfg.backoff.max_delay(), Duration::from_secs(30));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: InformerConfig = serde_json::from_str(r#"{"resync_ms": 5000, "backoff": {"max_retries": 3}}"#).unwrap();
        assert_eq!(cfg.resync_period(), Some(Duration::from_secs(5)));
        assert_eq!(cfg.backoff.base_delay_ms, 200);
        assert_eq!(cfg.backoff.max_retries, 3);
        assert!(cfg.namespace_index);
    }

    #[test]
    fn max_delay_never_below_base() {
        let p = BackoffPolicy { base_delay_ms: 500, max_delay_ms: 100, max_retries: 0 };
        assert_eq!(p.max_delay(), Duration::from_millis(500));
    }
}
