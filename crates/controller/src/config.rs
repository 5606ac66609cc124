//! Controller settings, read from `HERALD_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use herald_core::Selector;
use herald_queue::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, MIN_BACKOFF};
use herald_store::InformerConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Concurrent worker loops. Correctness does not depend on this being 1.
    pub workers: usize,
    /// Startup fails if the cache has not synced within this window.
    pub cache_sync_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Drop a key after this many consecutive failures. `None` retries forever.
    pub max_retries: Option<u32>,
    /// `None` disables periodic resync.
    pub resync_period: Option<Duration>,
    pub watch_backoff_max: Duration,
    pub selector: Selector,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            cache_sync_timeout: Duration::from_secs(30),
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            max_retries: None,
            resync_period: Some(Duration::from_secs(30)),
            watch_backoff_max: Duration::from_secs(30),
            selector: Selector::all(),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse::<T>().ok())
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Unset or unparsable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            workers: parsed::<usize>(&lookup, "HERALD_WORKERS").map(|n| n.max(1)).unwrap_or(d.workers),
            cache_sync_timeout: parsed(&lookup, "HERALD_CACHE_SYNC_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.cache_sync_timeout),
            backoff_base: parsed(&lookup, "HERALD_BACKOFF_BASE_MS")
                .map(|ms| Duration::from_millis(ms).max(MIN_BACKOFF))
                .unwrap_or(d.backoff_base),
            backoff_max: parsed(&lookup, "HERALD_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
            max_retries: parsed(&lookup, "HERALD_MAX_RETRIES").or(d.max_retries),
            resync_period: match parsed::<u64>(&lookup, "HERALD_RESYNC_SECS") {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => d.resync_period,
            },
            watch_backoff_max: parsed(&lookup, "HERALD_WATCH_BACKOFF_MAX_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.watch_backoff_max),
            selector: d.selector,
        }
    }

    pub fn informer_config(&self) -> InformerConfig {
        InformerConfig {
            resync_period: self.resync_period,
            watch_backoff_max: self.watch_backoff_max,
            ..InformerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_follow_reference_behavior() {
        let c = ControllerConfig::from_lookup(lookup(&[]));
        assert_eq!(c, ControllerConfig::default());
        assert_eq!(c.workers, 1);
        assert_eq!(c.backoff_base, Duration::from_secs(5));
        assert_eq!(c.backoff_max, Duration::from_secs(60));
        assert_eq!(c.max_retries, None);
    }

    #[test]
    fn env_values_override_defaults() {
        let c = ControllerConfig::from_lookup(lookup(&[
            ("HERALD_WORKERS", "4"),
            ("HERALD_CACHE_SYNC_TIMEOUT_SECS", "5"),
            ("HERALD_BACKOFF_BASE_MS", "250"),
            ("HERALD_MAX_RETRIES", "10"),
            ("HERALD_RESYNC_SECS", "0"),
        ]));
        assert_eq!(c.workers, 4);
        assert_eq!(c.cache_sync_timeout, Duration::from_secs(5));
        assert_eq!(c.backoff_base, Duration::from_millis(250));
        assert_eq!(c.max_retries, Some(10));
        assert_eq!(c.resync_period, None);
    }

    #[test]
    fn bad_values_fall_back() {
        let c = ControllerConfig::from_lookup(lookup(&[("HERALD_WORKERS", "many"), ("HERALD_BACKOFF_MAX_SECS", "-1")]));
        assert_eq!(c.workers, 1);
        assert_eq!(c.backoff_max, Duration::from_secs(60));
        let zero = ControllerConfig::from_lookup(lookup(&[("HERALD_WORKERS", "0")]));
        assert_eq!(zero.workers, 1);
    }

    #[test]
    fn zero_backoff_base_is_clamped() {
        let c = ControllerConfig::from_lookup(lookup(&[("HERALD_BACKOFF_BASE_MS", "0")]));
        assert_eq!(c.backoff_base, Duration::from_millis(1));
    }
}
