//! Runtime knobs for the watchers, read from `VIGIL_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Reconnect policy for a resource watcher's follow-up watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    /// Consecutive failed watch attempts tolerated before giving up.
    pub max_failures: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial: Duration::from_millis(100), max: Duration::from_secs(5), max_failures: 10 }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial.saturating_mul(1u32 << shift).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherConfig {
    /// Debounce window letting near-simultaneous store updates coalesce.
    pub buffering: Duration,
    /// How long a pass waits for corroborating data before trusting what it has.
    pub grace: Duration,
    pub list_timeout_secs: u32,
    /// The API server rejects watch timeouts of 295s and above.
    pub watch_timeout_secs: u32,
    pub backoff: BackoffConfig,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            buffering: Duration::from_millis(5),
            grace: Duration::from_millis(750),
            list_timeout_secs: 240,
            watch_timeout_secs: 290,
            backoff: BackoffConfig::default(),
        }
    }
}

impl WatcherConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let ms = |key: &str, dflt: Duration| parse::<u64>(&lookup, key).map(Duration::from_millis).unwrap_or(dflt);
        let watch_timeout_secs = parse::<u32>(&lookup, "VIGIL_WATCH_TIMEOUT_SECS")
            .filter(|v| *v > 0 && *v < 295)
            .unwrap_or(d.watch_timeout_secs);
        Self {
            buffering: ms("VIGIL_BUFFERING_MS", d.buffering),
            grace: ms("VIGIL_GRACE_MS", d.grace),
            list_timeout_secs: parse(&lookup, "VIGIL_LIST_TIMEOUT_SECS").filter(|v| *v > 0).unwrap_or(d.list_timeout_secs),
            watch_timeout_secs,
            backoff: BackoffConfig {
                initial: ms("VIGIL_WATCH_BACKOFF_INITIAL_MS", d.backoff.initial),
                max: ms("VIGIL_WATCH_BACKOFF_MAX_MS", d.backoff.max),
                max_failures: parse(&lookup, "VIGIL_WATCH_MAX_FAILURES").filter(|v| *v > 0).unwrap_or(d.backoff.max_failures),
            },
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
