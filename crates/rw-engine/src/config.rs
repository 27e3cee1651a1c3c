use std::time::Duration;
use tracing::warn;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_STALL_AFTER_SECS: u64 = 5 * 60;
pub const DEFAULT_AUDIT_TIMEOUT_SECS: u64 = 5 * 60;
pub const DEFAULT_AUDIT_SWEEP_SECS: u64 = 15;
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Timing bounds for polling and audit tracking. All bounds are wall-clock
/// durations measured with the engine's [`crate::Clock`], not attempt counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub stall_after: Duration,
    pub audit_timeout: Duration,
    pub audit_sweep_interval: Duration,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            stall_after: Duration::from_secs(DEFAULT_STALL_AFTER_SECS),
            audit_timeout: Duration::from_secs(DEFAULT_AUDIT_TIMEOUT_SECS),
            audit_sweep_interval: Duration::from_secs(DEFAULT_AUDIT_SWEEP_SECS),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; unset keys keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: resolve_duration(
                &lookup,
                "RW_POLL_INTERVAL_MS",
                Duration::from_millis,
                defaults.poll_interval,
            ),
            stall_after: resolve_duration(
                &lookup,
                "RW_STALL_AFTER_SECS",
                Duration::from_secs,
                defaults.stall_after,
            ),
            audit_timeout: resolve_duration(
                &lookup,
                "RW_AUDIT_TIMEOUT_SECS",
                Duration::from_secs,
                defaults.audit_timeout,
            ),
            audit_sweep_interval: resolve_duration(
                &lookup,
                "RW_AUDIT_SWEEP_SECS",
                Duration::from_secs,
                defaults.audit_sweep_interval,
            ),
            event_capacity: defaults.event_capacity,
        }
    }

    pub(crate) fn stall_after_chrono(&self) -> chrono::Duration {
        to_chrono(self.stall_after)
    }

    pub(crate) fn audit_timeout_chrono(&self) -> chrono::Duration {
        to_chrono(self.audit_timeout)
    }
}

fn resolve_duration(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    unit: fn(u64) -> Duration,
    fallback: Duration,
) -> Duration {
    let Some(raw) = lookup(key) else {
        return fallback;
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => unit(value),
        _ => {
            warn!(event = "config_invalid", key, value = %raw, "falling back to default");
            fallback
        }
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
