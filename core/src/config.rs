// Runtime configuration
use serde::{Deserialize, Serialize};

/// Tunables for the core runtime. No config files; values come from the
/// defaults below with env overrides, matching how deployments tune the
/// other services in this family.
///
/// Env overrides:
/// - CHORUS_REFRESH_TIMEOUT_MS: bound on one provider reload ack
/// - CHORUS_EVENT_CAPACITY: status feed ring size
/// - CHORUS_PROGRESS_CAPACITY: per-install progress channel depth
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChorusConfig {
    pub refresh_ack_timeout_ms: u64,
    pub event_capacity: usize,
    pub progress_capacity: usize,
}

impl Default for ChorusConfig {
    fn default() -> Self {
        Self {
            refresh_ack_timeout_ms: env_parse("CHORUS_REFRESH_TIMEOUT_MS", 2_000),
            event_capacity: env_parse("CHORUS_EVENT_CAPACITY", 256),
            progress_capacity: env_parse("CHORUS_PROGRESS_CAPACITY", 32),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}
