// Telemetry: tracing setup and install counters
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber with env-filter control (RUST_LOG).
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Counters over the lifetime of one core instance. Advisory; nothing reads
/// them on the hot path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallerStats {
    pub installs_started: u64,
    pub installs_succeeded: u64,
    pub installs_failed: u64,
    pub installs_cancelled: u64,
    pub uninstalls: u64,
    pub refreshes_partial: u64,
}

/// Shared collector the orchestrator ticks as machines reach terminal states.
#[derive(Debug, Default)]
pub struct StatsCollector {
    stats: Arc<RwLock<InstallerStats>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_started(&self) {
        self.stats.write().await.installs_started += 1;
    }

    pub async fn record_succeeded(&self) {
        self.stats.write().await.installs_succeeded += 1;
    }

    pub async fn record_failed(&self) {
        self.stats.write().await.installs_failed += 1;
    }

    pub async fn record_cancelled(&self) {
        self.stats.write().await.installs_cancelled += 1;
    }

    pub async fn record_uninstall(&self) {
        self.stats.write().await.uninstalls += 1;
    }

    pub async fn record_partial_refresh(&self) {
        self.stats.write().await.refreshes_partial += 1;
    }

    pub async fn snapshot(&self) -> InstallerStats {
        self.stats.read().await.clone()
    }
}
