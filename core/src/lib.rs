// Chorus Core Library
// Voice-bundle install orchestration runtime

pub mod adapters;
pub mod bundles;
pub mod catalog;
pub mod config;
pub mod orchestrator;
pub mod refresh;
pub mod resolver;
pub mod store;
pub mod telemetry;

// Export core types
pub use bundles::{BundleError, BundleManager, BundleProgress, BundleRef, RemoteVoice};
pub use catalog::{Catalog, CatalogFetcher, CatalogFilter, ProviderEntry, VoiceEntry};
pub use config::ChorusConfig;
pub use orchestrator::{InFlightMap, InstallOrchestrator, OpState};
pub use refresh::{InstanceHandle, RefreshCoordinator, RefreshOutcome, ServiceRegistry};
pub use resolver::{resolve, InstallStep};
pub use store::{FailureReason, InstallPhase, InstallStatus, StatusEvent, VoiceStore};
pub use telemetry::{init_tracing, InstallerStats};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

// Error types
#[derive(Error, Debug)]
pub enum ChorusError {
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("Bundle manager error: {0}")]
    Bundle(#[from] bundles::BundleError),

    #[error("Service registry error: {0}")]
    Registry(String),

    #[error("Unknown voice: {0}")]
    UnknownVoice(BundleRef),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChorusError>;

/// Core runtime: wires the state store, the orchestrator and the refresh
/// coordinator over the two external seams, and is the surface the UI talks
/// to. Nothing here persists; every run rediscovers installable state from
/// the bundle manager and the running-provider set.
pub struct Chorus {
    pub store: Arc<VoiceStore>,
    pub orchestrator: Arc<InstallOrchestrator>,
    manager: Arc<dyn BundleManager>,
    fetcher: CatalogFetcher,
}

impl Chorus {
    pub fn new(manager: Arc<dyn BundleManager>, registry: Arc<dyn ServiceRegistry>) -> Self {
        Self::with_config(manager, registry, ChorusConfig::default())
    }

    pub fn with_config(
        manager: Arc<dyn BundleManager>,
        registry: Arc<dyn ServiceRegistry>,
        config: ChorusConfig,
    ) -> Self {
        let store = Arc::new(VoiceStore::new(config.event_capacity));
        let refresher = Arc::new(RefreshCoordinator::new(
            registry,
            Duration::from_millis(config.refresh_ack_timeout_ms),
        ));
        let orchestrator = Arc::new(InstallOrchestrator::new(
            manager.clone(),
            store.clone(),
            refresher,
            &config,
        ));
        Self {
            store,
            orchestrator,
            fetcher: CatalogFetcher::new(manager.clone()),
            manager,
        }
    }

    /// Fetches the catalog and seeds every voice's status from the bundle
    /// manager's installed set. Returns the number of installable voices.
    ///
    /// A failed fetch leaves the previous snapshot untouched so the app
    /// stays usable with whatever it already had (possibly nothing) and a
    /// retry action.
    pub async fn populate(&self) -> Result<usize> {
        let catalog = self.fetcher.fetch_catalog().await?;
        let installed = self.manager.query_installed_set().await?;
        let count = catalog.voices().len();
        self.store.replace_catalog(catalog, &installed);
        Ok(count)
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.store.catalog()
    }

    pub fn catalog_filtered(&self, filter: &CatalogFilter) -> Vec<VoiceEntry> {
        self.store
            .catalog()
            .voices()
            .iter()
            .filter(|v| filter.matches(v))
            .cloned()
            .collect()
    }

    pub fn providers(&self) -> Vec<ProviderEntry> {
        self.store.catalog().providers().to_vec()
    }

    pub fn languages(&self) -> Vec<String> {
        self.store.catalog().languages().to_vec()
    }

    pub fn status(&self, voice: &BundleRef) -> Option<InstallStatus> {
        self.store.status(voice)
    }

    pub fn request_install(&self, voice: &BundleRef) -> Result<InstallStatus> {
        self.orchestrator.request_install(voice)
    }

    pub fn cancel_install(&self, voice: &BundleRef) {
        self.orchestrator.cancel_install(voice)
    }

    pub fn request_uninstall(&self, voice: &BundleRef) -> Result<InstallStatus> {
        self.orchestrator.request_uninstall(voice)
    }

    /// Re-derives settled statuses from a fresh installed set, picking up
    /// out-of-band installs and removals. Returns how many changed.
    pub async fn sync_installed_set(&self) -> Result<usize> {
        let installed: HashSet<BundleRef> = self.manager.query_installed_set().await?;
        Ok(self.store.sync_installed_set(&installed))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.store.subscribe()
    }

    pub async fn stats(&self) -> InstallerStats {
        self.orchestrator.stats().snapshot().await
    }

    pub fn shutdown(&self) {
        self.orchestrator.shutdown();
    }
}
