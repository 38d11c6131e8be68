// Installation state store
//
// In-memory record of each voice's status plus the change-event feed the UI
// observes. Statuses are mutated only by the install orchestrator (and the
// installed-set resync, which never touches in-flight voices); reads are
// lock-free and may observe a transient intermediate status.
use crate::bundles::{BundleProgress, BundleRef};
use crate::catalog::Catalog;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

/// Sub-phase of an in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallPhase {
    Resolving,
    InstallingProvider,
    InstallingVoice,
    Refreshing,
    Removing,
}

/// Why a voice ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    ResolveFailed,
    ProviderInstallFailed,
    VoiceInstallFailed,
}

/// Exactly one status per voice at any time; transitions are serialized per
/// voice by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallStatus {
    /// Neither the voice nor its provider is installed.
    Unavailable,
    /// Provider installed, voice not.
    ProviderOnly,
    /// Both present.
    Installed,
    Installing(InstallPhase),
    Failed(FailureReason),
}

impl InstallStatus {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, InstallStatus::Installing(_))
    }
}

/// One entry of the subscription feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub voice: BundleRef,
    pub status: InstallStatus,
    /// Advisory; present only while the bundle manager reports sizes.
    pub progress: Option<BundleProgress>,
    pub timestamp_ms: i64,
}

/// DashMap-backed registry of voice statuses over a swappable catalog
/// snapshot.
pub struct VoiceStore {
    catalog: RwLock<Arc<Catalog>>,
    statuses: DashMap<BundleRef, InstallStatus>,
    events: broadcast::Sender<StatusEvent>,
}

impl VoiceStore {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            catalog: RwLock::new(Arc::new(Catalog::default())),
            statuses: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Replaces the catalog wholesale and seeds every voice's status from the
    /// bundle manager's installed set. Discards previous statuses entirely.
    pub fn replace_catalog(&self, catalog: Catalog, installed: &HashSet<BundleRef>) {
        let catalog = Arc::new(catalog);
        self.statuses.clear();
        for voice in catalog.voices() {
            self.statuses
                .insert(voice.bundle.clone(), derived_status(voice, installed));
        }
        *self
            .catalog
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = catalog;
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn status(&self, voice: &BundleRef) -> Option<InstallStatus> {
        self.statuses.get(voice).map(|s| *s)
    }

    /// Sets a voice's status and publishes the change on the feed.
    pub fn set_status(&self, voice: &BundleRef, status: InstallStatus) {
        debug!("Voice {} -> {:?}", voice, status);
        self.statuses.insert(voice.clone(), status);
        self.emit(voice, status, None);
    }

    /// Publishes an advisory progress tick without touching the status.
    pub fn emit_progress(&self, voice: &BundleRef, progress: BundleProgress) {
        if let Some(status) = self.status(voice) {
            self.emit(voice, status, Some(progress));
        }
    }

    /// Re-derives every settled voice's status from a fresh installed set,
    /// picking up installs and removals performed out of band. In-flight
    /// voices are never overwritten. Returns how many statuses changed.
    pub fn sync_installed_set(&self, installed: &HashSet<BundleRef>) -> usize {
        let catalog = self.catalog();
        let mut changed = 0;
        for voice in catalog.voices() {
            let current = self.status(&voice.bundle);
            if matches!(current, Some(s) if s.is_in_flight()) {
                continue;
            }
            let fresh = derived_status(voice, installed);
            if current != Some(fresh) {
                self.set_status(&voice.bundle, fresh);
                changed += 1;
            }
        }
        if changed > 0 {
            debug!("Installed-set resync changed {} voice statuses", changed);
        }
        changed
    }

    fn emit(&self, voice: &BundleRef, status: InstallStatus, progress: Option<BundleProgress>) {
        // No receivers is fine; the feed is best-effort.
        let _ = self.events.send(StatusEvent {
            voice: voice.clone(),
            status,
            progress,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        });
    }
}

/// Status of a voice as derivable from the installed set alone.
pub(crate) fn derived_status(
    voice: &crate::catalog::VoiceEntry,
    installed: &HashSet<BundleRef>,
) -> InstallStatus {
    if installed.contains(&voice.bundle) {
        InstallStatus::Installed
    } else if installed.contains(&voice.provider) {
        InstallStatus::ProviderOnly
    } else {
        InstallStatus::Unavailable
    }
}
