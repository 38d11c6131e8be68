// Install orchestrator
//
// One spawned state machine per voice request:
// Resolving -> InstallingProvider? -> InstallingVoice -> Refreshing -> Done,
// or Failed from any non-terminal state. Steps within one sequence are
// strictly ordered; a voice bundle is never installed while its provider is
// absent. Cross-request coordination happens only through the keyed
// in-flight map: at most one concurrent install per distinct bundle
// reference, system-wide.
use crate::bundles::{BundleError, BundleManager, BundleRef, BundleResult};
use crate::catalog::{ProviderEntry, VoiceEntry};
use crate::config::ChorusConfig;
use crate::refresh::{RefreshCoordinator, RefreshOutcome};
use crate::resolver::{self, InstallStep};
use crate::store::{FailureReason, InstallPhase, InstallStatus, VoiceStore};
use crate::telemetry::StatsCollector;
use crate::{ChorusError, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Terminal-or-running state of one in-flight bundle operation, published on
/// a watch channel so dependent sequences can await it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Running,
    Succeeded,
    Failed,
}

/// Bundle reference -> in-flight operation handle. Owned by the
/// orchestrator, queried by the dependency resolver.
pub type InFlightMap = DashMap<BundleRef, watch::Receiver<OpState>>;

/// Why one install sequence stopped. Internal to the state machine; the
/// store surfaces it as a `FailureReason` (or a settled status, for
/// cancellation).
#[derive(Debug)]
enum InstallError {
    Resolve(BundleError),
    Provider(BundleError),
    Voice(BundleError),
    Cancelled { provider_present: bool },
}

struct InstallCtx {
    manager: Arc<dyn BundleManager>,
    store: Arc<VoiceStore>,
    refresher: Arc<RefreshCoordinator>,
    in_flight: Arc<InFlightMap>,
    stats: Arc<StatsCollector>,
    cancel: Arc<AtomicBool>,
    progress_capacity: usize,
}

pub struct InstallOrchestrator {
    manager: Arc<dyn BundleManager>,
    store: Arc<VoiceStore>,
    refresher: Arc<RefreshCoordinator>,
    in_flight: Arc<InFlightMap>,
    cancel_flags: Arc<DashMap<BundleRef, Arc<AtomicBool>>>,
    tasks: DashMap<BundleRef, JoinHandle<()>>,
    stats: Arc<StatsCollector>,
    progress_capacity: usize,
}

impl InstallOrchestrator {
    pub fn new(
        manager: Arc<dyn BundleManager>,
        store: Arc<VoiceStore>,
        refresher: Arc<RefreshCoordinator>,
        config: &ChorusConfig,
    ) -> Self {
        Self {
            manager,
            store,
            refresher,
            in_flight: Arc::new(DashMap::new()),
            cancel_flags: Arc::new(DashMap::new()),
            tasks: DashMap::new(),
            stats: Arc::new(StatsCollector::new()),
            progress_capacity: config.progress_capacity,
        }
    }

    pub fn in_flight(&self) -> Arc<InFlightMap> {
        self.in_flight.clone()
    }

    pub fn stats(&self) -> Arc<StatsCollector> {
        self.stats.clone()
    }

    /// Starts an install sequence for a voice and returns immediately with
    /// the status the request settled on. Idempotent: an `Installed` voice
    /// returns `Installed` untouched, and a voice whose install is already
    /// in flight returns its current in-flight status without queuing a
    /// duplicate.
    pub fn request_install(&self, voice_ref: &BundleRef) -> Result<InstallStatus> {
        let catalog = self.store.catalog();
        let voice = catalog
            .voice(voice_ref)
            .ok_or_else(|| ChorusError::UnknownVoice(voice_ref.clone()))?
            .clone();
        let provider = catalog
            .provider(&voice.provider)
            .ok_or_else(|| ChorusError::UnknownVoice(voice.provider.clone()))?
            .clone();

        match self.store.status(voice_ref) {
            Some(InstallStatus::Installed) => return Ok(InstallStatus::Installed),
            Some(status @ InstallStatus::Installing(_)) => {
                debug!("Install of {} already in flight; not queuing another", voice_ref);
                return Ok(status);
            }
            _ => {}
        }

        let cancel = Arc::new(AtomicBool::new(false));
        self.cancel_flags.insert(voice_ref.clone(), cancel.clone());
        self.store
            .set_status(voice_ref, InstallStatus::Installing(InstallPhase::Resolving));

        let ctx = InstallCtx {
            manager: self.manager.clone(),
            store: self.store.clone(),
            refresher: self.refresher.clone(),
            in_flight: self.in_flight.clone(),
            stats: self.stats.clone(),
            cancel,
            progress_capacity: self.progress_capacity,
        };
        let cancel_flags = self.cancel_flags.clone();
        let handle = tokio::spawn(async move {
            ctx.stats.record_started().await;
            let outcome = run_install(&ctx, &voice, &provider).await;
            settle_install(&ctx, &voice, outcome).await;
            cancel_flags.remove(&voice.bundle);
        });
        self.tasks.insert(voice_ref.clone(), handle);

        Ok(InstallStatus::Installing(InstallPhase::Resolving))
    }

    /// Requests cancellation of an in-flight install. Takes effect before
    /// the voice step starts; a provider step already running completes
    /// first, so providers are never left half-installed. No-op when
    /// nothing is in flight for the voice.
    pub fn cancel_install(&self, voice_ref: &BundleRef) {
        match self.cancel_flags.get(voice_ref) {
            Some(flag) => {
                info!("Cancellation requested for {}", voice_ref);
                flag.store(true, Ordering::SeqCst);
            }
            None => debug!("No in-flight install of {} to cancel", voice_ref),
        }
    }

    /// Removes an installed voice bundle; the provider stays (other voices
    /// may share it) and its running instances are refreshed afterwards.
    /// No-op unless the voice is currently `Installed`.
    pub fn request_uninstall(&self, voice_ref: &BundleRef) -> Result<InstallStatus> {
        let catalog = self.store.catalog();
        let voice = catalog
            .voice(voice_ref)
            .ok_or_else(|| ChorusError::UnknownVoice(voice_ref.clone()))?
            .clone();
        let provider = catalog
            .provider(&voice.provider)
            .ok_or_else(|| ChorusError::UnknownVoice(voice.provider.clone()))?
            .clone();

        match self.store.status(voice_ref) {
            Some(InstallStatus::Installed) => {}
            Some(other) => return Ok(other),
            None => return Err(ChorusError::UnknownVoice(voice_ref.clone())),
        }

        self.store
            .set_status(voice_ref, InstallStatus::Installing(InstallPhase::Removing));

        let ctx = InstallCtx {
            manager: self.manager.clone(),
            store: self.store.clone(),
            refresher: self.refresher.clone(),
            in_flight: self.in_flight.clone(),
            stats: self.stats.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
            progress_capacity: self.progress_capacity,
        };
        let handle = tokio::spawn(async move {
            run_uninstall(&ctx, &voice, &provider).await;
        });
        self.tasks.insert(voice_ref.clone(), handle);

        Ok(InstallStatus::Installing(InstallPhase::Removing))
    }

    /// Aborts every running state machine. Bundle-manager operations
    /// already handed off are not interrupted mid-flight by this; only the
    /// orchestration around them stops.
    pub fn shutdown(&self) {
        info!("Install orchestrator shutting down");
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
        self.tasks.clear();
        self.in_flight.clear();
        self.cancel_flags.clear();
    }
}

/// Maps the machine's outcome onto the store and the counters.
async fn settle_install(
    ctx: &InstallCtx,
    voice: &VoiceEntry,
    outcome: std::result::Result<(), InstallError>,
) {
    match outcome {
        Ok(()) => {
            ctx.stats.record_succeeded().await;
        }
        Err(InstallError::Cancelled { provider_present }) => {
            let settled = if provider_present {
                InstallStatus::ProviderOnly
            } else {
                InstallStatus::Unavailable
            };
            info!("Install of {} cancelled; leaving {:?}", voice.bundle, settled);
            ctx.store.set_status(&voice.bundle, settled);
            ctx.stats.record_cancelled().await;
        }
        Err(InstallError::Resolve(e)) => {
            warn!("Could not resolve install of {}: {}", voice.bundle, e);
            ctx.store
                .set_status(&voice.bundle, InstallStatus::Failed(FailureReason::ResolveFailed));
            ctx.stats.record_failed().await;
        }
        Err(InstallError::Provider(e)) => {
            warn!("Provider install for {} failed: {}", voice.bundle, e);
            ctx.store.set_status(
                &voice.bundle,
                InstallStatus::Failed(FailureReason::ProviderInstallFailed),
            );
            ctx.stats.record_failed().await;
        }
        Err(InstallError::Voice(e)) => {
            // The provider stays installed; future installs for the same
            // provider reuse it.
            warn!("Voice install for {} failed: {}", voice.bundle, e);
            ctx.store.set_status(
                &voice.bundle,
                InstallStatus::Failed(FailureReason::VoiceInstallFailed),
            );
            ctx.stats.record_failed().await;
        }
    }
}

async fn run_install(
    ctx: &InstallCtx,
    voice: &VoiceEntry,
    provider: &ProviderEntry,
) -> std::result::Result<(), InstallError> {
    let installed = ctx
        .manager
        .query_installed_set()
        .await
        .map_err(InstallError::Resolve)?;

    let steps = resolver::resolve(voice, &installed, &ctx.in_flight);
    if steps.is_empty() {
        info!("Voice {} already installed; nothing to do", voice.bundle);
        ctx.store.set_status(&voice.bundle, InstallStatus::Installed);
        return Ok(());
    }
    debug!("Resolved {} to {} step(s)", voice.bundle, steps.len());

    let mut provider_present = installed.contains(&voice.provider);

    for step in steps {
        match step {
            InstallStep::InstallProvider(bundle) => {
                ensure_not_cancelled(ctx, provider_present)?;
                ctx.store.set_status(
                    &voice.bundle,
                    InstallStatus::Installing(InstallPhase::InstallingProvider),
                );
                install_bundle(ctx, &voice.bundle, &bundle)
                    .await
                    .map_err(InstallError::Provider)?;
                provider_present = true;
            }
            InstallStep::WaitForProvider(bundle) => {
                ctx.store.set_status(
                    &voice.bundle,
                    InstallStatus::Installing(InstallPhase::InstallingProvider),
                );
                wait_for_bundle(ctx, &bundle).await?;
                provider_present = true;
            }
            InstallStep::InstallVoice(bundle) => {
                // Last point where cancellation can take effect: once the
                // voice step starts it runs to its terminal result.
                ensure_not_cancelled(ctx, provider_present)?;
                ctx.store.set_status(
                    &voice.bundle,
                    InstallStatus::Installing(InstallPhase::InstallingVoice),
                );
                install_bundle(ctx, &voice.bundle, &bundle)
                    .await
                    .map_err(InstallError::Voice)?;
            }
        }
    }

    ctx.store.set_status(
        &voice.bundle,
        InstallStatus::Installing(InstallPhase::Refreshing),
    );
    run_refresh(ctx, provider).await;

    ctx.store.set_status(&voice.bundle, InstallStatus::Installed);
    info!("Voice {} installed", voice.bundle);
    Ok(())
}

/// A refresh failure never flips the voice to Failed: the bundle installed
/// correctly, only live-reload did not happen.
async fn run_refresh(ctx: &InstallCtx, provider: &ProviderEntry) {
    match ctx.refresher.refresh(provider).await {
        Ok(RefreshOutcome::Complete) => {}
        Ok(RefreshOutcome::Partial { unreachable }) => {
            warn!(
                "{} provider instance(s) of {} did not reload; consumers see the change after restarting them",
                unreachable.len(),
                provider.bundle
            );
            ctx.stats.record_partial_refresh().await;
        }
        Err(e) => {
            warn!("Provider refresh for {} failed: {}", provider.bundle, e);
            ctx.stats.record_partial_refresh().await;
        }
    }
}

async fn run_uninstall(ctx: &InstallCtx, voice: &VoiceEntry, provider: &ProviderEntry) {
    let (state_tx, state_rx) = watch::channel(OpState::Running);
    ctx.in_flight.insert(voice.bundle.clone(), state_rx);

    info!("Removing voice bundle {}", voice.bundle);
    let result = ctx.manager.uninstall(&voice.bundle).await;

    let _ = state_tx.send(if result.is_ok() {
        OpState::Succeeded
    } else {
        OpState::Failed
    });
    ctx.in_flight.remove(&voice.bundle);

    match result {
        Ok(()) => {
            ctx.store.set_status(
                &voice.bundle,
                InstallStatus::Installing(InstallPhase::Refreshing),
            );
            run_refresh(ctx, provider).await;
            ctx.store.set_status(&voice.bundle, InstallStatus::ProviderOnly);
            ctx.stats.record_uninstall().await;
        }
        Err(e) => {
            // The bundle is still there; the status reverts with it.
            warn!("Uninstall of {} failed: {}", voice.bundle, e);
            ctx.store.set_status(&voice.bundle, InstallStatus::Installed);
        }
    }
}

fn ensure_not_cancelled(
    ctx: &InstallCtx,
    provider_present: bool,
) -> std::result::Result<(), InstallError> {
    if ctx.cancel.load(Ordering::SeqCst) {
        Err(InstallError::Cancelled { provider_present })
    } else {
        Ok(())
    }
}

/// Runs one bundle install under the keyed in-flight entry, forwarding any
/// progress the bundle manager reports onto the event feed.
async fn install_bundle(
    ctx: &InstallCtx,
    voice_ref: &BundleRef,
    bundle: &BundleRef,
) -> BundleResult<()> {
    let (state_tx, state_rx) = watch::channel(OpState::Running);
    ctx.in_flight.insert(bundle.clone(), state_rx);

    let (progress_tx, mut progress_rx) = mpsc::channel(ctx.progress_capacity);
    let store = ctx.store.clone();
    let progress_voice = voice_ref.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            store.emit_progress(&progress_voice, progress);
        }
    });

    info!("Installing bundle {}", bundle);
    let result = ctx.manager.install(bundle, progress_tx).await;

    // Publish the terminal state before removing the entry so waiters see
    // success/failure rather than a closed channel.
    let _ = state_tx.send(if result.is_ok() {
        OpState::Succeeded
    } else {
        OpState::Failed
    });
    ctx.in_flight.remove(bundle);
    // The manager dropped its sender on return; the forwarder drains what
    // was still buffered and ends.
    let _ = forwarder.await;

    result
}

/// Awaits the terminal result of a bundle install owned by another sequence.
async fn wait_for_bundle(
    ctx: &InstallCtx,
    bundle: &BundleRef,
) -> std::result::Result<(), InstallError> {
    let mut rx = match ctx.in_flight.get(bundle) {
        Some(entry) => entry.value().clone(),
        // Finished between resolution and now; fall through to verification.
        None => return verify_bundle_installed(ctx, bundle).await,
    };

    info!("Awaiting in-flight install of {}", bundle);
    loop {
        let state = *rx.borrow();
        match state {
            OpState::Succeeded => return Ok(()),
            OpState::Failed => {
                return Err(InstallError::Provider(BundleError::InstallFailed {
                    bundle: bundle.clone(),
                    reason: "concurrent install of this bundle failed".to_string(),
                }))
            }
            OpState::Running => {
                if rx.changed().await.is_err() {
                    // Owner went away without publishing a terminal state.
                    return verify_bundle_installed(ctx, bundle).await;
                }
            }
        }
    }
}

async fn verify_bundle_installed(
    ctx: &InstallCtx,
    bundle: &BundleRef,
) -> std::result::Result<(), InstallError> {
    let installed = ctx
        .manager
        .query_installed_set()
        .await
        .map_err(InstallError::Resolve)?;
    if installed.contains(bundle) {
        Ok(())
    } else {
        Err(InstallError::Provider(BundleError::InstallFailed {
            bundle: bundle.clone(),
            reason: "bundle absent after concurrent install completed".to_string(),
        }))
    }
}
