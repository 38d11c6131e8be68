// Provider refresh coordinator
//
// After a voice install or removal, running provider processes must reload
// their voice registries so consuming apps see the change without a restart.
// Discovery and signaling live behind the ServiceRegistry trait so tests can
// fake them without a real provider process on a real bus.
use crate::catalog::ProviderEntry;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Handle to one running provider instance discovered on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    /// Bus name the instance answers on.
    pub service: String,
    pub pid: Option<u32>,
}

/// Capability trait over the live service registry and the control channel
/// to provider instances.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Running instances whose service identity matches.
    async fn list_services_matching(&self, identity: &str) -> Result<Vec<InstanceHandle>>;

    /// Tell one instance to reload its voice registry; resolves on its ack.
    async fn send_reload_voices(&self, instance: &InstanceHandle) -> Result<()>;
}

/// Result of a refresh pass. Partial is never fatal to the install that
/// triggered it: the bundle itself installed correctly, only live-reload
/// did not happen everywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Complete,
    Partial { unreachable: Vec<InstanceHandle> },
}

pub struct RefreshCoordinator {
    registry: Arc<dyn ServiceRegistry>,
    ack_timeout: Duration,
}

impl RefreshCoordinator {
    pub fn new(registry: Arc<dyn ServiceRegistry>, ack_timeout: Duration) -> Self {
        Self {
            registry,
            ack_timeout,
        }
    }

    /// Signals every running instance of the provider to reload its voices.
    ///
    /// Zero running instances is a success: apps will see the voice on their
    /// next normal provider discovery. Each ack is awaited with a bounded
    /// timeout; instances that time out or error are reported in
    /// `RefreshOutcome::Partial`.
    pub async fn refresh(&self, provider: &ProviderEntry) -> Result<RefreshOutcome> {
        let instances = self
            .registry
            .list_services_matching(&provider.service_identity)
            .await?;

        if instances.is_empty() {
            debug!(
                "No running instances of {}; nothing to refresh",
                provider.service_identity
            );
            return Ok(RefreshOutcome::Complete);
        }

        let mut unreachable = Vec::new();
        for instance in instances {
            match timeout(self.ack_timeout, self.registry.send_reload_voices(&instance)).await {
                Ok(Ok(())) => {
                    debug!("Instance {} reloaded voices", instance.service);
                }
                Ok(Err(e)) => {
                    warn!("Instance {} refused reload: {}", instance.service, e);
                    unreachable.push(instance);
                }
                Err(_) => {
                    warn!(
                        "Instance {} did not ack reload within {:?}",
                        instance.service, self.ack_timeout
                    );
                    unreachable.push(instance);
                }
            }
        }

        if unreachable.is_empty() {
            Ok(RefreshOutcome::Complete)
        } else {
            Ok(RefreshOutcome::Partial { unreachable })
        }
    }
}
