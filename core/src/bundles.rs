// Bundle manager seam
//
// All installed-state truth lives in the external bundle manager; the core
// only issues intents through this trait and observes outcomes.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Unique reference to a bundle known to the bundle manager.
///
/// Used as the key of every map in the core; cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleRef(String);

impl BundleRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BundleRef {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Error, Debug, Clone)]
pub enum BundleError {
    #[error("Remote unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("Malformed index: {0}")]
    MalformedIndex(String),

    #[error("Install failed for {bundle}: {reason}")]
    InstallFailed { bundle: BundleRef, reason: String },

    #[error("Uninstall failed for {bundle}: {reason}")]
    UninstallFailed { bundle: BundleRef, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type BundleResult<T> = std::result::Result<T, BundleError>;

/// One voice row of the remote index, with its declared provider linkage
/// (read from bundle metadata, never inferred by the core).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteVoice {
    pub bundle: BundleRef,
    pub name: String,
    /// BCP-47 tags as declared by the bundle.
    pub languages: Vec<String>,
    pub provider_bundle: BundleRef,
    pub provider_name: String,
    /// Approximate download size in bytes.
    pub download_size: u64,
}

/// Advisory progress report for one bundle install.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BundleProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
}

impl BundleProgress {
    pub fn percent(&self) -> f32 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        ((self.bytes_done as f64 / self.bytes_total as f64) * 100.0) as f32
    }
}

/// Capability trait over the external bundle manager.
///
/// Install and uninstall are long-running (network/unpack); implementations
/// must resolve only on the operation's terminal result. Progress reports are
/// optional; managers that cannot report sizes simply never send on the
/// channel.
#[async_trait]
pub trait BundleManager: Send + Sync {
    /// Index of installable voice bundles on the configured remote.
    async fn query_remote_index(&self) -> BundleResult<Vec<RemoteVoice>>;

    /// Set of locally installed bundle references.
    async fn query_installed_set(&self) -> BundleResult<HashSet<BundleRef>>;

    /// Install a single bundle, reporting progress when available.
    async fn install(
        &self,
        bundle: &BundleRef,
        progress: mpsc::Sender<BundleProgress>,
    ) -> BundleResult<()>;

    /// Remove a single bundle.
    async fn uninstall(&self, bundle: &BundleRef) -> BundleResult<()>;
}
