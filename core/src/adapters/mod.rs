/// Production implementations of the external seams: the sandboxed-bundle
/// manager and the session-bus service registry.
pub mod flatpak;
pub mod session_bus;

pub use flatpak::{FlatpakBundleManager, FlatpakConfig};
pub use session_bus::{SessionBusConfig, SessionBusRegistry};
