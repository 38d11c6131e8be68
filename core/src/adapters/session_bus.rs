//! Session-bus service registry
//!
//! Discovers running provider instances and delivers the reload-voices
//! control message through the session bus CLI (`busctl --user`). Providers
//! own their bundle id as a well-known bus name and expose a
//! `ReloadVoices` method on their provider interface; the call returning at
//! all is the acknowledgment, the coordinator bounds how long it waits.
//!
//! Env overrides:
//! - CHORUS_BUSCTL_BIN: path to the busctl binary
use crate::refresh::{InstanceHandle, ServiceRegistry};
use crate::{ChorusError, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

const PROVIDER_OBJECT_PATH: &str = "/org/freedesktop/speech/Provider";
const PROVIDER_INTERFACE: &str = "org.freedesktop.Speech.Provider";

#[derive(Debug, Clone)]
pub struct SessionBusConfig {
    pub busctl_bin: String,
}

impl Default for SessionBusConfig {
    fn default() -> Self {
        Self {
            busctl_bin: std::env::var("CHORUS_BUSCTL_BIN")
                .unwrap_or_else(|_| "busctl".to_string()),
        }
    }
}

pub struct SessionBusRegistry {
    config: SessionBusConfig,
}

impl SessionBusRegistry {
    pub fn new(config: SessionBusConfig) -> Self {
        Self { config }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.config.busctl_bin)
            .arg("--user")
            .args(args)
            .output()
            .await
            .map_err(|e| ChorusError::Registry(format!("failed to spawn busctl: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ChorusError::Registry(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[async_trait]
impl ServiceRegistry for SessionBusRegistry {
    async fn list_services_matching(&self, identity: &str) -> Result<Vec<InstanceHandle>> {
        let stdout = self.run(&["--no-pager", "list"]).await?;
        let instances = parse_service_list(&stdout, identity);
        debug!(
            "{} running instance(s) match service identity {}",
            instances.len(),
            identity
        );
        Ok(instances)
    }

    async fn send_reload_voices(&self, instance: &InstanceHandle) -> Result<()> {
        self.run(&[
            "call",
            &instance.service,
            PROVIDER_OBJECT_PATH,
            PROVIDER_INTERFACE,
            "ReloadVoices",
        ])
        .await?;
        Ok(())
    }
}

/// Parses `busctl list` output: NAME PID PROCESS ... columns, one service per
/// line. Keeps running services (those with a pid) whose name is the identity
/// or an instance suffix of it.
fn parse_service_list(stdout: &str, identity: &str) -> Vec<InstanceHandle> {
    let mut instances = Vec::new();
    for line in stdout.lines().skip(1) {
        let mut columns = line.split_whitespace();
        let (Some(name), Some(pid)) = (columns.next(), columns.next()) else {
            continue;
        };
        if name != identity && !name.strip_prefix(identity).is_some_and(|r| r.starts_with('.')) {
            continue;
        }
        let Ok(pid) = pid.parse::<u32>() else {
            continue; // activatable but not running
        };
        instances.push(InstanceHandle {
            service: name.to_string(),
            pid: Some(pid),
        });
    }
    instances
}
