//! Flatpak-backed bundle manager
//!
//! Drives the host's `flatpak` CLI for index queries and installs. Voice
//! bundles follow the id convention `<provider-id>.Voice.<suffix>` on the
//! configured remote; the provider linkage is read straight off the id, and
//! the suffix doubles as the voice's primary language tag.
//!
//! Env overrides:
//! - CHORUS_FLATPAK_BIN: path to the flatpak binary
//! - CHORUS_REMOTE: remote name carrying the voice index
//! - CHORUS_FLATPAK_USER: "false" to target the system installation
//!
//! The CLI reports download progress on an interactive tty only, so this
//! manager never sends on the progress channel; installs are observed at
//! their terminal result.
use crate::bundles::{
    BundleError, BundleManager, BundleProgress, BundleRef, BundleResult, RemoteVoice,
};
use async_trait::async_trait;
use std::collections::HashSet;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

const VOICE_ID_MARKER: &str = ".Voice.";

#[derive(Debug, Clone)]
pub struct FlatpakConfig {
    pub flatpak_bin: String,
    /// Remote the voice index lives on.
    pub remote: String,
    /// Target the per-user installation rather than the system one.
    pub user: bool,
}

impl Default for FlatpakConfig {
    fn default() -> Self {
        let flatpak_bin =
            std::env::var("CHORUS_FLATPAK_BIN").unwrap_or_else(|_| "flatpak".to_string());
        let remote = std::env::var("CHORUS_REMOTE").unwrap_or_else(|_| "voices".to_string());
        let user = std::env::var("CHORUS_FLATPAK_USER")
            .ok()
            .and_then(|s| s.parse::<bool>().ok())
            .unwrap_or(true);
        Self {
            flatpak_bin,
            remote,
            user,
        }
    }
}

pub struct FlatpakBundleManager {
    config: FlatpakConfig,
}

impl FlatpakBundleManager {
    pub fn new(config: FlatpakConfig) -> Self {
        Self { config }
    }

    async fn run(&self, args: &[&str]) -> BundleResult<String> {
        let mut cmd = Command::new(&self.config.flatpak_bin);
        if self.config.user {
            cmd.arg("--user");
        }
        cmd.args(args);
        debug!("Running {} {:?}", self.config.flatpak_bin, args);

        let output = cmd
            .output()
            .await
            .map_err(|e| BundleError::Storage(format!("failed to spawn flatpak: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(BundleError::Storage(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[async_trait]
impl BundleManager for FlatpakBundleManager {
    async fn query_remote_index(&self) -> BundleResult<Vec<RemoteVoice>> {
        let stdout = self
            .run(&[
                "remote-ls",
                "--app",
                "--columns=application,name,download-size",
                &self.config.remote,
            ])
            .await
            .map_err(|e| BundleError::RemoteUnreachable(e.to_string()))?;

        let voices = parse_remote_index(&stdout)?;
        info!(
            "Remote {} lists {} voice bundle(s)",
            self.config.remote,
            voices.len()
        );
        Ok(voices)
    }

    async fn query_installed_set(&self) -> BundleResult<HashSet<BundleRef>> {
        let stdout = self.run(&["list", "--app", "--columns=application"]).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(BundleRef::from)
            .collect())
    }

    async fn install(
        &self,
        bundle: &BundleRef,
        _progress: mpsc::Sender<BundleProgress>,
    ) -> BundleResult<()> {
        self.run(&[
            "install",
            "--noninteractive",
            "--or-update",
            &self.config.remote,
            bundle.as_str(),
        ])
        .await
        .map_err(|e| BundleError::InstallFailed {
            bundle: bundle.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn uninstall(&self, bundle: &BundleRef) -> BundleResult<()> {
        self.run(&["uninstall", "--noninteractive", bundle.as_str()])
            .await
            .map_err(|e| BundleError::UninstallFailed {
                bundle: bundle.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Parses `flatpak remote-ls` tab-separated output into index rows, keeping
/// only bundles that follow the voice id convention.
fn parse_remote_index(stdout: &str) -> BundleResult<Vec<RemoteVoice>> {
    let mut voices = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut columns = line.split('\t');
        let (Some(id), Some(name)) = (columns.next(), columns.next()) else {
            return Err(BundleError::MalformedIndex(format!(
                "unexpected remote-ls row: {line:?}"
            )));
        };
        let download_size = columns
            .next()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);

        let Some(marker) = id.find(VOICE_ID_MARKER) else {
            continue; // not a voice bundle
        };
        let provider_id = &id[..marker];
        let suffix = &id[marker + VOICE_ID_MARKER.len()..];

        voices.push(RemoteVoice {
            bundle: BundleRef::from(id),
            name: name.trim().to_string(),
            languages: vec![suffix.replace('_', "-").to_lowercase()],
            provider_bundle: BundleRef::from(provider_id),
            provider_name: provider_id
                .rsplit('.')
                .next()
                .unwrap_or(provider_id)
                .to_string(),
            download_size,
        });
    }
    Ok(voices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_index_keeps_voice_rows_only() {
        let out = "org.sample.Tts.Voice.en_US\tEnglish (US)\t52428800\n\
                   org.sample.Tts\tSample TTS\t10485760\n\
                   org.other.App\tSomething Else\t1\n";
        let voices = parse_remote_index(out).unwrap();
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].bundle.as_str(), "org.sample.Tts.Voice.en_US");
        assert_eq!(voices[0].provider_bundle.as_str(), "org.sample.Tts");
        assert_eq!(voices[0].provider_name, "Tts");
        assert_eq!(voices[0].languages, vec!["en-us"]);
        assert_eq!(voices[0].download_size, 52428800);
    }

    #[test]
    fn remote_index_rejects_rows_without_name_column() {
        let out = "org.sample.Tts.Voice.en\n";
        assert!(matches!(
            parse_remote_index(out),
            Err(BundleError::MalformedIndex(_))
        ));
    }

    #[test]
    fn missing_size_column_defaults_to_zero() {
        let out = "org.sample.Tts.Voice.de\tGerman\t\n";
        let voices = parse_remote_index(out).unwrap();
        assert_eq!(voices[0].download_size, 0);
    }
}
