use async_trait::async_trait;
use chorus_core::bundles::{BundleError, BundleProgress, BundleRef, BundleResult, RemoteVoice};
use chorus_core::refresh::{InstanceHandle, ServiceRegistry};
use chorus_core::store::{FailureReason, InstallPhase, InstallStatus, StatusEvent};
use chorus_core::{BundleManager, Chorus, Result};
use mockall::mock;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

mock! {
    pub Manager {}

    #[async_trait]
    impl BundleManager for Manager {
        async fn query_remote_index(&self) -> BundleResult<Vec<RemoteVoice>>;
        async fn query_installed_set(&self) -> BundleResult<HashSet<BundleRef>>;
        async fn install(
            &self,
            bundle: &BundleRef,
            progress: mpsc::Sender<BundleProgress>,
        ) -> BundleResult<()>;
        async fn uninstall(&self, bundle: &BundleRef) -> BundleResult<()>;
    }
}

struct NoInstancesRegistry;

#[async_trait]
impl ServiceRegistry for NoInstancesRegistry {
    async fn list_services_matching(&self, _identity: &str) -> Result<Vec<InstanceHandle>> {
        Ok(vec![])
    }

    async fn send_reload_voices(&self, _instance: &InstanceHandle) -> Result<()> {
        Ok(())
    }
}

fn sample_index() -> Vec<RemoteVoice> {
    vec![RemoteVoice {
        bundle: BundleRef::from("en-sample"),
        name: "English sample".to_string(),
        languages: vec!["en".to_string()],
        provider_bundle: BundleRef::from("sampletts"),
        provider_name: "Sample TTS".to_string(),
        download_size: 4096,
    }]
}

async fn await_settled(
    rx: &mut broadcast::Receiver<StatusEvent>,
    voice: &BundleRef,
) -> InstallStatus {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for status event")
            .expect("event feed closed");
        if &event.voice == voice && event.progress.is_none() && !event.status.is_in_flight() {
            return event.status;
        }
    }
}

#[tokio::test]
async fn provider_failure_never_attempts_voice_install() {
    let mut mock = MockManager::new();
    mock.expect_query_remote_index()
        .returning(|| Ok(sample_index()));
    mock.expect_query_installed_set()
        .returning(|| Ok(HashSet::new()));
    // The provider install fails with a network error; the bundle manager
    // must be asked exactly once, for the provider ref only.
    mock.expect_install()
        .withf(|bundle, _| bundle.as_str() == "sampletts")
        .times(1)
        .returning(|bundle, _| {
            Err(BundleError::InstallFailed {
                bundle: bundle.clone(),
                reason: "network unreachable".to_string(),
            })
        });
    mock.expect_install()
        .withf(|bundle, _| bundle.as_str() == "en-sample")
        .times(0);

    let chorus = Chorus::new(Arc::new(mock), Arc::new(NoInstancesRegistry));
    chorus.populate().await.unwrap();

    let voice = BundleRef::from("en-sample");
    let mut rx = chorus.subscribe();
    chorus.request_install(&voice).unwrap();

    let settled = await_settled(&mut rx, &voice).await;
    assert_eq!(
        settled,
        InstallStatus::Failed(FailureReason::ProviderInstallFailed)
    );
    assert_eq!(chorus.stats().await.installs_failed, 1);
}

#[tokio::test]
async fn voice_failure_keeps_provider_and_retry_skips_provider_phase() {
    let installed = Arc::new(Mutex::new(HashSet::<BundleRef>::new()));

    let mut mock = MockManager::new();
    mock.expect_query_remote_index()
        .returning(|| Ok(sample_index()));
    mock.expect_query_installed_set().returning({
        let installed = installed.clone();
        move || Ok(installed.lock().unwrap().clone())
    });
    // Provider install succeeds exactly once and lands in the installed set.
    mock.expect_install()
        .withf(|bundle, _| bundle.as_str() == "sampletts")
        .times(1)
        .returning({
            let installed = installed.clone();
            move |bundle, _| {
                installed.lock().unwrap().insert(bundle.clone());
                Ok(())
            }
        });
    // First voice attempt fails after the provider is in.
    mock.expect_install()
        .withf(|bundle, _| bundle.as_str() == "en-sample")
        .times(1)
        .returning(|bundle, _| {
            Err(BundleError::InstallFailed {
                bundle: bundle.clone(),
                reason: "disk full".to_string(),
            })
        });
    // The retry re-enters the resolver from scratch and only needs the voice.
    mock.expect_install()
        .withf(|bundle, _| bundle.as_str() == "en-sample")
        .times(1)
        .returning({
            let installed = installed.clone();
            move |bundle, _| {
                installed.lock().unwrap().insert(bundle.clone());
                Ok(())
            }
        });

    let chorus = Chorus::new(Arc::new(mock), Arc::new(NoInstancesRegistry));
    chorus.populate().await.unwrap();

    let voice = BundleRef::from("en-sample");
    let mut rx = chorus.subscribe();
    chorus.request_install(&voice).unwrap();

    let settled = await_settled(&mut rx, &voice).await;
    assert_eq!(
        settled,
        InstallStatus::Failed(FailureReason::VoiceInstallFailed)
    );
    // No rollback: the installed set still carries the provider.
    assert!(installed.lock().unwrap().contains(&BundleRef::from("sampletts")));

    // Retry: provider phase must not reappear.
    let mut transitions = Vec::new();
    chorus.request_install(&voice).unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for status event")
            .expect("event feed closed");
        if event.voice != voice || event.progress.is_some() {
            continue;
        }
        transitions.push(event.status);
        if !event.status.is_in_flight() {
            break;
        }
    }
    assert_eq!(
        transitions,
        vec![
            InstallStatus::Installing(InstallPhase::Resolving),
            InstallStatus::Installing(InstallPhase::InstallingVoice),
            InstallStatus::Installing(InstallPhase::Refreshing),
            InstallStatus::Installed,
        ]
    );
}
