use chorus_core::bundles::{BundleProgress, BundleRef, RemoteVoice};
use chorus_core::catalog::Catalog;
use chorus_core::store::{InstallPhase, InstallStatus, VoiceStore};
use std::collections::HashSet;
use std::time::Duration;

fn voice_row(id: &str, provider: &str) -> RemoteVoice {
    RemoteVoice {
        bundle: BundleRef::from(id),
        name: id.to_string(),
        languages: vec!["en".to_string()],
        provider_bundle: BundleRef::from(provider),
        provider_name: provider.to_string(),
        download_size: 4096,
    }
}

fn installed(refs: &[&str]) -> HashSet<BundleRef> {
    refs.iter().map(|r| BundleRef::from(*r)).collect()
}

fn seeded_store() -> VoiceStore {
    let store = VoiceStore::new(16);
    let catalog = Catalog::from_remote(vec![
        voice_row("en-sample", "sampletts"),
        voice_row("de-sample", "sampletts"),
        voice_row("fr-other", "othertts"),
    ]);
    store.replace_catalog(catalog, &installed(&["sampletts", "en-sample"]));
    store
}

#[test]
fn replace_catalog_seeds_statuses_from_installed_set() {
    let store = seeded_store();
    assert_eq!(
        store.status(&BundleRef::from("en-sample")),
        Some(InstallStatus::Installed)
    );
    assert_eq!(
        store.status(&BundleRef::from("de-sample")),
        Some(InstallStatus::ProviderOnly)
    );
    assert_eq!(
        store.status(&BundleRef::from("fr-other")),
        Some(InstallStatus::Unavailable)
    );
    assert_eq!(store.status(&BundleRef::from("unknown")), None);
}

#[tokio::test]
async fn set_status_reaches_subscribers() {
    let store = seeded_store();
    let mut rx = store.subscribe();

    let voice = BundleRef::from("de-sample");
    store.set_status(&voice, InstallStatus::Installing(InstallPhase::Resolving));

    let event = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timed out")
        .expect("feed closed");
    assert_eq!(event.voice, voice);
    assert_eq!(
        event.status,
        InstallStatus::Installing(InstallPhase::Resolving)
    );
    assert!(event.progress.is_none());
    assert!(event.timestamp_ms > 0);
}

#[tokio::test]
async fn progress_events_carry_the_current_status() {
    let store = seeded_store();
    let voice = BundleRef::from("de-sample");
    store.set_status(&voice, InstallStatus::Installing(InstallPhase::InstallingVoice));

    let mut rx = store.subscribe();
    store.emit_progress(
        &voice,
        BundleProgress {
            bytes_done: 1,
            bytes_total: 4,
        },
    );

    let event = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timed out")
        .expect("feed closed");
    assert_eq!(
        event.status,
        InstallStatus::Installing(InstallPhase::InstallingVoice)
    );
    assert_eq!(event.progress.map(|p| p.bytes_done), Some(1));
}

#[test]
fn resync_updates_only_settled_voices_that_changed() {
    let store = seeded_store();

    // en-sample was removed out of band, de-sample is mid-install and must
    // not be touched, fr-other is unchanged.
    store.set_status(
        &BundleRef::from("de-sample"),
        InstallStatus::Installing(InstallPhase::InstallingVoice),
    );
    let changed = store.sync_installed_set(&installed(&["sampletts"]));

    assert_eq!(changed, 1);
    assert_eq!(
        store.status(&BundleRef::from("en-sample")),
        Some(InstallStatus::ProviderOnly)
    );
    assert_eq!(
        store.status(&BundleRef::from("de-sample")),
        Some(InstallStatus::Installing(InstallPhase::InstallingVoice))
    );
    assert_eq!(
        store.status(&BundleRef::from("fr-other")),
        Some(InstallStatus::Unavailable)
    );
}

#[test]
fn resync_with_identical_set_changes_nothing() {
    let store = seeded_store();
    assert_eq!(
        store.sync_installed_set(&installed(&["sampletts", "en-sample"])),
        0
    );
}
