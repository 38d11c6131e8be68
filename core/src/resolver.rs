// Dependency resolver
//
// Pure decision logic: given a voice, the bundle manager's installed set and
// the orchestrator's keyed in-flight map, produce the ordered step list the
// orchestrator must execute. A voice bundle is never installed while its
// provider bundle is absent, so the provider step (own install or wait on
// someone else's) always precedes the voice step.
use crate::bundles::BundleRef;
use crate::catalog::VoiceEntry;
use crate::orchestrator::InFlightMap;
use std::collections::HashSet;

/// One step of an install sequence, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStep {
    /// Install the provider bundle through the bundle manager.
    InstallProvider(BundleRef),
    /// Another operation is already installing this provider; await its
    /// terminal result instead of issuing a duplicate install.
    WaitForProvider(BundleRef),
    /// Install the voice bundle itself.
    InstallVoice(BundleRef),
}

/// Resolves a voice to its required step sequence.
///
/// - `[]` when the voice is already installed.
/// - `[InstallVoice]` when only the provider is present.
/// - `[InstallProvider, InstallVoice]` when neither is present.
/// - `[WaitForProvider, InstallVoice]` when the provider install is already
///   in flight elsewhere; at most one concurrent install exists per distinct
///   bundle reference, system-wide.
pub fn resolve(
    voice: &VoiceEntry,
    installed: &HashSet<BundleRef>,
    in_flight: &InFlightMap,
) -> Vec<InstallStep> {
    if installed.contains(&voice.bundle) {
        return vec![];
    }
    if installed.contains(&voice.provider) {
        return vec![InstallStep::InstallVoice(voice.bundle.clone())];
    }
    if in_flight.contains_key(&voice.provider) {
        return vec![
            InstallStep::WaitForProvider(voice.provider.clone()),
            InstallStep::InstallVoice(voice.bundle.clone()),
        ];
    }
    vec![
        InstallStep::InstallProvider(voice.provider.clone()),
        InstallStep::InstallVoice(voice.bundle.clone()),
    ]
}
