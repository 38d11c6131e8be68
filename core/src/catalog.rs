// Catalog fetcher: remote index -> voice/provider entries
use crate::bundles::{BundleManager, BundleRef, RemoteVoice};
use crate::{ChorusError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// An installable voice as presented to the UI. Immutable once fetched;
/// the whole catalog is replaced on re-fetch, never patched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceEntry {
    pub bundle: BundleRef,
    pub name: String,
    pub languages: Vec<String>,
    pub provider: BundleRef,
    pub provider_name: String,
    pub download_size: u64,
}

/// A speech-provider bundle, deduplicated from the voices that declare it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub bundle: BundleRef,
    pub name: String,
    /// Well-known bus name of the provider's long-lived service process.
    /// Providers use their bundle id as the service name.
    pub service_identity: String,
}

/// Snapshot of everything the remote index declared, in catalog order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    voices: Vec<VoiceEntry>,
    providers: Vec<ProviderEntry>,
    languages: Vec<String>,
}

impl Catalog {
    /// Builds a catalog from raw index rows: keeps voice order, dedups
    /// providers by first appearance, collects the sorted language list.
    pub fn from_remote(rows: Vec<RemoteVoice>) -> Self {
        let mut voices = Vec::with_capacity(rows.len());
        let mut providers: Vec<ProviderEntry> = Vec::new();
        let mut seen_providers: HashSet<BundleRef> = HashSet::new();
        let mut languages: Vec<String> = Vec::new();

        for row in rows {
            if seen_providers.insert(row.provider_bundle.clone()) {
                providers.push(ProviderEntry {
                    bundle: row.provider_bundle.clone(),
                    name: row.provider_name.clone(),
                    service_identity: row.provider_bundle.as_str().to_string(),
                });
            }
            for lang in &row.languages {
                if !languages.contains(lang) {
                    languages.push(lang.clone());
                }
            }
            voices.push(VoiceEntry {
                bundle: row.bundle,
                name: row.name,
                languages: row.languages,
                provider: row.provider_bundle,
                provider_name: row.provider_name,
                download_size: row.download_size,
            });
        }
        languages.sort();

        Self {
            voices,
            providers,
            languages,
        }
    }

    pub fn voices(&self) -> &[VoiceEntry] {
        &self.voices
    }

    pub fn providers(&self) -> &[ProviderEntry] {
        &self.providers
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    pub fn voice(&self, bundle: &BundleRef) -> Option<&VoiceEntry> {
        self.voices.iter().find(|v| &v.bundle == bundle)
    }

    pub fn provider(&self, bundle: &BundleRef) -> Option<&ProviderEntry> {
        self.providers.iter().find(|p| &p.bundle == bundle)
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }
}

/// Filter over a catalog snapshot. Pure predicate; no filter state lives in
/// the core.
#[derive(Debug, Clone, Default)]
pub struct CatalogFilter {
    /// Only voices plugging into this provider.
    pub provider: Option<BundleRef>,
    /// Only voices declaring this language tag.
    pub language: Option<String>,
    /// Case-insensitive substring match against name, provider name and tags.
    pub text: Option<String>,
}

impl CatalogFilter {
    pub fn matches(&self, voice: &VoiceEntry) -> bool {
        self.match_provider(voice) && self.match_language(voice) && self.match_text(voice)
    }

    fn match_provider(&self, voice: &VoiceEntry) -> bool {
        match &self.provider {
            Some(provider) => &voice.provider == provider,
            None => true,
        }
    }

    fn match_language(&self, voice: &VoiceEntry) -> bool {
        match &self.language {
            Some(lang) => voice.languages.iter().any(|l| l == lang),
            None => true,
        }
    }

    fn match_text(&self, voice: &VoiceEntry) -> bool {
        let Some(text) = &self.text else {
            return true;
        };
        let needle = text.to_lowercase();
        if needle.is_empty() {
            return true;
        }
        let mut haystack = format!("{} {}", voice.name, voice.provider_name);
        for lang in &voice.languages {
            haystack.push(' ');
            haystack.push_str(lang);
        }
        haystack.to_lowercase().contains(&needle)
    }
}

/// Fetches the remote index through the bundle manager seam.
pub struct CatalogFetcher {
    manager: Arc<dyn BundleManager>,
}

impl CatalogFetcher {
    pub fn new(manager: Arc<dyn BundleManager>) -> Self {
        Self { manager }
    }

    /// Queries the configured remote and returns a fresh catalog.
    ///
    /// A failed fetch yields no entries, not stale ones; the caller keeps
    /// whatever snapshot it already holds and may retry.
    pub async fn fetch_catalog(&self) -> Result<Catalog> {
        debug!("Fetching voice catalog from remote index");
        let rows = self
            .manager
            .query_remote_index()
            .await
            .map_err(|e| ChorusError::CatalogUnavailable(e.to_string()))?;

        let catalog = Catalog::from_remote(rows);
        info!(
            "Catalog fetched: {} voices, {} providers",
            catalog.voices().len(),
            catalog.providers().len()
        );
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, name: &str, langs: &[&str], provider: &str) -> RemoteVoice {
        RemoteVoice {
            bundle: BundleRef::from(id),
            name: name.to_string(),
            languages: langs.iter().map(|l| l.to_string()).collect(),
            provider_bundle: BundleRef::from(provider),
            provider_name: format!("{provider} provider"),
            download_size: 1024,
        }
    }

    #[test]
    fn providers_dedup_in_first_seen_order() {
        let catalog = Catalog::from_remote(vec![
            row("v.en", "English", &["en"], "p.sample"),
            row("v.de", "German", &["de"], "p.other"),
            row("v.fr", "French", &["fr"], "p.sample"),
        ]);
        let ids: Vec<&str> = catalog
            .providers()
            .iter()
            .map(|p| p.bundle.as_str())
            .collect();
        assert_eq!(ids, vec!["p.sample", "p.other"]);
        assert_eq!(catalog.languages(), &["de", "en", "fr"]);
    }

    #[test]
    fn filter_composes_predicates() {
        let catalog = Catalog::from_remote(vec![
            row("v.en", "English Sally", &["en", "en-US"], "p.sample"),
            row("v.de", "German Max", &["de"], "p.other"),
        ]);

        let empty = CatalogFilter::default();
        assert!(catalog.voices().iter().all(|v| empty.matches(v)));

        let by_provider = CatalogFilter {
            provider: Some(BundleRef::from("p.other")),
            ..Default::default()
        };
        let hits: Vec<_> = catalog
            .voices()
            .iter()
            .filter(|v| by_provider.matches(v))
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].bundle.as_str(), "v.de");

        let by_text = CatalogFilter {
            text: Some("sally".to_string()),
            ..Default::default()
        };
        assert!(by_text.matches(&catalog.voices()[0]));
        assert!(!by_text.matches(&catalog.voices()[1]));

        let mismatch = CatalogFilter {
            provider: Some(BundleRef::from("p.sample")),
            language: Some("de".to_string()),
            ..Default::default()
        };
        assert!(catalog.voices().iter().all(|v| !mismatch.matches(v)));
    }
}
