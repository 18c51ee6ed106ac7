//! Evidence adapters keyed by `(Platform, Capability)`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use opforge_ai::{EvidenceRecord, EvidenceSet, Platform, SynthesisMode};
use opforge_core::TargetId;

use super::collaborators::{EvidenceError, EvidenceSource};

/// Kind of evidence an adapter can produce for a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Posts,
    Comments,
    Transcripts,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Posts, Capability::Comments, Capability::Transcripts];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Posts => "posts",
            Capability::Comments => "comments",
            Capability::Transcripts => "transcripts",
        }
    }

    /// Capabilities a run in `mode` pulls from every platform.
    pub fn required_for(mode: SynthesisMode) -> &'static [Capability] {
        match mode {
            SynthesisMode::Standard => &[Capability::Posts],
            SynthesisMode::Deep => &Capability::ALL,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait EvidenceAdapter: Send + Sync {
    async fn fetch(
        &self,
        target_id: TargetId,
        platform: Platform,
        capability: Capability,
    ) -> Result<Vec<EvidenceRecord>, EvidenceError>;
}

/// Result of a registry lookup. A missing pair is an explicit value, not a panic.
#[derive(Clone)]
pub enum AdapterLookup {
    Registered(Arc<dyn EvidenceAdapter>),
    Unregistered { platform: Platform, capability: Capability },
}

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<(Platform, Capability), Arc<dyn EvidenceAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.adapters.keys().collect();
        keys.sort();
        f.debug_struct("AdapterRegistry").field("registered", &keys).finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` for a pair, replacing any previous one.
    pub fn register(
        &mut self,
        platform: Platform,
        capability: Capability,
        adapter: Arc<dyn EvidenceAdapter>,
    ) -> &mut Self {
        self.adapters.insert((platform, capability), adapter);
        self
    }

    pub fn lookup(&self, platform: Platform, capability: Capability) -> AdapterLookup {
        match self.adapters.get(&(platform, capability)) {
            Some(adapter) => AdapterLookup::Registered(adapter.clone()),
            None => AdapterLookup::Unregistered {
                platform,
                capability,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Evidence source that fans a request out over registered adapters.
#[derive(Debug, Clone)]
pub struct RegistryEvidenceSource {
    registry: AdapterRegistry,
    platforms: Vec<Platform>,
}

impl RegistryEvidenceSource {
    pub fn new(registry: AdapterRegistry) -> Self {
        Self {
            registry,
            platforms: Platform::ALL.to_vec(),
        }
    }

    pub fn with_platforms(mut self, platforms: Vec<Platform>) -> Self {
        self.platforms = platforms;
        self
    }
}

#[async_trait]
impl EvidenceSource for RegistryEvidenceSource {
    async fn fetch_evidence(
        &self,
        target_id: TargetId,
        mode: SynthesisMode,
    ) -> Result<EvidenceSet, EvidenceError> {
        let mut records = Vec::new();
        let mut skipped = 0usize;

        for &platform in &self.platforms {
            for &capability in Capability::required_for(mode) {
                match self.registry.lookup(platform, capability) {
                    AdapterLookup::Registered(adapter) => {
                        let fetched = adapter.fetch(target_id, platform, capability).await?;
                        debug!(
                            target_id = %target_id,
                            platform = %platform,
                            capability = %capability,
                            count = fetched.len(),
                            "evidence fetched"
                        );
                        records.extend(fetched);
                    }
                    AdapterLookup::Unregistered {
                        platform,
                        capability,
                    } => {
                        skipped += 1;
                        debug!(platform = %platform, capability = %capability, "no adapter registered; skipping");
                    }
                }
            }
        }

        // Newest first, so truncation keeps the freshest evidence.
        records.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        let set = EvidenceSet::new(target_id, records);
        info!(target_id = %target_id, mode = %mode, items = set.len(), skipped, "evidence acquired");
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::{Duration, Utc};

    use super::*;

    #[derive(Default)]
    struct RecordingAdapter {
        calls: Mutex<Vec<(Platform, Capability)>>,
        fail: bool,
    }

    #[async_trait]
    impl EvidenceAdapter for RecordingAdapter {
        async fn fetch(
            &self,
            _target_id: TargetId,
            platform: Platform,
            capability: Capability,
        ) -> Result<Vec<EvidenceRecord>, EvidenceError> {
            self.calls.lock().unwrap().push((platform, capability));
            if self.fail {
                return Err(EvidenceError::Unavailable("down".into()));
            }
            let n = self.calls.lock().unwrap().len() as i64;
            Ok(vec![EvidenceRecord {
                platform,
                text: format!("{capability} from {platform}"),
                has_rich_content: false,
                author: "someone".into(),
                url: format!("https://example.com/{platform}/{capability}"),
                published_at: Utc::now() - Duration::days(n),
                engagement: None,
            }])
        }
    }

    #[test]
    fn missing_pairs_are_explicitly_unregistered() {
        let mut registry = AdapterRegistry::new();
        registry.register(Platform::Reddit, Capability::Posts, Arc::new(RecordingAdapter::default()));

        assert!(matches!(
            registry.lookup(Platform::Reddit, Capability::Posts),
            AdapterLookup::Registered(_)
        ));
        assert!(matches!(
            registry.lookup(Platform::Reddit, Capability::Comments),
            AdapterLookup::Unregistered {
                platform: Platform::Reddit,
                capability: Capability::Comments
            }
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn deep_mode_queries_every_registered_capability() {
        let adapter = Arc::new(RecordingAdapter::default());
        let mut registry = AdapterRegistry::new();
        registry
            .register(Platform::Youtube, Capability::Posts, adapter.clone())
            .register(Platform::Youtube, Capability::Transcripts, adapter.clone());
        let source = RegistryEvidenceSource::new(registry).with_platforms(vec![Platform::Youtube]);

        let standard = source
            .fetch_evidence(TargetId::new(), SynthesisMode::Standard)
            .await
            .unwrap();
        assert_eq!(standard.len(), 1);

        let deep = source
            .fetch_evidence(TargetId::new(), SynthesisMode::Deep)
            .await
            .unwrap();
        assert_eq!(deep.len(), 2);
        // Newest first.
        let records = deep.records();
        assert!(records[0].published_at >= records[1].published_at);

        let calls = adapter.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                (Platform::Youtube, Capability::Posts),
                (Platform::Youtube, Capability::Posts),
                (Platform::Youtube, Capability::Transcripts),
            ]
        );
    }

    #[tokio::test]
    async fn adapter_failure_fails_the_fetch() {
        let mut registry = AdapterRegistry::new();
        registry.register(
            Platform::Reddit,
            Capability::Posts,
            Arc::new(RecordingAdapter {
                fail: true,
                ..Default::default()
            }),
        );
        let source = RegistryEvidenceSource::new(registry);
        let err = source
            .fetch_evidence(TargetId::new(), SynthesisMode::Standard)
            .await
            .unwrap_err();
        assert!(matches!(err, EvidenceError::Unavailable(_)));
    }
}
