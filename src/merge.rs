//! Three-way merging of concurrently edited artifacts.

use crate::artifact::{ArtifactRef, KIND_MAP, MapArtifact, downcast_ref};
use crate::error::{DepotError, DepotResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

/// Combines an edit with changes that happened concurrently.
pub trait Merger: Send + Sync {
    /// `before` is the snapshot the edit started from, `after` the edited value and `latest` the
    /// value currently stored.
    fn merge(
        &self,
        before: &ArtifactRef,
        after: &ArtifactRef,
        latest: &ArtifactRef,
    ) -> DepotResult<ArtifactRef>;
}

/// Mergers by artifact kind.
pub struct MergerRegistry {
    mergers: RwLock<HashMap<String, Arc<dyn Merger>>>,
}

impl MergerRegistry {
    pub fn empty() -> Self {
        Self {
            mergers: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with a [MapMerger] for [MapArtifact]s.
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        registry.register(KIND_MAP, MapMerger);
        registry
    }

    pub fn register(&self, kind: impl Into<String>, merger: impl Merger + 'static) {
        self.mergers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.into(), Arc::new(merger));
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Merger>> {
        self.mergers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }

    /// Merges with the merger registered for `after`'s kind. `None` if there is none.
    pub fn merge(
        &self,
        before: &ArtifactRef,
        after: &ArtifactRef,
        latest: &ArtifactRef,
    ) -> DepotResult<Option<ArtifactRef>> {
        match self.get(after.kind()) {
            Some(merger) => merger.merge(before, after, latest).map(Some),
            None => Ok(None),
        }
    }
}

impl Default for MergerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Applies the entries added, changed or removed between `before` and `after` to `latest`.
///
/// Entries only changed by the concurrent writer survive; where both sides changed an entry,
/// the edit wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapMerger;

impl Merger for MapMerger {
    fn merge(
        &self,
        before: &ArtifactRef,
        after: &ArtifactRef,
        latest: &ArtifactRef,
    ) -> DepotResult<ArtifactRef> {
        let before = map_entries(before)?;
        let after = map_entries(after)?;
        let latest = map_entries(latest)?;
        let mut merged = latest.clone();
        for (key, value) in after {
            if before.get(key) != Some(value) {
                merged.insert(key.clone(), value.clone());
            }
        }
        for key in before.keys() {
            if !after.contains_key(key) {
                merged.remove(key);
            }
        }
        Ok(Arc::new(MapArtifact::new(merged)))
    }
}

fn map_entries(artifact: &ArtifactRef) -> DepotResult<&BTreeMap<String, String>> {
    downcast_ref::<MapArtifact>(artifact)
        .map(MapArtifact::entries)
        .ok_or_else(|| DepotError::Merge {
            kind: KIND_MAP.to_string(),
            reason: format!("{} is not a map", artifact.kind()),
        })
}
