//! Ensures that equal descriptors resolve to the same live object.

use crate::artifact::{Artifact, ArtifactRef, is_live, same_artifact};
use crate::descriptor::Descriptor;
use crate::error::{DepotError, DepotResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, trace};

/// Number of binds between sweeps over entries whose artifacts are gone.
const PRUNE_INTERVAL: usize = 256;

/// Weak bindings between descriptors and artifacts, in both directions.
///
/// Neither direction keeps an artifact alive. Once the last strong reference to an artifact is
/// dropped, its bindings stop resolving and are swept out lazily. The reverse direction only
/// serves [IdentityCache::descriptor_of].
///
/// Callers are expected to hold the lock of the descriptor they bind or unbind.
#[derive(Default)]
pub struct IdentityCache {
    bindings: Mutex<Bindings>,
}

#[derive(Default)]
struct Bindings {
    forward: HashMap<Descriptor, Weak<dyn Artifact>>,
    reverse: HashMap<usize, (Weak<dyn Artifact>, Descriptor)>,
    binds_since_prune: usize,
}

fn address(artifact: &ArtifactRef) -> usize {
    Arc::as_ptr(artifact) as *const () as usize
}

impl Bindings {
    fn remove_forward(&mut self, desc: &Descriptor) {
        if let Some(old) = self.forward.remove(desc) {
            let key = old.as_ptr() as *const () as usize;
            if self.reverse.get(&key).is_some_and(|(_, bound)| bound == desc) {
                self.reverse.remove(&key);
            }
        }
    }

    fn prune(&mut self) {
        self.forward.retain(|_, artifact| artifact.strong_count() > 0);
        self.reverse
            .retain(|_, (artifact, _)| artifact.strong_count() > 0);
        self.binds_since_prune = 0;
    }
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn bindings(&self) -> MutexGuard<'_, Bindings> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds `artifact` to `desc`. Returns `false` if nothing changed.
    ///
    /// Symlink descriptors are never bound. Binding a not-overwritable artifact over a different
    /// live one is logged as an error but performed; binding over a killed artifact is not.
    pub fn bind(&self, artifact: &ArtifactRef, desc: &Descriptor) -> DepotResult<bool> {
        if desc.is_symlink() {
            trace!(%desc, "not binding symlink descriptor");
            return Ok(false);
        }
        if !is_live(&**artifact) {
            return Err(DepotError::DeadArtifact(desc.clone()));
        }
        let mut bindings = self.bindings();
        if let Some(old) = bindings.forward.get(desc).and_then(Weak::upgrade) {
            if same_artifact(&old, artifact) {
                return Ok(false);
            }
            if !is_live(&*old) {
                debug!(%desc, "replacing binding to a killed artifact");
            } else if artifact.not_overwritable() {
                error!(
                    %desc,
                    old = ?old,
                    new = ?artifact,
                    "not-overwritable artifact bound over a different live instance"
                );
            }
        }
        bindings.remove_forward(desc);
        let weak = Arc::downgrade(artifact);
        bindings.forward.insert(desc.key(), weak.clone());
        bindings
            .reverse
            .insert(address(artifact), (weak, desc.key()));
        bindings.binds_since_prune += 1;
        if bindings.binds_since_prune >= PRUNE_INTERVAL {
            bindings.prune();
        }
        Ok(true)
    }

    /// Removes the binding if `desc` is bound to `artifact`.
    pub fn unbind(&self, artifact: &ArtifactRef, desc: &Descriptor) -> bool {
        let mut bindings = self.bindings();
        let bound_here = bindings
            .forward
            .get(desc)
            .and_then(Weak::upgrade)
            .is_some_and(|bound| same_artifact(&bound, artifact));
        if bound_here {
            bindings.remove_forward(desc);
        }
        bound_here
    }

    /// Drops whatever is bound to `desc`.
    pub fn forget(&self, desc: &Descriptor) {
        self.bindings().remove_forward(desc);
    }

    /// The live artifact bound to `desc`.
    pub fn get_artifact(&self, desc: &Descriptor) -> Option<ArtifactRef> {
        let mut bindings = self.bindings();
        let artifact = bindings.forward.get(desc)?.upgrade();
        match artifact {
            Some(artifact) if is_live(&*artifact) => Some(artifact),
            _ => {
                bindings.remove_forward(desc);
                None
            }
        }
    }

    /// The descriptor `artifact` is currently bound to.
    pub fn descriptor_of(&self, artifact: &ArtifactRef) -> Option<Descriptor> {
        let bindings = self.bindings();
        let (weak, desc) = bindings.reverse.get(&address(artifact))?;
        weak.upgrade()
            .filter(|bound| same_artifact(bound, artifact))
            .map(|_| desc.clone())
    }

    /// Number of live bindings per artifact kind.
    pub fn live_count_by_kind(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for artifact in self.bindings().forward.values().filter_map(Weak::upgrade) {
            if is_live(&*artifact) {
                *counts.entry(artifact.kind().to_string()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Number of bindings whose artifact still exists.
    pub fn len(&self) -> usize {
        self.bindings()
            .forward
            .values()
            .filter(|artifact| artifact.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweeps out bindings of dropped artifacts.
    pub fn prune(&self) {
        self.bindings().prune();
    }
}
