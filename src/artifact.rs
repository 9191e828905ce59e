//! Artifacts are the values kept in a depot.
//!
//! Any `Send + Sync` type can be an artifact by implementing [Artifact]. The trait's provided
//! methods describe optional capabilities the depot honors: carrying an own descriptor, a
//! lifecycle, a guard against silent overwrites, sub-artifacts ("modules"), and initialization
//! after being loaded.

use crate::descriptor::Descriptor;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const KIND_TEXT: &str = "Text";
pub const KIND_MAP: &str = "Map";
pub const KIND_FILE: &str = "File";

pub type ArtifactRef = Arc<dyn Artifact>;

/// Access to the concrete type behind a `dyn Artifact`.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub trait Artifact: AsAny + Debug {
    /// Name of the artifact's type. Must equal the kind of the descriptors it is stored under.
    fn kind(&self) -> &str;

    /// The descriptor the artifact considers its own, if it tracks one.
    fn descriptor(&self) -> Option<Descriptor> {
        None
    }

    fn lifecycle(&self) -> Option<&dyn Lifecycle> {
        None
    }

    /// Live instances of not-overwritable artifacts must only be replaced through a merge.
    fn not_overwritable(&self) -> bool {
        false
    }

    /// Sub-artifacts that are stored along with this one, each under its own descriptor.
    fn modules(&self) -> Vec<(Descriptor, ArtifactRef)> {
        Vec::new()
    }

    /// Called once after the artifact has been loaded from a backend.
    fn init(&self) {}
}

pub trait Lifecycle {
    fn is_live(&self) -> bool;
    fn kill(&self);
}

/// Whether the artifact has not been killed. Artifacts without lifecycle are always live.
pub fn is_live(artifact: &dyn Artifact) -> bool {
    artifact
        .lifecycle()
        .is_none_or(|lifecycle| lifecycle.is_live())
}

/// Identity comparison of two artifact references.
pub fn same_artifact(a: &ArtifactRef, b: &ArtifactRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub fn downcast_ref<T: Artifact>(artifact: &ArtifactRef) -> Option<&T> {
    (**artifact).as_any().downcast_ref::<T>()
}

pub fn downcast<T: Artifact>(artifact: ArtifactRef) -> Option<Arc<T>> {
    AsAny::into_any_arc(artifact).downcast::<T>().ok()
}

/// What a backend stores under a descriptor: an artifact, or a link to another descriptor.
#[derive(Debug, Clone)]
pub enum Value {
    Artifact(ArtifactRef),
    Link(Descriptor),
}

impl Value {
    pub fn as_artifact(&self) -> Option<&ArtifactRef> {
        match self {
            Value::Artifact(artifact) => Some(artifact),
            Value::Link(_) => None,
        }
    }

    pub fn into_artifact(self) -> Option<ArtifactRef> {
        match self {
            Value::Artifact(artifact) => Some(artifact),
            Value::Link(_) => None,
        }
    }
}

impl From<ArtifactRef> for Value {
    fn from(value: ArtifactRef) -> Self {
        Value::Artifact(value)
    }
}

/// Plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Text(String);

impl Text {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Artifact for Text {
    fn kind(&self) -> &str {
        KIND_TEXT
    }
}

/// An immutable string map. Edits produce a new map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapArtifact(BTreeMap<String, String>);

impl MapArtifact {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self(entries)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn with(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut entries = self.0.clone();
        entries.insert(key.into(), value.into());
        Self(entries)
    }

    pub fn without(&self, key: &str) -> Self {
        let mut entries = self.0.clone();
        entries.remove(key);
        Self(entries)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapArtifact {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

impl Artifact for MapArtifact {
    fn kind(&self) -> &str {
        KIND_MAP
    }
}

/// A raw file. Backends copy the file instead of serializing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileArtifact {
    path: PathBuf,
}

impl FileArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Artifact for FileArtifact {
    fn kind(&self) -> &str {
        KIND_FILE
    }
}
