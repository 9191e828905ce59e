//! Sample artifacts exercising the optional capabilities.

use crate::artifact::{Artifact, ArtifactRef, Lifecycle};
use crate::codec::SerdeCodec;
use crate::descriptor::Descriptor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn alive() -> AtomicBool {
    AtomicBool::new(true)
}

/// An artifact with a lifecycle that knows its own descriptor.
#[derive(Debug, Serialize, Deserialize)]
pub struct Widget {
    id: String,
    revision: u32,
    #[serde(default)]
    guarded: bool,
    #[serde(skip, default = "alive")]
    live: AtomicBool,
    #[serde(skip)]
    initialized: AtomicBool,
}

impl Widget {
    pub const KIND: &'static str = "Widget";

    pub fn new(id: impl Into<String>, revision: u32) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            revision,
            guarded: false,
            live: alive(),
            initialized: AtomicBool::new(false),
        })
    }

    /// A widget whose live instances must not be overwritten.
    pub fn guarded(id: impl Into<String>, revision: u32) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            revision,
            guarded: true,
            live: alive(),
            initialized: AtomicBool::new(false),
        })
    }

    pub fn codec() -> SerdeCodec<Widget> {
        SerdeCodec::new()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}

impl Lifecycle for Widget {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn kill(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

impl Artifact for Widget {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn descriptor(&self) -> Option<Descriptor> {
        Some(Descriptor::new(Self::KIND, &self.id))
    }

    fn lifecycle(&self) -> Option<&dyn Lifecycle> {
        Some(self)
    }

    fn not_overwritable(&self) -> bool {
        self.guarded
    }

    fn init(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }
}

/// A composite artifact owning modules. Only its name is persisted.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Folder {
    name: String,
    #[serde(skip)]
    modules: Vec<(Descriptor, ArtifactRef)>,
}

impl Folder {
    pub const KIND: &'static str = "Folder";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            modules: Vec::new(),
        }
    }

    pub fn with_module(mut self, desc: Descriptor, module: ArtifactRef) -> Self {
        self.modules.push((desc, module));
        self
    }

    pub fn codec() -> SerdeCodec<Folder> {
        SerdeCodec::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Artifact for Folder {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn modules(&self) -> Vec<(Descriptor, ArtifactRef)> {
        self.modules.clone()
    }
}
