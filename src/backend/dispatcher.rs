//! Static dispatch over the tail backends a configuration can select.

use super::Backend;
use super::local::LocalFileBackend;
use super::remote::RemoteSyncBackend;
use crate::artifact::Value;
use crate::descriptor::Descriptor;
use crate::error::DepotResult;
use crate::meta::MetaData;
use crate::transfer::ScpTransfer;
use std::path::PathBuf;

pub enum BackendDispatcher {
    Local(LocalFileBackend),
    Remote(RemoteSyncBackend<ScpTransfer>),
}

impl BackendDispatcher {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Remote(_) => "remote",
        }
    }
}

impl From<LocalFileBackend> for BackendDispatcher {
    fn from(backend: LocalFileBackend) -> Self {
        Self::Local(backend)
    }
}

impl From<RemoteSyncBackend<ScpTransfer>> for BackendDispatcher {
    fn from(backend: RemoteSyncBackend<ScpTransfer>) -> Self {
        Self::Remote(backend)
    }
}

impl Backend for BackendDispatcher {
    fn get(&self, desc: &Descriptor) -> DepotResult<Option<Value>> {
        match self {
            Self::Local(backend) => backend.get(desc),
            Self::Remote(backend) => backend.get(desc),
        }
    }

    fn put(&self, desc: &Descriptor, value: Value) -> DepotResult<()> {
        match self {
            Self::Local(backend) => backend.put(desc, value),
            Self::Remote(backend) => backend.put(desc, value),
        }
    }

    fn remove(&self, desc: &Descriptor) -> DepotResult<()> {
        match self {
            Self::Local(backend) => backend.remove(desc),
            Self::Remote(backend) => backend.remove(desc),
        }
    }

    fn contains(&self, desc: &Descriptor) -> DepotResult<bool> {
        match self {
            Self::Local(backend) => backend.contains(desc),
            Self::Remote(backend) => backend.contains(desc),
        }
    }

    fn get_raw(&self, desc: &Descriptor) -> DepotResult<Option<Vec<u8>>> {
        match self {
            Self::Local(backend) => backend.get_raw(desc),
            Self::Remote(backend) => backend.get_raw(desc),
        }
    }

    fn get_metadata(&self, desc: &Descriptor) -> DepotResult<Option<MetaData>> {
        match self {
            Self::Local(backend) => backend.get_metadata(desc),
            Self::Remote(backend) => backend.get_metadata(desc),
        }
    }

    fn local_path(&self, desc: &Descriptor) -> DepotResult<PathBuf> {
        match self {
            Self::Local(backend) => backend.local_path(desc),
            Self::Remote(backend) => backend.local_path(desc),
        }
    }

    fn load_keys(&self, partial: &Descriptor) -> DepotResult<Vec<Descriptor>> {
        match self {
            Self::Local(backend) => backend.load_keys(partial),
            Self::Remote(backend) => backend.load_keys(partial),
        }
    }

    fn flush(&self) -> DepotResult<()> {
        match self {
            Self::Local(backend) => backend.flush(),
            Self::Remote(backend) => backend.flush(),
        }
    }

    fn init(&self) -> DepotResult<()> {
        match self {
            Self::Local(backend) => backend.init(),
            Self::Remote(backend) => backend.init(),
        }
    }
}
