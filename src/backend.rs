//! Storage tiers behind the [Depot](crate::Depot).
//!
//! Every tier implements [Backend]. Tiers can wrap each other: the usual chain is a
//! [write_behind::WriteBehindBackend] in front of a [remote::RemoteSyncBackend], which in turn
//! keeps its copies in a [local::LocalFileBackend].

use crate::artifact::Value;
use crate::descriptor::Descriptor;
use crate::error::DepotResult;
use crate::meta::MetaData;
use std::path::PathBuf;
use std::sync::Arc;

pub mod dispatcher;
pub mod local;
pub mod remote;
pub mod staged_file;
pub mod write_behind;

#[cfg(test)]
pub(crate) mod tests;

/// The storage contract shared by all tiers.
pub trait Backend: Send + Sync {
    /// The stored value, or `None` if nothing is stored under `desc`.
    fn get(&self, desc: &Descriptor) -> DepotResult<Option<Value>>;

    fn put(&self, desc: &Descriptor, value: Value) -> DepotResult<()>;

    /// Removes the value. Removing something that does not exist is not an error.
    fn remove(&self, desc: &Descriptor) -> DepotResult<()>;

    fn contains(&self, desc: &Descriptor) -> DepotResult<bool>;

    /// The stored bytes without decoding them, used to rescue damaged artifacts.
    fn get_raw(&self, desc: &Descriptor) -> DepotResult<Option<Vec<u8>>>;

    fn get_metadata(&self, desc: &Descriptor) -> DepotResult<Option<MetaData>>;

    /// Path of the local file holding `desc`, whether or not it exists yet.
    fn local_path(&self, desc: &Descriptor) -> DepotResult<PathBuf>;

    /// Stored descriptors matched by `partial` (see [Descriptor::partial_match]).
    fn load_keys(&self, partial: &Descriptor) -> DepotResult<Vec<Descriptor>>;

    /// Persists everything that has been accepted but not yet written.
    fn flush(&self) -> DepotResult<()> {
        Ok(())
    }

    fn init(&self) -> DepotResult<()> {
        Ok(())
    }
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn get(&self, desc: &Descriptor) -> DepotResult<Option<Value>> {
        (**self).get(desc)
    }

    fn put(&self, desc: &Descriptor, value: Value) -> DepotResult<()> {
        (**self).put(desc, value)
    }

    fn remove(&self, desc: &Descriptor) -> DepotResult<()> {
        (**self).remove(desc)
    }

    fn contains(&self, desc: &Descriptor) -> DepotResult<bool> {
        (**self).contains(desc)
    }

    fn get_raw(&self, desc: &Descriptor) -> DepotResult<Option<Vec<u8>>> {
        (**self).get_raw(desc)
    }

    fn get_metadata(&self, desc: &Descriptor) -> DepotResult<Option<MetaData>> {
        (**self).get_metadata(desc)
    }

    fn local_path(&self, desc: &Descriptor) -> DepotResult<PathBuf> {
        (**self).local_path(desc)
    }

    fn load_keys(&self, partial: &Descriptor) -> DepotResult<Vec<Descriptor>> {
        (**self).load_keys(partial)
    }

    fn flush(&self) -> DepotResult<()> {
        (**self).flush()
    }

    fn init(&self) -> DepotResult<()> {
        (**self).init()
    }
}
