//! An in-memory backend that counts physical writes.

use crate::artifact::Value;
use crate::backend::Backend;
use crate::descriptor::Descriptor;
use crate::error::{DepotError, DepotResult, IoPathError};
use crate::meta::MetaData;
use chrono::Utc;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
pub struct RecordingBackend {
    values: Mutex<HashMap<Descriptor, (Descriptor, Value)>>,
    puts: AtomicUsize,
    removes: AtomicUsize,
    failing: AtomicBool,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    /// Makes puts and removes fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn values(&self) -> MutexGuard<'_, HashMap<Descriptor, (Descriptor, Value)>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_failing(&self, desc: &Descriptor) -> DepotResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DepotError::Io(IoPathError::new(
                io::Error::other("simulated failure"),
                desc.storage_path(),
            )));
        }
        Ok(())
    }
}

impl Backend for RecordingBackend {
    fn get(&self, desc: &Descriptor) -> DepotResult<Option<Value>> {
        Ok(self.values().get(desc).map(|(_, value)| value.clone()))
    }

    fn put(&self, desc: &Descriptor, value: Value) -> DepotResult<()> {
        self.check_failing(desc)?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.values().insert(desc.key(), (desc.key(), value));
        Ok(())
    }

    fn remove(&self, desc: &Descriptor) -> DepotResult<()> {
        self.check_failing(desc)?;
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.values().remove(desc);
        Ok(())
    }

    fn contains(&self, desc: &Descriptor) -> DepotResult<bool> {
        Ok(self.values().contains_key(desc))
    }

    fn get_raw(&self, _desc: &Descriptor) -> DepotResult<Option<Vec<u8>>> {
        Ok(None)
    }

    fn get_metadata(&self, desc: &Descriptor) -> DepotResult<Option<MetaData>> {
        Ok(self
            .values()
            .get(desc)
            .map(|(stored, _)| MetaData::new(stored, stored.storage_path()).written_at(Utc::now())))
    }

    fn local_path(&self, _desc: &Descriptor) -> DepotResult<PathBuf> {
        Err(DepotError::Unsupported {
            backend: "RecordingBackend",
            operation: "local_path",
        })
    }

    fn load_keys(&self, partial: &Descriptor) -> DepotResult<Vec<Descriptor>> {
        Ok(self
            .values()
            .values()
            .map(|(stored, _)| stored)
            .filter(|stored| partial.partial_match(stored))
            .cloned()
            .collect())
    }
}
