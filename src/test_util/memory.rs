use crate::util::memory::MemoryProbe;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reports a configurable amount of available memory.
#[derive(Debug, Default)]
pub struct FixedMemory {
    available: AtomicU64,
}

impl FixedMemory {
    pub fn new(available: u64) -> Self {
        Self {
            available: AtomicU64::new(available),
        }
    }

    pub fn set(&self, available: u64) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemory {
    fn available_bytes(&self) -> Option<u64> {
        Some(self.available.load(Ordering::SeqCst))
    }
}
