//! Buffers writes in memory and persists them to a base backend after a delay.
//!
//! Pending values are served to readers straight from memory. A single worker thread writes
//! each pending descriptor once its due time has come, always writing the newest value, so a
//! burst of puts to one descriptor costs one physical write. Removals are queued as tombstones.

use super::Backend;
use crate::artifact::{ArtifactRef, Value, same_artifact};
use crate::descriptor::Descriptor;
use crate::error::{DepotError, DepotResult};
use crate::merge::MergerRegistry;
use crate::meta::MetaData;
use crate::util::memory::{MemoryProbe, ProcMeminfo};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Consecutive failures of one descriptor after which every retry is logged as an error.
const FAILURES_BEFORE_ERROR: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct WriteBehindSettings {
    /// Nominal time between a put and its physical write.
    pub delay: Duration,
    /// Relative spread applied to `delay`, e.g. `0.1` for ±5%.
    pub jitter: f64,
    /// Delay used while available memory is below `high_memory_threshold`.
    pub short_delay: Duration,
    pub high_memory_threshold: u64,
    /// Below this much available memory, writes are flushed right away.
    pub low_memory_threshold: u64,
}

impl Default for WriteBehindSettings {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(60),
            jitter: 0.1,
            short_delay: Duration::from_secs(1),
            high_memory_threshold: 100 * 1024 * 1024,
            low_memory_threshold: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Value(Value),
    Tombstone,
}

struct Pending {
    desc: Descriptor,
    slot: Slot,
    due: Instant,
    ticket: u64,
    version: u64,
    failures: u32,
}

#[derive(Default)]
struct Queue {
    pending: HashMap<Descriptor, Pending>,
    schedule: BTreeMap<(Instant, u64), Descriptor>,
    counter: u64,
    shutdown: bool,
}

struct Shared<B> {
    base: B,
    settings: WriteBehindSettings,
    memory: Box<dyn MemoryProbe>,
    mergers: Arc<MergerRegistry>,
    queue: Mutex<Queue>,
    wake: Condvar,
    write_lock: Mutex<()>,
}

impl<B: Backend> Shared<B> {
    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delay(&self) -> Duration {
        match self.memory.available_bytes() {
            Some(available) if available < self.settings.low_memory_threshold => {
                debug!(available, "low on memory, writing through");
                Duration::ZERO
            }
            Some(available) if available < self.settings.high_memory_threshold => {
                self.settings.short_delay
            }
            _ => jittered(self.settings.delay, self.settings.jitter),
        }
    }

    fn enqueue(&self, desc: &Descriptor, slot: Slot) {
        let due = Instant::now() + self.delay();
        let key = desc.key();
        let mut queue = self.queue();
        queue.counter += 1;
        let version = queue.counter;
        let Queue {
            pending, schedule, ..
        } = &mut *queue;
        match pending.get_mut(&key) {
            Some(entry) => {
                entry.desc = desc.clone();
                entry.slot = slot;
                entry.version = version;
                let still_scheduled = schedule.remove(&(entry.due, entry.ticket)).is_some();
                if !still_scheduled || due < entry.due {
                    entry.due = due;
                }
                schedule.insert((entry.due, entry.ticket), key);
            }
            None => {
                schedule.insert((due, version), key.clone());
                pending.insert(
                    key,
                    Pending {
                        desc: desc.clone(),
                        slot,
                        due,
                        ticket: version,
                        version,
                        failures: 0,
                    },
                );
            }
        }
        drop(queue);
        self.wake.notify_all();
    }

    fn slot(&self, desc: &Descriptor) -> Option<Slot> {
        self.queue().pending.get(desc).map(|entry| entry.slot.clone())
    }

    /// Writes the current pending value of `key` to the base backend.
    fn flush_one(&self, key: &Descriptor) -> DepotResult<()> {
        let _writing = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (desc, slot, version) = match self.queue().pending.get(key) {
            Some(entry) => (entry.desc.clone(), entry.slot.clone(), entry.version),
            None => return Ok(()),
        };
        let result = match slot {
            Slot::Tombstone => self.base.remove(&desc).map(|()| None),
            Slot::Value(value) => self.write(&desc, value),
        };

        let mut queue = self.queue();
        let Queue {
            pending, schedule, ..
        } = &mut *queue;
        match result {
            Ok(merged) => {
                if pending.get(key).is_some_and(|entry| entry.version == version) {
                    if let Some(entry) = pending.remove(key) {
                        schedule.remove(&(entry.due, entry.ticket));
                    }
                    trace!(%desc, "written behind");
                } else if let (Some(merged), Some(entry)) = (merged, pending.get_mut(key)) {
                    if entry.desc.merge_snapshot().is_some() {
                        entry.desc.remark_for_merge(merged);
                    }
                }
                Ok(())
            }
            Err(err) => {
                if let Some(entry) = pending.get_mut(key) {
                    entry.failures += 1;
                    schedule.remove(&(entry.due, entry.ticket));
                    entry.due = Instant::now() + self.settings.delay;
                    schedule.insert((entry.due, entry.ticket), key.clone());
                    if entry.failures > FAILURES_BEFORE_ERROR {
                        error!(%desc, failures = entry.failures, error = %err, "write-behind keeps failing");
                    } else {
                        warn!(%desc, error = %err, "write-behind failed, will retry");
                    }
                }
                Err(err)
            }
        }
    }

    /// Puts `value`, first merging it with the stored value if `desc` carries a snapshot.
    /// Returns the merged artifact if a merge happened.
    fn write(&self, desc: &Descriptor, value: Value) -> DepotResult<Option<ArtifactRef>> {
        if let (Value::Artifact(after), Some(before)) = (&value, desc.merge_snapshot()) {
            match self.base.get(desc) {
                Ok(Some(Value::Artifact(latest))) if !same_artifact(&latest, after) => {
                    if let Some(merged) = self.mergers.merge(before, after, &latest)? {
                        self.base.put(desc, Value::Artifact(merged.clone()))?;
                        return Ok(Some(merged));
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(%desc, error = %err, "cannot read stored value for merge, overwriting");
                }
            }
        }
        self.base.put(desc, value)?;
        Ok(None)
    }
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = 1.0 + (rand::random::<f64>() - 0.5) * jitter;
    delay.mul_f64(factor.max(0.0))
}

fn run<B: Backend>(shared: Arc<Shared<B>>) {
    let mut queue = shared.queue();
    loop {
        if queue.shutdown {
            return;
        }
        let now = Instant::now();
        let next = queue.schedule.first_key_value().map(|(&slot, _)| slot);
        match next {
            Some(slot) if slot.0 <= now => {
                let key = queue.schedule.remove(&slot);
                drop(queue);
                if let Some(key) = key {
                    // Failures are logged and rescheduled by flush_one.
                    let _ = shared.flush_one(&key);
                }
                queue = shared.queue();
            }
            Some((due, _)) => {
                queue = shared
                    .wake
                    .wait_timeout(queue, due - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            None => {
                queue = shared
                    .wake
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

/// A backend that accepts writes into memory and persists them to `B` later.
///
/// Call [Backend::flush] before shutting down; dropping the backend flushes as well, but can
/// only log failures.
pub struct WriteBehindBackend<B: Backend + 'static> {
    shared: Arc<Shared<B>>,
    worker: Option<JoinHandle<()>>,
}

impl<B: Backend + 'static> WriteBehindBackend<B> {
    pub fn new(base: B, settings: WriteBehindSettings) -> DepotResult<Self> {
        Self::with_parts(
            base,
            settings,
            Box::new(ProcMeminfo),
            Arc::new(MergerRegistry::with_defaults()),
        )
    }

    pub fn with_parts(
        base: B,
        settings: WriteBehindSettings,
        memory: Box<dyn MemoryProbe>,
        mergers: Arc<MergerRegistry>,
    ) -> DepotResult<Self> {
        debug!(delay = ?settings.delay, jitter = settings.jitter, "starting write-behind worker");
        let shared = Arc::new(Shared {
            base,
            settings,
            memory,
            mergers,
            queue: Mutex::new(Queue::default()),
            wake: Condvar::new(),
            write_lock: Mutex::new(()),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("depot-write-behind".to_string())
                .spawn(move || run(shared))
                .map_err(DepotError::Spawn)?
        };
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn base(&self) -> &B {
        &self.shared.base
    }

    /// Number of descriptors whose latest value has not been written yet.
    pub fn pending_len(&self) -> usize {
        self.shared.queue().pending.len()
    }
}

impl<B: Backend + 'static> Backend for WriteBehindBackend<B> {
    fn get(&self, desc: &Descriptor) -> DepotResult<Option<Value>> {
        match self.shared.slot(desc) {
            Some(Slot::Value(value)) => Ok(Some(value)),
            Some(Slot::Tombstone) => Ok(None),
            None => self.shared.base.get(desc),
        }
    }

    fn put(&self, desc: &Descriptor, value: Value) -> DepotResult<()> {
        self.shared.enqueue(desc, Slot::Value(value));
        Ok(())
    }

    fn remove(&self, desc: &Descriptor) -> DepotResult<()> {
        self.shared.enqueue(desc, Slot::Tombstone);
        Ok(())
    }

    fn contains(&self, desc: &Descriptor) -> DepotResult<bool> {
        match self.shared.slot(desc) {
            Some(Slot::Value(_)) => Ok(true),
            Some(Slot::Tombstone) => Ok(false),
            None => self.shared.base.contains(desc),
        }
    }

    fn get_raw(&self, desc: &Descriptor) -> DepotResult<Option<Vec<u8>>> {
        match self.shared.slot(desc) {
            Some(Slot::Tombstone) => Ok(None),
            _ => self.shared.base.get_raw(desc),
        }
    }

    fn get_metadata(&self, desc: &Descriptor) -> DepotResult<Option<MetaData>> {
        match self.shared.slot(desc) {
            Some(Slot::Tombstone) => Ok(None),
            _ => self.shared.base.get_metadata(desc),
        }
    }

    fn local_path(&self, desc: &Descriptor) -> DepotResult<PathBuf> {
        self.shared.base.local_path(desc)
    }

    fn load_keys(&self, partial: &Descriptor) -> DepotResult<Vec<Descriptor>> {
        let mut keys = self.shared.base.load_keys(partial)?;
        let queue = self.shared.queue();
        keys.retain(|key| {
            !matches!(
                queue.pending.get(key).map(|entry| &entry.slot),
                Some(Slot::Tombstone)
            )
        });
        for entry in queue.pending.values() {
            if matches!(entry.slot, Slot::Value(_))
                && partial.partial_match(&entry.desc)
                && !keys.contains(&entry.desc)
            {
                keys.push(entry.desc.key());
            }
        }
        Ok(keys)
    }

    /// Writes every pending descriptor, repeating until nothing is pending.
    fn flush(&self) -> DepotResult<()> {
        loop {
            let batch: Vec<Descriptor> = self.shared.queue().pending.keys().cloned().collect();
            if batch.is_empty() {
                return self.shared.base.flush();
            }
            for key in &batch {
                self.shared.flush_one(key)?;
            }
        }
    }

    fn init(&self) -> DepotResult<()> {
        self.shared.base.init()
    }
}

impl<B: Backend + 'static> Drop for WriteBehindBackend<B> {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            error!(error = %err, pending = self.pending_len(), "dropping unwritten values");
        }
        self.shared.queue().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("write-behind worker panicked");
            }
        }
    }
}
