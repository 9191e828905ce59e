//! Mutual exclusion per key, for keys compared by value.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

struct Holder {
    owner: ThreadId,
    depth: usize,
}

/// Locks keys independently of each other. A thread may lock a key it already holds.
///
/// Holders are only recorded while a key is locked, so the table stays as small as the number
/// of keys currently in use.
pub struct KeyedLocker<K> {
    held: Mutex<HashMap<K, Holder>>,
    released: Condvar,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocker<K> {
    fn default() -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashMap<K, Holder>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until `key` is free or held by the calling thread.
    pub fn lock(&self, key: K) -> KeyGuard<'_, K> {
        let me = thread::current().id();
        let mut held = self.held();
        loop {
            match held.get(&key).map(|holder| holder.owner) {
                None => {
                    held.insert(key.clone(), Holder { owner: me, depth: 1 });
                    break;
                }
                Some(owner) if owner == me => {
                    if let Some(holder) = held.get_mut(&key) {
                        holder.depth += 1;
                    }
                    break;
                }
                Some(_) => {
                    held = self
                        .released
                        .wait(held)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        KeyGuard { locker: self, key }
    }

    pub fn is_locked(&self, key: &K) -> bool {
        self.held().contains_key(key)
    }

    fn release(&self, key: &K) {
        let mut held = self.held();
        let free = match held.get_mut(key) {
            Some(holder) => {
                holder.depth -= 1;
                holder.depth == 0
            }
            None => false,
        };
        if free {
            held.remove(key);
            drop(held);
            self.released.notify_all();
        }
    }
}

/// Releases the key when dropped.
#[must_use = "the key is unlocked as soon as the guard is dropped"]
pub struct KeyGuard<'a, K: Eq + Hash + Clone> {
    locker: &'a KeyedLocker<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        self.locker.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_lock_is_reentrant() {
        let locker = KeyedLocker::new();
        let outer = locker.lock("a");
        let inner = locker.lock("a");
        drop(inner);
        assert!(locker.is_locked(&"a"));
        drop(outer);
        assert!(!locker.is_locked(&"a"));
    }

    #[test]
    fn test_different_keys_do_not_block_each_other() {
        let locker = Arc::new(KeyedLocker::new());
        let _a = locker.lock("a".to_string());
        let other = Arc::clone(&locker);
        thread::spawn(move || {
            let _b = other.lock("b".to_string());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_same_key_is_exclusive() {
        let locker = Arc::new(KeyedLocker::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let locker = Arc::clone(&locker);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _guard = locker.lock(42);
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(50));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(!locker.is_locked(&42));
    }
}
