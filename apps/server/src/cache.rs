use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Process-local cache with time-boxed entries and substring invalidation.
///
/// Not shared between processes: with more than one server instance each keeps
/// its own view, so callers must treat cached values as advisory.
#[derive(Debug, Clone)]
pub struct Cache<V> {
    entries: Arc<DashMap<String, (Instant, V)>>,
    /// Bumped by every [`Cache::invalidate`].
    generation: Arc<AtomicU64>,
    ttl: Duration,
}

impl<V: Clone> Cache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
            ttl,
        }
    }

    /// Returns a live entry, dropping it if it has expired.
    pub fn get(&self, key: &str) -> Option<V> {
        {
            // The read guard must be released before `remove` below.
            let entry = self.entries.get(key)?;
            let (stored_at, value) = entry.value();
            if stored_at.elapsed() <= self.ttl {
                return Some(value.clone());
            }
        }
        self.entries.remove(key);
        None
    }

    #[cfg(test)]
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.entries.insert(key.into(), (Instant::now(), value));
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Inserts only if no invalidation ran since `generation` was read.
    ///
    /// The check happens under the key's shard lock, and `invalidate` bumps the
    /// counter before sweeping, so a value computed before an invalidation
    /// either is skipped here or is swept right after.
    pub fn insert_if_current(&self, key: impl Into<String>, value: V, generation: u64) -> bool {
        let entry = self.entries.entry(key.into());
        if self.generation() != generation {
            return false;
        }
        entry.insert((Instant::now(), value));
        true
    }

    /// Removes every key containing `pattern`. Returns how many were removed.
    pub fn invalidate(&self, pattern: &str) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.contains(pattern));
        before - self.entries.len()
    }

    /// Drops expired entries. Called periodically from a background task.
    pub fn evict_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, (stored_at, _)| stored_at.elapsed() <= ttl);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
