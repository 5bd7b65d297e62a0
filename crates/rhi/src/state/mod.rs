//! Content-addressed caches of immutable GPU state objects.
//!
//! Each cache maps the stable hash of a description to the single live
//! object built from it. Lookups take a shared read lock; a miss takes the
//! write lock, checks again for a racing creator, then builds and inserts.
//! Returned objects are shared (`Arc`) and immutable; only the owning cache
//! decides when an entry goes away.

pub mod fixed_function;
pub mod sampler;

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::RhiResult;

/// Stable hash of a description.
///
/// Uses a fixed-key SipHash so equal descriptions hash equally for the life
/// of the process.
pub fn description_hash<T: Hash + ?Sized>(desc: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    desc.hash(&mut hasher);
    hasher.finish()
}

/// Get-or-create cache keyed by description hash.
pub struct StateCache<T> {
    label: &'static str,
    entries: RwLock<HashMap<u64, Arc<T>>>,
}

impl<T> StateCache<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the object cached for `hash`, building it with `create` on a miss.
    ///
    /// `create` runs at most once per hash even when several threads miss
    /// at the same time.
    pub fn get_or_create_hashed(
        &self,
        hash: u64,
        create: impl FnOnce() -> RhiResult<T>,
    ) -> RhiResult<Arc<T>> {
        if let Some(existing) = self.entries.read().get(&hash) {
            return Ok(Arc::clone(existing));
        }

        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&hash) {
            return Ok(Arc::clone(existing));
        }

        let created = Arc::new(create()?);
        entries.insert(hash, Arc::clone(&created));
        debug!("{} cache: created {:016x} ({} entries)", self.label, hash, entries.len());
        Ok(created)
    }

    /// Hashes `desc` and forwards to [`StateCache::get_or_create_hashed`].
    pub fn get_or_create<D: Hash + ?Sized>(
        &self,
        desc: &D,
        create: impl FnOnce(u64) -> RhiResult<T>,
    ) -> RhiResult<Arc<T>> {
        let hash = description_hash(desc);
        self.get_or_create_hashed(hash, || create(hash))
    }

    pub fn get(&self, hash: u64) -> Option<Arc<T>> {
        self.entries.read().get(&hash).cloned()
    }

    /// Removes and returns every entry matching `predicate`.
    pub fn evict_where(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<Arc<T>> {
        let mut entries = self.entries.write();
        let doomed: Vec<u64> = entries
            .iter()
            .filter(|(_, value)| predicate(value))
            .map(|(hash, _)| *hash)
            .collect();
        doomed
            .into_iter()
            .filter_map(|hash| entries.remove(&hash))
            .collect()
    }

    /// Removes every entry.
    pub fn clear(&self) -> Vec<Arc<T>> {
        self.entries.write().drain().map(|(_, value)| value).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Hash)]
    struct Desc {
        a: u32,
        b: &'static str,
    }

    #[test]
    fn test_same_description_same_object() {
        let cache: StateCache<u32> = StateCache::new("test");
        let first = cache.get_or_create(&Desc { a: 1, b: "x" }, |_| Ok(7)).unwrap();
        let second = cache.get_or_create(&Desc { a: 1, b: "x" }, |_| Ok(8)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, 7);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_different_descriptions_different_objects() {
        let cache: StateCache<u32> = StateCache::new("test");
        let first = cache.get_or_create(&Desc { a: 1, b: "x" }, |_| Ok(1)).unwrap();
        let second = cache.get_or_create(&Desc { a: 1, b: "y" }, |_| Ok(2)).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_failed_creation_is_not_cached() {
        let cache: StateCache<u32> = StateCache::new("test");
        let desc = Desc { a: 3, b: "z" };
        let result = cache.get_or_create(&desc, |_| {
            Err(crate::RhiError::PipelineError("boom".into()))
        });
        assert!(result.is_err());
        assert!(cache.is_empty());
        assert_eq!(*cache.get_or_create(&desc, |_| Ok(5)).unwrap(), 5);
    }

    #[test]
    fn test_concurrent_misses_create_once() {
        let cache: Arc<StateCache<usize>> = Arc::new(StateCache::new("test"));
        let created = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let created = Arc::clone(&created);
                thread::spawn(move || {
                    cache
                        .get_or_create(&Desc { a: 42, b: "shared" }, |_| {
                            Ok(created.fetch_add(1, Ordering::SeqCst))
                        })
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<Arc<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_evict_where() {
        let cache: StateCache<u32> = StateCache::new("test");
        for a in 0..4 {
            cache.get_or_create(&Desc { a, b: "e" }, move |_| Ok(a)).unwrap();
        }
        let evicted = cache.evict_where(|value| value % 2 == 0);
        assert_eq!(evicted.len(), 2);
        assert_eq!(cache.len(), 2);
    }
}
