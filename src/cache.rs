use crate::model::ChunkKey;
use crate::volume::VoxelData;
use dashmap::DashSet;
use fxhash::FxBuildHasher;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Bounded store of decoded chunks plus the set of keys currently being fetched.
///
/// Entries are evicted least-recently-used first. [`ChunkCache::get`] counts as
/// a use, [`ChunkCache::has`] does not.
pub struct ChunkCache {
    entries: Mutex<LruCache<ChunkKey, Arc<VoxelData>, FxBuildHasher>>,
    loading: DashSet<ChunkKey, FxBuildHasher>,
}

impl ChunkCache {
    /// Create a new [`ChunkCache`] holding at most `capacity` chunks (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::with_hasher(capacity, FxBuildHasher::default())),
            loading: DashSet::with_hasher(FxBuildHasher::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn has(&self, key: &ChunkKey) -> bool {
        self.entries.lock().contains(key)
    }

    pub fn get(&self, key: &ChunkKey) -> Option<Arc<VoxelData>> {
        self.entries.lock().get(key).cloned()
    }

    /// Inserts, evicting the least recently used entry when full.
    pub fn set(&self, key: ChunkKey, chunk: Arc<VoxelData>) {
        self.entries.lock().put(key, chunk);
    }

    pub fn remove(&self, key: &ChunkKey) -> Option<Arc<VoxelData>> {
        self.entries.lock().pop(key)
    }

    pub fn is_loading(&self, key: &ChunkKey) -> bool {
        self.loading.contains(key)
    }

    /// Marks `key` as in flight. Returns false if it already was.
    pub fn start_loading(&self, key: ChunkKey) -> bool {
        self.loading.insert(key)
    }

    pub fn done_loading(&self, key: &ChunkKey) {
        self.loading.remove(key);
    }

    /// Marks `key` as in flight and returns a guard that clears the mark when
    /// dropped, or `None` if another fetch already holds it.
    pub fn begin_load(self: &Arc<Self>, key: ChunkKey) -> Option<LoadTicket> {
        self.start_loading(key.clone()).then(|| LoadTicket {
            cache: self.clone(),
            key,
        })
    }

    /// Drops all entries and in-flight markers.
    pub fn clear(&self) {
        self.entries.lock().clear();
        self.loading.clear();
    }

    /// Return the number of chunks in the cache.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn loading_count(&self) -> usize {
        self.loading.len()
    }

    /// Cached keys, most recently used first.
    pub fn keys(&self) -> Vec<ChunkKey> {
        self.entries.lock().iter().map(|(k, _)| k.clone()).collect()
    }
}

/// In-flight marker for one fetch attempt. Dropping it, on any path, releases
/// the key so a later pass can retry.
#[derive(derive_more::Debug)]
pub struct LoadTicket {
    #[debug(skip)]
    cache: Arc<ChunkCache>,
    key: ChunkKey,
}
impl LoadTicket {
    pub fn key(&self) -> &ChunkKey {
        &self.key
    }
}
impl Drop for LoadTicket {
    fn drop(&mut self) {
        self.cache.done_loading(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChunkAddress;

    fn key(x: usize) -> ChunkKey {
        ChunkKey::new("p".into(), Arc::from([0usize]), ChunkAddress::new(0, x, 0, Some(0)))
    }

    fn chunk(v: u8) -> Arc<VoxelData> {
        Arc::new(VoxelData::U8(vec![v; 4]))
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ChunkCache::new(2);
        cache.set(key(0), chunk(0));
        cache.set(key(1), chunk(1));
        // touch 0 so 1 becomes the eviction candidate
        assert!(cache.get(&key(0)).is_some());
        cache.set(key(2), chunk(2));
        assert_eq!(cache.len(), 2);
        assert!(cache.has(&key(0)));
        assert!(!cache.has(&key(1)));
        assert!(cache.has(&key(2)));
    }

    #[test]
    fn has_does_not_refresh() {
        let cache = ChunkCache::new(2);
        cache.set(key(0), chunk(0));
        cache.set(key(1), chunk(1));
        assert!(cache.has(&key(0)));
        cache.set(key(2), chunk(2));
        assert!(!cache.has(&key(0)));
        assert_eq!(cache.keys(), vec![key(2), key(1)]);
    }

    #[test]
    fn keys_differ_by_level_and_slice() {
        let cache = ChunkCache::new(8);
        let a = key(0);
        let mut b = key(0);
        b.address.level = 1;
        let c = ChunkKey::new("p".into(), Arc::from([1usize]), a.address);
        cache.set(a.clone(), chunk(1));
        assert!(!cache.has(&b));
        assert!(!cache.has(&c));
        assert_eq!(cache.get(&a).unwrap().get(0), Some(1.0));
    }

    #[test]
    fn load_ticket_is_single_flight() {
        let cache = Arc::new(ChunkCache::new(4));
        let ticket = cache.begin_load(key(3)).unwrap();
        assert!(cache.is_loading(&key(3)));
        assert!(cache.begin_load(key(3)).is_none());
        assert_eq!(cache.loading_count(), 1);
        drop(ticket);
        assert!(!cache.is_loading(&key(3)));
        assert!(cache.begin_load(key(3)).is_some());
    }

    #[test]
    fn concurrent_begin_load_hands_out_one_ticket() {
        let cache = Arc::new(ChunkCache::new(4));
        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let cache = cache.clone();
                    s.spawn(move || cache.begin_load(key(1)).map(std::mem::forget).is_some() as usize)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
        assert!(cache.is_loading(&key(1)));
    }

    #[test]
    fn clear_drops_entries_and_markers() {
        let cache = Arc::new(ChunkCache::new(4));
        cache.set(key(0), chunk(0));
        assert!(cache.start_loading(key(1)));
        assert!(!cache.start_loading(key(1)));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.loading_count(), 0);
        assert!(cache.remove(&key(0)).is_none());
    }

    #[test]
    fn zero_capacity_holds_one() {
        let cache = ChunkCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.set(key(0), chunk(0));
        cache.set(key(1), chunk(1));
        assert_eq!(cache.keys(), vec![key(1)]);
    }
}
