//! Bounded in-memory caches of decoded images.
//!
//! [`LruMemoryCache`] is a plain least-recently-used cache bounded by the byte size of its
//! entries. [`TwoTierMemoryCache`] puts a second, unbounded tier of weak references behind such
//! a strong tier: entries evicted from the strong tier stay retrievable for as long as anybody
//! else still holds on to the image, without counting towards the strong tier's budget.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use lru::LruCache;

use super::{CachedImage, MemoryKey};
use crate::decode::DecodedImage;
use crate::types::DataSource;

/// The contract shared by the memory caches the loader can be configured with.
pub trait MemoryCache: Send + Sync {
    /// Looks up `key`, marking it as most recently used.
    fn get(&self, key: &MemoryKey) -> Option<CachedImage>;

    /// Inserts `image` under `key`, evicting the least recently used entries as necessary.
    fn set(&self, key: MemoryKey, image: CachedImage);

    /// Removes `key`, returning whether it was present.
    fn remove(&self, key: &MemoryKey) -> bool;

    fn clear(&self);

    /// Evicts least recently used entries until at most `size` bytes remain.
    fn trim_to_size(&self, size: u64);

    /// Changes the capacity, evicting entries if the cache is now over budget.
    fn resize(&self, max_size: u64);

    /// The total size in bytes of all entries of the bounded tier.
    fn size(&self) -> u64;

    fn max_size(&self) -> u64;

    /// The number of entries of the bounded tier.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The unsynchronized core of the LRU caches.
///
/// Every mutating method hands the entries it evicted back to the caller.
struct LruState<K: Hash + Eq> {
    entries: LruCache<K, CachedImage>,
    size: u64,
    max_size: u64,
}

impl<K: Hash + Eq + Clone> LruState<K> {
    fn new(max_size: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            size: 0,
            max_size,
        }
    }

    fn get(&mut self, key: &K) -> Option<CachedImage> {
        self.entries.get(key).cloned()
    }

    fn remove(&mut self, key: &K) -> Option<CachedImage> {
        let removed = self.entries.pop(key)?;
        self.size -= removed.size_bytes;
        Some(removed)
    }

    /// Inserts an entry, making room for it first, and returns the value it replaced.
    ///
    /// An entry that is larger than the whole cache is not admitted and handed back as evicted.
    fn insert(
        &mut self,
        key: K,
        image: CachedImage,
        evicted: &mut Vec<(K, CachedImage)>,
    ) -> Option<CachedImage> {
        let previous = self.remove(&key);

        if image.size_bytes > self.max_size {
            evicted.push((key, image));
            return previous;
        }

        self.evict_until(self.max_size - image.size_bytes, evicted);
        self.size += image.size_bytes;
        self.entries.put(key, image);
        previous
    }

    fn evict_until(&mut self, size: u64, evicted: &mut Vec<(K, CachedImage)>) {
        while self.size > size {
            let Some((key, image)) = self.entries.pop_lru() else {
                break;
            };
            self.size -= image.size_bytes;
            evicted.push((key, image));
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.size = 0;
    }
}

/// A least-recently-used cache bounded by the total byte size of its entries.
///
/// The size invariant `size() <= max_size()` holds after every call, as room for a new entry is
/// made *before* it is inserted.
pub struct LruMemoryCache<K: Hash + Eq> {
    state: Mutex<LruState<K>>,
}

impl<K: Hash + Eq + Clone> LruMemoryCache<K> {
    pub fn new(max_size: u64) -> Self {
        Self {
            state: Mutex::new(LruState::new(max_size)),
        }
    }

    pub fn get(&self, key: &K) -> Option<CachedImage> {
        lock(&self.state).get(key)
    }

    /// Whether `key` is cached, without touching its recency.
    pub fn contains(&self, key: &K) -> bool {
        lock(&self.state).entries.contains(key)
    }

    pub fn set(&self, key: K, image: CachedImage) {
        let mut evicted = Vec::new();
        let previous = lock(&self.state).insert(key, image, &mut evicted);
        // evicted images are dropped after the lock is released
        drop((previous, evicted));
    }

    pub fn remove(&self, key: &K) -> bool {
        lock(&self.state).remove(key).is_some()
    }

    pub fn clear(&self) {
        lock(&self.state).clear();
    }

    pub fn trim_to_size(&self, size: u64) {
        let mut evicted = Vec::new();
        lock(&self.state).evict_until(size, &mut evicted);
    }

    pub fn resize(&self, max_size: u64) {
        let mut evicted = Vec::new();
        let mut state = lock(&self.state);
        state.max_size = max_size;
        state.evict_until(max_size, &mut evicted);
    }

    pub fn size(&self) -> u64 {
        lock(&self.state).size
    }

    pub fn max_size(&self) -> u64 {
        lock(&self.state).max_size
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Hash + Eq + Clone> std::fmt::Debug for LruMemoryCache<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("LruMemoryCache")
            .field("len", &state.entries.len())
            .field("size", &state.size)
            .field("max_size", &state.max_size)
            .finish()
    }
}

impl MemoryCache for LruMemoryCache<MemoryKey> {
    fn get(&self, key: &MemoryKey) -> Option<CachedImage> {
        LruMemoryCache::get(self, key)
    }

    fn set(&self, key: MemoryKey, image: CachedImage) {
        LruMemoryCache::set(self, key, image)
    }

    fn remove(&self, key: &MemoryKey) -> bool {
        LruMemoryCache::remove(self, key)
    }

    fn clear(&self) {
        LruMemoryCache::clear(self)
    }

    fn trim_to_size(&self, size: u64) {
        LruMemoryCache::trim_to_size(self, size)
    }

    fn resize(&self, max_size: u64) {
        LruMemoryCache::resize(self, max_size)
    }

    fn size(&self) -> u64 {
        LruMemoryCache::size(self)
    }

    fn max_size(&self) -> u64 {
        LruMemoryCache::max_size(self)
    }

    fn len(&self) -> usize {
        LruMemoryCache::len(self)
    }
}

/// A weakly referenced image that fell out of the strong tier.
#[derive(Debug)]
struct WeakEntry {
    image: Weak<DecodedImage>,
    data_source: DataSource,
    size_bytes: u64,
}

impl WeakEntry {
    fn new(image: &CachedImage) -> Self {
        Self {
            image: Arc::downgrade(&image.image),
            data_source: image.data_source,
            size_bytes: image.size_bytes,
        }
    }

    fn upgrade(&self) -> Option<CachedImage> {
        Some(CachedImage {
            image: self.image.upgrade()?,
            data_source: self.data_source,
            size_bytes: self.size_bytes,
        })
    }
}

struct TwoTierState {
    strong: LruState<MemoryKey>,
    weak: HashMap<MemoryKey, WeakEntry>,
}

impl TwoTierState {
    /// Inserts into the strong tier, demoting whatever it evicts to the weak tier.
    ///
    /// Returns everything that has to be dropped once the lock is released.
    fn insert(&mut self, key: MemoryKey, image: CachedImage) -> Vec<(MemoryKey, CachedImage)> {
        self.weak.remove(&key);
        let mut evicted = Vec::new();
        let previous = self.strong.insert(key.clone(), image, &mut evicted);
        self.demote(&evicted);
        // a replaced value was superseded rather than evicted, so it is not demoted
        evicted.extend(previous.map(|previous| (key, previous)));
        evicted
    }

    fn demote(&mut self, evicted: &[(MemoryKey, CachedImage)]) {
        for (key, image) in evicted {
            self.weak.insert(key.clone(), WeakEntry::new(image));
        }
    }

    fn purge_dead(&mut self) {
        self.weak.retain(|_, entry| entry.image.strong_count() > 0);
    }
}

/// A [`LruMemoryCache`] backed by a second chance tier of weak references.
///
/// A miss in the strong tier consults the weak tier. A weak entry that is still alive is
/// promoted back into the strong tier, subject to the usual size invariant. Weak entries whose
/// image was dropped in the meantime are a miss, and are purged lazily.
pub struct TwoTierMemoryCache {
    state: Mutex<TwoTierState>,
}

impl TwoTierMemoryCache {
    pub fn new(max_size: u64) -> Self {
        Self {
            state: Mutex::new(TwoTierState {
                strong: LruState::new(max_size),
                weak: HashMap::new(),
            }),
        }
    }

    /// The number of entries of the weak tier, including dead ones that were not purged yet.
    pub fn weak_len(&self) -> usize {
        lock(&self.state).weak.len()
    }
}

impl std::fmt::Debug for TwoTierMemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("TwoTierMemoryCache")
            .field("len", &state.strong.entries.len())
            .field("size", &state.strong.size)
            .field("max_size", &state.strong.max_size)
            .field("weak_len", &state.weak.len())
            .finish()
    }
}

impl MemoryCache for TwoTierMemoryCache {
    fn get(&self, key: &MemoryKey) -> Option<CachedImage> {
        let mut state = lock(&self.state);
        if let Some(image) = state.strong.get(key) {
            return Some(image);
        }

        let entry = state.weak.get(key)?;
        let Some(image) = entry.upgrade() else {
            state.weak.remove(key);
            return None;
        };

        tracing::trace!(%key, "promoting weakly referenced image");
        let evicted = state.insert(key.clone(), image.clone());
        drop(state);
        drop(evicted);
        Some(image)
    }

    fn set(&self, key: MemoryKey, image: CachedImage) {
        let evicted = lock(&self.state).insert(key, image);
        drop(evicted);
    }

    fn remove(&self, key: &MemoryKey) -> bool {
        let mut state = lock(&self.state);
        let strong = state.strong.remove(key).is_some();
        let weak = state
            .weak
            .remove(key)
            .is_some_and(|entry| entry.image.strong_count() > 0);
        strong || weak
    }

    fn clear(&self) {
        let mut state = lock(&self.state);
        state.strong.clear();
        state.weak.clear();
    }

    fn trim_to_size(&self, size: u64) {
        let mut evicted = Vec::new();
        let mut state = lock(&self.state);
        state.strong.evict_until(size, &mut evicted);
        state.demote(&evicted);
        drop(evicted);
        state.purge_dead();
    }

    fn resize(&self, max_size: u64) {
        let mut evicted = Vec::new();
        let mut state = lock(&self.state);
        state.strong.max_size = max_size;
        state.strong.evict_until(max_size, &mut evicted);
        state.demote(&evicted);
    }

    fn size(&self) -> u64 {
        lock(&self.state).strong.size
    }

    fn max_size(&self) -> u64 {
        lock(&self.state).strong.max_size
    }

    fn len(&self) -> usize {
        lock(&self.state).strong.entries.len()
    }
}
