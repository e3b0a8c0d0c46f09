//! Positive object cache: hash to node object, evicted by age.

use crate::object::NodeObject;
use alloy_primitives::B256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Entry {
    object: Arc<NodeObject>,
    last_access: Instant,
}

struct CacheState {
    entries: HashMap<B256, Entry>,
    target_size: usize,
    target_age: Duration,
    hits: u64,
    misses: u64,
}

/// LRU-by-age cache of node objects with a target size and target age.
///
/// `sweep` drops entries older than the target age, then trims oldest-first
/// down to the target size. All operations are non-blocking apart from the
/// interior lock.
pub struct TaggedCache {
    name: String,
    state: Mutex<CacheState>,
}

impl TaggedCache {
    pub fn new(name: impl Into<String>, target_size: usize, target_age: Duration) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                target_size,
                target_age,
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up an object, refreshing its recency on a hit.
    pub fn fetch(&self, hash: &B256) -> Option<Arc<NodeObject>> {
        let mut state = self.state.lock().expect("cache lock");
        match state.entries.get_mut(hash) {
            Some(entry) => {
                entry.last_access = Instant::now();
                let object = Arc::clone(&entry.object);
                state.hits += 1;
                Some(object)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Deduplicate object identity: return the resident object for `hash`
    /// if there is one, otherwise insert `candidate` and return it. With
    /// `replace` the candidate supersedes any resident entry.
    pub fn canonicalize(
        &self,
        hash: &B256,
        candidate: Arc<NodeObject>,
        replace: bool,
    ) -> Arc<NodeObject> {
        let mut state = self.state.lock().expect("cache lock");
        let now = Instant::now();
        if !replace {
            if let Some(entry) = state.entries.get_mut(hash) {
                entry.last_access = now;
                return Arc::clone(&entry.object);
            }
        }
        state.entries.insert(
            *hash,
            Entry {
                object: Arc::clone(&candidate),
                last_access: now,
            },
        );
        candidate
    }

    /// Evict entries older than the target age, then oldest-first down to
    /// the target size.
    pub fn sweep(&self) {
        let mut state = self.state.lock().expect("cache lock");
        let now = Instant::now();
        let target_age = state.target_age;
        state
            .entries
            .retain(|_, entry| now.duration_since(entry.last_access) <= target_age);
        let excess = state.entries.len().saturating_sub(state.target_size);
        if excess > 0 {
            let mut by_age: Vec<(B256, Instant)> = state
                .entries
                .iter()
                .map(|(hash, entry)| (*hash, entry.last_access))
                .collect();
            by_age.sort_by_key(|&(_, at)| at);
            for (hash, _) in by_age.into_iter().take(excess) {
                state.entries.remove(&hash);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("cache lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn target_size(&self) -> usize {
        self.state.lock().expect("cache lock").target_size
    }

    pub fn set_target_size(&self, size: usize) {
        self.state.lock().expect("cache lock").target_size = size;
    }

    pub fn target_age(&self) -> Duration {
        self.state.lock().expect("cache lock").target_age
    }

    pub fn set_target_age(&self, age: Duration) {
        self.state.lock().expect("cache lock").target_age = age;
    }

    /// Positive hits over total lookups.
    pub fn hit_rate(&self) -> f32 {
        let state = self.state.lock().expect("cache lock");
        let total = state.hits + state.misses;
        if total == 0 {
            0.0
        } else {
            state.hits as f32 / total as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::NodeObjectType;

    fn object(tag: u8) -> Arc<NodeObject> {
        NodeObject::new(NodeObjectType::LeafNode, vec![tag], B256::from([tag; 32]))
    }

    #[test]
    fn canonicalize_returns_resident_object() {
        let cache = TaggedCache::new("test", 16, Duration::from_secs(60));
        let first = object(1);
        let got = cache.canonicalize(first.hash(), Arc::clone(&first), false);
        assert!(Arc::ptr_eq(&got, &first));

        let dup = NodeObject::new(NodeObjectType::LeafNode, vec![1], *first.hash());
        let got = cache.canonicalize(first.hash(), dup, false);
        assert!(Arc::ptr_eq(&got, &first));
    }

    #[test]
    fn canonicalize_replace_supersedes() {
        let cache = TaggedCache::new("test", 16, Duration::from_secs(60));
        let first = object(1);
        cache.canonicalize(first.hash(), Arc::clone(&first), false);

        let newer = NodeObject::new(NodeObjectType::Transaction, vec![1, 1], *first.hash());
        let got = cache.canonicalize(first.hash(), Arc::clone(&newer), true);
        assert!(Arc::ptr_eq(&got, &newer));
        let fetched = cache.fetch(first.hash()).expect("resident");
        assert!(Arc::ptr_eq(&fetched, &newer));
    }

    #[test]
    fn sweep_trims_to_target_size() {
        let cache = TaggedCache::new("test", 2, Duration::from_secs(60));
        for tag in 1..=5u8 {
            let obj = object(tag);
            cache.canonicalize(obj.hash(), Arc::clone(&obj), false);
        }
        cache.sweep();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn sweep_drops_aged_entries() {
        let cache = TaggedCache::new("test", 16, Duration::from_secs(60));
        let obj = object(1);
        cache.canonicalize(obj.hash(), Arc::clone(&obj), false);
        cache.set_target_age(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        cache.sweep();
        assert!(cache.is_empty());
    }

    #[test]
    fn hit_rate_counts_lookups() {
        let cache = TaggedCache::new("test", 16, Duration::from_secs(60));
        let obj = object(1);
        cache.canonicalize(obj.hash(), Arc::clone(&obj), false);
        assert!(cache.fetch(obj.hash()).is_some());
        assert!(cache.fetch(&B256::from([9u8; 32])).is_none());
        assert!((cache.hit_rate() - 0.5).abs() < f32::EPSILON);
    }
}
