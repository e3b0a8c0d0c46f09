//! Negative cache: hashes recently proven absent from a backend.

use alloy_primitives::B256;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct KeyState {
    keys: HashMap<B256, Instant>,
    target_size: usize,
    target_age: Duration,
}

/// Key-only recency cache. A present key is a proof of absence that
/// short-circuits backend reads; any store of the key must erase it.
pub struct KeyCache {
    name: String,
    state: Mutex<KeyState>,
}

impl KeyCache {
    pub fn new(name: impl Into<String>, target_size: usize, target_age: Duration) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(KeyState {
                keys: HashMap::new(),
                target_size,
                target_age,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert(&self, hash: &B256) {
        let mut state = self.state.lock().expect("cache lock");
        state.keys.insert(*hash, Instant::now());
    }

    pub fn erase(&self, hash: &B256) {
        let mut state = self.state.lock().expect("cache lock");
        state.keys.remove(hash);
    }

    /// True if the key is present; refreshes its recency.
    pub fn touch_if_exists(&self, hash: &B256) -> bool {
        let mut state = self.state.lock().expect("cache lock");
        match state.keys.get_mut(hash) {
            Some(at) => {
                *at = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn sweep(&self) {
        let mut state = self.state.lock().expect("cache lock");
        let now = Instant::now();
        let target_age = state.target_age;
        state
            .keys
            .retain(|_, at| now.duration_since(*at) <= target_age);
        let excess = state.keys.len().saturating_sub(state.target_size);
        if excess > 0 {
            let mut by_age: Vec<(B256, Instant)> =
                state.keys.iter().map(|(hash, at)| (*hash, *at)).collect();
            by_age.sort_by_key(|&(_, at)| at);
            for (hash, _) in by_age.into_iter().take(excess) {
                state.keys.remove(&hash);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("cache lock").keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_target_size(&self, size: usize) {
        self.state.lock().expect("cache lock").target_size = size;
    }

    pub fn set_target_age(&self, age: Duration) {
        self.state.lock().expect("cache lock").target_age = age;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_refreshes_and_reports_presence() {
        let cache = KeyCache::new("test", 16, Duration::from_secs(60));
        let hash = B256::from([1u8; 32]);
        assert!(!cache.touch_if_exists(&hash));
        cache.insert(&hash);
        assert!(cache.touch_if_exists(&hash));
        cache.erase(&hash);
        assert!(!cache.touch_if_exists(&hash));
    }

    #[test]
    fn sweep_trims_to_target_size() {
        let cache = KeyCache::new("test", 3, Duration::from_secs(60));
        for tag in 1..=6u8 {
            cache.insert(&B256::from([tag; 32]));
        }
        cache.sweep();
        assert_eq!(cache.len(), 3);
    }
}
