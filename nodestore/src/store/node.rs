//! Baseline topology: one backend with write-through caching.

use super::{
    batch_ledger_nodes, same_db, DbCore, FetchObserver, NodeDb, PrefetchTarget,
    ASYNC_DIVIDER, BATCH_WRITE_PREALLOCATION,
};
use crate::backend::Backend;
use crate::cache::{KeyCache, TaggedCache};
use crate::ledger::Ledger;
use crate::object::{NodeObject, NodeObjectType};
use alloy_primitives::B256;
use eyre::Result;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::error;

pub struct NodeStore {
    core: DbCore,
    p_cache: TaggedCache,
    n_cache: KeyCache,
    backend: Box<dyn Backend>,
}

impl NodeStore {
    pub fn new(
        name: impl Into<String>,
        backend: Box<dyn Backend>,
        read_threads: usize,
        cache_size: usize,
        cache_age: Duration,
        observer: Option<Arc<dyn FetchObserver>>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let target: Weak<dyn PrefetchTarget> = weak.clone();
            Self {
                core: DbCore::new(name.clone(), read_threads, target, observer),
                p_cache: TaggedCache::new(name.clone(), cache_size, cache_age),
                n_cache: KeyCache::new(name, cache_size, cache_age),
                backend,
            }
        })
    }

    /// Bulk-copy every object of `source` into this store's backend, in
    /// batches.
    pub fn import(&self, source: &dyn NodeDb) -> Result<()> {
        let mut batch: Vec<Arc<NodeObject>> = Vec::with_capacity(BATCH_WRITE_PREALLOCATION);
        let mut result = Ok(());
        source.for_each(&mut |object| {
            if result.is_err() {
                return;
            }
            batch.push(object);
            if batch.len() >= BATCH_WRITE_PREALLOCATION {
                result = self.core.store_batch_through(
                    &self.p_cache,
                    &self.n_cache,
                    &*self.backend,
                    std::mem::take(&mut batch),
                );
            }
        })?;
        result?;
        if !batch.is_empty() {
            self.core
                .store_batch_through(&self.p_cache, &self.n_cache, &*self.backend, batch)?;
        }
        Ok(())
    }

    pub fn get_store_count(&self) -> u64 {
        self.core.store_count()
    }

    pub fn get_store_size(&self) -> u64 {
        self.core.store_size()
    }

    pub fn get_fetch_total_count(&self) -> u64 {
        self.core.fetch_total_count()
    }

    pub fn get_fetch_hit_count(&self) -> u64 {
        self.core.fetch_hit_count()
    }

    pub fn get_fetch_size(&self) -> u64 {
        self.core.fetch_size()
    }
}

impl NodeDb for NodeStore {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn store(&self, otype: NodeObjectType, data: Vec<u8>, hash: B256, _seq: u32) {
        let object = NodeObject::new(otype, data, hash);
        if let Err(err) = self
            .core
            .store_through(&self.p_cache, &self.n_cache, &*self.backend, object)
        {
            error!(%hash, error = %err, "backend write failed");
        }
    }

    fn fetch(&self, hash: &B256, seq: u32) -> Option<Arc<NodeObject>> {
        self.core.do_fetch(
            hash,
            seq,
            &self.p_cache,
            &self.n_cache,
            |h, _| self.core.fetch_internal(&*self.backend, h),
            false,
        )
    }

    fn async_fetch(&self, hash: &B256, seq: u32, object: &mut Option<Arc<NodeObject>>) -> bool {
        *object = self.p_cache.fetch(hash);
        if object.is_some() || self.n_cache.touch_if_exists(hash) {
            return true;
        }
        self.core.enqueue_read(hash, seq);
        false
    }

    fn copy_ledger(&self, src: &dyn NodeDb, ledger: &Arc<Ledger>) -> bool {
        if ledger.info().account_hash == B256::ZERO {
            debug_assert!(false, "ledger has a zero account hash");
            error!(seq = ledger.info().seq, "ledger has a zero account hash");
            return false;
        }
        if same_db(src, self) {
            debug_assert!(false, "source and destination are the same");
            error!("source and destination are the same");
            return false;
        }
        let Some(batch) = batch_ledger_nodes(src, ledger) else {
            return false;
        };
        if let Err(err) =
            self.core
                .store_batch_through(&self.p_cache, &self.n_cache, &*self.backend, batch)
        {
            error!(seq = ledger.info().seq, error = %err, "backend write failed");
            return false;
        }
        true
    }

    fn for_each(&self, f: &mut dyn FnMut(Arc<NodeObject>)) -> Result<()> {
        self.backend.for_each(f)
    }

    fn get_write_load(&self) -> u64 {
        self.backend.write_load()
    }

    fn fd_limit(&self) -> u64 {
        u64::from(self.backend.fd_limit())
    }

    fn get_cache_hit_rate(&self) -> f32 {
        self.p_cache.hit_rate()
    }

    fn get_desired_async_read_count(&self, _seq: u32) -> usize {
        self.p_cache.target_size() / ASYNC_DIVIDER
    }

    fn tune(&self, size: usize, age: Duration) {
        self.p_cache.set_target_size(size);
        self.p_cache.set_target_age(age);
        self.n_cache.set_target_size(size);
        self.n_cache.set_target_age(age);
    }

    fn sweep(&self) {
        self.p_cache.sweep();
        self.n_cache.sweep();
    }

    fn wait_reads(&self) {
        self.core.wait_reads();
    }
}

impl PrefetchTarget for NodeStore {
    fn prefetch(&self, hash: &B256, seq: u32) {
        self.core.do_fetch(
            hash,
            seq,
            &self.p_cache,
            &self.n_cache,
            |h, _| self.core.fetch_internal(&*self.backend, h),
            true,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::store::CACHE_TARGET_AGE;

    fn new_store(name: &str) -> Arc<NodeStore> {
        NodeStore::new(
            name,
            Box::new(MemoryBackend::new()),
            2,
            64,
            CACHE_TARGET_AGE,
            None,
        )
    }

    #[test]
    fn store_then_fetch_preserves_bytes() {
        let store = new_store("node");
        let hash = B256::from([5u8; 32]);
        store.store(NodeObjectType::Transaction, b"txn".to_vec(), hash, 10);
        let got = store.fetch(&hash, 10).expect("stored object");
        assert_eq!(got.data(), b"txn");
        assert_eq!(store.get_store_count(), 1);
    }

    #[test]
    fn negative_cache_is_invalidated_by_store() {
        let store = new_store("node");
        let hash = B256::from([6u8; 32]);
        // Prove absence first, caching it.
        assert!(store.fetch(&hash, 1).is_none());
        // A store of the same key must defeat the cached absence proof.
        store.store(NodeObjectType::LeafNode, b"late".to_vec(), hash, 1);
        let got = store.fetch(&hash, 1).expect("stored object");
        assert_eq!(got.data(), b"late");
    }

    #[test]
    fn async_fetch_prefetches_into_cache() {
        let store = new_store("node");
        let hash = B256::from([7u8; 32]);
        store.store(NodeObjectType::LeafNode, b"bg".to_vec(), hash, 3);
        // Drop the cached copy so the read must go through the pool.
        store.p_cache.set_target_age(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        store.p_cache.sweep();
        store.p_cache.set_target_age(CACHE_TARGET_AGE);

        let mut object = None;
        if !store.async_fetch(&hash, 3, &mut object) {
            // The queue drains before the read lands in the cache, so poll.
            for _ in 0..500 {
                store.wait_reads();
                object = None;
                if store.async_fetch(&hash, 3, &mut object) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        assert_eq!(object.expect("prefetched").data(), b"bg");
    }

    #[test]
    fn import_copies_every_object() {
        let src = new_store("src");
        for tag in 1..=5u8 {
            store_tagged(&src, tag);
        }
        let dst = new_store("dst");
        dst.import(&*src).expect("import");
        for tag in 1..=5u8 {
            let hash = B256::from([tag; 32]);
            assert!(dst.fetch(&hash, 1).is_some());
        }
    }

    fn store_tagged(store: &NodeStore, tag: u8) {
        store.store(
            NodeObjectType::LeafNode,
            vec![tag],
            B256::from([tag; 32]),
            1,
        );
    }
}
