//! Rotating topology: a writable backend over an older archive.
//!
//! Reads fall back from writable to archive; archive hits are promoted
//! into the writable backend with the cached absence proof invalidated.
//! Operators periodically rotate a fresh writable in, and the evicted
//! archive is handed back for disposal. Promotion is not atomic with
//! rotation; a just-promoted object may land back in the archive tier,
//! which is harmless for content-addressed, idempotent objects.

use super::{
    batch_ledger_nodes, same_db, DbCore, FetchObserver, NodeDb, PrefetchTarget, ASYNC_DIVIDER,
};
use crate::backend::Backend;
use crate::cache::{KeyCache, TaggedCache};
use crate::ledger::Ledger;
use crate::object::{NodeObject, NodeObjectType};
use alloy_primitives::B256;
use eyre::Result;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::error;

struct Backends {
    writable: Arc<dyn Backend>,
    archive: Arc<dyn Backend>,
}

pub struct RotatingStore {
    core: DbCore,
    p_cache: TaggedCache,
    n_cache: KeyCache,
    backends: Mutex<Backends>,
}

impl RotatingStore {
    pub fn new(
        name: impl Into<String>,
        writable: Arc<dyn Backend>,
        archive: Arc<dyn Backend>,
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
                backends: Mutex::new(Backends { writable, archive }),
            }
        })
    }

    /// Consistent snapshot of both tiers. Handles stay valid for the
    /// duration of any in-flight call even across a rotation.
    fn backends(&self) -> (Arc<dyn Backend>, Arc<dyn Backend>) {
        let backends = self.backends.lock().expect("rotate lock");
        (
            Arc::clone(&backends.writable),
            Arc::clone(&backends.archive),
        )
    }

    pub fn writable(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.backends.lock().expect("rotate lock").writable)
    }

    pub fn archive(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.backends.lock().expect("rotate lock").archive)
    }

    /// Swap in a fresh writable backend: the old writable becomes the
    /// archive, and the evicted archive is returned for the caller to
    /// dispose of.
    pub fn rotate_backends(&self, new_writable: Arc<dyn Backend>) -> Arc<dyn Backend> {
        let mut backends = self.backends.lock().expect("rotate lock");
        let old_archive = Arc::clone(&backends.archive);
        backends.archive = Arc::clone(&backends.writable);
        backends.writable = new_writable;
        old_archive
    }

    pub fn get_store_count(&self) -> u64 {
        self.core.store_count()
    }

    pub fn get_fetch_total_count(&self) -> u64 {
        self.core.fetch_total_count()
    }

    fn fetch_from(&self, hash: &B256, _seq: u32) -> Option<Arc<NodeObject>> {
        let (writable, archive) = self.backends();
        if let Some(object) = self.core.fetch_internal(&*writable, hash) {
            return Some(object);
        }
        let object = self.core.fetch_internal(&*archive, hash)?;
        // Promote: re-store into the writable tier and drop any cached
        // absence proof.
        if let Err(err) = writable.store(&object) {
            error!(%hash, error = %err, "promotion write failed");
        }
        self.n_cache.erase(hash);
        Some(object)
    }
}

impl NodeDb for RotatingStore {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn store(&self, otype: NodeObjectType, data: Vec<u8>, hash: B256, _seq: u32) {
        let object = NodeObject::new(otype, data, hash);
        let (writable, _) = self.backends();
        if let Err(err) = self
            .core
            .store_through(&self.p_cache, &self.n_cache, &*writable, object)
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
            |h, s| self.fetch_from(h, s),
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
        let (writable, _) = self.backends();
        if let Err(err) =
            self.core
                .store_batch_through(&self.p_cache, &self.n_cache, &*writable, batch)
        {
            error!(seq = ledger.info().seq, error = %err, "backend write failed");
            return false;
        }
        true
    }

    fn for_each(&self, f: &mut dyn FnMut(Arc<NodeObject>)) -> Result<()> {
        let (writable, archive) = self.backends();
        archive.for_each(f)?;
        writable.for_each(f)
    }

    fn get_write_load(&self) -> u64 {
        self.writable().write_load()
    }

    fn fd_limit(&self) -> u64 {
        let (writable, archive) = self.backends();
        u64::from(writable.fd_limit()) + u64::from(archive.fd_limit())
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

impl PrefetchTarget for RotatingStore {
    fn prefetch(&self, hash: &B256, seq: u32) {
        self.core.do_fetch(
            hash,
            seq,
            &self.p_cache,
            &self.n_cache,
            |h, s| self.fetch_from(h, s),
            true,
        );
    }
}
