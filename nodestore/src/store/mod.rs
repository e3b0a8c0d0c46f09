//! Store topologies over the shared fetch/cache core.
//!
//! Three variants expose the same capability set (store, fetch, async
//! fetch, ledger copy) and share the two-tier cache read path, the backend
//! status mapping, and the prefetch thread pool by delegation.

mod node;
mod read_pool;
mod rotating;
pub mod sharded;

pub use node::NodeStore;
pub use rotating::RotatingStore;
pub use sharded::{Shard, ShardStore, ValidateOutcome};

pub(crate) use read_pool::{PrefetchTarget, ReadPool};

use crate::backend::{Backend, Fetched};
use crate::cache::{KeyCache, TaggedCache};
use crate::ledger::Ledger;
use crate::object::{NodeObject, NodeObjectType};
use alloy_primitives::B256;
use eyre::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{error, trace};

pub(crate) const CACHE_TARGET_SIZE: usize = 16_384;
pub(crate) const CACHE_TARGET_AGE: Duration = Duration::from_secs(300);

/// Fraction of the positive cache one prefetching client may fill.
pub(crate) const ASYNC_DIVIDER: usize = 8;

/// Batch sizing for bulk writeback paths.
pub(crate) const BATCH_WRITE_PREALLOCATION: usize = 128;

/// Floor for a freshly acquired shard's cache target size.
pub(crate) const SHARD_CACHE_TARGET_SIZE: usize = 16_384;

/// Timing and outcome of one fetch, reported to the observer hook.
#[derive(Debug, Clone, Copy)]
pub struct FetchReport {
    pub elapsed: Duration,
    pub is_async: bool,
    pub went_to_disk: bool,
    pub was_found: bool,
}

/// Caller-supplied sink for fetch reports.
pub trait FetchObserver: Send + Sync {
    fn on_fetch(&self, report: FetchReport) {
        let _ = report;
    }
}

struct NullObserver;

impl FetchObserver for NullObserver {}

/// The capability set every store topology exposes.
pub trait NodeDb: Send + Sync {
    fn name(&self) -> &str;

    /// Persist one node object for the ledger at `seq`. Misrouted writes
    /// are logged and dropped; backend failures are logged.
    fn store(&self, otype: NodeObjectType, data: Vec<u8>, hash: B256, seq: u32);

    fn fetch(&self, hash: &B256, seq: u32) -> Option<Arc<NodeObject>>;

    /// Cache-only fetch: returns true when the caches answer (object set on
    /// a positive hit, left empty on a proven absence). Otherwise a
    /// background read is queued and false is returned.
    fn async_fetch(&self, hash: &B256, seq: u32, object: &mut Option<Arc<NodeObject>>) -> bool;

    /// Materialize every node reachable from `ledger` out of `src` into
    /// this store. Returns false on any missing node or invalid input.
    fn copy_ledger(&self, src: &dyn NodeDb, ledger: &Arc<Ledger>) -> bool;

    /// Visit every stored object. Topologies that do not support bulk
    /// export return an error.
    fn for_each(&self, f: &mut dyn FnMut(Arc<NodeObject>)) -> Result<()>;

    fn get_write_load(&self) -> u64;

    fn fd_limit(&self) -> u64;

    fn get_cache_hit_rate(&self) -> f32;

    /// Preferred prefetch window for the partition owning `seq`.
    fn get_desired_async_read_count(&self, seq: u32) -> usize;

    fn tune(&self, size: usize, age: Duration);

    fn sweep(&self);

    /// Block until pending background reads drain (two generations).
    fn wait_reads(&self);
}

#[derive(Default)]
struct StoreCounters {
    store_count: AtomicU64,
    store_size: AtomicU64,
    fetch_total: AtomicU64,
    fetch_hits: AtomicU64,
    fetch_size: AtomicU64,
}

/// Shared fetch/store machinery: counters, observer, prefetch pool, and
/// the cache-then-backend read path. Each topology owns one.
pub(crate) struct DbCore {
    name: String,
    counters: StoreCounters,
    observer: Arc<dyn FetchObserver>,
    read_pool: ReadPool,
}

impl DbCore {
    pub(crate) fn new(
        name: impl Into<String>,
        read_threads: usize,
        target: Weak<dyn PrefetchTarget>,
        observer: Option<Arc<dyn FetchObserver>>,
    ) -> Self {
        Self {
            name: name.into(),
            counters: StoreCounters::default(),
            observer: observer.unwrap_or_else(|| Arc::new(NullObserver)),
            read_pool: ReadPool::new(read_threads, target),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn enqueue_read(&self, hash: &B256, seq: u32) {
        self.read_pool.enqueue(hash, seq);
    }

    pub(crate) fn wait_reads(&self) {
        self.read_pool.wait_reads();
    }

    /// Map the backend's four-valued fetch status onto an option, logging
    /// corruption and I/O failures. Nothing propagates past here.
    pub(crate) fn fetch_internal(
        &self,
        backend: &dyn Backend,
        hash: &B256,
    ) -> Option<Arc<NodeObject>> {
        match backend.fetch(hash) {
            Ok(Fetched::Found(object)) => {
                self.counters.fetch_hits.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .fetch_size
                    .fetch_add(object.data().len() as u64, Ordering::Relaxed);
                Some(object)
            }
            Ok(Fetched::NotFound) => None,
            Ok(Fetched::Corrupt) => {
                error!(%hash, backend = backend.name(), "corrupt node object");
                None
            }
            Err(err) => {
                error!(%hash, backend = backend.name(), error = %err, "backend fetch failed");
                None
            }
        }
    }

    /// The shared read path: positive cache, negative cache, then the
    /// backend via `fetch_from`. Absence populates the negative cache;
    /// found objects are canonicalized into the positive cache.
    pub(crate) fn do_fetch<F>(
        &self,
        hash: &B256,
        seq: u32,
        p_cache: &TaggedCache,
        n_cache: &KeyCache,
        fetch_from: F,
        is_async: bool,
    ) -> Option<Arc<NodeObject>>
    where
        F: FnOnce(&B256, u32) -> Option<Arc<NodeObject>>,
    {
        let before = Instant::now();
        let mut went_to_disk = false;
        let mut object = p_cache.fetch(hash);
        if object.is_none() && !n_cache.touch_if_exists(hash) {
            went_to_disk = true;
            self.counters.fetch_total.fetch_add(1, Ordering::Relaxed);
            object = fetch_from(hash, seq);
            match object {
                None => {
                    // A concurrent store may have landed while we read.
                    object = p_cache.fetch(hash);
                    if object.is_none() {
                        n_cache.insert(hash);
                    }
                }
                Some(found) => {
                    object = Some(p_cache.canonicalize(hash, found, false));
                    trace!(%hash, "fetch: in backend");
                }
            }
        }
        self.observer.on_fetch(FetchReport {
            elapsed: before.elapsed(),
            is_async,
            went_to_disk,
            was_found: object.is_some(),
        });
        object
    }

    /// Write-through: canonicalize (superseding any resident entry), store
    /// to the backend, and invalidate any cached absence proof.
    pub(crate) fn store_through(
        &self,
        p_cache: &TaggedCache,
        n_cache: &KeyCache,
        backend: &dyn Backend,
        object: Arc<NodeObject>,
    ) -> Result<()> {
        let hash = *object.hash();
        let size = object.data().len() as u64;
        let object = p_cache.canonicalize(&hash, object, true);
        backend.store(&object)?;
        self.counters.store_count.fetch_add(1, Ordering::Relaxed);
        self.counters.store_size.fetch_add(size, Ordering::Relaxed);
        n_cache.erase(&hash);
        Ok(())
    }

    pub(crate) fn store_batch_through(
        &self,
        p_cache: &TaggedCache,
        n_cache: &KeyCache,
        backend: &dyn Backend,
        batch: Vec<Arc<NodeObject>>,
    ) -> Result<()> {
        let mut canonical = Vec::with_capacity(batch.len());
        for object in batch {
            let hash = *object.hash();
            let size = object.data().len() as u64;
            let object = p_cache.canonicalize(&hash, object, true);
            self.counters.store_count.fetch_add(1, Ordering::Relaxed);
            self.counters.store_size.fetch_add(size, Ordering::Relaxed);
            n_cache.erase(&hash);
            canonical.push(object);
        }
        backend.store_batch(&canonical)
    }

    pub(crate) fn store_count(&self) -> u64 {
        self.counters.store_count.load(Ordering::Relaxed)
    }

    pub(crate) fn store_size(&self) -> u64 {
        self.counters.store_size.load(Ordering::Relaxed)
    }

    pub(crate) fn fetch_total_count(&self) -> u64 {
        self.counters.fetch_total.load(Ordering::Relaxed)
    }

    pub(crate) fn fetch_hit_count(&self) -> u64 {
        self.counters.fetch_hits.load(Ordering::Relaxed)
    }

    pub(crate) fn fetch_size(&self) -> u64 {
        self.counters.fetch_size.load(Ordering::Relaxed)
    }
}

/// Two stores are the same store when their data pointers coincide.
pub(crate) fn same_db(a: &dyn NodeDb, b: &dyn NodeDb) -> bool {
    std::ptr::eq(a as *const dyn NodeDb as *const u8, b as *const dyn NodeDb as *const u8)
}

/// Gather the ledger header and every node reachable from the ledger's
/// maps into one batch, fetching node payloads from `src`. Used by the
/// single-backend topologies; the shard store writes through per node so it
/// can copy differentially. Returns `None` on an invalid map or the first
/// missing node.
pub(crate) fn batch_ledger_nodes(
    src: &dyn NodeDb,
    ledger: &Ledger,
) -> Option<Vec<Arc<NodeObject>>> {
    let info = ledger.info();
    let mut batch: Vec<Arc<NodeObject>> = Vec::with_capacity(BATCH_WRITE_PREALLOCATION);
    batch.push(NodeObject::new(
        NodeObjectType::LedgerHeader,
        info.encode_header(),
        info.hash,
    ));

    let mut missing = false;
    let mut visit = |batch: &mut Vec<Arc<NodeObject>>, hash: &B256| {
        match src.fetch(hash, info.seq) {
            Some(object) => batch.push(object),
            None => missing = true,
        }
        !missing
    };

    if info.account_hash != B256::ZERO {
        let Some(state_map) = ledger.state_map() else {
            error!(seq = info.seq, "source ledger state map not resident");
            return None;
        };
        if state_map.root_hash() != info.account_hash || !state_map.is_valid() {
            error!(seq = info.seq, "invalid state map");
            return None;
        }
        if !state_map.visit_nodes(&mut |hash, _| visit(&mut batch, hash)) {
            return None;
        }
    }
    if info.tx_hash != B256::ZERO {
        let Some(tx_map) = ledger.tx_map() else {
            error!(seq = info.seq, "source ledger transaction map not resident");
            return None;
        };
        if tx_map.root_hash() != info.tx_hash || !tx_map.is_valid() {
            error!(seq = info.seq, "invalid transaction map");
            return None;
        }
        if !tx_map.visit_nodes(&mut |hash, _| visit(&mut batch, hash)) {
            return None;
        }
    }
    Some(batch)
}
