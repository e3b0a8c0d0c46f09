//! One shard: a fixed range of ledger sequences with its own backend,
//! caches, and acquiring-to-complete lifecycle.

use super::dir_size;
use crate::backend::{make_backend, Backend, Fetched};
use crate::cache::{KeyCache, TaggedCache};
use crate::config::{ShardConfig, StoreConfig};
use crate::ledger::{Ledger, LedgerInfo};
use crate::map::{walk_tree, walk_tree_differences};
use crate::rangeset::RangeSet;
use alloy_primitives::B256;
use eyre::{eyre, Result, WrapErr};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CONTROL_FILE_NAME: &str = "control.json";

/// Sweep the shard caches every this many validated ledgers.
const VALIDATE_SWEEP_INTERVAL: u32 = 128;

/// Result of an offline integrity scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidateOutcome {
    /// Every ledger in the shard's range verified.
    Valid { ledgers: u32 },
    /// The shard claims completeness but verification failed here.
    Invalid { seq: u32, hash: B256 },
    /// The shard is still acquiring; verification stopped here.
    Incomplete { seq: u32, hash: B256 },
}

struct ShardState {
    stored_seqs: RangeSet,
    complete: bool,
    /// Most recently stored ledger while incomplete; lets the next copy
    /// walk differentially against a chain-adjacent neighbor.
    last_stored: Option<Arc<Ledger>>,
    file_size: u64,
}

/// A range of historical ledgers backed by its own store. Shard `i` covers
/// sequences `1 + i * ledgers_per_shard` through `(i + 1) *
/// ledgers_per_shard` (the genesis shard starts at the genesis sequence).
/// Once a shard has all its ledgers it is complete and never written
/// again.
pub struct Shard {
    index: u32,
    first_seq: u32,
    last_seq: u32,
    max_ledgers: u32,
    dir: PathBuf,
    control: PathBuf,
    backend: Box<dyn Backend>,
    /// False for fd-limit-zero (memory) backends, which skip all control
    /// file handling.
    backed: bool,
    p_cache: TaggedCache,
    n_cache: KeyCache,
    state: Mutex<ShardState>,
}

impl Shard {
    /// Open (or create) the shard directory under the store root and
    /// restore its lifecycle state from the control file.
    pub fn open(
        shard_cfg: &ShardConfig,
        store_cfg: &StoreConfig,
        index: u32,
        cache_size: usize,
        cache_age: Duration,
    ) -> Result<Self> {
        if index < shard_cfg.genesis_shard_index() {
            return Err(eyre!("shard index {index} precedes the genesis shard"));
        }
        let first_seq = shard_cfg.genesis_seq().max(shard_cfg.first_seq(index));
        let last_seq = shard_cfg.last_seq(index);
        let max_ledgers = shard_cfg.expected_ledger_count(index);

        let dir = store_cfg.path.join(index.to_string());
        let new_shard = !dir.is_dir()
            || fs::read_dir(&dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(true);
        let backend = make_backend(&store_cfg.backend, &dir)?;
        let backed = backend.fd_limit() != 0;
        let control = dir.join(CONTROL_FILE_NAME);
        let name = format!("shard-{index}");

        let shard = Self {
            index,
            first_seq,
            last_seq,
            max_ledgers,
            dir,
            control,
            backend,
            backed,
            p_cache: TaggedCache::new(name.clone(), cache_size, cache_age),
            n_cache: KeyCache::new(name, cache_size, cache_age),
            state: Mutex::new(ShardState {
                stored_seqs: RangeSet::new(),
                complete: false,
                last_stored: None,
                file_size: 0,
            }),
        };
        if !shard.backed {
            return Ok(shard);
        }

        {
            let mut state = shard.state.lock().expect("shard lock");
            if new_shard {
                if !shard.save_control(&state.stored_seqs) {
                    return Err(eyre!("unable to save control file"));
                }
            } else if shard.control.is_file() {
                let bytes = fs::read(&shard.control).wrap_err("failed to read control file")?;
                let stored: RangeSet =
                    serde_json::from_slice(&bytes).wrap_err("failed to decode control file")?;
                if let Some((lowest, highest)) = stored.bounds() {
                    if lowest < shard.first_seq || highest > shard.last_seq {
                        return Err(eyre!(
                            "invalid control file: sequences outside [{}, {}]",
                            shard.first_seq,
                            shard.last_seq
                        ));
                    }
                    if stored.len() == u64::from(shard.max_ledgers) {
                        debug!(shard = index, "found control file for complete shard");
                        let _ = fs::remove_file(&shard.control);
                        state.complete = true;
                    } else {
                        state.stored_seqs = stored;
                    }
                } else {
                    state.stored_seqs = stored;
                }
            } else {
                state.complete = true;
            }
            state.file_size = shard.measure_file_size();
        }
        Ok(shard)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn first_seq(&self) -> u32 {
        self.first_seq
    }

    pub fn last_seq(&self) -> u32 {
        self.last_seq
    }

    pub fn complete(&self) -> bool {
        self.state.lock().expect("shard lock").complete
    }

    pub fn file_size(&self) -> u64 {
        self.state.lock().expect("shard lock").file_size
    }

    /// Number of ledgers stored while still incomplete.
    pub fn num_stored(&self) -> u64 {
        self.state.lock().expect("shard lock").stored_seqs.len()
    }

    pub fn last_stored(&self) -> Option<Arc<Ledger>> {
        self.state.lock().expect("shard lock").last_stored.clone()
    }

    pub fn fd_limit(&self) -> u32 {
        self.backend.fd_limit()
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        &*self.backend
    }

    pub(crate) fn p_cache(&self) -> &TaggedCache {
        &self.p_cache
    }

    pub(crate) fn n_cache(&self) -> &KeyCache {
        &self.n_cache
    }

    /// Record that every node of `ledger` is durably stored. When the
    /// insertion would leave exactly one ledger outstanding the shard
    /// completes instead: the final sequence is subsumed by the completion
    /// flag and never enters the set, the set is cleared, and the control
    /// file is deleted.
    pub fn set_stored(&self, ledger: &Arc<Ledger>) -> bool {
        let seq = ledger.info().seq;
        let mut state = self.state.lock().expect("shard lock");
        if state.complete {
            debug_assert!(false, "shard already complete");
            error!(shard = self.index, seq, "ledger stored in a complete shard");
            return false;
        }
        if seq < self.first_seq || seq > self.last_seq {
            debug_assert!(false, "sequence outside shard range");
            error!(shard = self.index, seq, "ledger sequence outside shard range");
            return false;
        }
        if state.stored_seqs.contains(seq) {
            debug_assert!(false, "sequence already stored");
            error!(shard = self.index, seq, "ledger already stored in shard");
            return false;
        }

        if state.stored_seqs.len() + 1 >= u64::from(self.max_ledgers) {
            if self.backed {
                if let Err(err) = fs::remove_file(&self.control) {
                    warn!(shard = self.index, error = %err, "failed to remove control file");
                }
            }
            state.complete = true;
            state.stored_seqs.clear();
            state.file_size = self.measure_file_size();
            debug!(shard = self.index, "shard complete");
        } else {
            let mut next = state.stored_seqs.clone();
            next.insert(seq);
            if self.backed && !self.save_control(&next) {
                return false;
            }
            state.stored_seqs = next;
            state.last_stored = Some(Arc::clone(ledger));
        }
        debug!(shard = self.index, seq, "ledger stored in shard");
        true
    }

    /// Next ledger sequence to acquire: the newest not yet stored.
    pub fn prepare(&self) -> Option<u32> {
        let state = self.state.lock().expect("shard lock");
        if state.stored_seqs.is_empty() {
            return Some(self.last_seq);
        }
        state.stored_seqs.prev_missing(self.last_seq + 1, self.first_seq)
    }

    pub fn has_ledger(&self, seq: u32) -> bool {
        if seq < self.first_seq || seq > self.last_seq {
            return false;
        }
        let state = self.state.lock().expect("shard lock");
        state.complete || state.stored_seqs.contains(seq)
    }

    fn measure_file_size(&self) -> u64 {
        match dir_size(&self.dir) {
            Ok(size) => size,
            Err(err) => {
                warn!(shard = self.index, error = %err, "failed to measure shard size");
                0
            }
        }
    }

    /// Truncate and rewrite the control file with the given set.
    fn save_control(&self, stored_seqs: &RangeSet) -> bool {
        let bytes = match serde_json::to_vec_pretty(stored_seqs) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(shard = self.index, error = %err, "unable to encode control file");
                return false;
            }
        };
        if let Err(err) = fs::write(&self.control, bytes) {
            error!(shard = self.index, error = %err, "unable to save control file");
            return false;
        }
        true
    }

    /// Offline integrity scan: walk the hash chain backward from the
    /// shard's last ledger, verifying each header and every reachable
    /// state/tx node against the backend. The positive cache runs at its
    /// minimum age for the duration to cap memory.
    pub fn validate(&self, last_hash: B256) -> ValidateOutcome {
        let saved_age = self.p_cache.target_age();
        self.p_cache.set_target_age(Duration::ZERO);
        let outcome = self.validate_walk(last_hash);
        self.p_cache.set_target_age(saved_age);
        outcome
    }

    fn validate_walk(&self, last_hash: B256) -> ValidateOutcome {
        let mut hash = last_hash;
        let mut seq = self.last_seq;
        let mut next: Option<LedgerInfo> = None;
        let mut verified: u32 = 0;
        loop {
            let info = match self.val_ledger(&hash, seq, next.as_ref()) {
                Ok(info) => info,
                Err(err) => {
                    error!(
                        shard = self.index,
                        seq,
                        %hash,
                        error = %err,
                        "shard validation stopped"
                    );
                    return if self.complete() {
                        ValidateOutcome::Invalid { seq, hash }
                    } else {
                        ValidateOutcome::Incomplete { seq, hash }
                    };
                }
            };
            verified += 1;
            if verified % VALIDATE_SWEEP_INTERVAL == 0 {
                self.p_cache.sweep();
                self.n_cache.sweep();
            }
            if seq == self.first_seq {
                break;
            }
            hash = info.parent_hash;
            seq -= 1;
            next = Some(info);
        }
        info!(shard = self.index, ledgers = verified, "shard validated");
        ValidateOutcome::Valid { ledgers: verified }
    }

    /// Verify one ledger: header, roots, and a full or differential walk
    /// of the state map (differential when `next` chains to this ledger).
    fn val_ledger(
        &self,
        hash: &B256,
        seq: u32,
        next: Option<&LedgerInfo>,
    ) -> Result<LedgerInfo> {
        let header = self.val_fetch(hash)?;
        let info = LedgerInfo::decode_header(header.data())?;
        if info.hash != *hash || info.seq != seq {
            return Err(eyre!(
                "header mismatch: got seq {} hash {}",
                info.seq,
                info.hash
            ));
        }
        if info.account_hash == B256::ZERO {
            return Err(eyre!("ledger has a zero account hash"));
        }
        self.val_fetch(&info.account_hash)?;
        if info.tx_hash != B256::ZERO {
            self.val_fetch(&info.tx_hash)?;
        }

        let mut source = |h: &B256| self.val_fetch(h).map(|o| o.data().to_vec());
        let have = next
            .filter(|n| n.parent_hash == info.hash)
            .map(|n| n.account_hash);
        walk_tree_differences(&info.account_hash, have.as_ref(), &mut source)?;
        if info.tx_hash != B256::ZERO {
            walk_tree(&info.tx_hash, &mut source)?;
        }
        Ok(info)
    }

    /// Backend fetch for validation: absence and corruption are hard
    /// failures that abort the walk.
    fn val_fetch(&self, hash: &B256) -> Result<Arc<crate::object::NodeObject>> {
        match self.backend.fetch(hash) {
            Ok(Fetched::Found(object)) => Ok(object),
            Ok(Fetched::NotFound) => Err(eyre!("missing node object {hash}")),
            Ok(Fetched::Corrupt) => {
                error!(shard = self.index, %hash, "corrupt node object");
                Err(eyre!("corrupt node object {hash}"))
            }
            Err(err) => Err(err.wrap_err("backend fetch failed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::MapNode;
    use crate::object::{NodeObject, NodeObjectType};
    use crate::test_utils::{ledger_chain, temp_dir};
    use std::path::Path;

    const CACHE_AGE: Duration = Duration::from_secs(60);

    fn configs(dir: &Path) -> (ShardConfig, StoreConfig) {
        (ShardConfig::new(4, 1), StoreConfig::new("flatfile", dir))
    }

    fn open_shard(dir: &Path, index: u32) -> Result<Shard> {
        let (shard_cfg, store_cfg) = configs(dir);
        Shard::open(&shard_cfg, &store_cfg, index, 64, CACHE_AGE)
    }

    /// Store a ledger's header and every node of its maps straight into the
    /// shard backend, as a completed copy would have.
    fn seed_backend(shard: &Shard, ledger: &Ledger, skip: Option<&B256>) {
        let info = ledger.info();
        if skip != Some(&info.hash) {
            let header = NodeObject::new(
                NodeObjectType::LedgerHeader,
                info.encode_header(),
                info.hash,
            );
            shard.backend().store(&header).expect("store header");
        }
        for map in [ledger.state_map(), ledger.tx_map()].into_iter().flatten() {
            map.visit_nodes(&mut |hash, node| {
                if skip != Some(hash) {
                    let otype = match node {
                        MapNode::Inner { .. } => NodeObjectType::InnerNode,
                        MapNode::Leaf { .. } => NodeObjectType::LeafNode,
                    };
                    shard
                        .backend()
                        .store(&NodeObject::new(otype, node.encode(), *hash))
                        .expect("store node");
                }
                true
            });
        }
    }

    #[test]
    fn completion_clears_set_and_control_file() {
        let dir = temp_dir("shard");
        let shard = open_shard(&dir, 0).expect("open");
        assert_eq!((shard.first_seq(), shard.last_seq()), (1, 4));
        let chain = ledger_chain(1, 4);
        let control = dir.join("0").join(CONTROL_FILE_NAME);

        for ledger in &chain[..3] {
            assert!(shard.set_stored(ledger));
        }
        assert!(control.is_file());
        assert_eq!(shard.num_stored(), 3);
        assert!(!shard.complete());
        assert!(!shard.has_ledger(4));

        // The fourth ledger completes the shard: the final sequence never
        // enters the set, the set empties, and the control file goes away.
        assert!(shard.set_stored(&chain[3]));
        assert!(shard.complete());
        assert_eq!(shard.num_stored(), 0);
        assert!(!control.exists());
        assert!(shard.has_ledger(4));
        assert!(shard.has_ledger(1));
        assert!(!shard.has_ledger(5));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn control_file_round_trips_on_reopen() {
        let dir = temp_dir("shard");
        {
            let shard = open_shard(&dir, 1).expect("open");
            assert_eq!((shard.first_seq(), shard.last_seq()), (5, 8));
            let chain = ledger_chain(5, 1);
            assert!(shard.set_stored(&chain[0]));
        }
        let shard = open_shard(&dir, 1).expect("reopen");
        assert!(!shard.complete());
        assert_eq!(shard.num_stored(), 1);
        assert!(shard.has_ledger(5));
        assert!(!shard.has_ledger(6));
        assert_eq!(shard.prepare(), Some(8));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn out_of_range_control_file_fails_open() {
        let dir = temp_dir("shard");
        {
            let _shard = open_shard(&dir, 1).expect("open");
        }
        // Sequence 2 precedes the shard's range of 5..=8.
        fs::write(dir.join("1").join(CONTROL_FILE_NAME), b"[[2,2],[5,5]]")
            .expect("write control");
        assert!(open_shard(&dir, 1).is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_control_file_means_complete() {
        let dir = temp_dir("shard");
        {
            let _shard = open_shard(&dir, 2).expect("open");
        }
        fs::remove_file(dir.join("2").join(CONTROL_FILE_NAME)).expect("remove control");
        let shard = open_shard(&dir, 2).expect("reopen");
        assert!(shard.complete());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn prepare_acquires_newest_to_oldest() {
        let dir = temp_dir("shard");
        let shard = open_shard(&dir, 1).expect("open");
        assert_eq!(shard.prepare(), Some(8));
        let chain = ledger_chain(5, 4);
        assert!(shard.set_stored(&chain[3]));
        assert_eq!(shard.prepare(), Some(7));
        assert!(shard.set_stored(&chain[0]));
        assert_eq!(shard.prepare(), Some(7));
        assert!(shard.set_stored(&chain[2]));
        assert_eq!(shard.prepare(), Some(6));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn memory_shard_skips_control_file_handling() {
        let dir = temp_dir("shard");
        let shard_cfg = ShardConfig::new(4, 1);
        let store_cfg = StoreConfig::new("memory", &dir);
        let shard = Shard::open(&shard_cfg, &store_cfg, 0, 64, CACHE_AGE).expect("open");
        let chain = ledger_chain(1, 4);
        for ledger in &chain {
            assert!(shard.set_stored(ledger));
        }
        assert!(shard.complete());
        assert!(!dir.join("0").join(CONTROL_FILE_NAME).exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn validate_accepts_fully_seeded_shard() {
        let dir = temp_dir("shard");
        let shard = open_shard(&dir, 0).expect("open");
        let chain = ledger_chain(1, 4);
        for ledger in &chain {
            seed_backend(&shard, ledger, None);
        }
        let last_hash = chain[3].info().hash;
        assert_eq!(
            shard.validate(last_hash),
            ValidateOutcome::Valid { ledgers: 4 }
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn validate_stops_at_first_missing_node() {
        let dir = temp_dir("shard");
        let shard = open_shard(&dir, 0).expect("open");
        let chain = ledger_chain(1, 4);
        // The oldest ledger's state root is unique to it; drop that node.
        let skip = chain[0].info().account_hash;
        for ledger in &chain {
            seed_backend(&shard, ledger, Some(&skip));
        }
        let last_hash = chain[3].info().hash;
        match shard.validate(last_hash) {
            ValidateOutcome::Incomplete { seq, .. } => assert_eq!(seq, 1),
            other => panic!("expected incomplete stop, got {other:?}"),
        }
        let _ = fs::remove_dir_all(&dir);
    }
}
