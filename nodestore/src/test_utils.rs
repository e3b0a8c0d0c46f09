//! Shared helpers for unit tests.

use crate::ledger::{Ledger, LedgerInfo};
use crate::map::{MapNode, RadixMap};
use crate::object::NodeObjectType;
use crate::store::NodeDb;
use alloy_primitives::B256;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time moves forward")
        .as_nanos();
    let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "nodestore-{prefix}-test-{now}-{}-{suffix}",
        std::process::id()
    ));
    path
}

/// A well-spread 256-bit key derived from a small tag.
pub fn item_key(tag: u64) -> B256 {
    B256::from_slice(&Sha256::digest(tag.to_be_bytes()))
}

pub fn build_map(tags: impl IntoIterator<Item = u64>) -> Arc<RadixMap> {
    let items: BTreeMap<B256, Vec<u8>> = tags
        .into_iter()
        .map(|tag| (item_key(tag), tag.to_be_bytes().to_vec()))
        .collect();
    Arc::new(RadixMap::build(items))
}

pub fn make_ledger(
    seq: u32,
    parent_hash: B256,
    state_map: Arc<RadixMap>,
    tx_map: Option<Arc<RadixMap>>,
) -> Arc<Ledger> {
    let mut info = LedgerInfo {
        seq,
        hash: B256::ZERO,
        parent_hash,
        account_hash: state_map.root_hash(),
        tx_hash: tx_map
            .as_ref()
            .map(|map| map.root_hash())
            .unwrap_or(B256::ZERO),
        close_time: 1_000 + u64::from(seq),
    };
    info.hash = info.compute_hash();
    Arc::new(Ledger::new(info, state_map, tx_map))
}

/// Chain of ledgers starting at `first_seq`. Consecutive state maps share
/// most of their nodes, so differential walks have something to prune;
/// every other ledger carries a transaction map.
pub fn ledger_chain(first_seq: u32, count: u32) -> Vec<Arc<Ledger>> {
    let mut parent = B256::ZERO;
    let mut ledgers = Vec::with_capacity(count as usize);
    for i in 0..count {
        let seq = first_seq + i;
        let state_map = build_map(0..=u64::from(seq));
        let tx_map = (seq % 2 == 0).then(|| {
            let base = 9_000 + u64::from(seq) * 8;
            build_map(base..base + 3)
        });
        let ledger = make_ledger(seq, parent, state_map, tx_map);
        parent = ledger.info().hash;
        ledgers.push(ledger);
    }
    ledgers
}

fn node_type(node: &MapNode, tx: bool) -> NodeObjectType {
    match node {
        MapNode::Inner { .. } => NodeObjectType::InnerNode,
        MapNode::Leaf { .. } if tx => NodeObjectType::Transaction,
        MapNode::Leaf { .. } => NodeObjectType::LeafNode,
    }
}

/// Store every node of the ledger's maps into `db` so it can serve as a
/// copy source. `skip` suppresses one node to simulate a gappy source.
pub fn seed_source_with(db: &dyn NodeDb, ledger: &Ledger, skip: Option<&B256>) {
    let seq = ledger.info().seq;
    if let Some(map) = ledger.state_map() {
        map.visit_nodes(&mut |hash, node| {
            if skip != Some(hash) {
                db.store(node_type(node, false), node.encode(), *hash, seq);
            }
            true
        });
    }
    if let Some(map) = ledger.tx_map() {
        map.visit_nodes(&mut |hash, node| {
            if skip != Some(hash) {
                db.store(node_type(node, true), node.encode(), *hash, seq);
            }
            true
        });
    }
}

pub fn seed_source(db: &dyn NodeDb, ledger: &Ledger) {
    seed_source_with(db, ledger, None);
}
