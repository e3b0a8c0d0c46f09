//! Typed, hash-keyed immutable blobs.

use alloy_primitives::B256;
use std::sync::Arc;

/// Category tag carried alongside a stored blob. Metadata only; identity is
/// the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeObjectType {
    LedgerHeader,
    InnerNode,
    LeafNode,
    Transaction,
}

/// A content-addressed blob: once created, `data` and `hash` are frozen.
///
/// For ledger header objects the hash equals the ledger hash; for tree nodes
/// it equals the authenticated node hash. Hashes are assumed collision-free
/// and externally verified. Equality is by hash alone.
#[derive(Debug, Clone)]
pub struct NodeObject {
    otype: NodeObjectType,
    hash: B256,
    data: Vec<u8>,
}

impl NodeObject {
    pub fn new(otype: NodeObjectType, data: Vec<u8>, hash: B256) -> Arc<Self> {
        Arc::new(Self { otype, hash, data })
    }

    pub fn object_type(&self) -> NodeObjectType {
        self.otype
    }

    pub fn hash(&self) -> &B256 {
        &self.hash
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl PartialEq for NodeObject {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for NodeObject {}
