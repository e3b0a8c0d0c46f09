//! Authenticated 16-ary radix map.
//!
//! Just enough of the state/tx tree to drive the store's copy and
//! validation walks: a hash-addressed node codec, an in-memory builder,
//! full and differential traversals over resident maps, and the same two
//! walks driven off a backend for offline shard validation.
//!
//! Node hash is the digest of the encoded node, so equal subtrees have
//! equal hashes and differential walks can prune them.

use alloy_primitives::B256;
use eyre::{eyre, Result};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

const TAG_INNER: u8 = 0x01;
const TAG_LEAF: u8 = 0x02;

const BRANCH: usize = 16;

/// One node of the radix map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapNode {
    Inner { children: [Option<B256>; BRANCH] },
    Leaf { key: B256, data: Vec<u8> },
}

impl MapNode {
    /// Encode: inner nodes as `[tag, u16 child bitmap, child hashes in slot
    /// order]`, leaves as `[tag, key, data]`.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            MapNode::Inner { children } => {
                let mut bitmap: u16 = 0;
                let mut out = vec![TAG_INNER, 0, 0];
                for (slot, child) in children.iter().enumerate() {
                    if let Some(hash) = child {
                        bitmap |= 1 << slot;
                        out.extend_from_slice(hash.as_slice());
                    }
                }
                out[1..3].copy_from_slice(&bitmap.to_be_bytes());
                out
            }
            MapNode::Leaf { key, data } => {
                let mut out = Vec::with_capacity(1 + 32 + data.len());
                out.push(TAG_LEAF);
                out.extend_from_slice(key.as_slice());
                out.extend_from_slice(data);
                out
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        match data.first() {
            Some(&TAG_INNER) => {
                if data.len() < 3 {
                    return Err(eyre!("truncated inner node"));
                }
                let bitmap = u16::from_be_bytes(data[1..3].try_into().expect("fixed slice"));
                let expected = 3 + 32 * usize::from(bitmap.count_ones() as u16);
                if data.len() != expected {
                    return Err(eyre!(
                        "inner node length mismatch: expected {expected}, got {}",
                        data.len()
                    ));
                }
                let mut children = [None; BRANCH];
                let mut offset = 3;
                for (slot, child) in children.iter_mut().enumerate() {
                    if bitmap & (1 << slot) != 0 {
                        *child = Some(B256::from_slice(&data[offset..offset + 32]));
                        offset += 32;
                    }
                }
                Ok(MapNode::Inner { children })
            }
            Some(&TAG_LEAF) => {
                if data.len() < 1 + 32 {
                    return Err(eyre!("truncated leaf node"));
                }
                Ok(MapNode::Leaf {
                    key: B256::from_slice(&data[1..33]),
                    data: data[33..].to_vec(),
                })
            }
            Some(tag) => Err(eyre!("unknown map node tag {tag:#04x}")),
            None => Err(eyre!("empty map node")),
        }
    }

    /// Authenticated node hash: digest of the encoded bytes.
    pub fn hash(&self) -> B256 {
        B256::from_slice(&Sha256::digest(self.encode()))
    }
}

fn nibble(key: &B256, depth: usize) -> usize {
    let byte = key.as_slice()[depth / 2];
    if depth % 2 == 0 {
        (byte >> 4) as usize
    } else {
        (byte & 0x0f) as usize
    }
}

/// An immutable in-memory radix map over hash-addressed nodes.
#[derive(Debug, Clone, Default)]
pub struct RadixMap {
    root: B256,
    nodes: HashMap<B256, MapNode>,
}

impl RadixMap {
    /// Build a map from key/value items. Keys must be distinct; the shape
    /// (and therefore every node hash) is deterministic in the key set.
    pub fn build(items: BTreeMap<B256, Vec<u8>>) -> Self {
        let mut map = RadixMap::default();
        let items: Vec<(B256, Vec<u8>)> = items.into_iter().collect();
        if items.is_empty() {
            return map;
        }
        map.root = map.build_node(items, 0);
        map
    }

    fn build_node(&mut self, items: Vec<(B256, Vec<u8>)>, depth: usize) -> B256 {
        debug_assert!(depth < 64, "key nibbles exhausted");
        if items.len() == 1 {
            let (key, data) = items.into_iter().next().expect("one item");
            return self.intern(MapNode::Leaf { key, data });
        }
        let mut buckets: [Vec<(B256, Vec<u8>)>; BRANCH] = Default::default();
        for (key, data) in items {
            buckets[nibble(&key, depth)].push((key, data));
        }
        let mut children = [None; BRANCH];
        for (slot, bucket) in buckets.into_iter().enumerate() {
            if !bucket.is_empty() {
                children[slot] = Some(self.build_node(bucket, depth + 1));
            }
        }
        self.intern(MapNode::Inner { children })
    }

    fn intern(&mut self, node: MapNode) -> B256 {
        let hash = node.hash();
        self.nodes.insert(hash, node);
        hash
    }

    pub fn root_hash(&self) -> B256 {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root == B256::ZERO
    }

    pub fn node(&self, hash: &B256) -> Option<&MapNode> {
        self.nodes.get(hash)
    }

    pub fn contains(&self, hash: &B256) -> bool {
        self.nodes.contains_key(hash)
    }

    /// Whether every reachable node is resident and hashes to its key.
    pub fn is_valid(&self) -> bool {
        if self.is_empty() {
            return true;
        }
        let mut stack = vec![self.root];
        while let Some(hash) = stack.pop() {
            let Some(node) = self.nodes.get(&hash) else {
                return false;
            };
            if node.hash() != hash {
                return false;
            }
            if let MapNode::Inner { children } = node {
                stack.extend(children.iter().flatten());
            }
        }
        true
    }

    /// Pre-order walk of every reachable node. The visitor returns whether
    /// to continue; the walk reports whether it ran to completion.
    pub fn visit_nodes(&self, f: &mut dyn FnMut(&B256, &MapNode) -> bool) -> bool {
        if self.is_empty() {
            return true;
        }
        self.visit_inner(&self.root, f)
    }

    fn visit_inner(&self, hash: &B256, f: &mut dyn FnMut(&B256, &MapNode) -> bool) -> bool {
        let Some(node) = self.nodes.get(hash) else {
            return false;
        };
        if !f(hash, node) {
            return false;
        }
        if let MapNode::Inner { children } = node {
            for child in children.iter().flatten() {
                if !self.visit_inner(child, f) {
                    return false;
                }
            }
        }
        true
    }

    /// Walk only the nodes present in `self` but not in `have`: subtrees
    /// whose root hash also appears in `have` are pruned whole.
    pub fn visit_differences(
        &self,
        have: &RadixMap,
        f: &mut dyn FnMut(&B256, &MapNode) -> bool,
    ) -> bool {
        if self.is_empty() {
            return true;
        }
        let have_root = (!have.is_empty()).then_some(have.root);
        self.visit_diff_inner(&self.root, have_root.as_ref(), have, f)
    }

    fn visit_diff_inner(
        &self,
        hash: &B256,
        have_hash: Option<&B256>,
        have: &RadixMap,
        f: &mut dyn FnMut(&B256, &MapNode) -> bool,
    ) -> bool {
        if have_hash == Some(hash) {
            return true;
        }
        let Some(node) = self.nodes.get(hash) else {
            return false;
        };
        if !f(hash, node) {
            return false;
        }
        if let MapNode::Inner { children } = node {
            let have_children = match have_hash.and_then(|h| have.nodes.get(h)) {
                Some(MapNode::Inner { children }) => Some(children),
                _ => None,
            };
            for (slot, child) in children.iter().enumerate() {
                if let Some(child) = child {
                    let have_child = have_children.and_then(|hc| hc[slot].as_ref());
                    if !self.visit_diff_inner(child, have_child, have, f) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// Walk a tree held in a backend: `source` resolves a node hash to its
/// blob, erring on absent or corrupt nodes, which aborts the walk at the
/// offending node.
pub fn walk_tree(root: &B256, source: &mut dyn FnMut(&B256) -> Result<Vec<u8>>) -> Result<()> {
    if *root == B256::ZERO {
        return Ok(());
    }
    let blob = source(root)?;
    let node = MapNode::decode(&blob)?;
    if let MapNode::Inner { children } = node {
        for child in children.iter().flatten() {
            walk_tree(child, source)?;
        }
    }
    Ok(())
}

/// Differential variant of [`walk_tree`]: subtrees shared with the `have`
/// tree (matched structurally, slot by slot) are skipped.
pub fn walk_tree_differences(
    root: &B256,
    have: Option<&B256>,
    source: &mut dyn FnMut(&B256) -> Result<Vec<u8>>,
) -> Result<()> {
    if *root == B256::ZERO || have == Some(root) {
        return Ok(());
    }
    let blob = source(root)?;
    let node = MapNode::decode(&blob)?;
    if let MapNode::Inner { children } = node {
        let have_children = match have {
            Some(have_hash) => {
                let have_blob = source(have_hash)?;
                match MapNode::decode(&have_blob)? {
                    MapNode::Inner { children } => Some(children),
                    MapNode::Leaf { .. } => None,
                }
            }
            None => None,
        };
        for (slot, child) in children.iter().enumerate() {
            if let Some(child) = child {
                let have_child = have_children.as_ref().and_then(|hc| hc[slot].as_ref());
                walk_tree_differences(child, have_child, source)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn key(tag: u8) -> B256 {
        B256::from([tag; 32])
    }

    fn sample_map(tags: &[u8]) -> RadixMap {
        let items = tags
            .iter()
            .map(|&t| (key(t), vec![t, t, t]))
            .collect::<BTreeMap<_, _>>();
        RadixMap::build(items)
    }

    fn reachable_hashes(map: &RadixMap) -> HashSet<B256> {
        let mut seen = HashSet::new();
        map.visit_nodes(&mut |hash, _| {
            seen.insert(*hash);
            true
        });
        seen
    }

    #[test]
    fn node_codec_round_trip() {
        let leaf = MapNode::Leaf {
            key: key(9),
            data: b"value".to_vec(),
        };
        assert_eq!(MapNode::decode(&leaf.encode()).expect("leaf"), leaf);

        let mut children = [None; 16];
        children[3] = Some(key(1));
        children[12] = Some(key(2));
        let inner = MapNode::Inner { children };
        assert_eq!(MapNode::decode(&inner.encode()).expect("inner"), inner);

        assert!(MapNode::decode(&[0x7f, 0, 0]).is_err());
        assert!(MapNode::decode(&[]).is_err());
    }

    #[test]
    fn build_is_deterministic_and_valid() {
        let a = sample_map(&[1, 2, 3, 0x21]);
        let b = sample_map(&[1, 2, 3, 0x21]);
        assert_eq!(a.root_hash(), b.root_hash());
        assert!(a.is_valid());
        assert!(!a.is_empty());
        assert!(RadixMap::default().is_valid());
    }

    #[test]
    fn visit_nodes_covers_all_reachable() {
        let map = sample_map(&[1, 2, 3]);
        let seen = reachable_hashes(&map);
        assert!(seen.contains(&map.root_hash()));
        // Three leaves plus at least the root.
        assert!(seen.len() >= 4);
    }

    #[test]
    fn visitor_false_stops_walk() {
        let map = sample_map(&[1, 2, 3, 4, 5]);
        let mut visited = 0;
        let completed = map.visit_nodes(&mut |_, _| {
            visited += 1;
            visited < 2
        });
        assert!(!completed);
        assert_eq!(visited, 2);
    }

    #[test]
    fn differences_prune_shared_subtrees() {
        let prev = sample_map(&[1, 2, 3]);
        let curr = sample_map(&[1, 2, 3, 4]);

        let mut diff = HashSet::new();
        curr.visit_differences(&prev, &mut |hash, _| {
            diff.insert(*hash);
            true
        });

        let prev_nodes = reachable_hashes(&prev);
        let curr_nodes = reachable_hashes(&curr);
        let expected: HashSet<B256> = curr_nodes.difference(&prev_nodes).copied().collect();
        assert_eq!(diff, expected);
        assert!(!diff.is_empty());

        // Identical maps differ in nothing.
        let mut none = 0;
        curr.visit_differences(&curr, &mut |_, _| {
            none += 1;
            true
        });
        assert_eq!(none, 0);
    }

    #[test]
    fn backend_walk_matches_resident_walk() {
        let map = sample_map(&[1, 2, 3, 0x31, 0x32]);
        let mut walked = HashSet::new();
        let mut source = |hash: &B256| -> Result<Vec<u8>> {
            walked.insert(*hash);
            map.node(hash)
                .map(|n| n.encode())
                .ok_or_else(|| eyre!("missing node {hash}"))
        };
        walk_tree(&map.root_hash(), &mut source).expect("walk");
        drop(source);
        assert_eq!(walked, reachable_hashes(&map));
    }

    #[test]
    fn backend_walk_aborts_on_missing_node() {
        let map = sample_map(&[1, 2, 3]);
        let skip = key(1);
        let mut source = |hash: &B256| -> Result<Vec<u8>> {
            map.node(hash)
                .filter(|n| !matches!(n, MapNode::Leaf { key, .. } if *key == skip))
                .map(|n| n.encode())
                .ok_or_else(|| eyre!("missing node {hash}"))
        };
        assert!(walk_tree(&map.root_hash(), &mut source).is_err());
    }
}
