use std::collections::HashMap;

use ethereum_types::H256;

use crate::NodeRLP;
use crate::error::TrieError;
use crate::nibbles::Nibbles;
use crate::sharded::SHARD_COUNT;

/// A committed trie node blob together with its hash.
/// An empty blob marks a deletion, with `hash` naming the node being removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrieNode {
    pub hash: H256,
    pub rlp: NodeRLP,
}

impl TrieNode {
    pub fn new(hash: H256, rlp: NodeRLP) -> Self {
        Self { hash, rlp }
    }

    pub fn is_deleted(&self) -> bool {
        self.rlp.is_empty()
    }
}

/// The set of dirty nodes produced by committing a single trie, keyed by
/// the node's path from the root. `owner` identifies which trie the nodes
/// belong to (zero for a standalone trie).
#[derive(Debug, Default, Clone)]
pub struct NodeSet {
    owner: H256,
    nodes: HashMap<Nibbles, TrieNode>,
}

impl NodeSet {
    pub fn new(owner: H256) -> Self {
        Self {
            owner,
            nodes: HashMap::new(),
        }
    }

    pub fn owner(&self) -> H256 {
        self.owner
    }

    pub fn add_node(&mut self, path: Nibbles, hash: H256, rlp: NodeRLP) {
        self.nodes.insert(path, TrieNode::new(hash, rlp));
    }

    pub fn mark_deleted(&mut self, path: Nibbles, prev_hash: H256) {
        self.nodes.insert(path, TrieNode::new(prev_hash, vec![]));
    }

    pub fn get(&self, path: &Nibbles) -> Option<&TrieNode> {
        self.nodes.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Nibbles, &TrieNode)> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Node sets from multiple tries gathered for a single database update,
/// at most one per owner.
#[derive(Debug, Default)]
pub struct MergedNodeSet {
    sets: HashMap<H256, NodeSet>,
}

impl MergedNodeSet {
    pub fn merge(&mut self, set: NodeSet) -> Result<(), TrieError> {
        if self.sets.contains_key(&set.owner) {
            return Err(TrieError::InvalidInput);
        }
        self.sets.insert(set.owner, set);
        Ok(())
    }

    pub fn sets(&self) -> impl Iterator<Item = &NodeSet> {
        self.sets.values()
    }

    pub fn len(&self) -> usize {
        self.sets.values().map(NodeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(NodeSet::is_empty)
    }

    /// Partitions the merged set by the first nibble of each node path,
    /// preserving the per-owner grouping inside every partition. Nodes whose
    /// path sits above the fan-out point (the root node itself) land in the
    /// separate overflow set. The returned flags record which of the 16
    /// partitions received any node.
    pub fn regroup(&self) -> ([MergedNodeSet; SHARD_COUNT], MergedNodeSet, [bool; SHARD_COUNT]) {
        let mut buckets: [MergedNodeSet; SHARD_COUNT] = Default::default();
        let mut overflow = MergedNodeSet::default();
        let mut occupied = [false; SHARD_COUNT];

        for set in self.sets.values() {
            let mut routed: [NodeSet; SHARD_COUNT] =
                std::array::from_fn(|_| NodeSet::new(set.owner));
            let mut root_nodes = NodeSet::new(set.owner);
            for (path, node) in set.iter() {
                match path.first_choice() {
                    Some(choice) => {
                        routed[choice].nodes.insert(path.clone(), node.clone());
                    }
                    None => {
                        root_nodes.nodes.insert(path.clone(), node.clone());
                    }
                }
            }
            for (index, routed_set) in routed.into_iter().enumerate() {
                if !routed_set.is_empty() {
                    occupied[index] = true;
                    // owners are unique across self, insertion cannot collide
                    buckets[index].sets.insert(set.owner, routed_set);
                }
            }
            if !root_nodes.is_empty() {
                overflow.sets.insert(set.owner, root_nodes);
            }
        }

        (buckets, overflow, occupied)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(byte: u8) -> TrieNode {
        TrieNode::new(H256::repeat_byte(byte), vec![byte; 40])
    }

    #[test]
    fn merge_rejects_duplicate_owner() {
        let owner = H256::repeat_byte(1);
        let mut merged = MergedNodeSet::default();
        merged.merge(NodeSet::new(owner)).unwrap();
        assert!(matches!(
            merged.merge(NodeSet::new(owner)),
            Err(TrieError::InvalidInput)
        ));
    }

    #[test]
    fn regroup_routes_by_first_nibble() {
        let mut set = NodeSet::new(H256::zero());
        set.nodes
            .insert(Nibbles::from_slice(&[0x1, 0x2]), node(0x12));
        set.nodes
            .insert(Nibbles::from_slice(&[0x1, 0x3]), node(0x13));
        set.nodes.insert(Nibbles::from_slice(&[0xf]), node(0xf0));
        set.nodes.insert(Nibbles::from_slice(&[]), node(0xaa));

        let mut merged = MergedNodeSet::default();
        merged.merge(set).unwrap();
        let (buckets, overflow, occupied) = merged.regroup();

        assert_eq!(buckets[0x1].len(), 2);
        assert_eq!(buckets[0xf].len(), 1);
        assert_eq!(overflow.len(), 1);
        assert!(occupied[0x1] && occupied[0xf]);
        assert_eq!(occupied.iter().filter(|o| **o).count(), 2);
    }

    #[test]
    fn regroup_preserves_owner_grouping() {
        let owner_a = H256::repeat_byte(0xaa);
        let owner_b = H256::repeat_byte(0xbb);
        let mut set_a = NodeSet::new(owner_a);
        set_a.nodes.insert(Nibbles::from_slice(&[0x2]), node(1));
        let mut set_b = NodeSet::new(owner_b);
        set_b.nodes.insert(Nibbles::from_slice(&[0x2, 0x5]), node(2));

        let mut merged = MergedNodeSet::default();
        merged.merge(set_a).unwrap();
        merged.merge(set_b).unwrap();
        let (buckets, _, _) = merged.regroup();

        let owners: Vec<H256> = buckets[0x2].sets().map(NodeSet::owner).collect();
        assert_eq!(owners.len(), 2);
        assert!(owners.contains(&owner_a) && owners.contains(&owner_b));
    }

    #[test]
    fn deletion_marker_is_detected() {
        let mut set = NodeSet::new(H256::zero());
        set.mark_deleted(Nibbles::from_slice(&[0x3]), H256::repeat_byte(3));
        let (path, trie_node) = set.iter().next().unwrap();
        assert_eq!(path, &Nibbles::from_slice(&[0x3]));
        assert!(trie_node.is_deleted());
    }
}
