pub mod db;
pub mod error;
mod nibbles;
mod node;
mod node_hash;
mod parallel;
mod proof;
mod rlp;
mod sharded;
mod tracker;
mod trienode;
mod worker;

use std::sync::Arc;

use ethereum_types::H256;
use paratrie_rlp::constants::RLP_NULL;

pub use self::db::{InMemoryStore, InMemoryTrieDB, KeyValueStore, TrieDB};
pub use self::error::TrieError;
pub use self::nibbles::Nibbles;
pub use self::node::{BranchNode, ExtensionNode, LeafNode, Node, NodeRef};
pub use self::node_hash::NodeHash;
pub use self::proof::verify_proof;
pub use self::sharded::{ChildResolver, MptResolver, SHARD_COUNT, ShardConfig, ShardedDb};
pub use self::tracker::{ShardedTracker, Tracker};
pub use self::trienode::{MergedNodeSet, NodeSet, TrieNode};
pub use self::worker::{generate_ranges, parallel_worker};

use self::node_hash::keccak;

use lazy_static::lazy_static;

lazy_static! {
    // Hash value for an empty trie, equal to keccak(RLP_NULL)
    pub static ref EMPTY_TRIE_HASH: H256 = keccak([RLP_NULL]);
}

/// RLP-encoded trie path
pub type PathRLP = Vec<u8>;
/// RLP-encoded trie value
pub type ValueRLP = Vec<u8>;
/// RLP-encoded trie node
pub type NodeRLP = Vec<u8>;

/// Ethereum Compatible Merkle Patricia Trie with batch-parallel updates
pub struct Trie {
    /// Reference to the current root node
    pub(crate) root: NodeRef,
    /// Backend the trie reads unresolved nodes from
    pub(crate) db: Arc<dyn TrieDB>,
    /// Identifies this trie within a merged node set, zero for a standalone trie
    owner: H256,
    /// Records node paths read, created and deleted since the last commit
    pub(crate) tracker: ShardedTracker,
}

impl Trie {
    /// Creates a new Trie from a clean DB
    pub fn new(db: Arc<dyn TrieDB>) -> Self {
        Self {
            root: NodeRef::default(),
            db,
            owner: H256::zero(),
            tracker: ShardedTracker::default(),
        }
    }

    /// Creates a trie from an already-initialized DB and sets root as the root node of the trie
    pub fn open(db: Arc<dyn TrieDB>, root: H256) -> Self {
        let mut trie = Self::new(db);
        if root != *EMPTY_TRIE_HASH {
            trie.root = NodeHash::from(root).into();
        }
        trie
    }

    /// Same as [`Trie::open`] but tagging the trie with an owner, so that its
    /// committed nodes can be merged with other tries' for a database update
    pub fn open_owned(db: Arc<dyn TrieDB>, root: H256, owner: H256) -> Self {
        let mut trie = Self::open(db, root);
        trie.owner = owner;
        trie
    }

    /// Retrieve an RLP-encoded value from the trie given its RLP-encoded path.
    pub fn get(&self, path: &PathRLP) -> Result<Option<ValueRLP>, TrieError> {
        if !self.root.is_valid() {
            return Ok(None);
        }
        let root_node = self
            .root
            .get_node(&*self.db, &Nibbles::default(), &self.tracker)?
            .ok_or(TrieError::InconsistentTree)?;
        root_node.get(&*self.db, Nibbles::from_bytes(path), &self.tracker)
    }

    /// Insert an RLP-encoded value into the trie.
    pub fn insert(&mut self, path: PathRLP, value: ValueRLP) -> Result<(), TrieError> {
        let path = Nibbles::from_bytes(&path);
        if self.root.is_valid() {
            // If the trie is not empty, call the root node's insertion logic
            let root_node = self
                .root
                .get_node(&*self.db, &Nibbles::default(), &self.tracker)?
                .ok_or(TrieError::InconsistentTree)?;
            self.root = root_node
                .insert(&*self.db, path, value, &self.tracker)?
                .into();
        } else {
            // If the trie is empty, just add a leaf.
            self.tracker.on_insert(&Nibbles::default());
            self.root = Node::from(LeafNode::new(path, value)).into();
        }
        Ok(())
    }

    /// Remove a value from the trie given its RLP-encoded path.
    /// Returns the value if it was succesfully removed or None if it wasn't part of the trie
    pub fn remove(&mut self, path: PathRLP) -> Result<Option<ValueRLP>, TrieError> {
        if !self.root.is_valid() {
            return Ok(None);
        }
        let root_node = self
            .root
            .get_node(&*self.db, &Nibbles::default(), &self.tracker)?
            .ok_or(TrieError::InconsistentTree)?;
        let (root_node, old_value) =
            root_node.remove(&*self.db, Nibbles::from_bytes(&path), &self.tracker)?;
        self.root = match root_node {
            Some(root_node) => root_node.into(),
            None => NodeRef::default(),
        };
        Ok(old_value)
    }

    /// Return the hash of the trie's root node.
    /// Returns keccak(RLP_NULL) if the trie is empty
    pub fn hash(&self) -> H256 {
        if self.root.is_valid() {
            self.root.compute_hash().finalize()
        } else {
            *EMPTY_TRIE_HASH
        }
    }

    /// Hashes the whole trie and drains the dirty nodes accumulated since the
    /// last commit into a [`NodeSet`], keyed by path and tagged with this
    /// trie's owner. Deletion markers recorded by the tracker are folded in.
    /// The caller decides where the set goes, nothing is written here.
    pub fn commit(&mut self) -> (H256, NodeSet) {
        let mut set = NodeSet::new(self.owner);
        let root_hash = if self.root.is_valid() {
            match self.root.commit(Nibbles::default(), &mut set) {
                NodeHash::Hashed(hash) => hash,
                // A root shorter than 32 bytes has no parent to live in,
                // persist it under its keccak hash.
                inline => {
                    let finalized = inline.finalize();
                    set.add_node(Nibbles::default(), finalized, inline.as_ref().to_vec());
                    finalized
                }
            }
        } else {
            *EMPTY_TRIE_HASH
        };
        self.tracker.mark_deletions(&mut set);
        self.tracker.reset();
        (root_hash, set)
    }

    /// Obtain a merkle proof for the given path.
    /// The proof will contain all the encoded nodes traversed until reaching the node where the path is stored (including this last node).
    /// The proof will still be constructed even if the path is not stored in the trie, proving its absence.
    pub fn get_proof(&self, path: &PathRLP) -> Result<Vec<NodeRLP>, TrieError> {
        // Will store all the encoded nodes traversed until reaching the node containing the path
        let mut node_path = Vec::new();
        if !self.root.is_valid() {
            return Ok(node_path);
        }
        // If the root is inlined, add it to the node_path
        if let hash @ NodeHash::Inline(_) = self.root.compute_hash() {
            node_path.push(hash.as_ref().to_vec());
        }
        let root_node = self
            .root
            .get_node(&*self.db, &Nibbles::default(), &self.tracker)?
            .ok_or(TrieError::InconsistentTree)?;
        root_node.get_path(
            &*self.db,
            Nibbles::from_bytes(path),
            &mut node_path,
            &self.tracker,
        )?;
        Ok(node_path)
    }

    /// Creates a new Trie based on a temporary InMemory DB
    pub fn new_temp() -> Self {
        Trie::new(Arc::new(InMemoryTrieDB::new_empty()))
    }
}
