mod branch;
mod extension;
mod leaf;

use std::sync::{Arc, OnceLock};

pub use branch::BranchNode;
pub use extension::ExtensionNode;
pub use leaf::LeafNode;

use paratrie_rlp::decode::RLPDecode;
use paratrie_rlp::error::RLPDecodeError;

use crate::ValueRLP;
use crate::db::TrieDB;
use crate::error::TrieError;
use crate::nibbles::Nibbles;
use crate::node_hash::NodeHash;
use crate::tracker::ShardedTracker;
use crate::trienode::NodeSet;

/// A reference to a node.
#[derive(Clone, Debug)]
pub enum NodeRef {
    /// The node is embedded within the reference.
    Node(Arc<Node>, OnceLock<NodeHash>),
    /// The node is in the database, referenced by its hash.
    Hash(NodeHash),
}

impl NodeRef {
    /// Resolves the referenced node, reading it from the database when only
    /// its hash is at hand. `at` is the node's path from the trie root, which
    /// path-indexed backends use to locate the blob. Resolved reads are
    /// recorded on the tracker.
    pub fn get_node(
        &self,
        db: &dyn TrieDB,
        at: &Nibbles,
        tracker: &ShardedTracker,
    ) -> Result<Option<Node>, TrieError> {
        match *self {
            NodeRef::Node(ref node, _) => Ok(Some(node.as_ref().clone())),
            NodeRef::Hash(NodeHash::Inline((data, len))) => {
                Ok(Some(Node::decode_raw(&data[..len as usize])?))
            }
            // Comparing finalized hashes keeps short nodes resolvable when
            // they were persisted under their keccak hash (e.g. a short root).
            NodeRef::Hash(NodeHash::Hashed(h256)) => db
                .get(at, h256)?
                .filter(|rlp| !rlp.is_empty())
                .and_then(|rlp| match Node::decode_raw(&rlp) {
                    Ok(node) => (node.compute_hash().finalize() == h256).then(|| {
                        tracker.on_read(at, &rlp);
                        Ok(node)
                    }),
                    Err(err) => Some(Err(TrieError::RLPDecode(err))),
                })
                .transpose(),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            NodeRef::Node(_, _) => true,
            NodeRef::Hash(hash) => hash.is_valid(),
        }
    }

    /// Hashes the subtrie rooted at this reference, collecting every node
    /// that has a standalone hash into `acc` keyed by its path. Inline nodes
    /// stay embedded in their parent's encoding. The reference collapses
    /// into its hash afterwards.
    pub fn commit(&mut self, path: Nibbles, acc: &mut NodeSet) -> NodeHash {
        match *self {
            NodeRef::Node(ref mut node, ref mut hash) => {
                match Arc::make_mut(node) {
                    Node::Branch(node) => {
                        for (choice, node) in &mut node.choices.iter_mut().enumerate() {
                            node.commit(path.append_new(choice as u8), acc);
                        }
                    }
                    Node::Extension(node) => {
                        node.child.commit(path.concat(&node.prefix), acc);
                    }
                    Node::Leaf(_) => {}
                }
                let hash = *hash.get_or_init(|| node.compute_hash());
                if let NodeHash::Hashed(finalized) = hash {
                    acc.add_node(path, finalized, node.encode_raw());
                }

                *self = hash.into();

                hash
            }
            NodeRef::Hash(hash) => hash,
        }
    }

    pub fn compute_hash(&self) -> NodeHash {
        match self {
            NodeRef::Node(node, hash) => *hash.get_or_init(|| node.compute_hash()),
            NodeRef::Hash(hash) => *hash,
        }
    }

    pub fn compute_hash_ref(&self) -> &NodeHash {
        match self {
            NodeRef::Node(node, hash) => hash.get_or_init(|| node.compute_hash()),
            NodeRef::Hash(hash) => hash,
        }
    }
}

impl Default for NodeRef {
    fn default() -> Self {
        Self::Hash(NodeHash::default())
    }
}

impl From<Node> for NodeRef {
    fn from(value: Node) -> Self {
        Self::Node(Arc::new(value), OnceLock::new())
    }
}

impl From<NodeHash> for NodeRef {
    fn from(value: NodeHash) -> Self {
        Self::Hash(value)
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.compute_hash() == other.compute_hash()
    }
}

/// A Node in an Ethereum Compatible Patricia Merkle Trie
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Branch(Box<BranchNode>),
    Extension(ExtensionNode),
    Leaf(LeafNode),
}

impl From<Box<BranchNode>> for Node {
    fn from(val: Box<BranchNode>) -> Self {
        Node::Branch(val)
    }
}

impl From<BranchNode> for Node {
    fn from(val: BranchNode) -> Self {
        Node::Branch(Box::new(val))
    }
}

impl From<ExtensionNode> for Node {
    fn from(val: ExtensionNode) -> Self {
        Node::Extension(val)
    }
}

impl From<LeafNode> for Node {
    fn from(val: LeafNode) -> Self {
        Node::Leaf(val)
    }
}

impl Node {
    /// Retrieves a value from the subtrie originating from this node given its path
    pub fn get(
        &self,
        db: &dyn TrieDB,
        path: Nibbles,
        tracker: &ShardedTracker,
    ) -> Result<Option<ValueRLP>, TrieError> {
        match self {
            Node::Branch(n) => n.get(db, path, tracker),
            Node::Extension(n) => n.get(db, path, tracker),
            Node::Leaf(n) => n.get(path),
        }
    }

    /// Inserts a value into the subtrie originating from this node and returns the new root of the subtrie
    pub fn insert(
        self,
        db: &dyn TrieDB,
        path: Nibbles,
        value: ValueRLP,
        tracker: &ShardedTracker,
    ) -> Result<Node, TrieError> {
        match self {
            Node::Branch(n) => n.insert(db, path, value, tracker),
            Node::Extension(n) => n.insert(db, path, value, tracker),
            Node::Leaf(n) => n.insert(path, value, tracker),
        }
    }

    /// Removes a value from the subtrie originating from this node given its path
    /// Returns the new root of the subtrie (if any) and the removed value if it existed in the subtrie
    pub fn remove(
        self,
        db: &dyn TrieDB,
        path: Nibbles,
        tracker: &ShardedTracker,
    ) -> Result<(Option<Node>, Option<ValueRLP>), TrieError> {
        match self {
            Node::Branch(n) => n.remove(db, path, tracker),
            Node::Extension(n) => n.remove(db, path, tracker),
            Node::Leaf(n) => n.remove(path, tracker),
        }
    }

    /// Traverses own subtrie until reaching the node containing `path`
    /// Appends all encoded nodes traversed to `node_path` (including self)
    /// Only nodes with encoded len over or equal to 32 bytes are included
    pub fn get_path(
        &self,
        db: &dyn TrieDB,
        path: Nibbles,
        node_path: &mut Vec<Vec<u8>>,
        tracker: &ShardedTracker,
    ) -> Result<(), TrieError> {
        match self {
            Node::Branch(n) => n.get_path(db, path, node_path, tracker),
            Node::Extension(n) => n.get_path(db, path, node_path, tracker),
            Node::Leaf(n) => n.get_path(node_path),
        }
    }

    /// Encodes the node
    pub fn encode_raw(&self) -> Vec<u8> {
        match self {
            Node::Branch(n) => n.encode_raw(),
            Node::Extension(n) => n.encode_raw(),
            Node::Leaf(n) => n.encode_raw(),
        }
    }

    /// Decodes the node
    pub fn decode_raw(rlp: &[u8]) -> Result<Self, RLPDecodeError> {
        Self::decode(rlp)
    }

    /// Computes the node's hash
    pub fn compute_hash(&self) -> NodeHash {
        match self {
            Node::Branch(n) => n.compute_hash(),
            Node::Extension(n) => n.compute_hash(),
            Node::Leaf(n) => n.compute_hash(),
        }
    }
}
