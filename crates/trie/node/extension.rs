use crate::ValueRLP;
use crate::db::TrieDB;
use crate::error::TrieError;
use crate::nibbles::Nibbles;
use crate::node_hash::NodeHash;
use crate::tracker::ShardedTracker;

use super::{BranchNode, Node, NodeRef};

/// Extension Node of an Ethereum Compatible Patricia Merkle Trie
/// Contains the node's prefix and a reference to its child node
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionNode {
    pub prefix: Nibbles,
    pub child: NodeRef,
}

impl ExtensionNode {
    /// Creates a new extension node given its child reference and prefix
    pub fn new(prefix: Nibbles, child: NodeRef) -> Self {
        Self { prefix, child }
    }

    /// Retrieves a value from the subtrie originating from this node given its path
    pub fn get(
        &self,
        db: &dyn TrieDB,
        mut path: Nibbles,
        tracker: &ShardedTracker,
    ) -> Result<Option<ValueRLP>, TrieError> {
        // If the path is prefixed by this node's prefix, delegate to its child.
        // Otherwise, no value is present.
        if path.skip_prefix(&self.prefix) {
            let child_node = self
                .child
                .get_node(db, &path.current(), tracker)?
                .ok_or(TrieError::InconsistentTree)?;
            child_node.get(db, path, tracker)
        } else {
            Ok(None)
        }
    }

    /// Inserts a value into the subtrie originating from this node and returns the new root of the subtrie
    pub fn insert(
        mut self,
        db: &dyn TrieDB,
        mut path: Nibbles,
        value: ValueRLP,
        tracker: &ShardedTracker,
    ) -> Result<Node, TrieError> {
        let match_index = path.count_prefix(&self.prefix);
        if match_index == self.prefix.len() {
            // Insert into child node
            path.skip_prefix(&self.prefix);
            let child_node = self
                .child
                .get_node(db, &path.current(), tracker)?
                .ok_or(TrieError::InconsistentTree)?;
            let new_child_node = child_node.insert(db, path, value, tracker)?;
            self.child = new_child_node.into();
            Ok(self.into())
        } else if match_index == 0 {
            // Branch out at the first nibble, moving the current child one
            // level down if the prefix was longer than a single nibble.
            let new_node = if self.prefix.len() == 1 {
                self.child.clone()
            } else {
                Node::from(ExtensionNode::new(self.prefix.offset(1), self.child.clone())).into()
            };
            let mut choices: [NodeRef; 16] = Default::default();
            choices[self.prefix.at(0)] = new_node;
            let branch_node = BranchNode::new(choices);
            branch_node.insert(db, path, value, tracker)
        } else {
            // Split the prefix at the divergence point and insert into the
            // lower half, which will branch out itself.
            let new_extension =
                ExtensionNode::new(self.prefix.offset(match_index), self.child.clone());
            let new_node = new_extension.insert(db, path.offset(match_index), value, tracker)?;
            self.prefix = self.prefix.slice(0, match_index);
            self.child = new_node.into();
            Ok(self.into())
        }
    }

    /// Removes a value from the subtrie originating from this node given its path
    /// Returns the new root of the subtrie (if any) and the removed value if it existed in the subtrie
    pub fn remove(
        mut self,
        db: &dyn TrieDB,
        mut path: Nibbles,
        tracker: &ShardedTracker,
    ) -> Result<(Option<Node>, Option<ValueRLP>), TrieError> {
        // If the path is prefixed by this node's prefix, delegate to its child.
        // Otherwise, no value is present.
        if path.skip_prefix(&self.prefix) {
            let child_path = path.current();
            let child_node = self
                .child
                .get_node(db, &child_path, tracker)?
                .ok_or(TrieError::InconsistentTree)?;
            let (child_node, old_value) = child_node.remove(db, path, tracker)?;
            // The child node may have collapsed into a short node, in which
            // case it gets merged into self and its own slot disappears.
            let node = match child_node {
                Some(Node::Branch(branch_node)) => {
                    self.child = Node::Branch(branch_node).into();
                    Some(self.into())
                }
                Some(Node::Extension(mut extension_node)) => {
                    tracker.on_delete(&child_path);
                    extension_node.prefix = self.prefix.concat(&extension_node.prefix);
                    Some(extension_node.into())
                }
                Some(Node::Leaf(mut leaf_node)) => {
                    tracker.on_delete(&child_path);
                    leaf_node.partial = self.prefix.concat(&leaf_node.partial);
                    Some(leaf_node.into())
                }
                None => None,
            };
            Ok((node, old_value))
        } else {
            Ok((Some(self.into()), None))
        }
    }

    /// Computes the node's hash
    pub fn compute_hash(&self) -> NodeHash {
        NodeHash::from_encoded_raw(&self.encode_raw())
    }

    /// Encodes the node
    pub fn encode_raw(&self) -> Vec<u8> {
        use paratrie_rlp::encode::RLPEncode;
        self.encode_to_vec()
    }

    /// Traverses own subtrie until reaching the node containing `path`
    /// Appends all encoded nodes traversed to `node_path` (including self)
    pub fn get_path(
        &self,
        db: &dyn TrieDB,
        mut path: Nibbles,
        node_path: &mut Vec<Vec<u8>>,
        tracker: &ShardedTracker,
    ) -> Result<(), TrieError> {
        // Add self to node_path (if not inlined in parent)
        let encoded = self.encode_raw();
        if encoded.len() >= 32 {
            node_path.push(encoded);
        }
        // Continue to child
        if path.skip_prefix(&self.prefix) {
            let child_node = self
                .child
                .get_node(db, &path.current(), tracker)?
                .ok_or(TrieError::InconsistentTree)?;
            child_node.get_path(db, path, node_path, tracker)?;
        }
        Ok(())
    }
}
