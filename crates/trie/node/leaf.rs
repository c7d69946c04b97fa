use crate::ValueRLP;
use crate::error::TrieError;
use crate::nibbles::Nibbles;
use crate::node_hash::NodeHash;
use crate::tracker::ShardedTracker;

use super::{BranchNode, ExtensionNode, Node, NodeRef};

/// Leaf Node of an Ethereum Compatible Patricia Merkle Trie
/// Contains the node's path and value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeafNode {
    pub partial: Nibbles,
    pub value: ValueRLP,
}

impl LeafNode {
    /// Creates a new leaf node given its path and value
    pub fn new(partial: Nibbles, value: ValueRLP) -> Self {
        Self { partial, value }
    }

    /// Returns the stored value if the given path matches the stored path
    pub fn get(&self, path: Nibbles) -> Result<Option<ValueRLP>, TrieError> {
        if self.partial == path {
            Ok(Some(self.value.clone()))
        } else {
            Ok(None)
        }
    }

    /// Stores the given value, possibly splitting into a branch if the path diverges.
    /// Returns the new root of the subtrie
    pub fn insert(
        mut self,
        path: Nibbles,
        value: ValueRLP,
        tracker: &ShardedTracker,
    ) -> Result<Node, TrieError> {
        // Possible flow paths:
        //   Replace self
        //   Branch { [self,...], None, None } (insert into branch's value)
        //   Branch { [ [self,...], Leaf,...], None, None}
        //   Extension { prefix, Branch { [self,...], None, None} }
        //   Extension { prefix, Branch { [ [self,...], Leaf,...], None, None} }
        if self.partial == path {
            self.value = value;
            Ok(self.into())
        } else {
            let match_index = path.count_prefix(&self.partial);
            let self_choice_idx = self.partial.at(match_index);
            let new_leaf_choice_idx = path.at(match_index);
            // Path of the brand new leaf relative to the trie root, for tracking
            let new_leaf_path = path.current().concat(&path.slice(0, match_index + 1));
            self.partial = self.partial.offset(match_index + 1);

            let branch_node = if self_choice_idx == 16 {
                // Create a new leaf node and store the value in it
                // Create a new branch node with the leaf as a child and store self's value
                tracker.on_insert(&new_leaf_path);
                let new_leaf = LeafNode::new(path.offset(match_index + 1), value);
                let mut choices: [NodeRef; 16] = Default::default();
                choices[new_leaf_choice_idx] = Node::from(new_leaf).into();
                BranchNode::new_with_value(choices, self.value)
            } else if new_leaf_choice_idx == 16 {
                // Create a new branch node with self as a child and store the value in the branch node
                let mut choices: [NodeRef; 16] = Default::default();
                choices[self_choice_idx] = Node::from(self).into();
                BranchNode::new_with_value(choices, value)
            } else {
                // Create a new leaf node and store the path and value in it
                // Create a new branch node with the leaf and self as children
                tracker.on_insert(&new_leaf_path);
                let new_leaf = LeafNode::new(path.offset(match_index + 1), value);
                let mut choices: [NodeRef; 16] = Default::default();
                choices[new_leaf_choice_idx] = Node::from(new_leaf).into();
                choices[self_choice_idx] = Node::from(self).into();
                BranchNode::new(choices)
            };

            let final_node = if match_index == 0 {
                branch_node.into()
            } else {
                // Create an extension node with the shared prefix pointing to the branch
                ExtensionNode::new(path.slice(0, match_index), Node::from(branch_node).into())
                    .into()
            };

            Ok(final_node)
        }
    }

    /// Removes own value if the path matches own path and returns self if it still holds a value
    pub fn remove(
        self,
        path: Nibbles,
        tracker: &ShardedTracker,
    ) -> Result<(Option<Node>, Option<ValueRLP>), TrieError> {
        if self.partial == path {
            tracker.on_delete(&path.current());
            Ok((None, Some(self.value)))
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

    /// Appends own encoding to `node_path` if it is not inlined in its parent
    pub fn get_path(&self, node_path: &mut Vec<Vec<u8>>) -> Result<(), TrieError> {
        let encoded = self.encode_raw();
        if encoded.len() >= 32 {
            node_path.push(encoded);
        }
        Ok(())
    }
}
