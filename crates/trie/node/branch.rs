use crate::ValueRLP;
use crate::db::TrieDB;
use crate::error::TrieError;
use crate::nibbles::Nibbles;
use crate::node_hash::NodeHash;
use crate::tracker::ShardedTracker;

use super::{ExtensionNode, LeafNode, Node, NodeRef};

/// Branch Node of an Ethereum Compatible Patricia Merkle Trie
/// Contains the node's value and the hash of the next node for each nibble (choice)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BranchNode {
    pub choices: [NodeRef; 16],
    pub value: ValueRLP,
}

impl BranchNode {
    /// Creates a new branch node given its children
    pub fn new(choices: [NodeRef; 16]) -> Self {
        Self {
            choices,
            value: Default::default(),
        }
    }

    /// Creates a new branch node given its children and value
    pub fn new_with_value(choices: [NodeRef; 16], value: ValueRLP) -> Self {
        Self { choices, value }
    }

    /// Updates the node's value
    pub fn update(&mut self, new_value: ValueRLP) {
        self.value = new_value;
    }

    /// Retrieves a value from the subtrie originating from this node given its path
    pub fn get(
        &self,
        db: &dyn TrieDB,
        mut path: Nibbles,
        tracker: &ShardedTracker,
    ) -> Result<Option<ValueRLP>, TrieError> {
        // If path is at the end, return the node's value.
        // Otherwise, check the corresponding choice and delegate accordingly if present.
        if let Some(choice) = path.next_choice() {
            // Delegate to children if present
            let child_ref = &self.choices[choice];
            if child_ref.is_valid() {
                let child_node = child_ref
                    .get_node(db, &path.current(), tracker)?
                    .ok_or(TrieError::InconsistentTree)?;
                child_node.get(db, path, tracker)
            } else {
                Ok(None)
            }
        } else {
            // Return internal value if present.
            Ok((!self.value.is_empty()).then(|| self.value.clone()))
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
        match path.next_choice() {
            Some(choice) => {
                let choice_ref = &mut self.choices[choice];
                if choice_ref.is_valid() {
                    let child_node = choice_ref
                        .get_node(db, &path.current(), tracker)?
                        .ok_or(TrieError::InconsistentTree)?;
                    let new_child = child_node.insert(db, path, value, tracker)?;
                    *choice_ref = new_child.into();
                } else {
                    // Open a new leaf where nothing existed before
                    tracker.on_insert(&path.current());
                    *choice_ref = Node::from(LeafNode::new(path, value)).into();
                }
            }
            None => {
                // Insert into self
                self.update(value);
            }
        };
        Ok(self.into())
    }

    /// Removes a value from the subtrie originating from this node given its path
    /// Returns the new root of the subtrie (if any) and the removed value if it existed in the subtrie
    pub fn remove(
        mut self,
        db: &dyn TrieDB,
        mut path: Nibbles,
        tracker: &ShardedTracker,
    ) -> Result<(Option<Node>, Option<ValueRLP>), TrieError> {
        // The path of this node, before consuming the next choice nibble.
        let branch_path = path.current();

        let value = match path.next_choice() {
            Some(choice) => {
                if self.choices[choice].is_valid() {
                    let child_node = self.choices[choice]
                        .get_node(db, &path.current(), tracker)?
                        .ok_or(TrieError::InconsistentTree)?;
                    let (new_child, old_value) = child_node.remove(db, path, tracker)?;
                    self.choices[choice] = match new_child {
                        Some(child) => child.into(),
                        None => NodeRef::default(),
                    };
                    old_value
                } else {
                    None
                }
            }
            None => {
                let value = std::mem::take(&mut self.value);
                (!value.is_empty()).then_some(value)
            }
        };

        // The node may have become redundant, restructure it if so:
        // - No children and no value: prune the node.
        // - No children but a value: turn into a leaf holding the value.
        // - A single child and no value: merge with the child.
        let children: Vec<usize> = (0..16).filter(|i| self.choices[*i].is_valid()).collect();
        let new_node = match (children.len(), self.value.is_empty()) {
            (0, true) => None,
            (0, false) => Some(
                LeafNode::new(Nibbles::from_hex(vec![16]), std::mem::take(&mut self.value)).into(),
            ),
            (1, true) => {
                let choice_index = children[0];
                let child_path = branch_path.append_new(choice_index as u8);
                let child = self.choices[choice_index]
                    .get_node(db, &child_path, tracker)?
                    .ok_or(TrieError::InconsistentTree)?;
                match child {
                    // The child branch stays where it is, point at it through
                    // an extension carrying the choice nibble.
                    Node::Branch(_) => Some(
                        ExtensionNode::new(
                            Nibbles::from_hex(vec![choice_index as u8]),
                            self.choices[choice_index].clone(),
                        )
                        .into(),
                    ),
                    // Merge the child node into self, its own slot disappears.
                    Node::Extension(mut extension_node) => {
                        tracker.on_delete(&child_path);
                        extension_node.prefix.prepend(choice_index as u8);
                        Some(extension_node.into())
                    }
                    Node::Leaf(mut leaf) => {
                        tracker.on_delete(&child_path);
                        leaf.partial.prepend(choice_index as u8);
                        Some(leaf.into())
                    }
                }
            }
            _ => Some(self.into()),
        };

        Ok((new_node, value))
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
        // Check the corresponding choice and delegate accordingly if present.
        if let Some(choice) = path.next_choice() {
            if self.choices[choice].is_valid() {
                let child_node = self.choices[choice]
                    .get_node(db, &path.current(), tracker)?
                    .ok_or(TrieError::InconsistentTree)?;
                child_node.get_path(db, path, node_path, tracker)?;
            }
        }
        Ok(())
    }
}
