use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ethereum_types::H256;

use crate::error::TrieError;
use crate::nibbles::Nibbles;
use crate::trienode::NodeSet;

/// Read interface the trie uses to resolve hashed node references.
///
/// The traversal path is handed down alongside the hash so that
/// path-indexed backends can locate the node without scanning.
/// Flat hash-keyed backends are free to ignore it.
pub trait TrieDB: Send + Sync {
    fn get(&self, path: &Nibbles, hash: H256) -> Result<Option<Vec<u8>>, TrieError>;
}

/// Plain hash-to-blob persistence used underneath each database shard.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, hash: H256) -> Result<Option<Vec<u8>>, TrieError>;
    fn put(&self, hash: H256, value: Vec<u8>) -> Result<(), TrieError>;
    fn delete(&self, hash: H256) -> Result<(), TrieError>;
}

/// A stored blob and the number of trie paths currently holding it.
/// Hash addressing dedupes identical nodes, so a blob may only be dropped
/// once the last path referencing it is gone.
struct CountedNode {
    rlp: Vec<u8>,
    refs: u32,
}

/// InMemory implementation for the TrieDB trait, used for testing and
/// sequential setups without a sharded store underneath
#[derive(Default, Clone)]
pub struct InMemoryTrieDB {
    inner: Arc<Mutex<HashMap<H256, CountedNode>>>,
}

impl InMemoryTrieDB {
    pub fn new_empty() -> Self {
        Self::default()
    }

    /// Writes a committed node set into the store. Every added path counts
    /// one reference on its blob, every deletion marker drops one; the blob
    /// itself is removed only when no path references it anymore.
    pub fn apply(&self, set: &NodeSet) -> Result<(), TrieError> {
        let mut inner = self.inner.lock().map_err(|_| TrieError::LockError)?;
        for (_, node) in set.iter() {
            if node.is_deleted() {
                if let Some(cached) = inner.get_mut(&node.hash) {
                    cached.refs = cached.refs.saturating_sub(1);
                    if cached.refs == 0 {
                        inner.remove(&node.hash);
                    }
                }
            } else {
                inner
                    .entry(node.hash)
                    .and_modify(|cached| cached.refs += 1)
                    .or_insert_with(|| CountedNode {
                        rlp: node.rlp.clone(),
                        refs: 1,
                    });
            }
        }
        Ok(())
    }
}

impl TrieDB for InMemoryTrieDB {
    fn get(&self, _path: &Nibbles, hash: H256) -> Result<Option<Vec<u8>>, TrieError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| TrieError::LockError)?
            .get(&hash)
            .map(|cached| cached.rlp.clone()))
    }
}

/// InMemory implementation for the KeyValueStore trait, used as the disk
/// layer in tests and ephemeral setups
#[derive(Default, Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<HashMap<H256, Vec<u8>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, hash: H256) -> Result<Option<Vec<u8>>, TrieError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| TrieError::LockError)?
            .get(&hash)
            .cloned())
    }

    fn put(&self, hash: H256, value: Vec<u8>) -> Result<(), TrieError> {
        self.inner
            .lock()
            .map_err(|_| TrieError::LockError)?
            .insert(hash, value);
        Ok(())
    }

    fn delete(&self, hash: H256) -> Result<(), TrieError> {
        self.inner
            .lock()
            .map_err(|_| TrieError::LockError)?
            .remove(&hash);
        Ok(())
    }
}
