use std::array;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::db::TrieDB;
use crate::error::TrieError;
use crate::nibbles::Nibbles;
use crate::node::{BranchNode, ExtensionNode, LeafNode, Node, NodeRef};
use crate::tracker::ShardedTracker;
use crate::worker::parallel_worker;
use crate::{PathRLP, Trie, ValueRLP};

/// Mutable state a fan-out worker owns for a single root branch choice.
struct BucketSlot {
    sub: NodeRef,
    err: Option<TrieError>,
}

struct BucketGet {
    found: Vec<(usize, Option<ValueRLP>)>,
    err: Option<TrieError>,
}

impl Trie {
    /// Applies a batch of updates, fanning the work out across the sixteen
    /// root branch children by the first nibble of each key. An empty value
    /// removes the key. The resulting root hash is identical to inserting
    /// the batch sequentially in order.
    ///
    /// Entries sharing a first nibble are applied in batch order by the same
    /// worker, entries in different buckets are independent by construction.
    pub fn parallel_update(
        &mut self,
        keys: &[PathRLP],
        values: &[ValueRLP],
    ) -> Result<(), TrieError> {
        if keys.len() != values.len() {
            return Err(TrieError::InvalidInput);
        }
        if keys.is_empty() {
            return Ok(());
        }

        let mut consumed = vec![false; keys.len()];

        // Entries addressing the root's own value slot cannot be fanned out
        for (i, key) in keys.iter().enumerate() {
            if key.is_empty() {
                self.apply_entry(key, &values[i])?;
                consumed[i] = true;
            }
        }

        // Seed the first entry of every bucket sequentially. Whatever root
        // restructuring the batch causes at the fan-out point (leaf splits,
        // extension breaks) happens here, before workers take over.
        let mut seeded = [false; 16];
        for (i, key) in keys.iter().enumerate() {
            if consumed[i] {
                continue;
            }
            let bucket = (key[0] >> 4) as usize;
            if !seeded[bucket] {
                seeded[bucket] = true;
                self.apply_entry(key, &values[i])?;
                consumed[i] = true;
            }
        }
        if consumed.iter().all(|done| *done) {
            return Ok(());
        }

        // The root only branches out when the batch spans several buckets
        // over a populated trie. Anything else is not worth fanning out.
        let root_node = if self.root.is_valid() {
            self.root
                .get_node(&*self.db, &Nibbles::default(), &self.tracker)?
                .ok_or(TrieError::InconsistentTree)?
        } else {
            debug!("trie still empty after seeding, applying batch sequentially");
            return self.apply_remaining(keys, values, &consumed);
        };
        let branch = match root_node {
            Node::Branch(branch) => *branch,
            _ => {
                debug!("root did not branch out, applying batch sequentially");
                return self.apply_remaining(keys, values, &consumed);
            }
        };

        let slots: [Mutex<BucketSlot>; 16] = array::from_fn(|i| {
            Mutex::new(BucketSlot {
                sub: branch.choices[i].clone(),
                err: None,
            })
        });
        {
            let db = &*self.db;
            let tracker = &self.tracker;
            let consumed = &consumed;
            parallel_worker(16, 16, |bucket, _, _| {
                let mut slot = slots[bucket]
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                for (i, key) in keys.iter().enumerate() {
                    if consumed[i] || (key[0] >> 4) as usize != bucket {
                        continue;
                    }
                    let mut path = Nibbles::from_bytes(key);
                    path.next();
                    let result = if values[i].is_empty() {
                        remove_in_subtrie(db, &mut slot.sub, path, tracker).map(|_| ())
                    } else {
                        insert_in_subtrie(db, &mut slot.sub, path, values[i].clone(), tracker)
                    };
                    if let Err(err) = result {
                        slot.err = Some(err);
                        return;
                    }
                }
            });
        }

        let mut new_branch = BranchNode::new_with_value(Default::default(), branch.value);
        for (i, slot) in slots.into_iter().enumerate() {
            let slot = slot.into_inner().unwrap_or_else(PoisonError::into_inner);
            if let Some(err) = slot.err {
                return Err(err);
            }
            new_branch.choices[i] = slot.sub;
        }
        self.write_back_root(new_branch)
    }

    /// Reads a batch of keys, fanning the lookups out across the sixteen
    /// root branch children. Results come back in key order.
    pub fn parallel_get(&self, keys: &[PathRLP]) -> Result<Vec<Option<ValueRLP>>, TrieError> {
        let mut results: Vec<Option<ValueRLP>> = vec![None; keys.len()];
        if keys.is_empty() || !self.root.is_valid() {
            return Ok(results);
        }
        let root_node = self
            .root
            .get_node(&*self.db, &Nibbles::default(), &self.tracker)?
            .ok_or(TrieError::InconsistentTree)?;
        let branch = match &root_node {
            Node::Branch(branch) => branch,
            _ => {
                for (i, key) in keys.iter().enumerate() {
                    results[i] =
                        root_node.get(&*self.db, Nibbles::from_bytes(key), &self.tracker)?;
                }
                return Ok(results);
            }
        };

        let buckets: [Mutex<BucketGet>; 16] = array::from_fn(|_| {
            Mutex::new(BucketGet {
                found: Vec::new(),
                err: None,
            })
        });
        {
            let db = &*self.db;
            let tracker = &self.tracker;
            parallel_worker(16, 16, |bucket, _, _| {
                let mut out = buckets[bucket]
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let child_ref = &branch.choices[bucket];
                if !child_ref.is_valid() {
                    // every key routed here is absent
                    return;
                }
                let child_path = Nibbles::from_hex(vec![bucket as u8]);
                let child = match child_ref.get_node(db, &child_path, tracker) {
                    Ok(Some(node)) => node,
                    Ok(None) => {
                        out.err = Some(TrieError::InconsistentTree);
                        return;
                    }
                    Err(err) => {
                        out.err = Some(err);
                        return;
                    }
                };
                for (i, key) in keys.iter().enumerate() {
                    if key.is_empty() || (key[0] >> 4) as usize != bucket {
                        continue;
                    }
                    let mut path = Nibbles::from_bytes(key);
                    path.next();
                    match child.get(db, path, tracker) {
                        Ok(value) => out.found.push((i, value)),
                        Err(err) => {
                            out.err = Some(err);
                            return;
                        }
                    }
                }
            });
        }
        for bucket in buckets {
            let out = bucket.into_inner().unwrap_or_else(PoisonError::into_inner);
            if let Some(err) = out.err {
                return Err(err);
            }
            for (i, value) in out.found {
                results[i] = value;
            }
        }
        // Root value slot reads stay on the caller thread
        for (i, key) in keys.iter().enumerate() {
            if key.is_empty() {
                results[i] = root_node.get(&*self.db, Nibbles::from_bytes(key), &self.tracker)?;
            }
        }
        Ok(results)
    }

    fn apply_entry(&mut self, key: &PathRLP, value: &ValueRLP) -> Result<(), TrieError> {
        if value.is_empty() {
            self.remove(key.clone()).map(|_| ())
        } else {
            self.insert(key.clone(), value.clone())
        }
    }

    fn apply_remaining(
        &mut self,
        keys: &[PathRLP],
        values: &[ValueRLP],
        consumed: &[bool],
    ) -> Result<(), TrieError> {
        for (i, key) in keys.iter().enumerate() {
            if !consumed[i] {
                self.apply_entry(key, &values[i])?;
            }
        }
        Ok(())
    }

    /// Installs the rebuilt root branch, first collapsing it the same way
    /// sequential removal would if the batch left it with too few children.
    fn write_back_root(&mut self, branch: BranchNode) -> Result<(), TrieError> {
        let children: Vec<usize> = (0..16).filter(|i| branch.choices[*i].is_valid()).collect();
        self.root = match (children.len(), branch.value.is_empty()) {
            (0, true) => NodeRef::default(),
            (0, false) => Node::from(LeafNode::new(Nibbles::from_hex(vec![16]), branch.value)).into(),
            (1, true) => {
                let choice = children[0];
                let child_path = Nibbles::from_hex(vec![choice as u8]);
                let child = branch.choices[choice]
                    .get_node(&*self.db, &child_path, &self.tracker)?
                    .ok_or(TrieError::InconsistentTree)?;
                match child {
                    Node::Branch(_) => Node::from(ExtensionNode::new(
                        Nibbles::from_hex(vec![choice as u8]),
                        branch.choices[choice].clone(),
                    ))
                    .into(),
                    Node::Extension(mut extension_node) => {
                        self.tracker.on_delete(&child_path);
                        extension_node.prefix.prepend(choice as u8);
                        Node::from(extension_node).into()
                    }
                    Node::Leaf(mut leaf) => {
                        self.tracker.on_delete(&child_path);
                        leaf.partial.prepend(choice as u8);
                        Node::from(leaf).into()
                    }
                }
            }
            _ => Node::from(branch).into(),
        };
        Ok(())
    }
}

/// Inserts below an already-consumed bucket nibble, growing a fresh leaf
/// when the bucket was empty.
fn insert_in_subtrie(
    db: &dyn TrieDB,
    slot: &mut NodeRef,
    path: Nibbles,
    value: ValueRLP,
    tracker: &ShardedTracker,
) -> Result<(), TrieError> {
    if slot.is_valid() {
        let node = slot
            .get_node(db, &path.current(), tracker)?
            .ok_or(TrieError::InconsistentTree)?;
        *slot = node.insert(db, path, value, tracker)?.into();
    } else {
        tracker.on_insert(&path.current());
        *slot = Node::from(LeafNode::new(path, value)).into();
    }
    Ok(())
}

fn remove_in_subtrie(
    db: &dyn TrieDB,
    slot: &mut NodeRef,
    path: Nibbles,
    tracker: &ShardedTracker,
) -> Result<Option<ValueRLP>, TrieError> {
    if !slot.is_valid() {
        return Ok(None);
    }
    let node = slot
        .get_node(db, &path.current(), tracker)?
        .ok_or(TrieError::InconsistentTree)?;
    let (new_node, old_value) = node.remove(db, path, tracker)?;
    *slot = match new_node {
        Some(node) => node.into(),
        None => NodeRef::default(),
    };
    Ok(old_value)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::db::InMemoryTrieDB;
    use crate::node_hash::keccak;

    /// Keys whose first nibbles spread over all sixteen buckets.
    fn hashed_entries(count: u64) -> (Vec<PathRLP>, Vec<ValueRLP>) {
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for i in 0..count {
            let key = keccak(i.to_be_bytes()).0.to_vec();
            values.push(keccak(&key).0.to_vec());
            keys.push(key);
        }
        (keys, values)
    }

    fn sequential_root(keys: &[PathRLP], values: &[ValueRLP]) -> ethereum_types::H256 {
        let mut trie = Trie::new_temp();
        for (key, value) in keys.iter().zip(values) {
            if value.is_empty() {
                trie.remove(key.clone()).unwrap();
            } else {
                trie.insert(key.clone(), value.clone()).unwrap();
            }
        }
        trie.hash()
    }

    #[test]
    fn parallel_update_matches_sequential_insertion() {
        let (keys, values) = hashed_entries(122);
        let mut trie = Trie::new_temp();
        trie.parallel_update(&keys, &values).unwrap();
        assert_eq!(trie.hash(), sequential_root(&keys, &values));
    }

    #[test]
    fn parallel_update_over_populated_trie() {
        let (keys, values) = hashed_entries(122);
        let mut trie = Trie::new_temp();
        trie.parallel_update(&keys, &values).unwrap();

        // update half, remove a quarter, add new keys
        let (mut keys2, _) = hashed_entries(61);
        let mut values2: Vec<ValueRLP> = Vec::new();
        for (i, key) in keys2.iter().enumerate() {
            if i % 4 == 0 {
                values2.push(vec![]);
            } else {
                values2.push(keccak([key.as_slice(), b"v2"].concat()).0.to_vec());
            }
        }
        for i in 200u64..230 {
            keys2.push(keccak(i.to_be_bytes()).0.to_vec());
            values2.push(vec![0xAA; 40]);
        }
        trie.parallel_update(&keys2, &values2).unwrap();

        let mut all_keys = keys.clone();
        let mut all_values = values.clone();
        all_keys.extend(keys2);
        all_values.extend(values2);
        assert_eq!(trie.hash(), sequential_root(&all_keys, &all_values));
    }

    #[test]
    fn parallel_update_single_bucket_falls_back() {
        // all keys share the first nibble, the root never branches out
        let keys: Vec<PathRLP> = (0u8..20).map(|i| vec![0x10, i]).collect();
        let values: Vec<ValueRLP> = (0u8..20).map(|i| vec![i; 33]).collect();
        let mut trie = Trie::new_temp();
        trie.parallel_update(&keys, &values).unwrap();
        assert_eq!(trie.hash(), sequential_root(&keys, &values));
        for (key, value) in keys.iter().zip(&values) {
            assert_eq!(trie.get(key).unwrap(), Some(value.clone()));
        }
    }

    #[test]
    fn parallel_update_with_empty_key() {
        let (mut keys, mut values) = hashed_entries(40);
        keys.push(vec![]);
        values.push(b"root value".to_vec());
        let mut trie = Trie::new_temp();
        trie.parallel_update(&keys, &values).unwrap();
        assert_eq!(trie.hash(), sequential_root(&keys, &values));
        assert_eq!(trie.get(&vec![]).unwrap(), Some(b"root value".to_vec()));
    }

    #[test]
    fn parallel_update_rejects_length_mismatch() {
        let mut trie = Trie::new_temp();
        assert!(matches!(
            trie.parallel_update(&[vec![1]], &[]),
            Err(TrieError::InvalidInput)
        ));
    }

    #[test]
    fn parallel_update_empty_batch_is_noop() {
        let mut trie = Trie::new_temp();
        trie.insert(b"a".to_vec(), b"b".to_vec()).unwrap();
        let before = trie.hash();
        trie.parallel_update(&[], &[]).unwrap();
        assert_eq!(trie.hash(), before);
    }

    #[test]
    fn parallel_update_is_idempotent() {
        let (keys, values) = hashed_entries(50);
        let mut trie = Trie::new_temp();
        trie.parallel_update(&keys, &values).unwrap();
        let first = trie.hash();
        trie.parallel_update(&keys, &values).unwrap();
        assert_eq!(trie.hash(), first);
    }

    #[test]
    fn parallel_update_removing_everything_empties_the_trie() {
        let (keys, values) = hashed_entries(30);
        let mut trie = Trie::new_temp();
        trie.parallel_update(&keys, &values).unwrap();

        let empties: Vec<ValueRLP> = vec![vec![]; keys.len()];
        trie.parallel_update(&keys, &empties).unwrap();
        assert_eq!(trie.hash(), *crate::EMPTY_TRIE_HASH);
    }

    #[test]
    fn parallel_update_duplicate_keys_last_write_wins() {
        let key = keccak(7u64.to_be_bytes()).0.to_vec();
        let (mut keys, mut values) = hashed_entries(20);
        keys.push(key.clone());
        values.push(b"first".to_vec());
        keys.push(key.clone());
        values.push(b"second".to_vec());

        let mut trie = Trie::new_temp();
        trie.parallel_update(&keys, &values).unwrap();
        assert_eq!(trie.get(&key).unwrap(), Some(b"second".to_vec()));
        assert_eq!(trie.hash(), sequential_root(&keys, &values));
    }

    #[test]
    fn parallel_get_matches_sequential_get() {
        let (keys, values) = hashed_entries(80);
        let mut trie = Trie::new_temp();
        trie.parallel_update(&keys, &values).unwrap();

        let mut queried = keys.clone();
        queried.push(keccak(999u64.to_be_bytes()).0.to_vec()); // absent
        queried.push(vec![]); // absent root value
        let results = trie.parallel_get(&queried).unwrap();
        for (i, key) in queried.iter().enumerate() {
            assert_eq!(results[i], trie.get(key).unwrap());
        }
    }

    #[test]
    fn parallel_update_commit_and_reopen() {
        let db = Arc::new(InMemoryTrieDB::new_empty());
        let (keys, values) = hashed_entries(60);
        let mut trie = Trie::new(db.clone());
        trie.parallel_update(&keys, &values).unwrap();
        let (root, set) = trie.commit();
        db.apply(&set).unwrap();

        // remove some entries through a second parallel batch on the
        // reopened trie, deletions must be tracked across the db boundary
        let mut trie = Trie::open(db.clone(), root);
        let removed: Vec<PathRLP> = keys.iter().take(15).cloned().collect();
        let empties: Vec<ValueRLP> = vec![vec![]; removed.len()];
        trie.parallel_update(&removed, &empties).unwrap();
        let (new_root, set) = trie.commit();
        db.apply(&set).unwrap();

        let reopened = Trie::open(db, new_root);
        for key in &removed {
            assert_eq!(reopened.get(key).unwrap(), None);
        }
        for (key, value) in keys.iter().zip(&values).skip(15) {
            assert_eq!(reopened.get(key).unwrap(), Some(value.clone()));
        }
    }
}
