use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use crate::nibbles::Nibbles;
use crate::node_hash::keccak;
use crate::trienode::NodeSet;

/// Records the node paths touched while mutating a trie.
///
/// Paths that get resolved from the database land in `reads`, newly created
/// node paths in `inserts` and resolved-then-removed paths in `deletes`.
/// Deleting a previously inserted path cancels the insertion and vice versa,
/// so a node that is removed and later recreated within the same batch leaves
/// no deletion marker behind.
#[derive(Debug, Default)]
struct TrackerInner {
    reads: HashMap<Nibbles, Vec<u8>>,
    inserts: HashSet<Nibbles>,
    deletes: HashSet<Nibbles>,
}

#[derive(Debug, Default)]
pub struct Tracker {
    inner: Mutex<TrackerInner>,
}

impl Tracker {
    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        // a poisoned tracker still holds consistent data, keep going
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_read(&self, path: &Nibbles, blob: &[u8]) {
        self.lock().reads.insert(path.clone(), blob.to_vec());
    }

    pub fn on_insert(&self, path: &Nibbles) {
        let mut inner = self.lock();
        if !inner.deletes.remove(path) {
            inner.inserts.insert(path.clone());
        }
    }

    pub fn on_delete(&self, path: &Nibbles) {
        let mut inner = self.lock();
        if !inner.inserts.remove(path) {
            inner.deletes.insert(path.clone());
        }
    }

    pub fn reset(&self) {
        *self.lock() = TrackerInner::default();
    }

    pub fn deep_copy(&self) -> Tracker {
        let inner = self.lock();
        Tracker {
            inner: Mutex::new(TrackerInner {
                reads: inner.reads.clone(),
                inserts: inner.inserts.clone(),
                deletes: inner.deletes.clone(),
            }),
        }
    }

    pub fn inserts(&self) -> HashSet<Nibbles> {
        self.lock().inserts.clone()
    }

    pub fn deletes(&self) -> HashSet<Nibbles> {
        self.lock().deletes.clone()
    }

    /// Returns the resolved blobs keyed by path, as witnessed before mutation.
    pub fn access_list(&self) -> HashMap<Nibbles, Vec<u8>> {
        self.lock().reads.clone()
    }

    /// Folds the recorded deletions into a node set. Paths that were never
    /// resolved from the database were embedded in their parent and have
    /// nothing on disk to delete.
    pub fn mark_deletions(&self, set: &mut NodeSet) {
        let inner = self.lock();
        for path in &inner.deletes {
            if set.get(path).is_some() {
                continue;
            }
            if let Some(blob) = inner.reads.get(path) {
                set.mark_deleted(path.clone(), keccak(blob));
            }
        }
    }
}

/// Number of tracker shards: one per root branch choice plus an overflow
/// shard for paths that sit above the fan-out point (the root itself).
pub const TRACKER_SHARDS: usize = 17;

/// Path-sharded tracker shared by concurrent subtrie workers.
///
/// A path is routed by its first nibble, so workers operating on disjoint
/// root children never contend on the same lock. Root-level paths (empty or
/// starting with the leaf flag) go to the overflow shard.
#[derive(Debug, Default)]
pub struct ShardedTracker {
    shards: [Tracker; TRACKER_SHARDS],
}

impl ShardedTracker {
    fn shard_for(&self, path: &Nibbles) -> &Tracker {
        &self.shards[path.first_choice().unwrap_or(TRACKER_SHARDS - 1)]
    }

    pub fn on_read(&self, path: &Nibbles, blob: &[u8]) {
        self.shard_for(path).on_read(path, blob);
    }

    pub fn on_insert(&self, path: &Nibbles) {
        self.shard_for(path).on_insert(path);
    }

    pub fn on_delete(&self, path: &Nibbles) {
        self.shard_for(path).on_delete(path);
    }

    pub fn reset(&self) {
        for shard in &self.shards {
            shard.reset();
        }
    }

    pub fn deep_copy(&self) -> ShardedTracker {
        ShardedTracker {
            shards: std::array::from_fn(|i| self.shards[i].deep_copy()),
        }
    }

    pub fn inserts(&self) -> HashSet<Nibbles> {
        let mut all = HashSet::new();
        for shard in &self.shards {
            all.extend(shard.inserts());
        }
        all
    }

    pub fn deletes(&self) -> HashSet<Nibbles> {
        let mut all = HashSet::new();
        for shard in &self.shards {
            all.extend(shard.deletes());
        }
        all
    }

    pub fn access_list(&self) -> HashMap<Nibbles, Vec<u8>> {
        let mut all = HashMap::new();
        for shard in &self.shards {
            all.extend(shard.access_list());
        }
        all
    }

    pub fn mark_deletions(&self, set: &mut NodeSet) {
        for shard in &self.shards {
            shard.mark_deletions(set);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn path(nibbles: &[u8]) -> Nibbles {
        Nibbles::from_slice(nibbles)
    }

    #[test]
    fn insert_cancels_pending_delete() {
        let tracker = Tracker::default();
        tracker.on_read(&path(&[1, 2]), &[0xc2, 1, 2]);
        tracker.on_delete(&path(&[1, 2]));
        tracker.on_insert(&path(&[1, 2]));
        assert!(tracker.deletes().is_empty());
        assert!(tracker.inserts().is_empty());
    }

    #[test]
    fn delete_cancels_pending_insert() {
        let tracker = Tracker::default();
        tracker.on_insert(&path(&[3]));
        tracker.on_delete(&path(&[3]));
        assert!(tracker.inserts().is_empty());
        assert!(tracker.deletes().is_empty());
    }

    #[test]
    fn unresolved_deletions_are_not_marked() {
        let tracker = Tracker::default();
        let read_path = path(&[1]);
        let embedded_path = path(&[2]);
        tracker.on_read(&read_path, &[0xc2, 0x01, 0x02]);
        tracker.on_delete(&read_path);
        tracker.on_delete(&embedded_path);

        let mut set = NodeSet::new(Default::default());
        tracker.mark_deletions(&mut set);
        assert!(set.get(&read_path).is_some_and(|n| n.is_deleted()));
        assert!(set.get(&embedded_path).is_none());
    }

    #[test]
    fn sharded_routing_keeps_buckets_apart() {
        let tracker = ShardedTracker::default();
        tracker.on_insert(&path(&[0x1, 0x5]));
        tracker.on_insert(&path(&[0xf, 0x5]));
        tracker.on_insert(&path(&[]));
        assert_eq!(tracker.inserts().len(), 3);

        // deleting in one bucket must not disturb the others
        tracker.on_delete(&path(&[0x1, 0x5]));
        let inserts = tracker.inserts();
        assert_eq!(inserts.len(), 2);
        assert!(inserts.contains(&path(&[0xf, 0x5])));
        assert!(inserts.contains(&path(&[])));
    }

    #[test]
    fn deep_copy_is_detached() {
        let tracker = ShardedTracker::default();
        tracker.on_insert(&path(&[4, 2]));
        let copy = tracker.deep_copy();
        tracker.reset();
        assert!(tracker.inserts().is_empty());
        assert_eq!(copy.inserts().len(), 1);
    }
}
