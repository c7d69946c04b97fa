use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use ethereum_types::H256;
use indexmap::IndexMap;
use lru::LruCache;
use tracing::{debug, warn};

use crate::db::{InMemoryStore, KeyValueStore, TrieDB};
use crate::error::TrieError;
use crate::nibbles::Nibbles;
use crate::node::{Node, NodeRef};
use crate::node_hash::NodeHash;
use crate::trienode::MergedNodeSet;
use crate::worker::parallel_worker;
use crate::{EMPTY_TRIE_HASH, NodeRLP};

/// Number of database shards, one per root branch choice.
pub const SHARD_COUNT: usize = 16;

// Bookkeeping overhead charged per cached node on top of its blob.
const HASH_OVERHEAD: usize = 32;

/// Extracts the hashed children referenced by an encoded node, so the store
/// can maintain reference counts and walk subtries without knowing the
/// node format.
pub trait ChildResolver: Send + Sync {
    fn for_each_child(&self, rlp: &[u8], apply: &mut dyn FnMut(H256));
}

/// [`ChildResolver`] for Merkle Patricia Trie nodes. Inline children carry
/// no standalone hash and are skipped.
#[derive(Debug, Default, Clone)]
pub struct MptResolver;

impl ChildResolver for MptResolver {
    fn for_each_child(&self, rlp: &[u8], apply: &mut dyn FnMut(H256)) {
        let Ok(node) = Node::decode_raw(rlp) else {
            return;
        };
        let mut visit = |child: &NodeRef| {
            if let NodeRef::Hash(NodeHash::Hashed(hash)) = child {
                apply(*hash);
            }
        };
        match &node {
            Node::Branch(branch) => branch.choices.iter().for_each(&mut visit),
            Node::Extension(extension) => visit(&extension.child),
            Node::Leaf(_) => {}
        }
    }
}

/// Tuning knobs for the sharded store.
#[derive(Debug, Clone, Copy)]
pub struct ShardConfig {
    /// Capacity, in entries, of each shard's clean node cache.
    pub clean_cache_entries: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            clean_cache_entries: 4096,
        }
    }
}

/// A dirty in-memory node together with the number of dirty parents
/// referencing it.
struct CachedNode {
    rlp: NodeRLP,
    parents: u32,
}

struct ShardInner {
    /// Uncommitted nodes in insertion order, children before parents.
    dirties: IndexMap<H256, CachedNode>,
    /// Approximate memory held by `dirties`.
    dirties_size: usize,
    /// Recently persisted or disk-loaded nodes.
    cleans: LruCache<H256, NodeRLP>,
}

/// One shard of the node database: a dirty cache over a clean cache over
/// its own disk backend.
struct ShardStore {
    disk: Arc<dyn KeyValueStore>,
    resolver: Arc<dyn ChildResolver>,
    inner: Mutex<ShardInner>,
}

impl ShardStore {
    fn new(disk: Arc<dyn KeyValueStore>, resolver: Arc<dyn ChildResolver>, config: &ShardConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.clean_cache_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            disk,
            resolver,
            inner: Mutex::new(ShardInner {
                dirties: IndexMap::new(),
                dirties_size: 0,
                cleans: LruCache::new(capacity),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ShardInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks the node up through the dirty cache, the clean cache and disk,
    /// in that order. Disk hits populate the clean cache.
    fn node(&self, hash: H256) -> Result<Option<NodeRLP>, TrieError> {
        let mut inner = self.lock();
        if let Some(node) = inner.dirties.get(&hash) {
            return Ok(Some(node.rlp.clone()));
        }
        if let Some(rlp) = inner.cleans.get(&hash) {
            return Ok(Some(rlp.clone()));
        }
        drop(inner);
        match self.disk.get(hash)? {
            Some(rlp) => {
                self.lock().cleans.put(hash, rlp.clone());
                Ok(Some(rlp))
            }
            None => Ok(None),
        }
    }

    fn has_dirty(&self, hash: H256) -> bool {
        self.lock().dirties.contains_key(&hash)
    }

    fn dirty(&self, hash: H256) -> Option<NodeRLP> {
        self.lock().dirties.get(&hash).map(|node| node.rlp.clone())
    }

    /// Caches a dirty node, bumping the reference counts of its children
    /// already dirty within this shard.
    fn insert_dirty(&self, hash: H256, rlp: NodeRLP) {
        let mut inner = self.lock();
        if inner.dirties.contains_key(&hash) {
            return;
        }
        let mut children = Vec::new();
        self.resolver.for_each_child(&rlp, &mut |child| children.push(child));
        inner.dirties_size += rlp.len() + HASH_OVERHEAD;
        inner.dirties.insert(hash, CachedNode { rlp, parents: 0 });
        for child in children {
            if let Some(child_node) = inner.dirties.get_mut(&child) {
                child_node.parents += 1;
            }
        }
    }

    fn bump_parents(&self, hash: H256) -> bool {
        let mut inner = self.lock();
        match inner.dirties.get_mut(&hash) {
            Some(node) => {
                node.parents += 1;
                true
            }
            None => false,
        }
    }

    /// Drops one reference from the node. Returns the children of the node
    /// if it became unreferenced and was evicted.
    fn unref(&self, hash: H256) -> Option<Vec<H256>> {
        let mut inner = self.lock();
        let node = inner.dirties.get_mut(&hash)?;
        node.parents = node.parents.saturating_sub(1);
        if node.parents > 0 {
            return None;
        }
        let node = inner.dirties.shift_remove(&hash)?;
        inner.dirties_size = inner
            .dirties_size
            .saturating_sub(node.rlp.len() + HASH_OVERHEAD);
        let mut children = Vec::new();
        self.resolver
            .for_each_child(&node.rlp, &mut |child| children.push(child));
        Some(children)
    }

    /// Writes a dirty node out to disk and moves it to the clean cache.
    /// The node stays in the dirty cache until the write has succeeded.
    fn persist(&self, hash: H256) -> Result<(), TrieError> {
        let Some(rlp) = self.dirty(hash) else {
            return Ok(());
        };
        self.disk.put(hash, rlp)?;
        let mut inner = self.lock();
        if let Some(node) = inner.dirties.shift_remove(&hash) {
            inner.dirties_size = inner
                .dirties_size
                .saturating_sub(node.rlp.len() + HASH_OVERHEAD);
            inner.cleans.put(hash, node.rlp);
        }
        Ok(())
    }

    /// Flushes the oldest dirty nodes to disk until the shard holds at most
    /// `limit` bytes of dirty data. Insertion order puts children before
    /// parents, so a partial flush never strands a parent without its
    /// children on disk.
    fn flush_to(&self, limit: usize) -> Result<(), TrieError> {
        loop {
            let oldest = {
                let inner = self.lock();
                if inner.dirties_size <= limit {
                    return Ok(());
                }
                match inner.dirties.get_index(0) {
                    Some((hash, _)) => *hash,
                    None => return Ok(()),
                }
            };
            self.persist(oldest)?;
        }
    }

    fn size(&self) -> usize {
        self.lock().dirties_size
    }
}

/// Index of the shard a node hash falls into when no path is available.
fn shard_index_of(hash: H256) -> usize {
    (hash.0[0] >> 4) as usize
}

/// Node database sharded sixteen ways by the first nibble of the node path,
/// so that the sixteen subtrie workers of a parallel update land their
/// writes on sixteen independent locks. Nodes above the fan-out point (trie
/// roots) are placed by their hash instead.
pub struct ShardedDb {
    shards: [ShardStore; SHARD_COUNT],
    resolver: Arc<dyn ChildResolver>,
}

impl ShardedDb {
    pub fn new(
        disks: [Arc<dyn KeyValueStore>; SHARD_COUNT],
        resolver: Arc<dyn ChildResolver>,
        config: ShardConfig,
    ) -> Self {
        let mut disks = disks.into_iter();
        let shards = std::array::from_fn(|_| {
            let disk = disks.next().unwrap_or_else(|| Arc::new(InMemoryStore::new()));
            ShardStore::new(disk, resolver.clone(), &config)
        });
        Self { shards, resolver }
    }

    /// An ephemeral instance backed by in-memory stores, for tests and tools.
    pub fn in_memory() -> Self {
        let disks: [Arc<dyn KeyValueStore>; SHARD_COUNT] =
            std::array::from_fn(|_| Arc::new(InMemoryStore::new()) as Arc<dyn KeyValueStore>);
        Self::new(disks, Arc::new(MptResolver), ShardConfig::default())
    }

    /// Scans every shard for the given hash. Used when the caller cannot
    /// name the node's path, and as the last resort on a misrouted read.
    fn find(&self, hash: H256) -> Result<Option<NodeRLP>, TrieError> {
        for shard in &self.shards {
            if let Some(rlp) = shard.node(hash)? {
                return Ok(Some(rlp));
            }
        }
        Ok(None)
    }

    fn find_dirty(&self, hash: H256) -> Option<(usize, NodeRLP)> {
        self.shards
            .iter()
            .enumerate()
            .find_map(|(index, shard)| shard.dirty(hash).map(|rlp| (index, rlp)))
    }

    /// Loads a batch of committed node sets into the dirty caches. The
    /// sixteen path partitions go to their shards in parallel, nodes above
    /// the fan-out point are placed by hash afterwards. `parent` is the root
    /// the batch was built on, `block_number` names the batch for logging.
    pub fn update(
        &self,
        root: H256,
        parent: H256,
        block_number: u64,
        nodes: &MergedNodeSet,
    ) -> Result<(), TrieError> {
        if parent != *EMPTY_TRIE_HASH && self.find(parent)?.is_none() {
            warn!(%parent, block_number, "parent state is not present");
        }

        let (buckets, overflow, occupied) = nodes.regroup();
        let first_error: Mutex<Option<TrieError>> = Mutex::new(None);
        parallel_worker(SHARD_COUNT, SHARD_COUNT, |index, _, _| {
            if !occupied[index] {
                return;
            }
            if let Err(err) = self.update_shard(index, &buckets[index]) {
                first_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_or_insert(err);
            }
        });
        if let Some(err) = first_error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(err);
        }

        // Root-level nodes go in by hash. Their children live in the path
        // shards, reference them across the shard boundary. Children dirty
        // in the same shard were already counted by insert_dirty.
        for (hash, rlp) in Self::sorted_live_nodes(&overflow) {
            let shard = shard_index_of(hash);
            self.shards[shard].insert_dirty(hash, rlp.clone());
            let mut children = Vec::new();
            self.resolver.for_each_child(&rlp, &mut |child| children.push(child));
            for child in children {
                if !self.shards[shard].has_dirty(child) {
                    self.reference(child);
                }
            }
        }

        debug!(%root, %parent, block_number, nodes = nodes.len(), "cached trie nodes");
        Ok(())
    }

    fn update_shard(&self, index: usize, nodes: &MergedNodeSet) -> Result<(), TrieError> {
        for (hash, rlp) in Self::sorted_live_nodes(nodes) {
            self.shards[index].insert_dirty(hash, rlp);
        }
        Ok(())
    }

    /// Flattens a merged set into (hash, blob) pairs ordered children before
    /// parents (deepest path first), dropping deletion markers.
    fn sorted_live_nodes(nodes: &MergedNodeSet) -> Vec<(H256, NodeRLP)> {
        let mut entries: Vec<(&Nibbles, H256, &NodeRLP)> = Vec::new();
        for set in nodes.sets() {
            for (path, node) in set.iter() {
                if node.is_deleted() {
                    debug!(hash = %node.hash, "skipping deletion marker");
                    continue;
                }
                entries.push((path, node.hash, &node.rlp));
            }
        }
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));
        entries
            .into_iter()
            .map(|(_, hash, rlp)| (hash, rlp.clone()))
            .collect()
    }

    /// Pins a dirty node by adding an external reference to it.
    pub fn reference(&self, hash: H256) {
        let preferred = shard_index_of(hash);
        if self.shards[preferred].bump_parents(hash) {
            return;
        }
        for (index, shard) in self.shards.iter().enumerate() {
            if index != preferred && shard.bump_parents(hash) {
                return;
            }
        }
    }

    /// Drops a reference from the given root, garbage collecting every
    /// dirty node that becomes unreachable.
    pub fn dereference(&self, root: H256) {
        let mut pending = vec![root];
        while let Some(hash) = pending.pop() {
            let preferred = shard_index_of(hash);
            let evicted = self.shards[preferred].unref(hash).or_else(|| {
                self.shards
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| *index != preferred)
                    .find_map(|(_, shard)| shard.unref(hash))
            });
            if let Some(children) = evicted {
                pending.extend(children);
            }
        }
    }

    /// Persists the whole subtrie below `root` to disk, children first.
    /// A referenced node that is neither dirty nor durable fails the commit.
    pub fn commit(&self, root: H256) -> Result<(), TrieError> {
        if root == *EMPTY_TRIE_HASH {
            return Ok(());
        }
        self.commit_node(root)
    }

    fn commit_node(&self, hash: H256) -> Result<(), TrieError> {
        let Some((shard_index, rlp)) = self.find_dirty(hash) else {
            // nodes already on disk (or in a clean cache) are fine, a
            // reachable node that is nowhere at all means a corrupted batch
            if self.find(hash)?.is_some() {
                return Ok(());
            }
            return Err(TrieError::NodeNotFound(hash));
        };
        let mut children = Vec::new();
        self.resolver.for_each_child(&rlp, &mut |child| children.push(child));
        for child in children {
            self.commit_node(child)?;
        }
        self.shards[shard_index].persist(hash)
    }

    /// Total dirty memory held across all shards.
    pub fn size(&self) -> usize {
        self.shards.iter().map(ShardStore::size).sum()
    }

    /// Flushes dirty nodes, oldest first, until every shard holds at most
    /// its even share of `limit` bytes.
    pub fn cap(&self, limit: usize) -> Result<(), TrieError> {
        let shard_limit = limit / SHARD_COUNT;
        for shard in &self.shards {
            shard.flush_to(shard_limit)?;
        }
        Ok(())
    }
}

impl TrieDB for ShardedDb {
    fn get(&self, path: &Nibbles, hash: H256) -> Result<Option<NodeRLP>, TrieError> {
        let preferred = match path.first_choice() {
            Some(choice) => choice,
            None => shard_index_of(hash),
        };
        if let Some(rlp) = self.shards[preferred].node(hash)? {
            return Ok(Some(rlp));
        }
        // Misrouted nodes can still be served, at the cost of a full scan
        let found = self.find(hash)?;
        if found.is_some() {
            warn!(%hash, "node found outside its expected shard");
        }
        Ok(found)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::node_hash::keccak;
    use crate::trienode::NodeSet;
    use crate::{PathRLP, Trie, ValueRLP};

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

    fn updated_db(count: u64) -> (Arc<ShardedDb>, H256, Vec<PathRLP>, Vec<ValueRLP>) {
        let db = Arc::new(ShardedDb::in_memory());
        let (keys, values) = hashed_entries(count);
        let mut trie = Trie::new(db.clone());
        trie.parallel_update(&keys, &values).unwrap();
        let (root, set) = trie.commit();
        let mut merged = MergedNodeSet::default();
        merged.merge(set).unwrap();
        db.update(root, *EMPTY_TRIE_HASH, 1, &merged).unwrap();
        (db, root, keys, values)
    }

    #[test]
    fn update_then_read_through_trie() {
        let (db, root, keys, values) = updated_db(80);
        let trie = Trie::open(db, root);
        for (key, value) in keys.iter().zip(&values) {
            assert_eq!(trie.get(key).unwrap(), Some(value.clone()));
        }
        assert_eq!(trie.hash(), root);
    }

    #[test]
    fn commit_persists_and_survives_reopen() {
        let (db, root, keys, values) = updated_db(60);
        db.commit(root).unwrap();
        assert_eq!(db.size(), 0);

        // all reads now come from the clean caches and disks
        let trie = Trie::open(db, root);
        for (key, value) in keys.iter().zip(&values) {
            assert_eq!(trie.get(key).unwrap(), Some(value.clone()));
        }
    }

    #[test]
    fn commit_of_empty_root_is_noop() {
        let db = ShardedDb::in_memory();
        db.commit(*EMPTY_TRIE_HASH).unwrap();
    }

    #[test]
    fn commit_fails_on_missing_node() {
        let db = ShardedDb::in_memory();
        // a branch referencing a child that was never cached
        let mut trie = Trie::new_temp();
        let (keys, values) = hashed_entries(40);
        for (key, value) in keys.iter().zip(&values) {
            trie.insert(key.clone(), value.clone()).unwrap();
        }
        let (root, set) = trie.commit();

        // drop one non-root node from the set before updating
        let mut merged = MergedNodeSet::default();
        let mut pruned = NodeSet::new(set.owner());
        let victim = set
            .iter()
            .find(|(path, _)| path.len() >= 2)
            .map(|(path, _)| path.clone())
            .unwrap();
        for (path, node) in set.iter() {
            if *path != victim {
                pruned.add_node(path.clone(), node.hash, node.rlp.clone());
            }
        }
        merged.merge(pruned).unwrap();
        db.update(root, *EMPTY_TRIE_HASH, 1, &merged).unwrap();

        assert!(matches!(
            db.commit(root),
            Err(TrieError::NodeNotFound(_))
        ));
    }

    struct RejectingDisk;

    impl KeyValueStore for RejectingDisk {
        fn get(&self, _hash: H256) -> Result<Option<Vec<u8>>, TrieError> {
            Ok(None)
        }

        fn put(&self, _hash: H256, _value: Vec<u8>) -> Result<(), TrieError> {
            Err(TrieError::DbError(anyhow::anyhow!("disk is read only")))
        }

        fn delete(&self, _hash: H256) -> Result<(), TrieError> {
            Ok(())
        }
    }

    #[test]
    fn failed_flush_keeps_nodes_dirty_and_readable() {
        let disks: [Arc<dyn KeyValueStore>; SHARD_COUNT] =
            std::array::from_fn(|_| Arc::new(RejectingDisk) as Arc<dyn KeyValueStore>);
        let db = Arc::new(ShardedDb::new(disks, Arc::new(MptResolver), ShardConfig::default()));
        let (keys, values) = hashed_entries(40);
        let mut trie = Trie::new(db.clone());
        trie.parallel_update(&keys, &values).unwrap();
        let (root, set) = trie.commit();
        let mut merged = MergedNodeSet::default();
        merged.merge(set).unwrap();
        db.update(root, *EMPTY_TRIE_HASH, 1, &merged).unwrap();

        let before = db.size();
        assert!(before > 0);
        assert!(db.commit(root).is_err());
        // the rejected nodes are still dirty, not lost
        assert_eq!(db.size(), before);

        let trie = Trie::open(db, root);
        for (key, value) in keys.iter().zip(&values) {
            assert_eq!(trie.get(key).unwrap(), Some(value.clone()));
        }
    }

    #[test]
    fn cap_flushes_oldest_dirty_nodes() {
        let (db, root, keys, values) = updated_db(100);
        let before = db.size();
        assert!(before > 0);
        db.cap(before / 2).unwrap();
        assert!(db.size() <= before / 2);

        // flushed or not, every node stays readable
        let trie = Trie::open(db, root);
        for (key, value) in keys.iter().zip(&values) {
            assert_eq!(trie.get(key).unwrap(), Some(value.clone()));
        }
    }

    #[test]
    fn dereference_collects_unreachable_nodes() {
        let db = Arc::new(ShardedDb::in_memory());
        let (keys, values) = hashed_entries(50);
        let mut trie = Trie::new(db.clone());
        trie.parallel_update(&keys, &values).unwrap();
        let (root, set) = trie.commit();
        let mut merged = MergedNodeSet::default();
        merged.merge(set).unwrap();
        db.update(root, *EMPTY_TRIE_HASH, 1, &merged).unwrap();
        db.reference(root);
        assert!(db.size() > 0);

        db.dereference(root);
        assert_eq!(db.size(), 0);
    }

    #[test]
    fn reads_survive_a_bogus_path_hint() {
        let (db, root, keys, _) = updated_db(80);
        // the root is resolvable with its real (empty) path and also
        // through the full scan when handed a wrong path hint
        let trie = Trie::open(db.clone(), root);
        let proof = trie.get_proof(&keys[0]).unwrap();
        assert!(!proof.is_empty());
        let node_hash = keccak(&proof[0]);
        let real = db.get(&Nibbles::default(), node_hash).unwrap();
        assert!(real.is_some());
        let misrouted = db.get(&Nibbles::from_hex(vec![0x9]), node_hash).unwrap();
        assert_eq!(real, misrouted);
    }
}
