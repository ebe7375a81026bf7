//! The shared id index
//!
//! Maps user-visible object ids to locators. The structure is an
//! open-addressed hash of [`HASH_BUCKETS`] fixed buckets, each the head of an
//! overflow chain allocated from a shared node pool. Entries are only ever
//! added: claiming a bucket CASes its `id` field, linking an overflow node
//! CASes the chain pointer, and removal merely zeroes the `locator` field,
//! leaving the id bucket in place for reuse.
//!
//! Insertion is a two-step claim: [`IdIndex::insert`] locates (or links) the
//! node for the id, refusing if its locator field is nonzero, then
//! [`IndexEntry::map`] CASes the field from zero to the new locator. The CAS
//! makes concurrent insertions of the same id admit exactly one winner; the
//! loser surfaces a duplicate-id error. A nonzero locator field always
//! counts as claimed, even when the object is dead in the inserter's
//! snapshot: only the watermark zeroes the field once a committed removal
//! has settled, after which the id becomes insertable again. (Liveness
//! cannot stand in for that check: a locator mapped by an uncommitted
//! concurrent create is dead in every other snapshot, and reusing it would
//! hand the same id to two transactions.)
//!
//! Lookups take an `is_live` predicate supplied by the caller's transaction
//! view, so deletions are visible per snapshot long before the watermark
//! settles them.

use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::{Locator, ObjectId, ReferentialError, Result, TesseraError, HASH_BUCKETS};

/// One index node: a bucket head or an overflow node.
#[derive(Debug, Default)]
pub struct HashNode {
    id: AtomicU64,
    locator: AtomicU64,
    next: AtomicU64,
}

impl HashNode {
    /// The id claimed by this node, zero if unclaimed.
    pub fn id(&self) -> ObjectId {
        ObjectId::new(self.id.load(Ordering::Acquire))
    }

    /// The locator currently mapped, zero if unmapped.
    pub fn locator(&self) -> Locator {
        Locator::new(self.locator.load(Ordering::Acquire))
    }
}

/// A claimed index node, ready to be mapped to a locator.
#[derive(Debug)]
pub struct IndexEntry<'a> {
    id: ObjectId,
    node: &'a HashNode,
}

impl IndexEntry<'_> {
    /// Map the claimed id to `locator`.
    ///
    /// Exactly one of any set of concurrent claimants succeeds; the rest get
    /// a duplicate-id error.
    pub fn map(&self, locator: Locator) -> Result<()> {
        self.node
            .locator
            .compare_exchange(0, locator.get(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| TesseraError::from(ReferentialError::DuplicateId(self.id)))
    }
}

/// The shared id → locator index.
pub struct IdIndex {
    nodes: Box<[HashNode]>,
    node_count: AtomicU64,
}

impl IdIndex {
    /// Create an index with capacity for `overflow_capacity` chained nodes
    /// beyond the fixed buckets.
    pub fn new(overflow_capacity: usize) -> IdIndex {
        let total = HASH_BUCKETS + overflow_capacity;
        let mut nodes = Vec::with_capacity(total);
        nodes.resize_with(total, HashNode::default);
        IdIndex {
            nodes: nodes.into_boxed_slice(),
            node_count: AtomicU64::new(0),
        }
    }

    fn bucket(&self, id: ObjectId) -> usize {
        (id.get() % HASH_BUCKETS as u64) as usize
    }

    /// Claim the index node for `id`, for a new object.
    ///
    /// Refuses with a duplicate-id error while the id is mapped to any
    /// locator, live or not.
    pub fn insert(&self, id: ObjectId) -> Result<IndexEntry<'_>> {
        debug_assert!(id.is_valid(), "cannot index the reserved zero id");
        let mut node = &self.nodes[self.bucket(id)];
        if node.id.load(Ordering::Acquire) == 0
            && node
                .id
                .compare_exchange(0, id.get(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Ok(IndexEntry { id, node });
        }

        let mut new_node_idx = 0usize;
        loop {
            if node.id.load(Ordering::Acquire) == id.get() {
                if node.locator().is_valid() {
                    return Err(TesseraError::from(ReferentialError::DuplicateId(id)));
                }
                return Ok(IndexEntry { id, node });
            }

            let next = node.next.load(Ordering::Acquire);
            if next != 0 {
                node = &self.nodes[next as usize];
                continue;
            }

            // Prepare an overflow node once; it stays ours across link races.
            if new_node_idx == 0 {
                let allocated = self.node_count.fetch_add(1, Ordering::AcqRel);
                new_node_idx = HASH_BUCKETS + allocated as usize;
                if new_node_idx >= self.nodes.len() {
                    return Err(TesseraError::resource("id index nodes"));
                }
                self.nodes[new_node_idx]
                    .id
                    .store(id.get(), Ordering::Release);
            }

            if node
                .next
                .compare_exchange(0, new_node_idx as u64, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(IndexEntry {
                    id,
                    node: &self.nodes[new_node_idx],
                });
            }
        }
    }

    /// Look up the locator mapped to `id`, if it is live in the caller's
    /// snapshot.
    pub fn find(&self, id: ObjectId, is_live: impl Fn(Locator) -> bool) -> Option<Locator> {
        let mut node = &self.nodes[self.bucket(id)];
        loop {
            if node.id.load(Ordering::Acquire) == id.get() {
                let locator = node.locator();
                return (locator.is_valid() && is_live(locator)).then_some(locator);
            }
            let next = node.next.load(Ordering::Acquire);
            if next == 0 {
                return None;
            }
            node = &self.nodes[next as usize];
        }
    }

    /// Unmap `id`, making it insertable again. Called by the watermark once
    /// a committed removal has settled below every live snapshot; the bucket
    /// stays claimed so a later insert of the same id reuses it.
    pub fn remove(&self, id: ObjectId) {
        let mut node = &self.nodes[self.bucket(id)];
        loop {
            if node.id.load(Ordering::Acquire) == id.get() {
                node.locator.store(0, Ordering::Release);
                return;
            }
            let next = node.next.load(Ordering::Acquire);
            if next == 0 {
                return;
            }
            node = &self.nodes[next as usize];
        }
    }

    /// Clear every node. Only valid while no sessions are attached.
    pub fn clear(&self) {
        for node in self.nodes.iter() {
            node.id.store(0, Ordering::Release);
            node.locator.store(0, Ordering::Release);
            node.next.store(0, Ordering::Release);
        }
        self.node_count.store(0, Ordering::Release);
    }
}

impl std::fmt::Debug for IdIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdIndex")
            .field("buckets", &HASH_BUCKETS)
            .field("overflow_nodes", &self.node_count.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const LIVE: fn(Locator) -> bool = |_| true;
    const DEAD: fn(Locator) -> bool = |_| false;

    #[test]
    fn insert_then_find() {
        let index = IdIndex::new(64);
        index.insert(ObjectId::new(42)).unwrap().map(Locator::new(7)).unwrap();
        assert_eq!(index.find(ObjectId::new(42), LIVE), Some(Locator::new(7)));
        assert_eq!(index.find(ObjectId::new(43), LIVE), None);
    }

    #[test]
    fn mapped_ids_are_rejected_even_when_dead_in_a_snapshot() {
        let index = IdIndex::new(64);
        index.insert(ObjectId::new(42)).unwrap().map(Locator::new(7)).unwrap();
        // A mapped id is claimed for everyone; per-snapshot deadness (e.g.
        // an uncommitted concurrent create) must not make it reusable.
        let dup = index.insert(ObjectId::new(42));
        assert!(matches!(
            dup,
            Err(TesseraError::Referential(ReferentialError::DuplicateId(id))) if id.get() == 42
        ));
    }

    #[test]
    fn removed_ids_reuse_their_bucket() {
        let index = IdIndex::new(64);
        index.insert(ObjectId::new(42)).unwrap().map(Locator::new(7)).unwrap();
        index.remove(ObjectId::new(42));
        assert_eq!(index.find(ObjectId::new(42), LIVE), None);

        index.insert(ObjectId::new(42)).unwrap().map(Locator::new(9)).unwrap();
        assert_eq!(index.find(ObjectId::new(42), LIVE), Some(Locator::new(9)));
    }

    #[test]
    fn find_respects_snapshot_liveness() {
        let index = IdIndex::new(64);
        index.insert(ObjectId::new(5)).unwrap().map(Locator::new(3)).unwrap();
        assert_eq!(index.find(ObjectId::new(5), LIVE), Some(Locator::new(3)));
        assert_eq!(
            index.find(ObjectId::new(5), DEAD),
            None,
            "an id deleted in this snapshot reads as absent"
        );
    }

    #[test]
    fn stale_claim_loses_to_concurrent_map() {
        let index = IdIndex::new(64);
        let first = index.insert(ObjectId::new(5)).unwrap();
        let second = index.insert(ObjectId::new(5)).unwrap();
        first.map(Locator::new(1)).unwrap();
        let lost = second.map(Locator::new(2));
        assert!(matches!(
            lost,
            Err(TesseraError::Referential(ReferentialError::DuplicateId(_)))
        ));
        assert_eq!(index.find(ObjectId::new(5), LIVE), Some(Locator::new(1)));
    }

    #[test]
    fn colliding_ids_chain_through_overflow_nodes() {
        let index = IdIndex::new(64);
        // All of these hash to the same bucket.
        let ids: Vec<ObjectId> = (0..4)
            .map(|i| ObjectId::new(7 + i * HASH_BUCKETS as u64))
            .collect();
        for (i, id) in ids.iter().enumerate() {
            index.insert(*id).unwrap().map(Locator::new(i as u64 + 1)).unwrap();
        }
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(index.find(*id, LIVE), Some(Locator::new(i as u64 + 1)));
        }
    }

    #[test]
    fn overflow_capacity_is_bounded() {
        let index = IdIndex::new(2);
        let colliders: Vec<ObjectId> = (0..4)
            .map(|i| ObjectId::new(3 + i * HASH_BUCKETS as u64))
            .collect();
        for (i, id) in colliders[..3].iter().enumerate() {
            index.insert(*id).unwrap().map(Locator::new(i as u64 + 1)).unwrap();
        }
        let overflow = index.insert(colliders[3]);
        assert!(matches!(overflow, Err(TesseraError::Resource { .. })));
    }

    #[test]
    fn concurrent_inserts_of_same_id_admit_exactly_one() {
        for round in 0..32u64 {
            let index = Arc::new(IdIndex::new(64));
            let barrier = Arc::new(std::sync::Barrier::new(4));
            let id = ObjectId::new(11 + round);
            let handles: Vec<_> = (0..4u64)
                .map(|t| {
                    let index = Arc::clone(&index);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        index.insert(id).and_then(|entry| entry.map(Locator::new(t + 1)))
                    })
                })
                .collect();
            let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(
                outcomes.iter().filter(|o| o.is_ok()).count(),
                1,
                "exactly one concurrent insert of the same id wins"
            );
            assert!(index.find(id, LIVE).is_some());
        }
    }

    #[test]
    fn concurrent_distinct_inserts_all_land() {
        let index = Arc::new(IdIndex::new(4096));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    for i in 0..200u64 {
                        let id = ObjectId::new(1 + t * 1000 + i);
                        index.insert(id).unwrap().map(Locator::new(id.get())).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..8u64 {
            for i in 0..200u64 {
                let id = ObjectId::new(1 + t * 1000 + i);
                assert_eq!(index.find(id, LIVE), Some(Locator::new(id.get())));
            }
        }
    }
}
