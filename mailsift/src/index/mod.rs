//! Vector index: an HNSW graph plus the slot <-> remote id mapping
//!
//! - `hnsw`: the approximate nearest-neighbour graph
//! - `slots`: dense slot allocation with lowest-first reuse
//! - `persist`: generation-stamped save/load with a checksummed manifest

pub mod hnsw;
pub mod persist;
pub mod slots;

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::error::MailsiftError;
use crate::types::{RemoteId, Slot};
use hnsw::{Hnsw, HnswParams};
use slots::SlotArena;

/// A nearest-neighbour hit resolved to its remote id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexHit {
    pub slot: Slot,
    pub remote_id: RemoteId,
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    graph: Hnsw,
    slots: SlotArena,
    slot_to_id: BTreeMap<Slot, RemoteId>,
    id_to_slot: HashMap<RemoteId, Slot>,
    /// Generation of the commit this index state belongs to
    generation: u64,
}

impl VectorIndex {
    pub fn new(dimension: usize, params: HnswParams) -> Self {
        Self {
            dimension,
            graph: Hnsw::new(params),
            slots: SlotArena::new(),
            slot_to_id: BTreeMap::new(),
            id_to_slot: HashMap::new(),
            generation: 0,
        }
    }

    /// Assemble an index from persisted parts, checking that graph, arena
    /// and mapping all describe the same set of slots.
    pub(crate) fn from_parts(
        dimension: usize,
        graph: Hnsw,
        slots: SlotArena,
        entries: Vec<(Slot, RemoteId)>,
        generation: u64,
    ) -> Result<Self, MailsiftError> {
        let mut slot_to_id = BTreeMap::new();
        let mut id_to_slot = HashMap::new();
        for (slot, remote_id) in entries {
            if !slots.is_live(slot) || !graph.contains(slot) {
                return Err(MailsiftError::CorruptIndex(format!(
                    "mapping refers to empty slot {}",
                    slot
                )));
            }
            if slot_to_id.insert(slot, remote_id).is_some()
                || id_to_slot.insert(remote_id, slot).is_some()
            {
                return Err(MailsiftError::CorruptIndex(format!(
                    "duplicate mapping for slot {} / message {}",
                    slot, remote_id
                )));
            }
        }
        if graph.len() != slot_to_id.len() || slots.live_count() != slot_to_id.len() {
            return Err(MailsiftError::CorruptIndex(format!(
                "graph holds {} nodes, arena {} slots, mapping {} entries",
                graph.len(),
                slots.live_count(),
                slot_to_id.len()
            )));
        }
        if let Some(bad) = graph.slots().find(|&s| {
            graph.vector(s).map(|v| v.len()) != Some(dimension)
        }) {
            return Err(MailsiftError::CorruptIndex(format!(
                "slot {} does not have dimension {}",
                bad, dimension
            )));
        }

        Ok(Self {
            dimension,
            graph,
            slots,
            slot_to_id,
            id_to_slot,
            generation,
        })
    }

    /// Rebuild from stored embeddings. Rows keep their recorded slot when it
    /// is free; rows without one (or with a conflicting one) get a fresh slot.
    /// Returns the index and the slots that differ from what was recorded.
    pub fn rebuild<I>(
        dimension: usize,
        params: HnswParams,
        rows: I,
    ) -> Result<(Self, Vec<(RemoteId, Slot)>), MailsiftError>
    where
        I: IntoIterator<Item = (RemoteId, Option<Slot>, Vec<f32>)>,
    {
        let mut index = Self::new(dimension, params);
        let mut unplaced = Vec::new();

        for (remote_id, slot, vector) in rows {
            match slot {
                Some(slot) if !index.slots.is_live(slot) => {
                    index.restore(slot, remote_id, &vector)?;
                }
                _ => unplaced.push((remote_id, vector)),
            }
        }

        let mut reassigned = Vec::with_capacity(unplaced.len());
        for (remote_id, vector) in unplaced {
            let slot = index.insert(remote_id, &vector)?;
            warn!(remote_id, slot, "Message had no usable slot, assigned a new one");
            reassigned.push((remote_id, slot));
        }

        Ok((index, reassigned))
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn params(&self) -> &HnswParams {
        self.graph.params()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub fn len(&self) -> usize {
        self.slot_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slot_to_id.is_empty()
    }

    pub fn slot_of(&self, remote_id: RemoteId) -> Option<Slot> {
        self.id_to_slot.get(&remote_id).copied()
    }

    pub fn remote_id(&self, slot: Slot) -> Option<RemoteId> {
        self.slot_to_id.get(&slot).copied()
    }

    /// (slot, remote id) pairs in slot order.
    pub fn mappings(&self) -> impl Iterator<Item = (Slot, RemoteId)> + '_ {
        self.slot_to_id.iter().map(|(&s, &r)| (s, r))
    }

    pub(crate) fn graph(&self) -> &Hnsw {
        &self.graph
    }

    pub(crate) fn arena(&self) -> &SlotArena {
        &self.slots
    }

    /// Validate and L2-normalize a vector.
    pub fn prepare_vector(&self, vector: &[f32]) -> Result<Vec<f32>, MailsiftError> {
        if vector.len() != self.dimension {
            return Err(MailsiftError::InvalidInput(format!(
                "vector has dimension {}, index expects {}",
                vector.len(),
                self.dimension
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(MailsiftError::InvalidInput("vector contains non-finite values".into()));
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 {
            return Err(MailsiftError::InvalidInput("vector has zero length".into()));
        }
        Ok(vector.iter().map(|v| v / norm).collect())
    }

    /// Insert a vector for a remote id that has no slot yet.
    pub fn insert(&mut self, remote_id: RemoteId, vector: &[f32]) -> Result<Slot, MailsiftError> {
        if let Some(existing) = self.slot_of(remote_id) {
            return Err(MailsiftError::Consistency(format!(
                "message {} already holds slot {}",
                remote_id, existing
            )));
        }
        let unit = self.prepare_vector(vector)?;
        let slot = self.slots.allocate();
        self.graph.insert(slot, unit);
        self.slot_to_id.insert(slot, remote_id);
        self.id_to_slot.insert(remote_id, slot);
        debug!(remote_id, slot, "Indexed message");
        Ok(slot)
    }

    /// Put a vector back at a known slot (restores and rebuilds).
    pub fn restore(&mut self, slot: Slot, remote_id: RemoteId, vector: &[f32]) -> Result<(), MailsiftError> {
        let unit = self.prepare_vector(vector)?;
        self.restore_unit(slot, remote_id, unit)
    }

    fn restore_unit(&mut self, slot: Slot, remote_id: RemoteId, unit: Vec<f32>) -> Result<(), MailsiftError> {
        if self.id_to_slot.contains_key(&remote_id) {
            return Err(MailsiftError::Consistency(format!(
                "message {} is already indexed",
                remote_id
            )));
        }
        if !self.slots.claim(slot) {
            return Err(MailsiftError::Consistency(format!("slot {} is already live", slot)));
        }
        self.graph.insert(slot, unit);
        self.slot_to_id.insert(slot, remote_id);
        self.id_to_slot.insert(remote_id, slot);
        Ok(())
    }

    /// Remove the entry at `slot`. The mapping is cleared before the slot
    /// goes back to the free list.
    pub fn remove(&mut self, slot: Slot) -> Option<(RemoteId, Vec<f32>)> {
        let remote_id = self.slot_to_id.remove(&slot)?;
        self.id_to_slot.remove(&remote_id);
        let vector = self.graph.remove(slot).unwrap_or_default();
        self.slots.release(slot);
        debug!(remote_id, slot, "Removed index entry");
        Some((remote_id, vector))
    }

    pub fn clear(&mut self) {
        let params = *self.graph.params();
        self.graph = Hnsw::new(params);
        self.slots = SlotArena::new();
        self.slot_to_id.clear();
        self.id_to_slot.clear();
    }

    /// Up to `k` nearest entries, ascending by (distance, slot).
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<IndexHit>, MailsiftError> {
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let unit = self.prepare_vector(query)?;
        let ef = self.graph.params().ef_search;
        Ok(self
            .graph
            .search(&unit, k, ef)
            .into_iter()
            .filter_map(|(slot, distance)| {
                self.remote_id(slot).map(|remote_id| IndexHit {
                    slot,
                    remote_id,
                    distance,
                })
            })
            .collect())
    }

    /// Start a group of changes that can be undone as a whole.
    pub fn begin(&mut self) -> IndexTxn<'_> {
        let inserted = self.graph.inserted();
        IndexTxn {
            index: self,
            journal: Vec::new(),
            inserted_before: inserted,
            finished: false,
        }
    }
}

enum UndoOp {
    Inserted { slot: Slot },
    Removed { slot: Slot, remote_id: RemoteId, unit: Vec<f32> },
}

/// Undo journal over a `VectorIndex`.
///
/// Dropping an unfinished transaction rolls it back, so an early return
/// with `?` never leaves half a batch in the index.
pub struct IndexTxn<'a> {
    index: &'a mut VectorIndex,
    journal: Vec<UndoOp>,
    inserted_before: u64,
    finished: bool,
}

impl<'a> IndexTxn<'a> {
    pub fn insert(&mut self, remote_id: RemoteId, vector: &[f32]) -> Result<Slot, MailsiftError> {
        let slot = self.index.insert(remote_id, vector)?;
        self.journal.push(UndoOp::Inserted { slot });
        Ok(slot)
    }

    /// Remove whatever slot the remote id holds, returning it.
    pub fn remove_remote(&mut self, remote_id: RemoteId) -> Option<Slot> {
        let slot = self.index.slot_of(remote_id)?;
        let (remote_id, unit) = self.index.remove(slot)?;
        self.journal.push(UndoOp::Removed { slot, remote_id, unit });
        Some(slot)
    }

    pub fn index(&self) -> &VectorIndex {
        &*self.index
    }

    pub fn commit(mut self) {
        self.finished = true;
        self.journal.clear();
    }

    pub fn rollback(mut self) {
        self.undo();
    }

    fn undo(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let undone = self.journal.len();
        while let Some(op) = self.journal.pop() {
            match op {
                UndoOp::Inserted { slot } => {
                    self.index.remove(slot);
                }
                UndoOp::Removed { slot, remote_id, unit } => {
                    if let Err(e) = self.index.restore_unit(slot, remote_id, unit) {
                        warn!(slot, remote_id, "Failed to restore index entry on rollback: {}", e);
                    }
                }
            }
        }
        self.index.graph.set_inserted(self.inserted_before);
        if undone > 0 {
            debug!(undone, "Rolled back index changes");
        }
    }
}

impl Drop for IndexTxn<'_> {
    fn drop(&mut self) {
        self.undo();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> HnswParams {
        HnswParams {
            m: 4,
            ef_construction: 16,
            ef_search: 16,
            seed: 9,
        }
    }

    fn v(x: f32, y: f32) -> Vec<f32> {
        vec![x, y, 0.0]
    }

    #[test]
    fn test_insert_assigns_dense_slots() {
        let mut index = VectorIndex::new(3, params());
        assert_eq!(index.insert(101, &v(1.0, 0.0)).unwrap(), 0);
        assert_eq!(index.insert(102, &v(0.0, 1.0)).unwrap(), 1);
        assert_eq!(index.slot_of(102), Some(1));
        assert_eq!(index.remote_id(0), Some(101));
    }

    #[test]
    fn test_insert_rejects_bad_vectors() {
        let mut index = VectorIndex::new(3, params());
        assert!(matches!(index.insert(1, &[1.0, 0.0]), Err(MailsiftError::InvalidInput(_))));
        assert!(index.insert(1, &[f32::NAN, 0.0, 0.0]).is_err());
        assert!(index.insert(1, &[0.0, 0.0, 0.0]).is_err());
        assert!(index.is_empty());
    }

    #[test]
    fn test_insert_twice_for_same_id_is_consistency_error() {
        let mut index = VectorIndex::new(3, params());
        index.insert(5, &v(1.0, 0.0)).unwrap();
        assert!(matches!(index.insert(5, &v(1.0, 0.0)), Err(MailsiftError::Consistency(_))));
    }

    #[test]
    fn test_freed_slot_is_reused_after_mapping_cleared() {
        let mut index = VectorIndex::new(3, params());
        index.insert(1, &v(1.0, 0.0)).unwrap();
        index.insert(2, &v(0.0, 1.0)).unwrap();
        let (rid, _) = index.remove(0).unwrap();
        assert_eq!(rid, 1);
        assert_eq!(index.remote_id(0), None);
        assert_eq!(index.insert(3, &v(1.0, 1.0)).unwrap(), 0);
        assert_eq!(index.remote_id(0), Some(3));
        assert_eq!(index.slot_of(1), None);
    }

    #[test]
    fn test_search_resolves_remote_ids() {
        let mut index = VectorIndex::new(3, params());
        index.insert(10, &v(1.0, 0.0)).unwrap();
        index.insert(20, &v(0.0, 1.0)).unwrap();
        index.insert(30, &v(0.7, 0.7)).unwrap();
        let hits = index.search(&v(1.0, 0.1), 2).unwrap();
        assert_eq!(hits.iter().map(|h| h.remote_id).collect::<Vec<_>>(), vec![10, 30]);
        assert!(index.search(&v(1.0, 0.0), 0).unwrap().is_empty());
    }

    #[test]
    fn test_dropped_txn_rolls_back() {
        let mut index = VectorIndex::new(3, params());
        index.insert(1, &v(1.0, 0.0)).unwrap();
        {
            let mut txn = index.begin();
            txn.remove_remote(1).unwrap();
            txn.insert(1, &v(0.0, 1.0)).unwrap();
            txn.insert(2, &v(1.0, 1.0)).unwrap();
        }
        assert_eq!(index.len(), 1);
        assert_eq!(index.slot_of(1), Some(0));
        assert_eq!(index.slot_of(2), None);
        let hits = index.search(&v(1.0, 0.0), 1).unwrap();
        assert!(hits[0].distance < 1e-6);
    }

    #[test]
    fn test_committed_txn_keeps_changes() {
        let mut index = VectorIndex::new(3, params());
        let mut txn = index.begin();
        txn.insert(1, &v(1.0, 0.0)).unwrap();
        txn.insert(2, &v(0.0, 1.0)).unwrap();
        txn.commit();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_rebuild_keeps_recorded_slots() {
        let rows = vec![
            (7, Some(2), v(1.0, 0.0)),
            (8, Some(0), v(0.0, 1.0)),
            (9, None, v(1.0, 1.0)),
            // Conflicts with message 7
            (10, Some(2), v(0.5, 1.0)),
        ];
        let (index, reassigned) = VectorIndex::rebuild(3, params(), rows).unwrap();
        assert_eq!(index.slot_of(7), Some(2));
        assert_eq!(index.slot_of(8), Some(0));
        assert_eq!(reassigned, vec![(9, 1), (10, 3)]);
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_from_parts_rejects_mismatched_mapping() {
        let mut index = VectorIndex::new(3, params());
        index.insert(1, &v(1.0, 0.0)).unwrap();
        let graph = index.graph().clone();
        let arena = index.arena().clone();
        assert!(VectorIndex::from_parts(3, graph.clone(), arena.clone(), vec![(0, 1)], 1).is_ok());
        assert!(matches!(
            VectorIndex::from_parts(3, graph.clone(), arena.clone(), vec![], 1),
            Err(MailsiftError::CorruptIndex(_))
        ));
        assert!(VectorIndex::from_parts(3, graph, arena, vec![(4, 1)], 1).is_err());
    }
}
