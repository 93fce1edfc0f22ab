//! In-memory priority structure of pages awaiting recycling.

use std::collections::{BTreeMap, HashMap};

use smallvec::{SmallVec, smallvec};

use crate::metrics::RecyclerMetrics;
use crate::page::{PageId, PageToRecycle};
use crate::slot::SlotOffset;

/// Pending pages, grouped deepest-first for draining so that ref-count
/// cascades terminate.
///
/// Inserting a page that is already pending at an equal or greater depth is
/// an idempotent no-op; a deeper insert updates the stored depth and
/// reports the item so a new WAL record can be written for recovery.
#[derive(Debug, Default)]
pub struct RecyclerState {
    pending: HashMap<PageId, PageToRecycle>,
    /// Insertion order (slot order) index; also yields the lru slot.
    by_slot: BTreeMap<SlotOffset, PageId>,
}

impl RecyclerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Add `item` to the pending set. Returns the items that need a WAL
    /// record; empty means the insert was an idempotent no-op.
    pub fn insert(&mut self, item: PageToRecycle) -> SmallVec<[PageToRecycle; 2]> {
        match self.pending.get(&item.page_id) {
            None => {
                self.pending.insert(item.page_id, item);
                self.by_slot.insert(item.slot_offset, item.page_id);
                smallvec![item]
            }
            Some(existing) if existing.depth >= item.depth => SmallVec::new(),
            Some(existing) => {
                // Deeper than before: the new level must reach the WAL so
                // recovery observes it.
                let old_slot = existing.slot_offset;
                self.by_slot.remove(&old_slot);
                self.pending.insert(item.page_id, item);
                self.by_slot.insert(item.slot_offset, item.page_id);
                smallvec![item]
            }
        }
    }

    /// Remove and return up to `max_size` items from the greatest non-empty
    /// depth group, oldest slot first.
    pub fn collect_batch(
        &mut self,
        max_size: usize,
        metrics: &RecyclerMetrics,
    ) -> Vec<PageToRecycle> {
        let Some(target_depth) = self.pending.values().map(|item| item.depth).max() else {
            return Vec::new();
        };
        let selected: Vec<PageId> = self
            .by_slot
            .values()
            .filter(|page_id| self.pending[*page_id].depth == target_depth)
            .take(max_size)
            .copied()
            .collect();
        let mut batch = Vec::with_capacity(selected.len());
        for page_id in selected {
            let item = self.pending.remove(&page_id).expect("selected from pending");
            self.by_slot.remove(&item.slot_offset);
            batch.push(item);
        }
        metrics
            .remove_count
            .fetch_add(batch.len() as u64, std::sync::atomic::Ordering::Relaxed);
        batch
    }

    /// Smallest recorded slot of any pending item; trimming must not pass
    /// this.
    pub fn get_lru_slot(&self) -> Option<SlotOffset> {
        self.by_slot.keys().next().copied()
    }

    /// Repopulate from recovery in one step.
    pub fn bulk_load(&mut self, items: impl IntoIterator<Item = PageToRecycle>) {
        for item in items {
            self.insert(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(page: u64, slot: SlotOffset, depth: u32) -> PageToRecycle {
        PageToRecycle {
            page_id: PageId::new(page),
            slot_offset: slot,
            depth,
        }
    }

    #[test]
    fn repeat_insert_is_idempotent() {
        let mut state = RecyclerState::new();
        assert_eq!(state.insert(item(1, 10, 0)).len(), 1);
        assert!(state.insert(item(1, 20, 0)).is_empty());
        assert_eq!(state.len(), 1);
        // The original slot is retained.
        assert_eq!(state.get_lru_slot(), Some(10));
    }

    #[test]
    fn deeper_insert_updates_and_reports() {
        let mut state = RecyclerState::new();
        state.insert(item(1, 10, 0));
        let appended = state.insert(item(1, 30, 2));
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].depth, 2);
        // A shallower re-insert is now a no-op.
        assert!(state.insert(item(1, 40, 1)).is_empty());
        assert_eq!(state.get_lru_slot(), Some(30));
    }

    #[test]
    fn collect_batch_drains_deepest_first_in_slot_order() {
        let metrics = RecyclerMetrics::default();
        let mut state = RecyclerState::new();
        state.insert(item(1, 10, 0));
        state.insert(item(2, 20, 1));
        state.insert(item(3, 30, 1));
        state.insert(item(4, 40, 0));

        let batch = state.collect_batch(8, &metrics);
        assert_eq!(
            batch.iter().map(|i| i.page_id.as_u64()).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(batch.iter().all(|i| i.depth == 1));

        let batch = state.collect_batch(1, &metrics);
        assert_eq!(batch[0].page_id.as_u64(), 1);
        assert_eq!(state.len(), 1);
        assert_eq!(metrics.snapshot().remove_count, 3);
    }

    #[test]
    fn lru_slot_tracks_remaining_minimum() {
        let metrics = RecyclerMetrics::default();
        let mut state = RecyclerState::new();
        assert_eq!(state.get_lru_slot(), None);
        state.insert(item(1, 50, 0));
        state.insert(item(2, 20, 0));
        assert_eq!(state.get_lru_slot(), Some(20));
        let batch = state.collect_batch(8, &metrics);
        assert_eq!(batch.len(), 2);
        assert_eq!(state.get_lru_slot(), None);
    }

    #[test]
    fn bulk_load_keeps_deepest_duplicate() {
        let mut state = RecyclerState::new();
        state.bulk_load([item(1, 10, 0), item(2, 20, 1), item(1, 30, 2)]);
        assert_eq!(state.len(), 2);
        let metrics = RecyclerMetrics::default();
        let batch = state.collect_batch(8, &metrics);
        assert_eq!(batch[0].page_id.as_u64(), 1);
        assert_eq!(batch[0].depth, 2);
    }
}
