//! Recycler WAL replay.
//!
//! The visitor folds the event stream into the recovered pending set, the
//! latest info anchor, and the in-flight batch (if a batch was prepared but
//! its commit never became durable). Replay is a fixed point: running it
//! twice over the same log produces identical results.

use std::collections::{BTreeMap, HashMap};

use uuid::Uuid;

use crate::config::RecyclerOptions;
use crate::error::PagelogResult;
use crate::page::{PageId, PageToRecycle};
use crate::records::RecyclerEvent;
use crate::slot::{SlotOffset, SlotRange};

use super::Batch;

#[derive(Debug, Default)]
struct BatchRecord {
    items: Vec<PageToRecycle>,
}

/// Replays recycler WAL events.
#[derive(Debug)]
pub struct RecyclerRecoveryVisitor {
    options: RecyclerOptions,
    uuid: Option<Uuid>,
    latest_info_slot: Option<SlotRange>,
    pending: HashMap<PageId, PageToRecycle>,
    /// Uncommitted batches keyed by batch slot; committed batches are
    /// removed as soon as their commit record is seen.
    open_batches: BTreeMap<SlotOffset, BatchRecord>,
}

/// Everything recovery needs to construct a live recycler.
#[derive(Debug)]
pub struct RecyclerRecovery {
    pub options: RecyclerOptions,
    pub uuid: Option<Uuid>,
    pub latest_info_slot: Option<SlotRange>,
    /// The in-flight batch to retry first.
    pub latest_batch: Option<Batch>,
    pub pending: Vec<PageToRecycle>,
}

impl RecyclerRecoveryVisitor {
    pub fn new(default_options: RecyclerOptions) -> Self {
        Self {
            options: default_options,
            uuid: None,
            latest_info_slot: None,
            pending: HashMap::new(),
            open_batches: BTreeMap::new(),
        }
    }

    pub fn visit(&mut self, slot: SlotRange, event: RecyclerEvent) -> PagelogResult<()> {
        match event {
            RecyclerEvent::Info {
                uuid,
                max_refs_per_page,
                batch_size,
                info_refresh_rate,
            } => {
                self.uuid = Some(uuid);
                self.options.max_refs_per_page = max_refs_per_page;
                self.options.batch_size = batch_size as usize;
                self.options.info_refresh_rate = info_refresh_rate;
                self.latest_info_slot = Some(slot);
            }
            RecyclerEvent::PageInsert { page_id, depth } => {
                let item = PageToRecycle {
                    page_id,
                    slot_offset: slot.lower_bound,
                    depth,
                };
                match self.pending.get(&page_id) {
                    Some(existing) if existing.depth >= depth => {}
                    _ => {
                        self.pending.insert(page_id, item);
                    }
                }
            }
            RecyclerEvent::PagePrepare {
                page_id,
                depth,
                batch_slot,
            } => {
                // The page left the pending set when it was collected into
                // the batch.
                self.pending.remove(&page_id);
                self.open_batches
                    .entry(batch_slot)
                    .or_default()
                    .items
                    .push(PageToRecycle {
                        page_id,
                        slot_offset: slot.lower_bound,
                        depth,
                    });
            }
            RecyclerEvent::BatchCommit { batch_slot } => {
                // The batch is durably done; a commit for an unknown batch
                // means its prepares were already trimmed.
                self.open_batches.remove(&batch_slot);
            }
        }
        Ok(())
    }

    /// Fold the scan into the recovered state. The greatest uncommitted
    /// batch becomes `latest_batch`; any older uncommitted prepares are
    /// re-inserted into the pending set.
    pub fn finish(mut self) -> RecyclerRecovery {
        let latest_batch_slot = self.open_batches.keys().next_back().copied();
        let latest_batch = latest_batch_slot.map(|batch_slot| {
            let record = self.open_batches.remove(&batch_slot).expect("known key");
            Batch {
                to_recycle: record.items,
                slot_offset: batch_slot,
            }
        });
        for (_, record) in std::mem::take(&mut self.open_batches) {
            for item in record.items {
                match self.pending.get(&item.page_id) {
                    Some(existing) if existing.depth >= item.depth => {}
                    _ => {
                        self.pending.insert(item.page_id, item);
                    }
                }
            }
        }
        let mut pending: Vec<PageToRecycle> = self.pending.into_values().collect();
        pending.sort_by_key(|item| item.slot_offset);
        RecyclerRecovery {
            options: self.options,
            uuid: self.uuid,
            latest_info_slot: self.latest_info_slot,
            latest_batch,
            pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepare(page: u64, depth: u32, batch_slot: SlotOffset) -> RecyclerEvent {
        RecyclerEvent::PagePrepare {
            page_id: PageId::new(page),
            depth,
            batch_slot,
        }
    }

    fn insert(page: u64, depth: u32) -> RecyclerEvent {
        RecyclerEvent::PageInsert {
            page_id: PageId::new(page),
            depth,
        }
    }

    fn at(offset: SlotOffset) -> SlotRange {
        SlotRange {
            lower_bound: offset,
            upper_bound: offset + 28,
        }
    }

    fn replay(events: &[(SlotOffset, RecyclerEvent)]) -> RecyclerRecovery {
        let mut visitor = RecyclerRecoveryVisitor::new(RecyclerOptions::default());
        for (offset, event) in events {
            visitor.visit(at(*offset), event.clone()).expect("visit");
        }
        visitor.finish()
    }

    #[test]
    fn committed_batch_is_fully_discharged() {
        let recovery = replay(&[
            (0, insert(1, 0)),
            (28, insert(2, 0)),
            (56, prepare(1, 0, 56)),
            (84, prepare(2, 0, 56)),
            (112, RecyclerEvent::BatchCommit { batch_slot: 56 }),
        ]);
        assert!(recovery.latest_batch.is_none());
        assert!(recovery.pending.is_empty());
    }

    #[test]
    fn uncommitted_batch_surfaces_as_latest() {
        let recovery = replay(&[
            (0, insert(1, 0)),
            (28, insert(2, 0)),
            (56, prepare(1, 0, 56)),
        ]);
        let batch = recovery.latest_batch.expect("latest batch");
        assert_eq!(batch.slot_offset, 56);
        assert_eq!(batch.to_recycle.len(), 1);
        assert_eq!(batch.to_recycle[0].page_id.as_u64(), 1);
        // Page 2 was never prepared, so it stays pending.
        assert_eq!(recovery.pending.len(), 1);
        assert_eq!(recovery.pending[0].page_id.as_u64(), 2);
    }

    #[test]
    fn older_uncommitted_prepares_reenter_pending() {
        let recovery = replay(&[
            (0, insert(1, 1)),
            (28, prepare(1, 1, 28)),
            (56, insert(2, 0)),
            (84, prepare(2, 0, 84)),
        ]);
        let batch = recovery.latest_batch.expect("latest batch");
        assert_eq!(batch.slot_offset, 84);
        assert_eq!(recovery.pending.len(), 1);
        assert_eq!(recovery.pending[0].page_id.as_u64(), 1);
        assert_eq!(recovery.pending[0].depth, 1);
    }

    #[test]
    fn info_slot_updates_options_and_anchor() {
        let mut options = RecyclerOptions::default();
        options.max_refs_per_page = 4;
        let mut visitor = RecyclerRecoveryVisitor::new(options);
        visitor
            .visit(
                at(0),
                RecyclerEvent::Info {
                    uuid: Uuid::from_u128(0xabc),
                    max_refs_per_page: 8,
                    batch_size: 8,
                    info_refresh_rate: 2,
                },
            )
            .expect("visit");
        let recovery = visitor.finish();
        assert_eq!(recovery.uuid, Some(Uuid::from_u128(0xabc)));
        assert_eq!(recovery.options.max_refs_per_page, 8);
        assert_eq!(recovery.options.info_refresh_rate, 2);
        assert_eq!(recovery.latest_info_slot, Some(at(0)));
    }

    #[test]
    fn replay_is_a_fixed_point() {
        let events = [
            (0, insert(1, 0)),
            (28, insert(2, 1)),
            (56, prepare(2, 1, 56)),
        ];
        let first = replay(&events);
        let second = replay(&events);
        assert_eq!(first.pending, second.pending);
        assert_eq!(
            first.latest_batch.as_ref().map(|b| b.slot_offset),
            second.latest_batch.as_ref().map(|b| b.slot_offset)
        );
        assert_eq!(
            first.latest_batch.map(|b| b.to_recycle),
            second.latest_batch.map(|b| b.to_recycle)
        );
    }
}
