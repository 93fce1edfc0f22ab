//! Named-range reader locks over slot offsets.
//!
//! A `SlotReadLock` pins `[lower, upper)` against trimming; the minimum
//! lower bound across live locks is the physical trim floor, published
//! through an awaitable watch that the volume's trimmer task follows.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{PagelogError, PagelogResult};
use crate::slot::{SlotOffset, SlotRange, slot_less_than, slot_max};
use crate::watch::Watch;

#[derive(Debug)]
struct LockEntry {
    range: SlotRange,
    #[allow(dead_code)]
    holder: &'static str,
}

#[derive(Debug, Default)]
struct LockTable {
    locks: HashMap<u64, LockEntry>,
    next_id: u64,
    halted: bool,
}

struct LockInner {
    table: Mutex<LockTable>,
    /// Minimum lower bound across live locks. Retains its last value while
    /// no locks are held so the trim floor never regresses.
    lower_bound: Watch<SlotOffset>,
}

impl LockInner {
    fn publish_lower_bound(&self) {
        let table = self.table.lock();
        let min = table
            .locks
            .values()
            .map(|entry| entry.range.lower_bound)
            .reduce(crate::slot::slot_min);
        if let Some(min) = min {
            self.lower_bound.set(min);
        }
    }
}

/// Issues and tracks named-range reader locks.
#[derive(Clone)]
pub struct SlotLockManager {
    inner: Arc<LockInner>,
}

impl Default for SlotLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotLockManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LockInner {
                table: Mutex::new(LockTable::default()),
                lower_bound: Watch::new(0),
            }),
        }
    }

    /// Acquire a read lock on `range`. `holder` labels the lock for
    /// diagnostics.
    pub fn lock_slots(&self, range: SlotRange, holder: &'static str) -> PagelogResult<SlotReadLock> {
        let id = {
            let mut table = self.inner.table.lock();
            if table.halted {
                return Err(PagelogError::Cancelled);
            }
            let id = table.next_id;
            table.next_id += 1;
            table.locks.insert(id, LockEntry { range, holder });
            id
        };
        self.inner.publish_lower_bound();
        Ok(SlotReadLock {
            inner: Arc::clone(&self.inner),
            id,
            range,
        })
    }

    /// Replace `lock`'s range. The lower bound may only advance; trim locks
    /// never move backwards.
    pub fn update_lock(
        &self,
        mut lock: SlotReadLock,
        new_range: SlotRange,
        _holder: &'static str,
    ) -> PagelogResult<SlotReadLock> {
        assert!(
            !slot_less_than(new_range.lower_bound, lock.range.lower_bound),
            "slot lock lower bound may not regress"
        );
        {
            let mut table = self.inner.table.lock();
            if table.halted {
                return Err(PagelogError::Cancelled);
            }
            let entry = table.locks.get_mut(&lock.id).expect("live lock is tracked");
            entry.range = new_range;
        }
        lock.range = new_range;
        self.inner.publish_lower_bound();
        Ok(lock)
    }

    /// The current trim floor.
    pub fn lower_bound(&self) -> SlotOffset {
        self.inner.lower_bound.get()
    }

    /// Wait for the trim floor to move past `current`.
    pub async fn await_lower_bound_not_equal(
        &self,
        current: SlotOffset,
    ) -> PagelogResult<SlotOffset> {
        self.inner.lower_bound.await_not_equal(current).await
    }

    /// Fail new acquisitions and release trim-floor awaiters.
    pub fn halt(&self) {
        self.inner.table.lock().halted = true;
        self.inner.lower_bound.close();
    }
}

/// A held read lock; releases on drop.
pub struct SlotReadLock {
    inner: Arc<LockInner>,
    id: u64,
    range: SlotRange,
}

impl SlotReadLock {
    pub fn slot_range(&self) -> SlotRange {
        self.range
    }

    /// Clamp `offset` to be no lower than this lock's floor.
    pub fn clamp_lower(&self, offset: SlotOffset) -> SlotOffset {
        slot_max(offset, self.range.lower_bound)
    }
}

impl Drop for SlotReadLock {
    fn drop(&mut self) {
        self.inner.table.lock().locks.remove(&self.id);
        self.inner.publish_lower_bound();
    }
}
