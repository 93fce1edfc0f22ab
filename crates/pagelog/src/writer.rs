//! Slot writer and grant accounting.
//!
//! A `SlotWriter` fronts a `LogDevice` with a byte pool: callers `reserve`
//! grants from the pool, spend them on appends, and the pool is replenished
//! when the log is trimmed. Grants are move-only credits; the sum of live
//! grant bytes plus in-use log bytes never exceeds the log capacity.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::device::LogDevice;
use crate::error::{PagelogError, PagelogResult};
use crate::records::{SlotPayload, encode_slot};
use crate::slot::{LogReadMode, SlotOffset, SlotRange, SlotUpperBoundAt, slot_less_than};

/// Whether a reservation may suspend until pool bytes become available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitForSpace {
    No,
    Yes,
}

static NEXT_ISSUER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct IssuerState {
    available: u64,
    halted: bool,
}

/// Byte pool shared by all grants of one slot writer.
#[derive(Debug)]
pub(crate) struct GrantIssuer {
    id: u64,
    state: Mutex<IssuerState>,
    notify: Notify,
}

impl GrantIssuer {
    fn new(available: u64) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ISSUER_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(IssuerState {
                available,
                halted: false,
            }),
            notify: Notify::new(),
        })
    }

    fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.state.lock().available += bytes;
        self.notify.notify_waiters();
    }

    async fn acquire(&self, bytes: u64, wait: WaitForSpace) -> PagelogResult<()> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.halted {
                    return Err(PagelogError::Cancelled);
                }
                if state.available >= bytes {
                    state.available -= bytes;
                    return Ok(());
                }
                if wait == WaitForSpace::No {
                    return Err(PagelogError::NoSpace);
                }
            }
            notified.await;
        }
    }

    fn try_acquire(&self, bytes: u64) -> PagelogResult<()> {
        let mut state = self.state.lock();
        if state.halted {
            return Err(PagelogError::Cancelled);
        }
        if state.available < bytes {
            return Err(PagelogError::NoSpace);
        }
        state.available -= bytes;
        Ok(())
    }

    fn available(&self) -> u64 {
        self.state.lock().available
    }

    fn halt(&self) {
        self.state.lock().halted = true;
        self.notify.notify_waiters();
    }
}

#[derive(Debug)]
struct GrantCellState {
    size: u64,
    revoked: bool,
}

#[derive(Debug)]
struct GrantCell {
    state: Mutex<GrantCellState>,
    notify: Notify,
}

/// A move-only credit of log bytes carved from a `SlotWriter`'s pool.
///
/// Dropping a grant returns its remaining bytes to the pool. `revoke`
/// additionally fails any pending `spend` so shutdown can release blocked
/// callers.
#[derive(Debug)]
pub struct Grant {
    issuer: Arc<GrantIssuer>,
    cell: Arc<GrantCell>,
}

impl Grant {
    fn with_size(issuer: Arc<GrantIssuer>, size: u64) -> Self {
        Self {
            issuer,
            cell: Arc::new(GrantCell {
                state: Mutex::new(GrantCellState {
                    size,
                    revoked: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn size(&self) -> u64 {
        self.cell.state.lock().size
    }

    /// Identifies the pool this grant draws on.
    pub fn issuer_id(&self) -> u64 {
        self.issuer.id
    }

    pub fn is_revoked(&self) -> bool {
        self.cell.state.lock().revoked
    }

    /// Merge `other`'s bytes into this grant. Merging into a revoked grant
    /// returns the bytes to the pool instead.
    ///
    /// Panics if the grants come from different pools; mixing issuers is a
    /// programming error.
    pub fn subsume(&self, other: Grant) {
        assert_eq!(
            self.issuer.id, other.issuer.id,
            "grants from different issuers may not be merged"
        );
        let bytes = other.take_all();
        if bytes == 0 {
            return;
        }
        {
            let mut state = self.cell.state.lock();
            if !state.revoked {
                state.size += bytes;
            } else {
                drop(state);
                self.issuer.release(bytes);
                return;
            }
        }
        self.cell.notify.notify_waiters();
    }

    /// Split `bytes` off into a new grant, optionally waiting for this grant
    /// to accumulate enough credit.
    pub async fn spend(&self, bytes: u64, wait: WaitForSpace) -> PagelogResult<Grant> {
        loop {
            let mut notified = pin!(self.cell.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.cell.state.lock();
                if state.revoked {
                    return Err(PagelogError::Cancelled);
                }
                if state.size >= bytes {
                    state.size -= bytes;
                    return Ok(Grant::with_size(Arc::clone(&self.issuer), bytes));
                }
                if wait == WaitForSpace::No {
                    return Err(PagelogError::NoSpace);
                }
            }
            notified.await;
        }
    }

    /// Return the remaining bytes to the pool and fail pending spends.
    pub fn revoke(&self) {
        let bytes = {
            let mut state = self.cell.state.lock();
            state.revoked = true;
            std::mem::take(&mut state.size)
        };
        self.issuer.release(bytes);
        self.cell.notify.notify_waiters();
    }

    /// Consume exactly `bytes` for an append. The bytes become log content
    /// and return to the pool only when the log is trimmed.
    fn consume_exact(&self, bytes: u64) -> PagelogResult<()> {
        let mut state = self.cell.state.lock();
        if state.revoked {
            return Err(PagelogError::Cancelled);
        }
        if state.size < bytes {
            return Err(PagelogError::NoSpace);
        }
        state.size -= bytes;
        Ok(())
    }

    fn refund(&self, bytes: u64) {
        let mut state = self.cell.state.lock();
        if !state.revoked {
            state.size += bytes;
        } else {
            drop(state);
            self.issuer.release(bytes);
        }
    }

    fn take_all(&self) -> u64 {
        std::mem::take(&mut self.cell.state.lock().size)
    }
}

impl Drop for Grant {
    fn drop(&mut self) {
        let bytes = self.take_all();
        self.issuer.release(bytes);
        self.cell.notify.notify_waiters();
    }
}

/// Reserve, append, sync, and trim atop a `LogDevice`.
pub struct SlotWriter {
    device: Arc<dyn LogDevice>,
    issuer: Arc<GrantIssuer>,
    append_mutex: Mutex<()>,
}

impl SlotWriter {
    pub fn new(device: Arc<dyn LogDevice>) -> Self {
        let in_use = device.slot_range(LogReadMode::Speculative).size();
        let capacity = device.capacity() as u64;
        assert!(
            in_use <= capacity,
            "log in-use span {in_use} exceeds capacity {capacity}"
        );
        Self {
            issuer: GrantIssuer::new(capacity - in_use),
            device,
            append_mutex: Mutex::new(()),
        }
    }

    /// Carve `bytes` from the pool.
    pub async fn reserve(&self, bytes: u64, wait: WaitForSpace) -> PagelogResult<Grant> {
        self.issuer.acquire(bytes, wait).await?;
        Ok(Grant::with_size(Arc::clone(&self.issuer), bytes))
    }

    /// Non-suspending `reserve`; fails with `NoSpace` when the pool cannot
    /// cover `bytes` right now.
    pub fn try_reserve(&self, bytes: u64) -> PagelogResult<Grant> {
        self.issuer.try_acquire(bytes)?;
        Ok(Grant::with_size(Arc::clone(&self.issuer), bytes))
    }

    /// Serialize `payload` and append it, consuming exactly its packed size
    /// from `grant`. Appends are strictly sequential; the returned ranges
    /// reflect log order.
    pub fn append(
        &self,
        grant: &Grant,
        payload: &impl SlotPayload,
    ) -> PagelogResult<SlotRange> {
        assert_eq!(
            grant.issuer_id(),
            self.issuer.id,
            "grant was issued by a different slot writer"
        );
        let bytes = encode_slot(payload)?;
        let _append = self.append_mutex.lock();
        grant.consume_exact(bytes.len() as u64)?;
        match self.device.append_bytes(&bytes) {
            Ok(range) => Ok(range),
            Err(err) => {
                grant.refund(bytes.len() as u64);
                Err(err)
            }
        }
    }

    pub async fn sync(&self, mode: LogReadMode, target: SlotUpperBoundAt) -> PagelogResult<()> {
        self.device.sync(mode, target).await
    }

    /// Advance the log's lower bound; the released span returns to the pool.
    /// Trimming at or below the current lower bound is a no-op.
    pub fn trim(&self, new_lower_bound: SlotOffset) -> PagelogResult<()> {
        let _append = self.append_mutex.lock();
        let current = self.device.slot_range(LogReadMode::Speculative).lower_bound;
        if !slot_less_than(current, new_lower_bound) {
            return Ok(());
        }
        self.device.trim(new_lower_bound)?;
        self.issuer.release(new_lower_bound.wrapping_sub(current));
        Ok(())
    }

    /// Offset the next append will be assigned.
    pub fn current_slot(&self) -> SlotOffset {
        self.device.slot_range(LogReadMode::Speculative).upper_bound
    }

    pub fn slot_range(&self, mode: LogReadMode) -> SlotRange {
        self.device.slot_range(mode)
    }

    pub fn pool_size(&self) -> u64 {
        self.issuer.available()
    }

    pub fn in_use_size(&self) -> u64 {
        self.device.slot_range(LogReadMode::Speculative).size()
    }

    pub fn log_capacity(&self) -> u64 {
        self.device.capacity() as u64
    }

    /// Unblock all reservations and syncs with an error; subsequent
    /// operations fail.
    pub fn halt(&self) {
        self.issuer.halt();
        self.device.halt();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::device::{LogDeviceFactory, MemoryLogDeviceFactory, MemoryLogStorage};
    use crate::page::PageId;
    use crate::records::{RecyclerEvent, packed_size_of};

    fn open_writer(capacity: usize) -> Arc<SlotWriter> {
        let factory = MemoryLogDeviceFactory::new(MemoryLogStorage::new(capacity));
        let device = factory
            .open_log_device(&mut |reader| Ok(reader.slot_offset()))
            .expect("open");
        Arc::new(SlotWriter::new(device))
    }

    fn insert_event(page: u64) -> RecyclerEvent {
        RecyclerEvent::PageInsert {
            page_id: PageId::new(page),
            depth: 0,
        }
    }

    #[tokio::test]
    async fn appends_are_contiguous_and_monotone() {
        let writer = open_writer(4096);
        let event = insert_event(1);
        let grant = writer
            .reserve(packed_size_of(&event) * 3, WaitForSpace::No)
            .await
            .expect("reserve");
        let first = writer.append(&grant, &event).expect("append");
        let second = writer.append(&grant, &event).expect("append");
        let third = writer.append(&grant, &event).expect("append");
        assert_eq!(first.upper_bound, second.lower_bound);
        assert_eq!(second.upper_bound, third.lower_bound);
        assert!(slot_less_than(first.lower_bound, third.upper_bound));
        assert_eq!(grant.size(), 0);
    }

    #[tokio::test]
    async fn append_never_over_consumes() {
        let writer = open_writer(4096);
        let event = insert_event(1);
        let grant = writer
            .reserve(packed_size_of(&event) - 1, WaitForSpace::No)
            .await
            .expect("reserve");
        let before = grant.size();
        assert!(matches!(
            writer.append(&grant, &event),
            Err(PagelogError::NoSpace)
        ));
        assert_eq!(grant.size(), before);
    }

    #[tokio::test]
    async fn grant_conservation_across_trim() {
        let writer = open_writer(256);
        let event = insert_event(1);
        let slot_len = packed_size_of(&event);

        let grant = writer.reserve(slot_len, WaitForSpace::No).await.expect("reserve");
        assert_eq!(writer.pool_size() + grant.size() + writer.in_use_size(), 256);

        let range = writer.append(&grant, &event).expect("append");
        assert_eq!(writer.pool_size() + grant.size() + writer.in_use_size(), 256);

        writer
            .sync(LogReadMode::Durable, SlotUpperBoundAt {
                offset: range.upper_bound,
            })
            .await
            .expect("sync");
        writer.trim(range.upper_bound).expect("trim");
        assert_eq!(writer.pool_size() + grant.size() + writer.in_use_size(), 256);
        assert_eq!(writer.pool_size(), 256);
    }

    #[tokio::test]
    async fn trim_below_lower_bound_is_a_noop() {
        let writer = open_writer(256);
        let event = insert_event(2);
        let grant = writer
            .reserve(packed_size_of(&event) * 2, WaitForSpace::No)
            .await
            .expect("reserve");
        writer.append(&grant, &event).expect("append");
        let second = writer.append(&grant, &event).expect("append");
        writer.trim(second.lower_bound).expect("trim");
        let lower = writer.slot_range(LogReadMode::Speculative).lower_bound;
        writer.trim(0).expect("noop trim");
        assert_eq!(
            writer.slot_range(LogReadMode::Speculative).lower_bound,
            lower
        );
    }

    #[tokio::test]
    async fn blocked_reserve_wakes_on_release() {
        let writer = open_writer(64);
        let all = writer.reserve(64, WaitForSpace::No).await.expect("reserve");

        let waiter = {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move { writer.reserve(32, WaitForSpace::Yes).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        drop(all);
        let grant = waiter.await.expect("join").expect("reserve");
        assert_eq!(grant.size(), 32);
    }

    #[tokio::test]
    async fn halt_unblocks_reserve_with_cancelled() {
        let writer = open_writer(64);
        let _all = writer.reserve(64, WaitForSpace::No).await.expect("reserve");
        let waiter = {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move { writer.reserve(1, WaitForSpace::Yes).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        writer.halt();
        let result = waiter.await.expect("join");
        assert!(matches!(result, Err(PagelogError::Cancelled)));
    }

    #[tokio::test]
    async fn spend_waits_for_subsumed_credit() {
        let writer = open_writer(128);
        let pool = Arc::new(writer.reserve(8, WaitForSpace::No).await.expect("reserve"));
        let spender = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.spend(32, WaitForSpace::Yes).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!spender.is_finished());

        let extra = writer.reserve(40, WaitForSpace::No).await.expect("reserve");
        pool.subsume(extra);
        let split = spender.await.expect("join").expect("spend");
        assert_eq!(split.size(), 32);
        assert_eq!(pool.size(), 16);
    }

    #[tokio::test]
    async fn revoke_fails_pending_spend() {
        let writer = open_writer(128);
        let pool = Arc::new(writer.reserve(8, WaitForSpace::No).await.expect("reserve"));
        let spender = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.spend(32, WaitForSpace::Yes).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.revoke();
        let result = spender.await.expect("join");
        assert!(matches!(result, Err(PagelogError::Cancelled)));
        assert_eq!(writer.pool_size(), 128);
    }

    #[tokio::test]
    #[should_panic(expected = "different issuers")]
    async fn subsume_across_issuers_panics() {
        let writer_a = open_writer(64);
        let writer_b = open_writer(64);
        let grant_a = writer_a.reserve(8, WaitForSpace::No).await.expect("reserve");
        let grant_b = writer_b.reserve(8, WaitForSpace::No).await.expect("reserve");
        grant_a.subsume(grant_b);
    }
}
