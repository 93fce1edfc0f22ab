//! WAL-backed page recycler.
//!
//! The recycler accepts pages whose liveness dropped to zero, records them
//! durably, and drains them in deepest-first batches through a
//! `PageDeleter`. Every step is journaled so that deletes happen exactly
//! once across crashes: a batch's prepares are durable before the delete
//! runs, and its commit slot is appended only after the delete succeeds.

mod recovery;
mod state;

pub use recovery::{RecyclerRecovery, RecyclerRecoveryVisitor};
pub use state::RecyclerState;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{RecyclerOptions, calculate_recycler_log_size};
use crate::device::{LogDevice, LogDeviceFactory};
use crate::error::{PagelogError, PagelogResult};
use crate::metrics::RecyclerMetrics;
use crate::page::{MAX_PAGE_REF_DEPTH, PageDeleter, PageId, PageToRecycle};
use crate::records::{RecyclerEvent, read_events};
use crate::slot::{
    LogReadMode, SlotOffset, SlotRange, SlotUpperBoundAt, clamp_min_slot, slot_less_than,
    slot_max, slot_min,
};
use crate::watch::Watch;
use crate::writer::{Grant, SlotWriter, WaitForSpace};

const DELETE_RETRY_MAX_ATTEMPTS: u32 = 5;
const DELETE_RETRY_BASE_DELAY_MS: u64 = 5;
const DELETE_RETRY_MAX_DELAY_MS: u64 = 250;

fn delete_retry_delay(retries: u32) -> Duration {
    let shift = retries.saturating_sub(1).min(6);
    let delay = DELETE_RETRY_BASE_DELAY_MS.saturating_mul(1u64 << shift);
    Duration::from_millis(delay.min(DELETE_RETRY_MAX_DELAY_MS))
}

/// A set of pages the recycler processes together.
///
/// `slot_offset` is the WAL slot captured before the batch's first prepare
/// append; it is the batch identity and the exactly-once dedup key handed
/// to the page deleter.
#[derive(Debug, Clone)]
pub struct Batch {
    pub to_recycle: Vec<PageToRecycle>,
    pub slot_offset: SlotOffset,
}

struct RecyclerShared {
    uuid: Uuid,
    options: RecyclerOptions,
    state: Mutex<RecyclerState>,
    pending_count: Watch<u64>,
    latest_info_refresh_slot: Watch<SlotOffset>,
}

/// Durable worker that drains the pending set, calls the `PageDeleter`, and
/// trims its WAL behind the work it has retired.
pub struct PageRecycler {
    name: String,
    page_deleter: Arc<dyn PageDeleter>,
    wal_device: Arc<dyn LogDevice>,
    slot_writer: Arc<SlotWriter>,
    shared: Arc<RecyclerShared>,
    /// Floor credit for the background task; topped up before the insert
    /// pool.
    recycle_task_grant: Grant,
    /// Credit for caller inserts.
    insert_grant_pool: Grant,
    latest_batch_upper_bound: Mutex<Option<SlotOffset>>,
    recovered_batch: Mutex<Option<Batch>>,
    stop_requested: AtomicBool,
    recycle_task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<RecyclerMetrics>,
}

impl PageRecycler {
    /// Minimum sufficient WAL size for `options`; enforced on construction.
    pub fn calculate_log_size(
        options: &RecyclerOptions,
        max_buffered_pages: Option<u64>,
    ) -> u64 {
        calculate_recycler_log_size(options, max_buffered_pages)
    }

    /// Open the recycler WAL, replay it, and construct the recovered
    /// recycler. The caller starts it with [`PageRecycler::start`].
    pub async fn recover(
        name: impl Into<String>,
        default_options: RecyclerOptions,
        page_deleter: Arc<dyn PageDeleter>,
        log_device_factory: &dyn LogDeviceFactory,
    ) -> PagelogResult<Arc<PageRecycler>> {
        let name = name.into();
        let mut visitor = RecyclerRecoveryVisitor::new(default_options);
        let wal_device = log_device_factory.open_log_device(&mut |reader| {
            let slots = read_events::<RecyclerEvent>(reader, |slot, event| {
                visitor.visit(slot, event)
            })?;
            debug!(slots, "recycler log recovered");
            Ok(reader.slot_offset())
        })?;
        let recovery = visitor.finish();

        let options = recovery.options;
        let uuid = recovery.uuid.unwrap_or_else(Uuid::new_v4);
        let slot_writer = Arc::new(SlotWriter::new(Arc::clone(&wal_device)));
        assert!(
            Self::calculate_log_size(&options, None) <= slot_writer.log_capacity(),
            "recycler WAL capacity {} is too small for the configuration (minimum {})",
            slot_writer.log_capacity(),
            Self::calculate_log_size(&options, None),
        );

        // Make sure a current info slot exists before the recycler goes
        // live; recovery depends on finding one ahead of the trim point.
        let latest_info_slot = match recovery.latest_info_slot {
            Some(slot) if !options.info_needs_refresh(slot.lower_bound, wal_device.as_ref()) => {
                slot
            }
            _ => {
                let grant = slot_writer.try_reserve(options.info_slot_size())?;
                refresh_info_slot(&slot_writer, uuid, &options, &grant).await?
            }
        };

        let mut state = RecyclerState::new();
        state.bulk_load(recovery.pending);
        let pending_len = state.len() as u64;

        let recycle_task_grant = slot_writer.try_reserve(0)?;
        let insert_grant_pool = slot_writer.try_reserve(0)?;
        let metrics = Arc::new(RecyclerMetrics::default());
        metrics.register_all(&name);

        let recycler = PageRecycler {
            name,
            page_deleter,
            wal_device,
            slot_writer,
            shared: Arc::new(RecyclerShared {
                uuid,
                options,
                state: Mutex::new(state),
                pending_count: Watch::new(pending_len),
                latest_info_refresh_slot: Watch::new(latest_info_slot.lower_bound),
            }),
            recycle_task_grant,
            insert_grant_pool,
            latest_batch_upper_bound: Mutex::new(None),
            recovered_batch: Mutex::new(recovery.latest_batch),
            stop_requested: AtomicBool::new(false),
            recycle_task: Mutex::new(None),
            metrics,
        };
        // Fund the grants up front so inserts can proceed before the task
        // is started.
        recycler.refresh_grants();
        Ok(Arc::new(recycler))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Uuid {
        self.shared.uuid
    }

    pub fn options(&self) -> &RecyclerOptions {
        &self.shared.options
    }

    pub fn metrics(&self) -> &RecyclerMetrics {
        &self.metrics
    }

    pub fn slot_upper_bound(&self, mode: LogReadMode) -> SlotOffset {
        self.wal_device.slot_range(mode).upper_bound
    }

    /// Number of pages currently awaiting recycling.
    pub fn pending_count(&self) -> u64 {
        self.shared.pending_count.get()
    }

    /// Remaining caller-insert credit, in bytes.
    pub fn insert_pool_size(&self) -> u64 {
        self.insert_grant_pool.size()
    }

    /// Spawn the recycle task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.recycle_task.lock();
        if task.is_none() {
            self.refresh_grants();
            let this = Arc::clone(self);
            *task = Some(tokio::spawn(async move {
                this.recycle_task_main().await;
            }));
        }
    }

    /// Stop the recycler: close the pending observable, revoke all grants,
    /// and halt the slot writer so every awaiter unblocks. Idempotent.
    pub fn halt(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            self.shared.pending_count.close();
            self.recycle_task_grant.revoke();
            self.insert_grant_pool.revoke();
            self.slot_writer.halt();
            let _ = self.wal_device.close();
        }
    }

    /// Wait for the recycle task to exit.
    pub async fn join(&self) {
        let task = self.recycle_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Schedule pages for deletion, returning the highest slot upper bound
    /// produced.
    ///
    /// Without a grant this is the user-facing depth-0 path: each insert
    /// spends from the insert pool, suspending while the pool is empty.
    /// With a grant it is the cascade path used by the page deleter, which
    /// charges the recycle task's credit at `depth + 1`.
    pub async fn recycle_pages(
        &self,
        page_ids: &[PageId],
        grant: Option<&Grant>,
        depth: u32,
    ) -> PagelogResult<SlotOffset> {
        if self.stop_requested.load(Ordering::SeqCst) {
            return Err(PagelogError::RecyclerStopped);
        }
        if page_ids.is_empty() {
            return Ok(self.slot_upper_bound(LogReadMode::Durable));
        }
        debug!(
            name = %self.name,
            pages = page_ids.len(),
            depth,
            depth_budget = self.shared.options.total_grant_size_for_depth(depth),
            "recycle_pages"
        );

        let mut sync_point: Option<SlotOffset> = None;
        match grant {
            None => {
                assert_eq!(depth, 0, "grantless recycle_pages is the depth-0 entry point");
                let needed = self.shared.options.insert_grant_size();
                for &page_id in page_ids {
                    let local = self
                        .insert_grant_pool
                        .spend(needed, WaitForSpace::Yes)
                        .await?;
                    let appended = self.insert_to_log(&local, page_id, depth);
                    self.insert_grant_pool.subsume(local);
                    clamp_min_slot(&mut sync_point, appended?);
                }
            }
            Some(grant) => {
                assert!(
                    depth < MAX_PAGE_REF_DEPTH,
                    "recycle depth {depth} exceeds the cascade bound"
                );
                for &page_id in page_ids {
                    let appended = self.insert_to_log(grant, page_id, depth)?;
                    clamp_min_slot(&mut sync_point, appended);
                }
            }
        }
        Ok(sync_point.expect("page_ids is non-empty"))
    }

    /// Wait for durable sync of `min_upper_bound`; `None` is trivially
    /// satisfied.
    pub async fn await_flush(&self, min_upper_bound: Option<SlotOffset>) -> PagelogResult<()> {
        let Some(offset) = min_upper_bound else {
            return Ok(());
        };
        self.wal_device
            .sync(LogReadMode::Durable, SlotUpperBoundAt { offset })
            .await
    }

    /// Record one page in the state machine and, unless the insert was an
    /// idempotent repeat, in the WAL.
    fn insert_to_log(
        &self,
        grant: &Grant,
        page_id: PageId,
        depth: u32,
    ) -> PagelogResult<SlotOffset> {
        let mut state = self.shared.state.lock();
        let current_slot = self.slot_writer.current_slot();
        let to_append = state.insert(PageToRecycle {
            page_id,
            slot_offset: current_slot,
            depth,
        });
        if to_append.is_empty() {
            // Already pending; repeat inserts succeed without consuming
            // grant.
            return Ok(current_slot);
        }

        let mut last_slot = current_slot;
        for item in &to_append {
            let appended = self.slot_writer.append(
                grant,
                &RecyclerEvent::PageInsert {
                    page_id: item.page_id,
                    depth: item.depth,
                },
            )?;
            last_slot = slot_max(last_slot, appended.upper_bound);
        }
        self.shared.pending_count.set(state.len() as u64);
        self.metrics.insert_count.fetch_add(1, Ordering::Relaxed);
        Ok(last_slot)
    }

    /// Top off grants from the pool: the recycle task's floor credit first,
    /// then everything left into the insert pool.
    fn refresh_grants(&self) {
        let target = self.shared.options.recycle_task_target();
        let current = self.recycle_task_grant.size();
        if current < target {
            let delta = (target - current).min(self.slot_writer.pool_size());
            if delta > 0 {
                match self.slot_writer.try_reserve(delta) {
                    Ok(extra) => self.recycle_task_grant.subsume(extra),
                    Err(_) => {
                        if self.stop_requested.load(Ordering::SeqCst) {
                            return;
                        }
                    }
                }
            }
        }
        let remainder = self.slot_writer.pool_size();
        if remainder > 0 && !self.stop_requested.load(Ordering::SeqCst) {
            if let Ok(extra) = self.slot_writer.try_reserve(remainder) {
                self.insert_grant_pool.subsume(extra);
            }
        }
    }

    async fn recycle_task_main(self: Arc<Self>) {
        let result = self.recycle_task_loop().await;

        // This task is what drains the WAL; once it exits, blocked writers
        // would never see space again. Halt the writer and revoke grants so
        // they unblock with a cancellation status.
        self.slot_writer.halt();
        self.recycle_task_grant.revoke();
        self.insert_grant_pool.revoke();

        if self.stop_requested.load(Ordering::SeqCst) {
            debug!(name = %self.name, "recycle task exited after stop request");
        } else {
            let error = result.err().unwrap_or(PagelogError::Cancelled);
            warn!(name = %self.name, error = %error, "recycle task exited without stop request");
            self.page_deleter.notify_failure(self.as_ref(), &error);
        }
    }

    async fn recycle_task_loop(&self) -> PagelogResult<()> {
        let mut prepared_batch = self.recovered_batch.lock().take();
        loop {
            if let Some(batch) = prepared_batch.take() {
                self.commit_batch(batch).await?;
                self.trim_log().await?;
            }

            // Wait for work.
            if self.shared.pending_count.get() == 0 {
                self.page_deleter
                    .notify_caught_up(self, self.slot_upper_bound(LogReadMode::Speculative));
                self.shared.pending_count.await_not_equal(0).await?;
            }

            let to_recycle = {
                let mut state = self.shared.state.lock();
                let batch = state.collect_batch(self.shared.options.batch_size, &self.metrics);
                self.shared.pending_count.set(state.len() as u64);
                batch
            };
            if to_recycle.is_empty() {
                continue;
            }

            // The prepare slots must be durable before any delete runs, so
            // a crash can finish the batch instead of losing it.
            prepared_batch = Some(self.prepare_batch(to_recycle).await?);
        }
    }

    async fn prepare_batch(&self, to_recycle: Vec<PageToRecycle>) -> PagelogResult<Batch> {
        let batch = Batch {
            // Captured before the first append: the batch identity, and the
            // key that guarantees ref-count updates apply exactly once.
            slot_offset: self.slot_writer.current_slot(),
            to_recycle,
        };
        debug!(name = %self.name, batch_slot = batch.slot_offset, pages = batch.to_recycle.len(), "preparing batch");

        let mut sync_upper_bound: Option<SlotOffset> = None;
        for next_page in &batch.to_recycle {
            if self.stop_requested.load(Ordering::SeqCst) {
                return Err(PagelogError::Cancelled);
            }
            let appended = self.slot_writer.append(
                &self.recycle_task_grant,
                &RecyclerEvent::PagePrepare {
                    page_id: next_page.page_id,
                    depth: next_page.depth,
                    batch_slot: batch.slot_offset,
                },
            );
            let appended = match appended {
                Ok(range) => range,
                Err(err) => {
                    if self.stop_requested.load(Ordering::SeqCst)
                        && self.recycle_task_grant.size() == 0
                    {
                        return Err(err);
                    }
                    warn!(
                        name = %self.name,
                        grant = self.recycle_task_grant.size(),
                        pool = self.slot_writer.pool_size(),
                        error = %err,
                        "prepare append failed"
                    );
                    return Err(err);
                }
            };
            clamp_min_slot(&mut sync_upper_bound, appended.upper_bound);
        }

        self.await_flush(sync_upper_bound).await?;
        self.metrics.batch_count.fetch_add(1, Ordering::Relaxed);
        debug!(name = %self.name, batch_slot = batch.slot_offset, "batch prepared");
        Ok(batch)
    }

    async fn commit_batch(&self, batch: Batch) -> PagelogResult<()> {
        debug!(name = %self.name, batch_slot = batch.slot_offset, "committing batch");
        let page_count = batch.to_recycle.len() as u64;

        let mut retries = 0u32;
        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                return Err(PagelogError::RecyclerStopped);
            }
            let deleted = self
                .page_deleter
                .delete_pages(
                    &batch.to_recycle,
                    self,
                    batch.slot_offset,
                    &self.recycle_task_grant,
                )
                .await;
            match deleted {
                Ok(()) => {
                    self.metrics
                        .page_drop_ok_count
                        .fetch_add(page_count, Ordering::Relaxed);
                    break;
                }
                Err(err) if err.is_shutdown() => return Err(err),
                Err(err) if retries < DELETE_RETRY_MAX_ATTEMPTS => {
                    retries += 1;
                    self.metrics
                        .page_drop_error_count
                        .fetch_add(page_count, Ordering::Relaxed);
                    debug!(name = %self.name, attempt = retries, error = %err, "retrying delete_pages");
                    tokio::time::sleep(delete_retry_delay(retries)).await;
                }
                Err(err) => {
                    self.metrics
                        .page_drop_error_count
                        .fetch_add(page_count, Ordering::Relaxed);
                    warn!(name = %self.name, retries, error = %err, "delete_pages failed after retries");
                    return Err(PagelogError::page_delete_failed(err));
                }
            }
        }

        if self.stop_requested.load(Ordering::SeqCst) {
            return Err(PagelogError::RecyclerStopped);
        }

        let appended = self.slot_writer.append(
            &self.recycle_task_grant,
            &RecyclerEvent::BatchCommit {
                batch_slot: batch.slot_offset,
            },
        )?;
        self.await_flush(Some(appended.upper_bound)).await?;
        *self.latest_batch_upper_bound.lock() = Some(appended.upper_bound);
        debug!(name = %self.name, batch_slot = batch.slot_offset, "batch committed");
        Ok(())
    }

    async fn trim_log(&self) -> PagelogResult<()> {
        let options = &self.shared.options;
        let mut latest_info_slot = self.shared.latest_info_refresh_slot.get();
        let lru_slot = self.shared.state.lock().get_lru_slot();
        let latest_batch_upper_bound = *self.latest_batch_upper_bound.lock();

        // The highest safe trim offset: we can pass neither the oldest
        // pending record nor the newest committed batch.
        let trim_point = match (lru_slot, latest_batch_upper_bound) {
            (Some(lru), Some(batch)) => slot_min(lru, batch),
            (Some(lru), None) => lru,
            (None, Some(batch)) => batch,
            (None, None) => latest_info_slot,
        };

        if options.info_needs_refresh(latest_info_slot, self.wal_device.as_ref())
            || slot_less_than(latest_info_slot, trim_point)
        {
            let info_grant = match self
                .recycle_task_grant
                .spend(options.info_slot_size(), WaitForSpace::No)
                .await
            {
                Ok(grant) => grant,
                Err(_) => {
                    assert!(
                        self.stop_requested.load(Ordering::SeqCst),
                        "recycle task grant must always cover an info slot"
                    );
                    return Err(PagelogError::RecyclerStopped);
                }
            };
            if self.stop_requested.load(Ordering::SeqCst) {
                return Err(PagelogError::RecyclerStopped);
            }
            let new_info_slot = refresh_info_slot(
                &self.slot_writer,
                self.shared.uuid,
                options,
                &info_grant,
            )
            .await?;
            latest_info_slot = new_info_slot.lower_bound;
            self.shared.latest_info_refresh_slot.set(latest_info_slot);
            debug!(name = %self.name, info_slot = latest_info_slot, "refreshed info slot");
        }

        // Never trim off the latest info slot.
        assert!(
            !slot_less_than(latest_info_slot, trim_point),
            "trim point {trim_point} would pass the info anchor {latest_info_slot}"
        );

        debug!(name = %self.name, trim_point, "trimming recycler log");
        self.slot_writer.trim(trim_point)?;
        self.refresh_grants();
        Ok(())
    }
}

impl Drop for PageRecycler {
    fn drop(&mut self) {
        self.halt();
        self.metrics.unregister_all();
    }
}

/// Append a fresh info anchor and sync it durably.
async fn refresh_info_slot(
    slot_writer: &SlotWriter,
    uuid: Uuid,
    options: &RecyclerOptions,
    grant: &Grant,
) -> PagelogResult<SlotRange> {
    let info = RecyclerEvent::Info {
        uuid,
        max_refs_per_page: options.max_refs_per_page,
        batch_size: options.batch_size as u32,
        info_refresh_rate: options.info_refresh_rate,
    };
    let appended = slot_writer.append(grant, &info)?;
    slot_writer
        .sync(
            LogReadMode::Durable,
            SlotUpperBoundAt {
                offset: appended.upper_bound,
            },
        )
        .await?;
    Ok(appended)
}
