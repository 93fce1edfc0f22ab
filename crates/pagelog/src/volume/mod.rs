//! Volume: a write-ahead log with two-phase transactional jobs.
//!
//! `Volume::append_job` runs the prepare→commit slot protocol: the prepare
//! slot is durable before any side effect runs, the `PageCache` applies the
//! job keyed on the prepare slot, and the commit slot may trail. Recovery
//! replays the root log and resolves every prepare that lost its commit.

mod reader;
mod recovery;
mod trimmer;

pub use reader::VolumeReader;
pub use recovery::{PrepareRecord, VolumeRecoveryVisitor};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::VolumeOptions;
use crate::device::{LogDevice, LogDeviceFactory};
use crate::error::{PagelogError, PagelogResult};
use crate::metrics::VolumeMetrics;
use crate::page::{AppendableJob, CachePageDeleter, JobCommitParams, PageCache};
use crate::records::{SlotPayload, VolumeEvent, VolumeIds, read_events};
use crate::recycler::PageRecycler;
use crate::slot::{
    LogReadMode, SlotOffset, SlotRange, SlotRangeSpec, SlotUpperBoundAt, slot_less_than,
    slot_max,
};
use crate::slot_lock::{SlotLockManager, SlotReadLock};
use crate::writer::{Grant, SlotWriter, WaitForSpace};

use trimmer::Trimmer;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SequencerSlot {
    Pending,
    Ready(SlotRange),
    Error(String),
}

/// Orders a chain of job appends: each sequencer waits for its predecessor
/// to be assigned a slot before its own append proceeds.
///
/// A sequencer handed to `append_job` is resolved on every path, success or
/// failure; resolving one twice is a programming error.
pub struct SlotSequencer {
    prev: Option<watch::Receiver<SequencerSlot>>,
    current: watch::Sender<SequencerSlot>,
}

impl Default for SlotSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotSequencer {
    pub fn new() -> Self {
        let (current, _) = watch::channel(SequencerSlot::Pending);
        Self {
            prev: None,
            current,
        }
    }

    /// The next sequencer in the chain; its `await_prev` resolves when this
    /// one is resolved.
    pub fn get_next(&self) -> SlotSequencer {
        let (current, _) = watch::channel(SequencerSlot::Pending);
        SlotSequencer {
            prev: Some(self.current.subscribe()),
            current,
        }
    }

    pub fn has_prev(&self) -> bool {
        self.prev.is_some()
    }

    pub fn is_resolved(&self) -> bool {
        *self.current.borrow() != SequencerSlot::Pending
    }

    /// Wait for the previous slot in the sequence; `None` when this is the
    /// head of the chain.
    pub async fn await_prev(&mut self) -> PagelogResult<Option<SlotRange>> {
        let Some(rx) = self.prev.as_mut() else {
            return Ok(None);
        };
        let cell = rx
            .wait_for(|slot| *slot != SequencerSlot::Pending)
            .await
            .map_err(|_| PagelogError::Sequencer("previous sequencer abandoned".into()))?;
        match &*cell {
            SequencerSlot::Ready(range) => Ok(Some(*range)),
            SequencerSlot::Error(msg) => Err(PagelogError::Sequencer(msg.clone())),
            SequencerSlot::Pending => unreachable!("wait_for excludes Pending"),
        }
    }

    /// Resolve with the assigned slot. Returns false if already resolved.
    pub fn set_current(&self, range: SlotRange) -> bool {
        self.current.send_if_modified(|slot| {
            if *slot == SequencerSlot::Pending {
                *slot = SequencerSlot::Ready(range);
                true
            } else {
                false
            }
        })
    }

    /// Resolve with an error. Returns false if already resolved.
    pub fn set_error(&self, error: &PagelogError) -> bool {
        self.current.send_if_modified(|slot| {
            if *slot == SequencerSlot::Pending {
                *slot = SequencerSlot::Error(error.to_string());
                true
            } else {
                false
            }
        })
    }
}

/// Everything `Volume::recover` needs.
pub struct VolumeRecoverParams {
    pub options: VolumeOptions,
    pub cache: Arc<dyn PageCache>,
    pub root_log_factory: Arc<dyn LogDeviceFactory>,
    pub recycler_log_factory: Arc<dyn LogDeviceFactory>,
    /// Supplied by embedders that share one lock manager across volumes; a
    /// fresh one is created when absent.
    pub trim_control: Option<SlotLockManager>,
}

/// A write-ahead log with transactional jobs, its trimmer, and its page
/// recycler.
pub struct Volume {
    options: VolumeOptions,
    volume_uuid: Uuid,
    trimmer_uuid: Uuid,
    cache: Arc<dyn PageCache>,
    trim_control: SlotLockManager,
    root_log: Arc<dyn LogDevice>,
    slot_writer: Arc<SlotWriter>,
    trim_lock: Mutex<Option<SlotReadLock>>,
    recycler: Arc<PageRecycler>,
    trimmer_task: Mutex<Option<JoinHandle<()>>>,
    halted: AtomicBool,
    metrics: VolumeMetrics,
}

impl Volume {
    /// Recover a volume: replay the recycler WAL and the root WAL, persist
    /// identities and device attachments, resolve pending jobs, and start
    /// the background tasks.
    pub async fn recover(params: VolumeRecoverParams) -> PagelogResult<Arc<Volume>> {
        let VolumeRecoverParams {
            options,
            cache,
            root_log_factory,
            recycler_log_factory,
            trim_control,
        } = params;
        let trim_control = trim_control.unwrap_or_default();

        let page_deleter = Arc::new(CachePageDeleter::new(Arc::clone(&cache)));
        let recycler = PageRecycler::recover(
            format!("{}_PageRecycler", options.name),
            options.recycler.clone(),
            page_deleter,
            recycler_log_factory.as_ref(),
        )
        .await?;

        let mut visitor = VolumeRecoveryVisitor::new();
        let root_log = root_log_factory.open_log_device(&mut |reader| {
            let slots =
                read_events::<VolumeEvent>(reader, |slot, event| visitor.visit(slot, event))?;
            debug!(slots, "volume root log recovered");
            Ok(reader.slot_offset())
        })?;
        let slot_writer = Arc::new(SlotWriter::new(Arc::clone(&root_log)));

        // Put the main log in a clean state: identities recorded, device
        // attachments created, pending jobs resolved.
        {
            let grant = slot_writer.try_reserve(slot_writer.pool_size())?;

            let ids = match visitor.ids.as_ref() {
                Some((_, ids)) => *ids,
                None => {
                    debug!(name = %options.name, "initializing volume ids");
                    let ids = VolumeIds {
                        main_uuid: options.uuid.unwrap_or_else(Uuid::new_v4),
                        recycler_uuid: recycler.uuid(),
                        trimmer_uuid: Uuid::new_v4(),
                    };
                    let appended = slot_writer.append(&grant, &VolumeEvent::Ids(ids))?;
                    slot_writer
                        .sync(
                            LogReadMode::Durable,
                            SlotUpperBoundAt {
                                offset: appended.upper_bound,
                            },
                        )
                        .await?;
                    ids
                }
            };

            for client_uuid in [ids.main_uuid, ids.recycler_uuid, ids.trimmer_uuid] {
                for arena in cache.all_arenas() {
                    let device_id = arena.device_id();
                    if visitor.device_attachments.contains(&(client_uuid, device_id)) {
                        continue;
                    }
                    debug!(client = %client_uuid, device_id, "attaching client to device");
                    let sync_slot = arena.allocator().attach_user(client_uuid, 0)?;
                    arena.allocator().sync(sync_slot)?;
                    let appended = slot_writer.append(
                        &grant,
                        &VolumeEvent::Attach {
                            client_uuid,
                            device_id,
                        },
                    )?;
                    slot_writer
                        .sync(
                            LogReadMode::Durable,
                            SlotUpperBoundAt {
                                offset: appended.upper_bound,
                            },
                        )
                        .await?;
                }
            }

            visitor
                .resolve_pending_jobs(&cache, &recycler, ids.main_uuid, &slot_writer, &grant)
                .await?;

            let metrics = VolumeMetrics::default();
            metrics.register_all(&options.name);

            let trim_lock = trim_control.lock_slots(
                root_log.slot_range(LogReadMode::Durable),
                "Volume::recover",
            )?;

            let volume = Arc::new(Volume {
                volume_uuid: ids.main_uuid,
                trimmer_uuid: ids.trimmer_uuid,
                options,
                cache,
                trim_control,
                root_log,
                slot_writer,
                trim_lock: Mutex::new(Some(trim_lock)),
                recycler,
                trimmer_task: Mutex::new(None),
                halted: AtomicBool::new(false),
                metrics,
            });
            volume.start();
            Ok(volume)
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn volume_uuid(&self) -> Uuid {
        self.volume_uuid
    }

    pub fn trimmer_uuid(&self) -> Uuid {
        self.trimmer_uuid
    }

    pub fn cache(&self) -> &Arc<dyn PageCache> {
        &self.cache
    }

    pub fn recycler(&self) -> &Arc<PageRecycler> {
        &self.recycler
    }

    pub fn trim_control(&self) -> &SlotLockManager {
        &self.trim_control
    }

    /// Carve `size` bytes from the root log's pool.
    pub async fn reserve(&self, size: u64, wait: WaitForSpace) -> PagelogResult<Grant> {
        self.slot_writer.reserve(size, wait).await
    }

    /// Single-slot append for non-job payloads.
    pub fn append(
        &self,
        payload: &impl SlotPayload,
        grant: &Grant,
    ) -> PagelogResult<SlotRange> {
        self.slot_writer.append(grant, payload)
    }

    /// Two-phase job append. The grant must cover both the prepare and the
    /// commit slot (`AppendableJob::grant_size`).
    pub async fn append_job(
        &self,
        job: &AppendableJob,
        grant: &Grant,
        mut sequencer: Option<&mut SlotSequencer>,
    ) -> PagelogResult<SlotRange> {
        let result = self.append_job_inner(job, grant, &mut sequencer).await;
        if let Some(sequencer) = sequencer.as_deref() {
            debug_assert!(
                sequencer.is_resolved(),
                "a supplied sequencer must be resolved even on failure paths"
            );
        }
        result
    }

    async fn append_job_inner(
        &self,
        job: &AppendableJob,
        grant: &Grant,
        sequencer: &mut Option<&mut SlotSequencer>,
    ) -> PagelogResult<SlotRange> {
        // Phase 0: wait for the previous slot in the sequence.
        if let Some(sequencer) = sequencer.as_deref_mut() {
            let prev_slot = match sequencer.await_prev().await {
                Ok(prev_slot) => prev_slot,
                Err(err) => {
                    sequencer.set_error(&err);
                    return Err(err);
                }
            };
            if let Some(prev_slot) = prev_slot {
                // A speculative sync suffices here: our own prepare gets a
                // durable sync below, and durably flushing a later slot
                // implies all earlier ones are flushed.
                let synced = self
                    .slot_writer
                    .sync(
                        LogReadMode::Speculative,
                        SlotUpperBoundAt {
                            offset: prev_slot.upper_bound,
                        },
                    )
                    .await;
                if let Err(err) = synced {
                    sequencer.set_error(&err);
                    return Err(err);
                }
            }
        }

        // Phase 1: durably log the prepare before any side effect.
        let prepare_slot = self.slot_writer.append(grant, &job.prepare_event());
        if let Some(sequencer) = sequencer.as_deref() {
            let resolved = match &prepare_slot {
                Ok(range) => sequencer.set_current(*range),
                Err(err) => sequencer.set_error(err),
            };
            assert!(resolved, "each slot within a sequence may only be set once");
        }
        let prepare_slot = prepare_slot?;
        self.metrics
            .prepare_slot_count
            .fetch_add(1, Ordering::Relaxed);

        self.slot_writer
            .sync(
                LogReadMode::Durable,
                SlotUpperBoundAt {
                    offset: prepare_slot.upper_bound,
                },
            )
            .await?;

        // Phase 2a: commit the job. This writes new pages, updates ref
        // counts, and hands dropped pages to the recycler; the prepare
        // slot's lower bound is the exactly-once dedup key.
        self.cache
            .commit_job(
                job,
                JobCommitParams {
                    caller_uuid: self.volume_uuid,
                    caller_slot: prepare_slot.lower_bound,
                    recycler: &self.recycler,
                    recycle_grant: None,
                    recycle_depth: 0,
                },
            )
            .await?;

        // Phase 2b: the commit slot. Recovery tolerates its absence.
        let commit_slot = self.slot_writer.append(
            grant,
            &VolumeEvent::CommitJob {
                prepare_slot: prepare_slot.lower_bound,
            },
        )?;
        self.metrics
            .commit_slot_count
            .fetch_add(1, Ordering::Relaxed);

        Ok(SlotRange {
            lower_bound: prepare_slot.lower_bound,
            upper_bound: commit_slot.upper_bound,
        })
    }

    /// Block until the root log reflects `target` in `mode`; returns the
    /// resulting slot range.
    pub async fn sync(
        &self,
        mode: LogReadMode,
        target: SlotUpperBoundAt,
    ) -> PagelogResult<SlotRange> {
        self.root_log.sync(mode, target).await?;
        Ok(self.root_log.slot_range(mode))
    }

    /// Acquire a read-locked reader over `spec`, clamped to the span the
    /// volume's trim lock still protects.
    pub fn reader(&self, spec: SlotRangeSpec, mode: LogReadMode) -> PagelogResult<VolumeReader> {
        let base_range = self.root_log.slot_range(mode);
        let floor = {
            let trim_lock = self.trim_lock.lock();
            match trim_lock.as_ref() {
                Some(lock) => lock.slot_range().lower_bound,
                None => base_range.lower_bound,
            }
        };
        let default_lower = slot_max(base_range.lower_bound, floor);
        let lower_bound = spec.lower_bound.unwrap_or(default_lower);
        if slot_less_than(lower_bound, floor) {
            return Err(PagelogError::StaleRead(floor));
        }
        let range = SlotRange {
            lower_bound,
            upper_bound: spec.upper_bound.unwrap_or(base_range.upper_bound),
        };
        let read_lock = self.trim_control.lock_slots(range, "Volume::read")?;
        Ok(VolumeReader::new(
            Arc::clone(&self.root_log),
            read_lock,
            mode,
        ))
    }

    /// Explicit read-lock acquisition for external readers.
    pub fn lock_slots(
        &self,
        spec: SlotRangeSpec,
        mode: LogReadMode,
    ) -> PagelogResult<SlotReadLock> {
        let base_range = self.root_log.slot_range(mode);
        let range = SlotRange {
            lower_bound: spec.lower_bound.unwrap_or(base_range.lower_bound),
            upper_bound: spec.upper_bound.unwrap_or(base_range.upper_bound),
        };
        self.trim_control.lock_slots(range, "Volume::lock_slots")
    }

    /// Advance the volume's trim lock; the trimmer task observes the new
    /// minimum and physically trims.
    pub fn trim(&self, slot_lower_bound: SlotOffset) -> PagelogResult<()> {
        let mut guard = self.trim_lock.lock();
        let lock = guard.take().expect("trim lock is held for the volume's lifetime");
        let mut target = lock.slot_range();
        target.lower_bound = slot_max(target.lower_bound, slot_lower_bound);
        match self.trim_control.update_lock(lock, target, "Volume::trim") {
            Ok(updated) => {
                *guard = Some(updated);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Start the recycler and the trimmer task. Idempotent.
    pub fn start(&self) {
        self.recycler.start();
        let mut task = self.trimmer_task.lock();
        if task.is_none() {
            let trimmer = Trimmer {
                name: self.options.name.clone(),
                trim_control: self.trim_control.clone(),
                slot_writer: Arc::clone(&self.slot_writer),
            };
            *task = Some(tokio::spawn(async move {
                if let Err(error) = trimmer.run().await {
                    warn!(error = %error, "volume trimmer exited with error");
                }
            }));
        }
    }

    /// Stop every subsystem and unblock all awaiters. Idempotent.
    pub fn halt(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            self.slot_writer.halt();
            self.trim_control.halt();
            let _ = self.root_log.close();
            self.recycler.halt();
        }
    }

    /// Wait for the trimmer task and the recycler to exit.
    pub async fn join(&self) {
        let task = self.trimmer_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.recycler.join().await;
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        let _ = self.root_log.flush();
        self.halt();
        // The trimmer task does not hold the volume alive, so it must not
        // outlive us; halt() has already released it. Blocking inside a
        // live runtime would deadlock a current-thread executor, so there
        // the task is cancelled at its next yield point instead.
        let trimmer = self.trimmer_task.lock().take();
        if let Some(task) = trimmer {
            if tokio::runtime::Handle::try_current().is_ok() {
                task.abort();
            } else {
                let _ = futures::executor::block_on(task);
            }
        }
        self.metrics.unregister_all();
    }
}
