//! Root WAL replay: identities, device attachments, and the pending-job
//! map that drives prepare/commit resolution after a crash.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::PagelogResult;
use crate::page::{AppendableJob, JobCommitParams, PageCache};
use crate::records::{VolumeEvent, VolumeIds};
use crate::recycler::PageRecycler;
use crate::slot::{LogReadMode, SlotOffset, SlotRange, SlotUpperBoundAt};
use crate::writer::{Grant, SlotWriter};

/// A prepare slot that has not yet been matched by a commit or rollback.
#[derive(Debug, Clone)]
pub struct PrepareRecord {
    pub slot: SlotRange,
    pub job: AppendableJob,
}

/// Replays volume WAL events.
#[derive(Debug, Default)]
pub struct VolumeRecoveryVisitor {
    pub ids: Option<(SlotRange, VolumeIds)>,
    pub device_attachments: HashSet<(Uuid, u64)>,
    /// Keyed by the prepare slot's lower bound.
    pub pending_jobs: BTreeMap<SlotOffset, PrepareRecord>,
}

impl VolumeRecoveryVisitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visit(&mut self, slot: SlotRange, event: VolumeEvent) -> PagelogResult<()> {
        match event {
            VolumeEvent::Ids(ids) => {
                self.ids = Some((slot, ids));
            }
            VolumeEvent::Attach {
                client_uuid,
                device_id,
            } => {
                self.device_attachments.insert((client_uuid, device_id));
            }
            VolumeEvent::PrepareJob {
                new_pages,
                deleted_pages,
                user_data,
            } => {
                self.pending_jobs.insert(
                    slot.lower_bound,
                    PrepareRecord {
                        slot,
                        job: AppendableJob {
                            new_pages,
                            deleted_pages,
                            user_data,
                        },
                    },
                );
            }
            VolumeEvent::CommitJob { prepare_slot }
            | VolumeEvent::RollbackJob { prepare_slot } => {
                self.pending_jobs.remove(&prepare_slot);
            }
        }
        Ok(())
    }

    /// Resolve every prepare without a durable commit or rollback.
    ///
    /// A pending job is committed when each of its new pages is already
    /// present in the cache, which means the job's side effects ran before
    /// the crash and re-applying them is an idempotent no-op keyed on the
    /// prepare slot. Otherwise the side effects never happened and the job
    /// is rolled back.
    pub async fn resolve_pending_jobs(
        &mut self,
        cache: &Arc<dyn PageCache>,
        recycler: &PageRecycler,
        volume_uuid: Uuid,
        slot_writer: &SlotWriter,
        grant: &Grant,
    ) -> PagelogResult<()> {
        for (prepare_slot, record) in std::mem::take(&mut self.pending_jobs) {
            let side_effects_applied = record
                .job
                .new_pages
                .iter()
                .all(|page_id| cache.contains_page(*page_id));

            if side_effects_applied {
                debug!(prepare_slot, "recommitting pending job");
                cache
                    .commit_job(
                        &record.job,
                        JobCommitParams {
                            caller_uuid: volume_uuid,
                            caller_slot: prepare_slot,
                            recycler,
                            recycle_grant: None,
                            recycle_depth: 0,
                        },
                    )
                    .await?;
                let appended =
                    slot_writer.append(grant, &VolumeEvent::CommitJob { prepare_slot })?;
                slot_writer
                    .sync(
                        LogReadMode::Durable,
                        SlotUpperBoundAt {
                            offset: appended.upper_bound,
                        },
                    )
                    .await?;
            } else {
                debug!(prepare_slot, "rolling back pending job");
                let appended =
                    slot_writer.append(grant, &VolumeEvent::RollbackJob { prepare_slot })?;
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
        Ok(())
    }
}
