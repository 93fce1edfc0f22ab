//! Page identities and the collaborator seams the core consumes: the page
//! cache (reference counts and page lifetimes) and the page deleter the
//! recycler drives.

use std::fmt::{self, Display};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PagelogError, PagelogResult};
use crate::records::{VolumeEvent, packed_size_of};
use crate::recycler::PageRecycler;
use crate::slot::SlotOffset;
use crate::writer::Grant;

/// Bound on the recycling cascade: a page dropped at depth `d` may cascade
/// into drops at depth `d + 1`, up to this limit.
pub const MAX_PAGE_REF_DEPTH: u32 = 32;

/// Opaque 64-bit page identifier.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PageId(pub u64);

impl PageId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for PageId {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A page awaiting recycling.
///
/// `slot_offset` is the WAL slot at which the page was recorded; `depth` is
/// its cascade level (0 = user-initiated).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageToRecycle {
    pub page_id: PageId,
    pub slot_offset: SlotOffset,
    pub depth: u32,
}

/// A multi-page transaction to append through the volume's two-phase
/// protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendableJob {
    pub new_pages: Vec<PageId>,
    pub deleted_pages: Vec<PageId>,
    pub user_data: Vec<u8>,
}

impl AppendableJob {
    /// The prepare-phase WAL payload for this job.
    pub fn prepare_event(&self) -> VolumeEvent {
        VolumeEvent::PrepareJob {
            new_pages: self.new_pages.clone(),
            deleted_pages: self.deleted_pages.clone(),
            user_data: self.user_data.clone(),
        }
    }

    /// Grant bytes the two-phase append consumes: the prepare slot plus the
    /// commit slot.
    pub fn grant_size(&self) -> u64 {
        let commit = VolumeEvent::CommitJob { prepare_slot: 0 };
        packed_size_of(&self.prepare_event()) + packed_size_of(&commit)
    }
}

/// Parameters handed to `PageCache::commit_job`.
///
/// `caller_slot` is the prepare slot's lower bound and the dedup key that
/// makes re-applied commits idempotent. Dropped pages are enqueued into
/// `recycler` at `recycle_depth`, charged against `recycle_grant` when one
/// is supplied (the cascade path) and against the recycler's insert pool
/// otherwise.
pub struct JobCommitParams<'a> {
    pub caller_uuid: Uuid,
    pub caller_slot: SlotOffset,
    pub recycler: &'a PageRecycler,
    pub recycle_grant: Option<&'a Grant>,
    pub recycle_depth: u32,
}

/// Owns page reference counts and physical page lifetimes.
pub trait PageCache: Send + Sync {
    fn all_arenas(&self) -> Vec<Arc<dyn PageArena>>;

    /// Whether `page_id` currently exists in any arena.
    fn contains_page(&self, page_id: PageId) -> bool;

    /// Apply a job's side effects: write new pages, update reference
    /// counts, and enqueue dropped pages into the recycler. Must be
    /// idempotent on `params.caller_slot`.
    fn commit_job<'a>(
        &'a self,
        job: &'a AppendableJob,
        params: JobCommitParams<'a>,
    ) -> BoxFuture<'a, PagelogResult<()>>;

    /// Decrement the reference counts of `items`, idempotent on
    /// `batch_slot`. Returns pages whose liveness dropped to zero as a
    /// result, which cascade into the next recycling depth.
    fn delete_pages(
        &self,
        items: &[PageToRecycle],
        batch_slot: SlotOffset,
    ) -> PagelogResult<Vec<PageId>>;
}

/// One physical device's pages plus its allocator.
pub trait PageArena: Send + Sync {
    fn device_id(&self) -> u64;
    fn allocator(&self) -> &dyn PageAllocator;
}

/// Ref-count authority for one arena.
pub trait PageAllocator: Send + Sync {
    /// Register `user` as a ref-count client; returns the allocator slot to
    /// sync before the attachment is durable.
    fn attach_user(&self, user: Uuid, user_slot: SlotOffset) -> PagelogResult<SlotOffset>;
    fn sync(&self, slot: SlotOffset) -> PagelogResult<()>;
}

/// Deletes batches of pages on the recycler's behalf.
pub trait PageDeleter: Send + Sync {
    /// Delete `items`, idempotent on `batch_slot`. May call back into
    /// `recycler.recycle_pages(.., Some(grant), depth + 1)` to cascade.
    fn delete_pages<'a>(
        &'a self,
        items: &'a [PageToRecycle],
        recycler: &'a PageRecycler,
        batch_slot: SlotOffset,
        grant: &'a Grant,
    ) -> BoxFuture<'a, PagelogResult<()>>;

    /// Best-effort signal that the recycler has drained up to `upper_bound`.
    fn notify_caught_up(&self, recycler: &PageRecycler, upper_bound: SlotOffset) {
        let _ = (recycler, upper_bound);
    }

    /// Terminal: the recycle task exited without a stop request.
    fn notify_failure(&self, recycler: &PageRecycler, error: &PagelogError) {
        let _ = (recycler, error);
    }
}

/// `PageDeleter` backed by a `PageCache`: decrements ref counts and feeds
/// newly unreferenced pages back into the recycler one depth down.
pub struct CachePageDeleter {
    cache: Arc<dyn PageCache>,
}

impl CachePageDeleter {
    pub fn new(cache: Arc<dyn PageCache>) -> Self {
        Self { cache }
    }
}

impl PageDeleter for CachePageDeleter {
    fn delete_pages<'a>(
        &'a self,
        items: &'a [PageToRecycle],
        recycler: &'a PageRecycler,
        batch_slot: SlotOffset,
        grant: &'a Grant,
    ) -> BoxFuture<'a, PagelogResult<()>> {
        Box::pin(async move {
            let cascaded = self.cache.delete_pages(items, batch_slot)?;
            if cascaded.is_empty() {
                return Ok(());
            }
            let next_depth = items.iter().map(|item| item.depth).max().unwrap_or(0) + 1;
            recycler
                .recycle_pages(&cascaded, Some(grant), next_depth)
                .await?;
            Ok(())
        })
    }
}
