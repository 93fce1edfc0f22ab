//! Test-support implementations of the collaborator traits: a simulated
//! page cache with a reference graph and per-key idempotence, and a
//! recording page deleter for recycler-only tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{PagelogError, PagelogResult};
use crate::page::{
    AppendableJob, JobCommitParams, PageAllocator, PageArena, PageCache, PageDeleter, PageId,
    PageToRecycle,
};
use crate::recycler::PageRecycler;
use crate::slot::SlotOffset;
use crate::watch::Watch;
use crate::writer::Grant;

#[derive(Debug, Clone)]
struct PageState {
    ref_count: i64,
    refs: Vec<PageId>,
}

#[derive(Default)]
struct CacheState {
    pages: HashMap<PageId, PageState>,
    applied_jobs: HashSet<SlotOffset>,
    applied_batches: HashMap<SlotOffset, Vec<PageId>>,
    delete_observations: Vec<(SlotOffset, PageId)>,
    fail_deletes_remaining: u32,
}

/// In-memory page cache with a reference graph.
///
/// `commit_job` dedups on the caller slot and `delete_pages` dedups on the
/// batch slot, mirroring the exactly-once contracts the core relies on.
/// Deleting a page decrements each referenced page's count; pages reaching
/// zero are returned for the next cascade depth.
pub struct SimulatedPageCache {
    state: Mutex<CacheState>,
    arenas: Vec<Arc<SimulatedArena>>,
    /// Total pages deleted; awaitable so tests can wait for drains.
    deleted_count: Watch<u64>,
}

impl SimulatedPageCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CacheState::default()),
            arenas: vec![Arc::new(SimulatedArena::new(0))],
            deleted_count: Watch::new(0),
        })
    }

    /// Seed a live page whose deletion will decrement each page in `refs`.
    pub fn insert_page(&self, page_id: PageId, refs: &[PageId]) {
        self.seed_page(page_id, refs, 1);
    }

    /// Seed a page that is only alive through incoming references; it
    /// cascades as soon as its last referrer is deleted.
    pub fn insert_dependent_page(&self, page_id: PageId, refs: &[PageId]) {
        self.seed_page(page_id, refs, 0);
    }

    fn seed_page(&self, page_id: PageId, refs: &[PageId], base_ref_count: i64) {
        let mut state = self.state.lock();
        for referenced in refs {
            if let Some(entry) = state.pages.get_mut(referenced) {
                entry.ref_count += 1;
            }
        }
        state.pages.insert(
            page_id,
            PageState {
                ref_count: base_ref_count,
                refs: refs.to_vec(),
            },
        );
    }

    pub fn ref_count(&self, page_id: PageId) -> Option<i64> {
        self.state.lock().pages.get(&page_id).map(|p| p.ref_count)
    }

    /// Every `(batch_slot, page)` pair `delete_pages` has applied, in
    /// order. Exactly-once delete means no pair repeats with different
    /// batch slots.
    pub fn delete_observations(&self) -> Vec<(SlotOffset, PageId)> {
        self.state.lock().delete_observations.clone()
    }

    pub fn job_applied(&self, caller_slot: SlotOffset) -> bool {
        self.state.lock().applied_jobs.contains(&caller_slot)
    }

    /// Make the next `count` calls to `delete_pages` fail, to exercise the
    /// recycler's retry path.
    pub fn fail_next_deletes(&self, count: u32) {
        self.state.lock().fail_deletes_remaining = count;
    }

    /// Wait until at least `count` pages have been deleted.
    pub async fn await_deleted_count(&self, count: u64) -> PagelogResult<u64> {
        self.deleted_count.await_condition(|c| *c >= count).await
    }

    pub fn attachments(&self) -> HashSet<(Uuid, u64)> {
        let mut all = HashSet::new();
        for arena in &self.arenas {
            for user in arena.allocator.users() {
                all.insert((user, arena.device_id));
            }
        }
        all
    }
}

impl PageCache for SimulatedPageCache {
    fn all_arenas(&self) -> Vec<Arc<dyn PageArena>> {
        self.arenas
            .iter()
            .map(|arena| Arc::clone(arena) as Arc<dyn PageArena>)
            .collect()
    }

    fn contains_page(&self, page_id: PageId) -> bool {
        self.state.lock().pages.contains_key(&page_id)
    }

    fn commit_job<'a>(
        &'a self,
        job: &'a AppendableJob,
        params: JobCommitParams<'a>,
    ) -> BoxFuture<'a, PagelogResult<()>> {
        Box::pin(async move {
            {
                let mut state = self.state.lock();
                if state.applied_jobs.contains(&params.caller_slot) {
                    return Ok(());
                }
                for page_id in &job.new_pages {
                    state.pages.insert(
                        *page_id,
                        PageState {
                            ref_count: 1,
                            refs: Vec::new(),
                        },
                    );
                }
                state.applied_jobs.insert(params.caller_slot);
            }
            if !job.deleted_pages.is_empty() {
                params
                    .recycler
                    .recycle_pages(
                        &job.deleted_pages,
                        params.recycle_grant,
                        params.recycle_depth,
                    )
                    .await?;
            }
            Ok(())
        })
    }

    fn delete_pages(
        &self,
        items: &[PageToRecycle],
        batch_slot: SlotOffset,
    ) -> PagelogResult<Vec<PageId>> {
        let mut state = self.state.lock();
        if state.fail_deletes_remaining > 0 {
            state.fail_deletes_remaining -= 1;
            return Err(PagelogError::Io(std::io::Error::other(
                "injected delete failure",
            )));
        }
        if let Some(cascaded) = state.applied_batches.get(&batch_slot) {
            return Ok(cascaded.clone());
        }

        let mut cascaded = Vec::new();
        let mut deleted = 0u64;
        for item in items {
            let Some(page) = state.pages.remove(&item.page_id) else {
                continue;
            };
            state.delete_observations.push((batch_slot, item.page_id));
            deleted += 1;
            for referenced in page.refs {
                if let Some(entry) = state.pages.get_mut(&referenced) {
                    entry.ref_count -= 1;
                    if entry.ref_count <= 0 {
                        cascaded.push(referenced);
                    }
                }
            }
        }
        state.applied_batches.insert(batch_slot, cascaded.clone());
        drop(state);
        if deleted > 0 {
            self.deleted_count.modify(|c| *c += deleted);
        }
        Ok(cascaded)
    }
}

/// One simulated arena; records allocator attachments.
pub struct SimulatedArena {
    device_id: u64,
    allocator: SimulatedAllocator,
}

impl SimulatedArena {
    fn new(device_id: u64) -> Self {
        Self {
            device_id,
            allocator: SimulatedAllocator::default(),
        }
    }
}

impl PageArena for SimulatedArena {
    fn device_id(&self) -> u64 {
        self.device_id
    }

    fn allocator(&self) -> &dyn PageAllocator {
        &self.allocator
    }
}

#[derive(Default)]
pub struct SimulatedAllocator {
    users: Mutex<Vec<Uuid>>,
}

impl SimulatedAllocator {
    fn users(&self) -> Vec<Uuid> {
        self.users.lock().clone()
    }
}

impl PageAllocator for SimulatedAllocator {
    fn attach_user(&self, user: Uuid, user_slot: SlotOffset) -> PagelogResult<SlotOffset> {
        let mut users = self.users.lock();
        if !users.contains(&user) {
            users.push(user);
        }
        Ok(user_slot)
    }

    fn sync(&self, _slot: SlotOffset) -> PagelogResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct DeleterState {
    batches: Vec<(SlotOffset, Vec<PageToRecycle>)>,
    cascades: HashMap<PageId, Vec<PageId>>,
    fail_remaining: u32,
    caught_up_count: u64,
    failures: Vec<String>,
}

/// `PageDeleter` that records every batch it sees; used by recycler tests
/// that do not need a page cache.
pub struct RecordingPageDeleter {
    state: Mutex<DeleterState>,
    batch_count: Watch<u64>,
}

impl RecordingPageDeleter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DeleterState::default()),
            batch_count: Watch::new(0),
        })
    }

    /// Configure `page` to cascade into `targets` when deleted.
    pub fn set_cascade(&self, page: PageId, targets: Vec<PageId>) {
        self.state.lock().cascades.insert(page, targets);
    }

    pub fn fail_next_deletes(&self, count: u32) {
        self.state.lock().fail_remaining = count;
    }

    pub fn batches(&self) -> Vec<(SlotOffset, Vec<PageToRecycle>)> {
        self.state.lock().batches.clone()
    }

    pub fn caught_up_count(&self) -> u64 {
        self.state.lock().caught_up_count
    }

    pub fn failures(&self) -> Vec<String> {
        self.state.lock().failures.clone()
    }

    /// Wait until at least `count` batches have been delivered.
    pub async fn await_batch_count(&self, count: u64) -> PagelogResult<u64> {
        self.batch_count.await_condition(|c| *c >= count).await
    }
}

impl PageDeleter for RecordingPageDeleter {
    fn delete_pages<'a>(
        &'a self,
        items: &'a [PageToRecycle],
        recycler: &'a PageRecycler,
        batch_slot: SlotOffset,
        grant: &'a Grant,
    ) -> BoxFuture<'a, PagelogResult<()>> {
        Box::pin(async move {
            let cascade_targets: Vec<PageId> = {
                let mut state = self.state.lock();
                if state.fail_remaining > 0 {
                    state.fail_remaining -= 1;
                    return Err(PagelogError::Io(std::io::Error::other(
                        "injected delete failure",
                    )));
                }
                state.batches.push((batch_slot, items.to_vec()));
                items
                    .iter()
                    .flat_map(|item| {
                        state
                            .cascades
                            .remove(&item.page_id)
                            .unwrap_or_default()
                    })
                    .collect()
            };
            if !cascade_targets.is_empty() {
                let next_depth = items.iter().map(|item| item.depth).max().unwrap_or(0) + 1;
                recycler
                    .recycle_pages(&cascade_targets, Some(grant), next_depth)
                    .await?;
            }
            self.batch_count.modify(|c| *c += 1);
            Ok(())
        })
    }

    fn notify_caught_up(&self, _recycler: &PageRecycler, _upper_bound: SlotOffset) {
        self.state.lock().caught_up_count += 1;
    }

    fn notify_failure(&self, _recycler: &PageRecycler, error: &PagelogError) {
        self.state.lock().failures.push(error.to_string());
    }
}
