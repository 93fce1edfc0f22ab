//! Crash-consistent, log-structured storage substrate.
//!
//! pagelog couples two subsystems around a slotted write-ahead log:
//!
//! - [`Volume`]: a WAL with two-phase transactional jobs. A job's prepare
//!   slot is durable before any side effect runs; the commit slot may
//!   trail, and recovery resolves every prepare that lost its commit.
//! - [`PageRecycler`]: a WAL-backed worker that retires pages whose
//!   liveness dropped to zero, cascading through reference chains with
//!   exactly-once deletes across crashes.
//!
//! ## Architecture Overview
//!
//! - **Slot writer**: reserve/append/sync/trim over a [`LogDevice`], with
//!   move-only [`Grant`] credits providing backpressure. The sum of live
//!   grant bytes plus in-use log bytes never exceeds log capacity.
//! - **Recycler pipeline**: insert records land in the WAL and a
//!   deepest-first pending structure; the recycle task drains batches,
//!   journals prepares before deletes and a commit after, then trims the
//!   WAL behind an info anchor it periodically refreshes.
//! - **Volume pipeline**: prepare slot (durable) → page cache commit keyed
//!   on the prepare slot → commit slot. Readers take named-range locks
//!   whose minimum forms the trim floor followed by the trimmer task.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pagelog::test_support::SimulatedPageCache;
//! use pagelog::{
//!     AppendableJob, MemoryLogDeviceFactory, MemoryLogStorage, PageId, Volume,
//!     VolumeOptions, VolumeRecoverParams, WaitForSpace,
//! };
//!
//! # async fn example() -> pagelog::PagelogResult<()> {
//! let cache = SimulatedPageCache::new();
//! let volume = Volume::recover(VolumeRecoverParams {
//!     options: VolumeOptions::with_name("demo"),
//!     cache,
//!     root_log_factory: Arc::new(MemoryLogDeviceFactory::new(MemoryLogStorage::new(1 << 20))),
//!     recycler_log_factory: Arc::new(MemoryLogDeviceFactory::new(MemoryLogStorage::new(1 << 16))),
//!     trim_control: None,
//! })
//! .await?;
//!
//! let job = AppendableJob {
//!     new_pages: vec![PageId::new(1)],
//!     deleted_pages: vec![],
//!     user_data: b"hello".to_vec(),
//! };
//! let grant = volume.reserve(job.grant_size(), WaitForSpace::Yes).await?;
//! let range = volume.append_job(&job, &grant, None).await?;
//! println!("job committed at {range:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! All public types are safe to share across tasks. Shared state sits
//! behind parking_lot mutexes with awaitable watches for the suspension
//! points; `halt()` on any subsystem is idempotent and releases every
//! awaiter in bounded time.

pub mod config;
pub mod device;
pub mod error;
pub mod metrics;
pub mod page;
pub mod records;
pub mod recycler;
pub mod slot;
pub mod slot_lock;
pub mod test_support;
pub mod volume;
pub mod watch;
pub mod writer;

pub use config::{
    PackedLogDeviceConfig, RecyclerOptions, VolumeOptions, calculate_recycler_log_size,
};
pub use device::{
    LogDevice, LogDeviceFactory, LogReader, MemoryLogDevice, MemoryLogDeviceFactory,
    MemoryLogStorage, ScanFn,
};
pub use error::{PagelogError, PagelogResult};
pub use page::{
    AppendableJob, CachePageDeleter, JobCommitParams, MAX_PAGE_REF_DEPTH, PageAllocator,
    PageArena, PageCache, PageDeleter, PageId, PageToRecycle,
};
pub use records::{
    RecyclerEvent, SlotPayload, VolumeEvent, VolumeIds, packed_size_of, read_events,
};
pub use recycler::{Batch, PageRecycler, RecyclerRecovery, RecyclerRecoveryVisitor, RecyclerState};
pub use slot::{
    LogReadMode, SlotOffset, SlotRange, SlotRangeSpec, SlotUpperBoundAt, clamp_min_slot,
    slot_less_than, slot_max, slot_min,
};
pub use slot_lock::{SlotLockManager, SlotReadLock};
pub use volume::{
    SlotSequencer, Volume, VolumeReader, VolumeRecoverParams, VolumeRecoveryVisitor,
};
pub use watch::Watch;
pub use writer::{Grant, SlotWriter, WaitForSpace};
