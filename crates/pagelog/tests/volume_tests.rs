//! End-to-end volume scenarios: the two-phase append pipeline, pending-job
//! resolution after crashes, recycler integration, sequencing, and trim
//! safety.

use std::sync::Arc;
use std::time::Duration;

use pagelog::test_support::SimulatedPageCache;
use pagelog::{
    AppendableJob, LogReadMode, MemoryLogDeviceFactory, MemoryLogStorage, PageCache, PageId,
    PagelogError, SlotRange, SlotRangeSpec, SlotSequencer, SlotUpperBoundAt, Volume,
    VolumeEvent, VolumeOptions, VolumeRecoverParams, WaitForSpace, calculate_recycler_log_size,
    packed_size_of, read_events, slot_less_than,
};

fn root_storage() -> MemoryLogStorage {
    MemoryLogStorage::new(1 << 16)
}

fn recycler_storage() -> MemoryLogStorage {
    let options = VolumeOptions::with_name("size-probe").recycler;
    MemoryLogStorage::new(calculate_recycler_log_size(&options, Some(64)) as usize)
}

async fn recover_volume(
    name: &str,
    root: &MemoryLogStorage,
    recycler: &MemoryLogStorage,
    cache: &Arc<SimulatedPageCache>,
) -> Arc<Volume> {
    Volume::recover(VolumeRecoverParams {
        options: VolumeOptions::with_name(name),
        cache: Arc::clone(cache) as Arc<dyn PageCache>,
        root_log_factory: Arc::new(MemoryLogDeviceFactory::new(root.clone())),
        recycler_log_factory: Arc::new(MemoryLogDeviceFactory::new(recycler.clone())),
        trim_control: None,
    })
    .await
    .expect("volume recover")
}

fn durable_volume_events(storage: &MemoryLogStorage) -> Vec<(SlotRange, VolumeEvent)> {
    let mut reader = storage.durable_snapshot();
    let mut events = Vec::new();
    read_events::<VolumeEvent>(&mut reader, |slot, event| {
        events.push((slot, event));
        Ok(())
    })
    .expect("scan volume wal");
    events
}

#[tokio::test]
async fn append_job_writes_prepare_then_commit() {
    let (root, recycler) = (root_storage(), recycler_storage());
    let cache = SimulatedPageCache::new();
    let volume = recover_volume("simple", &root, &recycler, &cache).await;

    let page = PageId::new(1);
    let job = AppendableJob {
        new_pages: vec![page],
        deleted_pages: vec![],
        user_data: b"hello".to_vec(),
    };
    let grant = volume
        .reserve(job.grant_size(), WaitForSpace::Yes)
        .await
        .expect("reserve");
    let range = volume
        .append_job(&job, &grant, None)
        .await
        .expect("append_job");

    // The grant covered exactly the prepare and commit slots.
    assert_eq!(grant.size(), 0);
    assert_eq!(range.size(), job.grant_size());
    assert!(cache.job_applied(range.lower_bound));
    assert!(cache.contains_page(page));

    volume
        .sync(
            LogReadMode::Durable,
            SlotUpperBoundAt {
                offset: range.upper_bound,
            },
        )
        .await
        .expect("sync");

    let reader = volume
        .reader(SlotRangeSpec::default(), LogReadMode::Durable)
        .expect("reader");
    let mut prepares = 0;
    let mut commits = 0;
    reader
        .visit_slots(|slot, event| {
            match event {
                VolumeEvent::PrepareJob { user_data, .. } => {
                    assert_eq!(slot.lower_bound, range.lower_bound);
                    assert_eq!(user_data, b"hello");
                    prepares += 1;
                }
                VolumeEvent::CommitJob { prepare_slot } => {
                    assert_eq!(prepare_slot, range.lower_bound);
                    commits += 1;
                }
                _ => {}
            }
            Ok(())
        })
        .expect("visit");
    assert_eq!((prepares, commits), (1, 1));

    volume.halt();
    volume.join().await;
}

#[tokio::test]
async fn undersized_grant_fails_without_partial_state() {
    let (root, recycler) = (root_storage(), recycler_storage());
    let cache = SimulatedPageCache::new();
    let volume = recover_volume("undersized", &root, &recycler, &cache).await;

    let job = AppendableJob {
        new_pages: vec![PageId::new(2)],
        deleted_pages: vec![],
        user_data: b"too big".to_vec(),
    };
    // Not even the prepare slot fits, so the append fails before any side
    // effect runs.
    let short = packed_size_of(&job.prepare_event()) - 1;
    let grant = volume
        .reserve(short, WaitForSpace::Yes)
        .await
        .expect("reserve");
    let result = volume.append_job(&job, &grant, None).await;
    assert!(matches!(result, Err(PagelogError::NoSpace)));
    assert_eq!(grant.size(), short);
    assert!(!cache.contains_page(PageId::new(2)));

    volume.halt();
    volume.join().await;
}

#[tokio::test]
async fn crash_between_prepare_and_commit_rolls_back() {
    let (root, recycler) = (root_storage(), recycler_storage());
    let cache = SimulatedPageCache::new();
    let orphan = PageId::new(5);

    let prepare_range = {
        let volume = recover_volume("torn", &root, &recycler, &cache).await;
        let job = AppendableJob {
            new_pages: vec![orphan],
            deleted_pages: vec![],
            user_data: b"orphan".to_vec(),
        };
        let grant = volume
            .reserve(job.grant_size(), WaitForSpace::Yes)
            .await
            .expect("reserve");
        // Phase 1 only: durable prepare, then the process dies before the
        // job commits.
        let prepare_range = volume
            .append(&job.prepare_event(), &grant)
            .expect("prepare append");
        volume
            .sync(
                LogReadMode::Durable,
                SlotUpperBoundAt {
                    offset: prepare_range.upper_bound,
                },
            )
            .await
            .expect("sync prepare");
        volume.halt();
        volume.join().await;
        prepare_range
    };
    root.crash();
    recycler.crash();

    // The orphan page was never written, so recovery must roll back.
    let volume = recover_volume("torn", &root, &recycler, &cache).await;
    assert!(!cache.contains_page(orphan));
    assert!(!cache.job_applied(prepare_range.lower_bound));

    let events = durable_volume_events(&root);
    let rollbacks: Vec<_> = events
        .iter()
        .filter_map(|(_, event)| match event {
            VolumeEvent::RollbackJob { prepare_slot } => Some(*prepare_slot),
            _ => None,
        })
        .collect();
    assert_eq!(rollbacks, vec![prepare_range.lower_bound]);
    assert!(
        !events
            .iter()
            .any(|(_, event)| matches!(event, VolumeEvent::CommitJob { .. })),
        "a rolled-back prepare must not also commit"
    );

    volume.halt();
    volume.join().await;
}

#[tokio::test]
async fn crash_after_side_effects_recommits_idempotently() {
    let (root, recycler) = (root_storage(), recycler_storage());
    let cache = SimulatedPageCache::new();
    let page = PageId::new(6);

    let prepare_range = {
        let volume = recover_volume("replay", &root, &recycler, &cache).await;
        let job = AppendableJob {
            new_pages: vec![page],
            deleted_pages: vec![],
            user_data: vec![],
        };
        let grant = volume
            .reserve(job.grant_size(), WaitForSpace::Yes)
            .await
            .expect("reserve");
        let prepare_range = volume
            .append(&job.prepare_event(), &grant)
            .expect("prepare append");
        volume
            .sync(
                LogReadMode::Durable,
                SlotUpperBoundAt {
                    offset: prepare_range.upper_bound,
                },
            )
            .await
            .expect("sync prepare");
        volume.halt();
        volume.join().await;
        prepare_range
    };
    // The job's side effects reached the cache before the crash; only the
    // commit slot is missing.
    cache.insert_page(page, &[]);
    root.crash();
    recycler.crash();

    let volume = recover_volume("replay", &root, &recycler, &cache).await;
    assert!(cache.contains_page(page));
    assert!(cache.job_applied(prepare_range.lower_bound));

    let events = durable_volume_events(&root);
    let commits: Vec<_> = events
        .iter()
        .filter_map(|(_, event)| match event {
            VolumeEvent::CommitJob { prepare_slot } => Some(*prepare_slot),
            _ => None,
        })
        .collect();
    assert_eq!(commits, vec![prepare_range.lower_bound]);

    volume.halt();
    volume.join().await;
}

#[tokio::test]
async fn dropped_pages_cascade_through_the_recycler() {
    let (root, recycler) = (root_storage(), recycler_storage());
    let cache = SimulatedPageCache::new();
    let volume = recover_volume("cascade", &root, &recycler, &cache).await;

    let parent = PageId::new(10);
    let child = PageId::new(11);
    // The child is only alive through the parent's reference.
    cache.insert_dependent_page(child, &[]);
    cache.insert_page(parent, &[child]);

    let job = AppendableJob {
        new_pages: vec![],
        deleted_pages: vec![parent],
        user_data: vec![],
    };
    let grant = volume
        .reserve(job.grant_size(), WaitForSpace::Yes)
        .await
        .expect("reserve");
    volume
        .append_job(&job, &grant, None)
        .await
        .expect("append_job");

    cache
        .await_deleted_count(2)
        .await
        .expect("both pages recycled");
    volume.halt();
    volume.join().await;

    let observations = cache.delete_observations();
    let parent_deletes: Vec<_> = observations.iter().filter(|(_, p)| *p == parent).collect();
    let child_deletes: Vec<_> = observations.iter().filter(|(_, p)| *p == child).collect();
    assert_eq!(parent_deletes.len(), 1, "exactly-once delete for the parent");
    assert_eq!(child_deletes.len(), 1, "exactly-once delete for the child");
    // The cascade runs under its own batch identity.
    assert_ne!(parent_deletes[0].0, child_deletes[0].0);
    assert!(!cache.contains_page(parent));
    assert!(!cache.contains_page(child));
}

#[tokio::test]
async fn sequencer_orders_concurrent_appends() {
    let (root, recycler) = (root_storage(), recycler_storage());
    let cache = SimulatedPageCache::new();
    let volume = recover_volume("sequenced", &root, &recycler, &cache).await;

    let mut head = SlotSequencer::new();
    let mut tail = head.get_next();

    // The second job is issued first but must wait for the head of the
    // chain to take its slot.
    let second = {
        let volume = Arc::clone(&volume);
        tokio::spawn(async move {
            let job = AppendableJob {
                new_pages: vec![PageId::new(21)],
                deleted_pages: vec![],
                user_data: b"second".to_vec(),
            };
            let grant = volume.reserve(job.grant_size(), WaitForSpace::Yes).await?;
            volume.append_job(&job, &grant, Some(&mut tail)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!second.is_finished(), "the tail waits for the head");

    let first_job = AppendableJob {
        new_pages: vec![PageId::new(20)],
        deleted_pages: vec![],
        user_data: b"first".to_vec(),
    };
    let grant = volume
        .reserve(first_job.grant_size(), WaitForSpace::Yes)
        .await
        .expect("reserve");
    let first_range = volume
        .append_job(&first_job, &grant, Some(&mut head))
        .await
        .expect("first append");

    let second_range = second
        .await
        .expect("join")
        .expect("second append");
    assert!(slot_less_than(
        first_range.lower_bound,
        second_range.lower_bound
    ));

    volume.halt();
    volume.join().await;
}

#[tokio::test]
async fn trim_advances_the_floor_and_stales_old_readers() {
    let (root, recycler) = (root_storage(), recycler_storage());
    let cache = SimulatedPageCache::new();
    let volume = recover_volume("trimmed", &root, &recycler, &cache).await;

    let mut last_range = None;
    for i in 0..3u64 {
        let job = AppendableJob {
            new_pages: vec![PageId::new(30 + i)],
            deleted_pages: vec![],
            user_data: vec![],
        };
        let grant = volume
            .reserve(job.grant_size(), WaitForSpace::Yes)
            .await
            .expect("reserve");
        last_range = Some(volume.append_job(&job, &grant, None).await.expect("append"));
    }
    let last_range = last_range.expect("appended");
    volume
        .sync(
            LogReadMode::Durable,
            SlotUpperBoundAt {
                offset: last_range.upper_bound,
            },
        )
        .await
        .expect("sync");

    let floor = last_range.lower_bound;
    volume.trim(floor).expect("trim");

    // Reads below the floor fail immediately.
    let stale = volume.reader(
        SlotRangeSpec {
            lower_bound: Some(0),
            upper_bound: None,
        },
        LogReadMode::Durable,
    );
    assert!(matches!(stale, Err(PagelogError::StaleRead(_))));

    // The trimmer task observes the new minimum and physically trims.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if root.slot_range(LogReadMode::Speculative).lower_bound == floor {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("physical trim follows the trim lock");

    // Readers at or above the floor still work.
    let reader = volume
        .reader(SlotRangeSpec::default(), LogReadMode::Durable)
        .expect("reader above floor");
    assert!(reader.slot_range().lower_bound >= floor);

    volume.halt();
    volume.join().await;
}

#[tokio::test]
async fn reopen_preserves_ids_and_attachments() {
    let (root, recycler) = (root_storage(), recycler_storage());
    let cache = SimulatedPageCache::new();

    let first_uuid = {
        let volume = recover_volume("stable", &root, &recycler, &cache).await;
        let uuid = volume.volume_uuid();
        volume.halt();
        volume.join().await;
        uuid
    };

    let volume = recover_volume("stable", &root, &recycler, &cache).await;
    assert_eq!(volume.volume_uuid(), first_uuid);

    let events = durable_volume_events(&root);
    let ids_count = events
        .iter()
        .filter(|(_, event)| matches!(event, VolumeEvent::Ids(_)))
        .count();
    let attach_count = events
        .iter()
        .filter(|(_, event)| matches!(event, VolumeEvent::Attach { .. }))
        .count();
    assert_eq!(ids_count, 1, "identities are persisted once");
    assert_eq!(attach_count, 3, "one attachment per client uuid per arena");
    assert_eq!(cache.attachments().len(), 3);

    volume.halt();
    volume.join().await;
}
