//! Process-wide metric registry and counter groups.
//!
//! Counters are plain `AtomicU64`s shared through `Arc`. Subsystems register
//! their counters under stable names at construction and unregister them on
//! drop; `registered_value` exposes the registry to exporters and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

fn registry() -> &'static Mutex<HashMap<String, Arc<AtomicU64>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<AtomicU64>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register `counter` under `name`, replacing any previous registration of
/// that name.
pub fn register(name: impl Into<String>, counter: &Arc<AtomicU64>) {
    registry().lock().insert(name.into(), Arc::clone(counter));
}

/// Remove every registration pointing at `counter`.
pub fn unregister(counter: &Arc<AtomicU64>) {
    registry()
        .lock()
        .retain(|_, registered| !Arc::ptr_eq(registered, counter));
}

/// Current value of a registered counter, if present.
pub fn registered_value(name: &str) -> Option<u64> {
    registry()
        .lock()
        .get(name)
        .map(|counter| counter.load(Ordering::Relaxed))
}

/// Point-in-time snapshot of a recycler's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecyclerMetricsSnapshot {
    pub insert_count: u64,
    pub remove_count: u64,
    pub batch_count: u64,
    pub page_drop_ok_count: u64,
    pub page_drop_error_count: u64,
}

/// Counters maintained by one `PageRecycler`.
///
/// Registered globally as `PageRecycler_<name>_<metric>` and unregistered
/// when the recycler is dropped.
#[derive(Debug, Default)]
pub struct RecyclerMetrics {
    pub insert_count: Arc<AtomicU64>,
    pub remove_count: Arc<AtomicU64>,
    pub batch_count: Arc<AtomicU64>,
    pub page_drop_ok_count: Arc<AtomicU64>,
    pub page_drop_error_count: Arc<AtomicU64>,
}

impl RecyclerMetrics {
    fn entries(&self) -> [(&'static str, &Arc<AtomicU64>); 5] {
        [
            ("insert_count", &self.insert_count),
            ("remove_count", &self.remove_count),
            ("batch_count", &self.batch_count),
            ("page_drop_ok_count", &self.page_drop_ok_count),
            ("page_drop_error_count", &self.page_drop_error_count),
        ]
    }

    pub fn register_all(&self, recycler_name: &str) {
        for (metric, counter) in self.entries() {
            register(format!("PageRecycler_{recycler_name}_{metric}"), counter);
        }
    }

    pub fn unregister_all(&self) {
        for (_, counter) in self.entries() {
            unregister(counter);
        }
    }

    pub fn snapshot(&self) -> RecyclerMetricsSnapshot {
        RecyclerMetricsSnapshot {
            insert_count: self.insert_count.load(Ordering::Relaxed),
            remove_count: self.remove_count.load(Ordering::Relaxed),
            batch_count: self.batch_count.load(Ordering::Relaxed),
            page_drop_ok_count: self.page_drop_ok_count.load(Ordering::Relaxed),
            page_drop_error_count: self.page_drop_error_count.load(Ordering::Relaxed),
        }
    }
}

/// Counters maintained by one `Volume`.
#[derive(Debug, Default)]
pub struct VolumeMetrics {
    pub prepare_slot_count: Arc<AtomicU64>,
    pub commit_slot_count: Arc<AtomicU64>,
    pub rollback_slot_count: Arc<AtomicU64>,
}

impl VolumeMetrics {
    fn entries(&self) -> [(&'static str, &Arc<AtomicU64>); 3] {
        [
            ("prepare_slot_count", &self.prepare_slot_count),
            ("commit_slot_count", &self.commit_slot_count),
            ("rollback_slot_count", &self.rollback_slot_count),
        ]
    }

    pub fn register_all(&self, volume_name: &str) {
        for (metric, counter) in self.entries() {
            register(format!("Volume_{volume_name}_{metric}"), counter);
        }
    }

    pub fn unregister_all(&self) {
        for (_, counter) in self.entries() {
            unregister(counter);
        }
    }
}
