//! Slot offsets and ranges.
//!
//! A slot offset is a 64-bit monotone logical position in an append-only
//! log. Comparisons are wraparound tolerant: the offset space is treated as
//! a sliding window so that logs may run indefinitely.

use serde::{Deserialize, Serialize};

/// Logical position in an append-only log.
pub type SlotOffset = u64;

/// Half-open `[lower_bound, upper_bound)` range of slot offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    pub lower_bound: SlotOffset,
    pub upper_bound: SlotOffset,
}

impl SlotRange {
    /// An empty range positioned at `at`.
    pub const fn empty(at: SlotOffset) -> Self {
        Self {
            lower_bound: at,
            upper_bound: at,
        }
    }

    pub fn size(&self) -> u64 {
        self.upper_bound.wrapping_sub(self.lower_bound)
    }

    pub fn is_empty(&self) -> bool {
        self.lower_bound == self.upper_bound
    }
}

/// Sync target: all slots with `upper_bound <= offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotUpperBoundAt {
    pub offset: SlotOffset,
}

/// Visibility level for reads and syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogReadMode {
    /// Visible to readers, not necessarily persistent.
    Speculative,
    /// Persistent across crashes.
    Durable,
}

/// Optional bounds for a read-lock or reader request; `None` defaults to the
/// log's current range in the requested mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotRangeSpec {
    pub lower_bound: Option<SlotOffset>,
    pub upper_bound: Option<SlotOffset>,
}

impl SlotRangeSpec {
    pub const fn exact(range: SlotRange) -> Self {
        Self {
            lower_bound: Some(range.lower_bound),
            upper_bound: Some(range.upper_bound),
        }
    }
}

/// Wraparound-tolerant strict ordering: true iff `a` precedes `b` within a
/// half-space window, i.e. `b - a < u64::MAX / 2` modulo 2^64.
pub fn slot_less_than(a: SlotOffset, b: SlotOffset) -> bool {
    a != b && b.wrapping_sub(a) < u64::MAX / 2
}

pub fn slot_min(a: SlotOffset, b: SlotOffset) -> SlotOffset {
    if slot_less_than(b, a) { b } else { a }
}

pub fn slot_max(a: SlotOffset, b: SlotOffset) -> SlotOffset {
    if slot_less_than(a, b) { b } else { a }
}

/// Raise `target` to at least `candidate`, initializing it when unset.
pub fn clamp_min_slot(target: &mut Option<SlotOffset>, candidate: SlotOffset) {
    *target = Some(match *target {
        None => candidate,
        Some(current) => slot_max(current, candidate),
    });
}
