//! Read-locked event scans over a volume's root log.

use std::sync::Arc;

use crate::device::LogDevice;
use crate::error::PagelogResult;
use crate::records::{VolumeEvent, read_events};
use crate::slot::{LogReadMode, SlotRange, slot_less_than};
use crate::slot_lock::SlotReadLock;

/// A reader holding a read lock on its slot range; the locked span cannot
/// be trimmed away while the reader is alive.
pub struct VolumeReader {
    device: Arc<dyn LogDevice>,
    read_lock: SlotReadLock,
    mode: LogReadMode,
}

impl VolumeReader {
    pub(crate) fn new(
        device: Arc<dyn LogDevice>,
        read_lock: SlotReadLock,
        mode: LogReadMode,
    ) -> Self {
        Self {
            device,
            read_lock,
            mode,
        }
    }

    pub fn slot_range(&self) -> SlotRange {
        self.read_lock.slot_range()
    }

    pub fn mode(&self) -> LogReadMode {
        self.mode
    }

    /// Scan the locked range, invoking `visit` for each event inside it.
    /// Returns the number of events visited.
    pub fn visit_slots(
        &self,
        mut visit: impl FnMut(SlotRange, VolumeEvent) -> PagelogResult<()>,
    ) -> PagelogResult<usize> {
        let range = self.read_lock.slot_range();
        let mut reader = self.device.new_reader(Some(range.lower_bound), self.mode);
        let mut visited = 0;
        read_events::<VolumeEvent>(reader.as_mut(), |slot, event| {
            if slot_less_than(range.upper_bound, slot.upper_bound) {
                return Ok(());
            }
            visited += 1;
            visit(slot, event)
        })?;
        Ok(visited)
    }
}
