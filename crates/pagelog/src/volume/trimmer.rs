//! Background task that follows the lock manager's low-water mark and
//! physically trims the root log.

use std::sync::Arc;

use tracing::debug;

use crate::error::PagelogResult;
use crate::slot::{LogReadMode, slot_less_than};
use crate::slot_lock::SlotLockManager;
use crate::writer::SlotWriter;

pub(crate) struct Trimmer {
    pub(crate) name: String,
    pub(crate) trim_control: SlotLockManager,
    pub(crate) slot_writer: Arc<SlotWriter>,
}

impl Trimmer {
    /// Run until the lock manager halts. Each time the minimum live lock
    /// advances, trim the log up to it.
    pub(crate) async fn run(self) -> PagelogResult<()> {
        let mut last_trim = self
            .slot_writer
            .slot_range(LogReadMode::Speculative)
            .lower_bound;
        loop {
            let target = match self.trim_control.await_lower_bound_not_equal(last_trim).await {
                Ok(target) => target,
                Err(err) if err.is_shutdown() => return Ok(()),
                Err(err) => return Err(err),
            };
            if slot_less_than(last_trim, target) {
                self.slot_writer.trim(target)?;
                debug!(name = %self.name, trim_point = target, "volume log trimmed");
            }
            last_trim = target;
        }
    }
}
