//! Log device abstraction and the in-memory reference implementation.
//!
//! A `LogDevice` is an appendable, trimmable, durable byte log addressed by
//! monotone slot offsets. The `MemoryLogDevice` models the
//! speculative/durable split explicitly: appended bytes are speculative
//! until a durable sync or flush, and `MemoryLogStorage::crash` discards
//! the non-durable suffix, which is how the recovery tests simulate power
//! loss at slot boundaries.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::error::{PagelogError, PagelogResult};
use crate::slot::{LogReadMode, SlotOffset, SlotRange, SlotUpperBoundAt};

/// Sequential reader over a log's byte stream.
pub trait LogReader: Send {
    /// Logical offset of the first byte `peek` would return.
    fn slot_offset(&self) -> SlotOffset;
    /// Bytes available from the current position.
    fn peek(&self) -> &[u8];
    /// Advance past `len` bytes.
    fn consume(&mut self, len: usize);
}

/// An appendable, trimmable, durable byte log.
pub trait LogDevice: Send + Sync + 'static {
    fn capacity(&self) -> usize;
    fn slot_range(&self, mode: LogReadMode) -> SlotRange;
    fn new_reader(&self, lower_bound: Option<SlotOffset>, mode: LogReadMode)
        -> Box<dyn LogReader>;
    /// Append raw bytes, returning the assigned range. Appends are strictly
    /// sequential.
    fn append_bytes(&self, bytes: &[u8]) -> PagelogResult<SlotRange>;
    /// Advance the lower bound, releasing the trimmed span.
    fn trim(&self, new_lower_bound: SlotOffset) -> PagelogResult<()>;
    /// Wait until all slots with `upper_bound <= target.offset` are visible
    /// in `mode`.
    fn sync(
        &self,
        mode: LogReadMode,
        target: SlotUpperBoundAt,
    ) -> BoxFuture<'_, PagelogResult<()>>;
    /// Make everything appended so far durable.
    fn flush(&self) -> PagelogResult<()>;
    /// Unblock pending syncs with an error; subsequent operations fail.
    fn halt(&self);
    fn close(&self) -> PagelogResult<()>;
}

/// Recovery scan callback: reads the log and returns the offset up to which
/// recovery consumed data. The factory truncates the log there before
/// handing it to the writer.
pub type ScanFn<'a> = dyn FnMut(&mut dyn LogReader) -> PagelogResult<SlotOffset> + 'a;

/// Opens a log device, running the recovery scan while the log is quiescent.
pub trait LogDeviceFactory: Send + Sync {
    fn open_log_device(&self, scan_fn: &mut ScanFn<'_>) -> PagelogResult<Arc<dyn LogDevice>>;
}

#[derive(Debug)]
struct MediaState {
    base_offset: SlotOffset,
    /// Bytes in `[base_offset, speculative upper)`.
    bytes: Vec<u8>,
    durable_upper: SlotOffset,
    halted: bool,
    closed: bool,
}

impl MediaState {
    fn speculative_upper(&self) -> SlotOffset {
        self.base_offset + self.bytes.len() as u64
    }
}

/// The persistent "media" behind memory log devices. Survives device
/// open/close cycles so recovery tests can crash and reopen the same log.
#[derive(Clone)]
pub struct MemoryLogStorage {
    capacity: usize,
    state: Arc<Mutex<MediaState>>,
}

impl MemoryLogStorage {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Arc::new(Mutex::new(MediaState {
                base_offset: 0,
                bytes: Vec::new(),
                durable_upper: 0,
                halted: false,
                closed: false,
            })),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Simulate power loss: every byte that was never durably synced is
    /// gone. The media stays usable for a subsequent reopen.
    pub fn crash(&self) {
        let mut state = self.state.lock();
        let durable_len = (state.durable_upper - state.base_offset) as usize;
        state.bytes.truncate(durable_len);
        state.halted = false;
        state.closed = false;
    }

    /// Current range visible in `mode`, for test assertions.
    pub fn slot_range(&self, mode: LogReadMode) -> SlotRange {
        let state = self.state.lock();
        SlotRange {
            lower_bound: state.base_offset,
            upper_bound: match mode {
                LogReadMode::Speculative => state.speculative_upper(),
                LogReadMode::Durable => state.durable_upper,
            },
        }
    }

    /// Detached reader over the current durable contents. Does not disturb
    /// a live device; useful for inspecting a log's records from tests.
    pub fn durable_snapshot(&self) -> BufferLogReader {
        let state = self.state.lock();
        let durable_len = (state.durable_upper - state.base_offset) as usize;
        BufferLogReader::new(state.base_offset, state.bytes[..durable_len].to_vec())
    }
}

/// Reader over a detached byte snapshot.
pub struct BufferLogReader {
    offset: SlotOffset,
    data: Vec<u8>,
    pos: usize,
}

impl BufferLogReader {
    pub fn new(offset: SlotOffset, data: Vec<u8>) -> Self {
        Self {
            offset,
            data,
            pos: 0,
        }
    }
}

impl LogReader for BufferLogReader {
    fn slot_offset(&self) -> SlotOffset {
        self.offset
    }

    fn peek(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    fn consume(&mut self, len: usize) {
        assert!(self.pos + len <= self.data.len(), "consume past end");
        self.pos += len;
        self.offset += len as u64;
    }
}

/// In-memory `LogDevice` over a `MemoryLogStorage`.
pub struct MemoryLogDevice {
    capacity: usize,
    state: Arc<Mutex<MediaState>>,
}

impl MemoryLogDevice {
    fn reader_snapshot(
        &self,
        lower_bound: Option<SlotOffset>,
        mode: LogReadMode,
    ) -> MemoryLogReader {
        let state = self.state.lock();
        let upper = match mode {
            LogReadMode::Speculative => state.speculative_upper(),
            LogReadMode::Durable => state.durable_upper,
        };
        let lower = lower_bound
            .unwrap_or(state.base_offset)
            .clamp(state.base_offset, upper);
        let start = (lower - state.base_offset) as usize;
        let end = (upper - state.base_offset) as usize;
        MemoryLogReader {
            offset: lower,
            data: state.bytes[start..end].to_vec(),
            pos: 0,
        }
    }
}

impl LogDevice for MemoryLogDevice {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn slot_range(&self, mode: LogReadMode) -> SlotRange {
        let state = self.state.lock();
        SlotRange {
            lower_bound: state.base_offset,
            upper_bound: match mode {
                LogReadMode::Speculative => state.speculative_upper(),
                LogReadMode::Durable => state.durable_upper,
            },
        }
    }

    fn new_reader(
        &self,
        lower_bound: Option<SlotOffset>,
        mode: LogReadMode,
    ) -> Box<dyn LogReader> {
        Box::new(self.reader_snapshot(lower_bound, mode))
    }

    fn append_bytes(&self, bytes: &[u8]) -> PagelogResult<SlotRange> {
        let mut state = self.state.lock();
        if state.halted || state.closed {
            return Err(PagelogError::Cancelled);
        }
        if state.bytes.len() + bytes.len() > self.capacity {
            return Err(PagelogError::NoSpace);
        }
        let lower_bound = state.speculative_upper();
        state.bytes.extend_from_slice(bytes);
        Ok(SlotRange {
            lower_bound,
            upper_bound: state.speculative_upper(),
        })
    }

    fn trim(&self, new_lower_bound: SlotOffset) -> PagelogResult<()> {
        let mut state = self.state.lock();
        if state.halted || state.closed {
            return Err(PagelogError::Cancelled);
        }
        assert!(
            new_lower_bound >= state.base_offset
                && new_lower_bound <= state.speculative_upper(),
            "trim target {new_lower_bound} outside log range"
        );
        let drop_len = (new_lower_bound - state.base_offset) as usize;
        state.bytes.drain(..drop_len);
        state.base_offset = new_lower_bound;
        if state.durable_upper < new_lower_bound {
            state.durable_upper = new_lower_bound;
        }
        Ok(())
    }

    fn sync(
        &self,
        mode: LogReadMode,
        target: SlotUpperBoundAt,
    ) -> BoxFuture<'_, PagelogResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if state.halted || state.closed {
                return Err(PagelogError::Cancelled);
            }
            match mode {
                // Appended bytes are immediately visible to readers.
                LogReadMode::Speculative => Ok(()),
                LogReadMode::Durable => {
                    let reachable = target.offset.min(state.speculative_upper());
                    if reachable > state.durable_upper {
                        state.durable_upper = reachable;
                    }
                    Ok(())
                }
            }
        })
    }

    fn flush(&self) -> PagelogResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PagelogError::DeviceClosed);
        }
        state.durable_upper = state.speculative_upper();
        Ok(())
    }

    fn halt(&self) {
        self.state.lock().halted = true;
    }

    fn close(&self) -> PagelogResult<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

struct MemoryLogReader {
    offset: SlotOffset,
    data: Vec<u8>,
    pos: usize,
}

impl LogReader for MemoryLogReader {
    fn slot_offset(&self) -> SlotOffset {
        self.offset
    }

    fn peek(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    fn consume(&mut self, len: usize) {
        assert!(self.pos + len <= self.data.len(), "consume past end");
        self.pos += len;
        self.offset += len as u64;
    }
}

/// Factory over a `MemoryLogStorage` media.
pub struct MemoryLogDeviceFactory {
    storage: MemoryLogStorage,
}

impl MemoryLogDeviceFactory {
    pub fn new(storage: MemoryLogStorage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &MemoryLogStorage {
        &self.storage
    }
}

impl LogDeviceFactory for MemoryLogDeviceFactory {
    fn open_log_device(&self, scan_fn: &mut ScanFn<'_>) -> PagelogResult<Arc<dyn LogDevice>> {
        {
            let mut state = self.storage.state.lock();
            state.halted = false;
            state.closed = false;
        }
        let device = Arc::new(MemoryLogDevice {
            capacity: self.storage.capacity,
            state: Arc::clone(&self.storage.state),
        });
        let consumed = {
            let mut reader = device.reader_snapshot(None, LogReadMode::Durable);
            scan_fn(&mut reader)?
        };
        // Recovery consumed data up to `consumed`; anything past it (a torn
        // tail, or bytes that were never durable) is discarded before the
        // writer takes over.
        {
            let mut state = self.storage.state.lock();
            assert!(consumed >= state.base_offset);
            let keep = (consumed - state.base_offset) as usize;
            state.bytes.truncate(keep);
            state.durable_upper = consumed;
        }
        Ok(device)
    }
}
