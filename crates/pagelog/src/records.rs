//! WAL slot framing and payload codecs.
//!
//! Every slot is a fixed 16-byte header followed by a variant payload:
//!
//! ```text
//! | payload_len: u32 | tag: u16 | flags: u16 | payload_crc64: u64 | payload... |
//! ```
//!
//! Fields are little-endian. Readers dispatch on the tag; a CRC mismatch or
//! an unknown tag is a corruption error, while an incomplete frame at the
//! log tail terminates the scan (torn tails are expected after a crash).

use byteorder::{ByteOrder, LittleEndian};
use crc64fast_nvme::Digest;
use uuid::Uuid;

use crate::device::LogReader;
use crate::error::{PagelogError, PagelogResult};
use crate::page::PageId;
use crate::slot::{SlotOffset, SlotRange};

pub const SLOT_HEADER_LEN: usize = 16;

pub const TAG_RECYCLER_INFO: u16 = 1;
pub const TAG_RECYCLER_PAGE_INSERT: u16 = 2;
pub const TAG_RECYCLER_PAGE_PREPARE: u16 = 3;
pub const TAG_RECYCLER_BATCH_COMMIT: u16 = 4;

pub const TAG_VOLUME_IDS: u16 = 16;
pub const TAG_VOLUME_ATTACH: u16 = 17;
pub const TAG_VOLUME_PREPARE_JOB: u16 = 18;
pub const TAG_VOLUME_COMMIT_JOB: u16 = 19;
pub const TAG_VOLUME_ROLLBACK_JOB: u16 = 20;

pub const RECYCLER_INFO_PAYLOAD_LEN: usize = 28;
pub const RECYCLER_PAGE_INSERT_PAYLOAD_LEN: usize = 12;
pub const RECYCLER_PAGE_PREPARE_PAYLOAD_LEN: usize = 20;
pub const RECYCLER_BATCH_COMMIT_PAYLOAD_LEN: usize = 8;

pub fn crc64(bytes: &[u8]) -> u64 {
    if bytes.is_empty() {
        return 0;
    }
    let mut digest = Digest::new();
    digest.write(bytes);
    digest.sum64()
}

/// A value that can occupy a WAL slot.
pub trait SlotPayload: Sized {
    fn tag(&self) -> u16;
    fn encoded_len(&self) -> usize;
    fn encode_payload(&self, buf: &mut Vec<u8>);
    fn decode(tag: u16, payload: &[u8]) -> PagelogResult<Self>;
}

/// Total on-log size of `payload`, header included.
pub fn packed_size_of(payload: &impl SlotPayload) -> u64 {
    (SLOT_HEADER_LEN + payload.encoded_len()) as u64
}

/// Serialize `payload` into a complete framed slot.
pub fn encode_slot(payload: &impl SlotPayload) -> PagelogResult<Vec<u8>> {
    let mut body = Vec::with_capacity(payload.encoded_len());
    payload.encode_payload(&mut body);
    if body.len() > u32::MAX as usize {
        return Err(PagelogError::invalid_config("slot payload too large"));
    }
    let mut slot = Vec::with_capacity(SLOT_HEADER_LEN + body.len());
    slot.resize(SLOT_HEADER_LEN, 0);
    LittleEndian::write_u32(&mut slot[0..4], body.len() as u32);
    LittleEndian::write_u16(&mut slot[4..6], payload.tag());
    LittleEndian::write_u16(&mut slot[6..8], 0);
    LittleEndian::write_u64(&mut slot[8..16], crc64(&body));
    slot.extend_from_slice(&body);
    Ok(slot)
}

/// Events recorded in the recycler's WAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecyclerEvent {
    /// Periodically refreshed anchor; trimming never passes the latest one.
    Info {
        uuid: Uuid,
        max_refs_per_page: u32,
        batch_size: u32,
        info_refresh_rate: u32,
    },
    /// A page entered the pending set.
    PageInsert { page_id: PageId, depth: u32 },
    /// A page was pulled into the batch identified by `batch_slot`.
    PagePrepare {
        page_id: PageId,
        depth: u32,
        batch_slot: SlotOffset,
    },
    /// The ref-count decrement for the batch completed.
    BatchCommit { batch_slot: SlotOffset },
}

impl SlotPayload for RecyclerEvent {
    fn tag(&self) -> u16 {
        match self {
            RecyclerEvent::Info { .. } => TAG_RECYCLER_INFO,
            RecyclerEvent::PageInsert { .. } => TAG_RECYCLER_PAGE_INSERT,
            RecyclerEvent::PagePrepare { .. } => TAG_RECYCLER_PAGE_PREPARE,
            RecyclerEvent::BatchCommit { .. } => TAG_RECYCLER_BATCH_COMMIT,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            RecyclerEvent::Info { .. } => RECYCLER_INFO_PAYLOAD_LEN,
            RecyclerEvent::PageInsert { .. } => RECYCLER_PAGE_INSERT_PAYLOAD_LEN,
            RecyclerEvent::PagePrepare { .. } => RECYCLER_PAGE_PREPARE_PAYLOAD_LEN,
            RecyclerEvent::BatchCommit { .. } => RECYCLER_BATCH_COMMIT_PAYLOAD_LEN,
        }
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        match self {
            RecyclerEvent::Info {
                uuid,
                max_refs_per_page,
                batch_size,
                info_refresh_rate,
            } => {
                buf.extend_from_slice(uuid.as_bytes());
                write_u32(buf, *max_refs_per_page);
                write_u32(buf, *batch_size);
                write_u32(buf, *info_refresh_rate);
            }
            RecyclerEvent::PageInsert { page_id, depth } => {
                write_u64(buf, page_id.as_u64());
                write_u32(buf, *depth);
            }
            RecyclerEvent::PagePrepare {
                page_id,
                depth,
                batch_slot,
            } => {
                write_u64(buf, page_id.as_u64());
                write_u32(buf, *depth);
                write_u64(buf, *batch_slot);
            }
            RecyclerEvent::BatchCommit { batch_slot } => {
                write_u64(buf, *batch_slot);
            }
        }
    }

    fn decode(tag: u16, payload: &[u8]) -> PagelogResult<Self> {
        let mut cursor = PayloadCursor::new(payload);
        let event = match tag {
            TAG_RECYCLER_INFO => RecyclerEvent::Info {
                uuid: cursor.read_uuid()?,
                max_refs_per_page: cursor.read_u32()?,
                batch_size: cursor.read_u32()?,
                info_refresh_rate: cursor.read_u32()?,
            },
            TAG_RECYCLER_PAGE_INSERT => RecyclerEvent::PageInsert {
                page_id: PageId::new(cursor.read_u64()?),
                depth: cursor.read_u32()?,
            },
            TAG_RECYCLER_PAGE_PREPARE => RecyclerEvent::PagePrepare {
                page_id: PageId::new(cursor.read_u64()?),
                depth: cursor.read_u32()?,
                batch_slot: cursor.read_u64()?,
            },
            TAG_RECYCLER_BATCH_COMMIT => RecyclerEvent::BatchCommit {
                batch_slot: cursor.read_u64()?,
            },
            other => {
                return Err(PagelogError::corruption(format!(
                    "unknown recycler slot tag: {other}"
                )));
            }
        };
        cursor.finish()?;
        Ok(event)
    }
}

/// Persisted volume identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeIds {
    pub main_uuid: Uuid,
    pub recycler_uuid: Uuid,
    pub trimmer_uuid: Uuid,
}

/// Events recorded in a volume's root WAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeEvent {
    Ids(VolumeIds),
    Attach {
        client_uuid: Uuid,
        device_id: u64,
    },
    /// First phase of a job: durably declares intent before side effects.
    PrepareJob {
        new_pages: Vec<PageId>,
        deleted_pages: Vec<PageId>,
        user_data: Vec<u8>,
    },
    /// Second phase: the side effects of the prepare at `prepare_slot` were
    /// applied.
    CommitJob {
        prepare_slot: SlotOffset,
    },
    /// The prepare at `prepare_slot` was abandoned during recovery.
    RollbackJob {
        prepare_slot: SlotOffset,
    },
}

impl SlotPayload for VolumeEvent {
    fn tag(&self) -> u16 {
        match self {
            VolumeEvent::Ids(_) => TAG_VOLUME_IDS,
            VolumeEvent::Attach { .. } => TAG_VOLUME_ATTACH,
            VolumeEvent::PrepareJob { .. } => TAG_VOLUME_PREPARE_JOB,
            VolumeEvent::CommitJob { .. } => TAG_VOLUME_COMMIT_JOB,
            VolumeEvent::RollbackJob { .. } => TAG_VOLUME_ROLLBACK_JOB,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            VolumeEvent::Ids(_) => 48,
            VolumeEvent::Attach { .. } => 24,
            VolumeEvent::PrepareJob {
                new_pages,
                deleted_pages,
                user_data,
            } => 12 + new_pages.len() * 8 + deleted_pages.len() * 8 + user_data.len(),
            VolumeEvent::CommitJob { .. } | VolumeEvent::RollbackJob { .. } => 8,
        }
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        match self {
            VolumeEvent::Ids(ids) => {
                buf.extend_from_slice(ids.main_uuid.as_bytes());
                buf.extend_from_slice(ids.recycler_uuid.as_bytes());
                buf.extend_from_slice(ids.trimmer_uuid.as_bytes());
            }
            VolumeEvent::Attach {
                client_uuid,
                device_id,
            } => {
                buf.extend_from_slice(client_uuid.as_bytes());
                write_u64(buf, *device_id);
            }
            VolumeEvent::PrepareJob {
                new_pages,
                deleted_pages,
                user_data,
            } => {
                write_u32(buf, new_pages.len() as u32);
                for page_id in new_pages {
                    write_u64(buf, page_id.as_u64());
                }
                write_u32(buf, deleted_pages.len() as u32);
                for page_id in deleted_pages {
                    write_u64(buf, page_id.as_u64());
                }
                write_u32(buf, user_data.len() as u32);
                buf.extend_from_slice(user_data);
            }
            VolumeEvent::CommitJob { prepare_slot }
            | VolumeEvent::RollbackJob { prepare_slot } => {
                write_u64(buf, *prepare_slot);
            }
        }
    }

    fn decode(tag: u16, payload: &[u8]) -> PagelogResult<Self> {
        let mut cursor = PayloadCursor::new(payload);
        let event = match tag {
            TAG_VOLUME_IDS => VolumeEvent::Ids(VolumeIds {
                main_uuid: cursor.read_uuid()?,
                recycler_uuid: cursor.read_uuid()?,
                trimmer_uuid: cursor.read_uuid()?,
            }),
            TAG_VOLUME_ATTACH => VolumeEvent::Attach {
                client_uuid: cursor.read_uuid()?,
                device_id: cursor.read_u64()?,
            },
            TAG_VOLUME_PREPARE_JOB => {
                let new_count = cursor.read_u32()? as usize;
                let mut new_pages = Vec::with_capacity(new_count.min(1024));
                for _ in 0..new_count {
                    new_pages.push(PageId::new(cursor.read_u64()?));
                }
                let deleted_count = cursor.read_u32()? as usize;
                let mut deleted_pages = Vec::with_capacity(deleted_count.min(1024));
                for _ in 0..deleted_count {
                    deleted_pages.push(PageId::new(cursor.read_u64()?));
                }
                let data_len = cursor.read_u32()? as usize;
                let user_data = cursor.read_bytes(data_len)?.to_vec();
                VolumeEvent::PrepareJob {
                    new_pages,
                    deleted_pages,
                    user_data,
                }
            }
            TAG_VOLUME_COMMIT_JOB => VolumeEvent::CommitJob {
                prepare_slot: cursor.read_u64()?,
            },
            TAG_VOLUME_ROLLBACK_JOB => VolumeEvent::RollbackJob {
                prepare_slot: cursor.read_u64()?,
            },
            other => {
                return Err(PagelogError::corruption(format!(
                    "unknown volume slot tag: {other}"
                )));
            }
        };
        cursor.finish()?;
        Ok(event)
    }
}

/// Scan framed slots from `reader`, invoking `visit` for each decoded event.
///
/// Returns the number of slots consumed. An incomplete frame at the tail
/// ends the scan; a checksum mismatch or unknown tag fails it.
pub fn read_events<E: SlotPayload>(
    reader: &mut dyn LogReader,
    mut visit: impl FnMut(SlotRange, E) -> PagelogResult<()>,
) -> PagelogResult<usize> {
    let mut count = 0;
    loop {
        let lower_bound: SlotOffset = reader.slot_offset();
        let frame = {
            let buf = reader.peek();
            if buf.len() < SLOT_HEADER_LEN {
                break;
            }
            let payload_len = LittleEndian::read_u32(&buf[0..4]) as usize;
            if buf.len() < SLOT_HEADER_LEN + payload_len {
                // Torn tail: the slot was never completely appended.
                break;
            }
            let tag = LittleEndian::read_u16(&buf[4..6]);
            let expected_crc = LittleEndian::read_u64(&buf[8..16]);
            let payload = &buf[SLOT_HEADER_LEN..SLOT_HEADER_LEN + payload_len];
            if expected_crc != crc64(payload) {
                return Err(PagelogError::corruption(format!(
                    "slot crc mismatch at offset {lower_bound}"
                )));
            }
            (tag, payload.to_vec())
        };
        let (tag, payload) = frame;
        let total_len = SLOT_HEADER_LEN + payload.len();
        let event = E::decode(tag, &payload)?;
        reader.consume(total_len);
        let range = SlotRange {
            lower_bound,
            upper_bound: lower_bound.wrapping_add(total_len as u64),
        };
        visit(range, event)?;
        count += 1;
    }
    Ok(count)
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    let mut bytes = [0u8; 4];
    LittleEndian::write_u32(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

fn write_u64(buf: &mut Vec<u8>, value: u64) {
    let mut bytes = [0u8; 8];
    LittleEndian::write_u64(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

struct PayloadCursor<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl<'a> PayloadCursor<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { payload, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> PagelogResult<&'a [u8]> {
        if self.payload.len().saturating_sub(self.pos) < len {
            return Err(PagelogError::corruption("slot payload truncated"));
        }
        let bytes = &self.payload[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_u32(&mut self) -> PagelogResult<u32> {
        Ok(LittleEndian::read_u32(self.read_bytes(4)?))
    }

    fn read_u64(&mut self) -> PagelogResult<u64> {
        Ok(LittleEndian::read_u64(self.read_bytes(8)?))
    }

    fn read_uuid(&mut self) -> PagelogResult<Uuid> {
        let bytes = self.read_bytes(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        Ok(Uuid::from_bytes(raw))
    }

    fn finish(self) -> PagelogResult<()> {
        if self.pos != self.payload.len() {
            return Err(PagelogError::corruption("slot payload has trailing bytes"));
        }
        Ok(())
    }
}
