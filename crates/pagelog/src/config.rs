//! Configuration types: recycler sizing, volume options, and the packed
//! on-disk log device config slot.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::LogDevice;
use crate::error::{PagelogError, PagelogResult};
use crate::page::MAX_PAGE_REF_DEPTH;
use crate::records::{
    RECYCLER_BATCH_COMMIT_PAYLOAD_LEN, RECYCLER_INFO_PAYLOAD_LEN,
    RECYCLER_PAGE_INSERT_PAYLOAD_LEN, RECYCLER_PAGE_PREPARE_PAYLOAD_LEN, SLOT_HEADER_LEN,
};
use crate::slot::{LogReadMode, SlotOffset};

/// Default reference fan-out bound per page.
const DEFAULT_MAX_REFS_PER_PAGE: u32 = 16;

/// Default info-slot budget in the recycler WAL.
const DEFAULT_INFO_REFRESH_RATE: u32 = 4;

/// Fixed slack added to the computed minimum WAL size.
const RECYCLER_LOG_SLACK: u64 = 1024;

/// Tuning knobs for a `PageRecycler` and the sizing derivations its WAL
/// grant accounting is built on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecyclerOptions {
    /// Bound on reference fan-out per page; cascades at any depth stay
    /// within this bound.
    pub max_refs_per_page: u32,
    /// Pages drained per batch.
    pub batch_size: usize,
    /// How many info slots are budgeted in the WAL.
    pub info_refresh_rate: u32,
}

impl Default for RecyclerOptions {
    fn default() -> Self {
        Self::with_max_refs(DEFAULT_MAX_REFS_PER_PAGE)
    }
}

impl RecyclerOptions {
    pub fn with_max_refs(max_refs_per_page: u32) -> Self {
        Self {
            max_refs_per_page,
            batch_size: max_refs_per_page as usize,
            info_refresh_rate: DEFAULT_INFO_REFRESH_RATE,
        }
    }

    /// WAL bytes consumed by one page-insert slot.
    pub fn insert_grant_size(&self) -> u64 {
        (SLOT_HEADER_LEN + RECYCLER_PAGE_INSERT_PAYLOAD_LEN) as u64
    }

    /// WAL bytes consumed by one page-prepare slot.
    pub fn prepare_slot_size(&self) -> u64 {
        (SLOT_HEADER_LEN + RECYCLER_PAGE_PREPARE_PAYLOAD_LEN) as u64
    }

    /// WAL bytes consumed by one batch-commit slot.
    pub fn commit_slot_size(&self) -> u64 {
        (SLOT_HEADER_LEN + RECYCLER_BATCH_COMMIT_PAYLOAD_LEN) as u64
    }

    /// WAL bytes consumed by one info slot.
    pub fn info_slot_size(&self) -> u64 {
        (SLOT_HEADER_LEN + RECYCLER_INFO_PAYLOAD_LEN) as u64
    }

    /// Worst-case WAL bytes one page consumes across its lifecycle.
    pub fn total_page_grant_size(&self) -> u64 {
        self.insert_grant_size() + self.prepare_slot_size() + self.commit_slot_size()
    }

    /// Credit one page may still consume when it enters at `depth`: an
    /// insert slot for itself and for each remaining cascade level.
    pub fn total_grant_size_for_depth(&self, depth: u32) -> u64 {
        let remaining_levels = MAX_PAGE_REF_DEPTH.saturating_sub(depth) as u64;
        self.insert_grant_size() * remaining_levels.max(1)
    }

    /// Floor credit for the background task: a full batch of prepares, the
    /// worst-case cascade inserts those deletes can trigger, one batch
    /// commit, and one info refresh.
    pub fn recycle_task_target(&self) -> u64 {
        let batch = self.batch_size as u64;
        batch * (self.prepare_slot_size() + self.max_refs_per_page as u64 * self.insert_grant_size())
            + self.commit_slot_size()
            + self.info_slot_size()
    }

    /// True when the latest info slot is old enough that the next trim
    /// window could reach it.
    pub fn info_needs_refresh(&self, info_slot: SlotOffset, device: &dyn LogDevice) -> bool {
        let upper = device.slot_range(LogReadMode::Speculative).upper_bound;
        let window = device.capacity() as u64 / (self.info_refresh_rate as u64 + 1);
        upper.wrapping_sub(info_slot) >= window
    }
}

/// Minimum sufficient recycler WAL size for the given options.
///
/// `max_buffered_pages` bounds how many pages may sit in the pending set at
/// once; it defaults to `max_refs_per_page`.
pub fn calculate_recycler_log_size(
    options: &RecyclerOptions,
    max_buffered_pages: Option<u64>,
) -> u64 {
    let buffered = max_buffered_pages.unwrap_or(options.max_refs_per_page as u64);
    options.total_page_grant_size() * (1 + buffered)
        + options.recycle_task_target()
        + options.info_slot_size() * (options.info_refresh_rate as u64 + 1)
        + RECYCLER_LOG_SLACK
}

/// Options for recovering a `Volume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeOptions {
    /// Name used for task labels and metric keys.
    pub name: String,
    /// Preferred main UUID; a random one is generated when absent and no
    /// persisted identity exists.
    pub uuid: Option<Uuid>,
    pub recycler: RecyclerOptions,
}

impl VolumeOptions {
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: None,
            recycler: RecyclerOptions::default(),
        }
    }
}

/// Size of one packed config slot.
pub const PACKED_CONFIG_SLOT_LEN: usize = 64;

/// Config slot tag identifying a log device entry.
pub const CONFIG_TAG_LOG_DEVICE: u32 = 1;

/// On-disk configuration entry for a log device: a fixed 64-byte
/// little-endian slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedLogDeviceConfig {
    /// log2 of the number of 4 KiB pages per flush block. Higher values
    /// trade latency for throughput.
    pub pages_per_block_log2: u16,
    /// File offset of flush block 0, relative to this structure.
    pub block_0_offset: i64,
    /// Total size of the log in bytes.
    pub physical_size: u64,
    /// Logical size of the log; excludes block headers.
    pub logical_size: u64,
    pub uuid: Uuid,
}

impl PackedLogDeviceConfig {
    pub fn pages_per_block(&self) -> usize {
        1usize << self.pages_per_block_log2
    }

    pub fn block_size(&self) -> usize {
        4 * 1024 * self.pages_per_block()
    }

    pub fn encode(&self) -> [u8; PACKED_CONFIG_SLOT_LEN] {
        let mut buf = [0u8; PACKED_CONFIG_SLOT_LEN];
        LittleEndian::write_u32(&mut buf[0..4], CONFIG_TAG_LOG_DEVICE);
        // buf[4..6] reserved, zero.
        LittleEndian::write_u16(&mut buf[6..8], self.pages_per_block_log2);
        LittleEndian::write_i64(&mut buf[8..16], self.block_0_offset);
        LittleEndian::write_u64(&mut buf[16..24], self.physical_size);
        LittleEndian::write_u64(&mut buf[24..32], self.logical_size);
        buf[32..48].copy_from_slice(self.uuid.as_bytes());
        // buf[48..64] reserved, zero.
        buf
    }

    pub fn decode(bytes: &[u8]) -> PagelogResult<Self> {
        if bytes.len() < PACKED_CONFIG_SLOT_LEN {
            return Err(PagelogError::corruption("log device config truncated"));
        }
        let tag = LittleEndian::read_u32(&bytes[0..4]);
        if tag != CONFIG_TAG_LOG_DEVICE {
            return Err(PagelogError::corruption(format!(
                "unexpected config slot tag: {tag}"
            )));
        }
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&bytes[32..48]);
        Ok(Self {
            pages_per_block_log2: LittleEndian::read_u16(&bytes[6..8]),
            block_0_offset: LittleEndian::read_i64(&bytes[8..16]),
            physical_size: LittleEndian::read_u64(&bytes[16..24]),
            logical_size: LittleEndian::read_u64(&bytes[24..32]),
            uuid: Uuid::from_bytes(uuid_bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_target_covers_a_full_batch_and_cascade() {
        let options = RecyclerOptions::with_max_refs(8);
        let target = options.recycle_task_target();
        assert!(target >= options.batch_size as u64 * options.prepare_slot_size());
        assert!(
            target
                >= options.batch_size as u64
                    * options.max_refs_per_page as u64
                    * options.insert_grant_size()
        );
    }

    #[test]
    fn log_size_exceeds_task_target_plus_insert_budget() {
        let options = RecyclerOptions::default();
        let log_size = calculate_recycler_log_size(&options, None);
        assert!(log_size >= options.recycle_task_target() + options.insert_grant_size());
        assert!(log_size >= options.info_slot_size() * (options.info_refresh_rate as u64 + 1));
    }

    #[test]
    fn device_config_roundtrip_and_block_math() {
        let config = PackedLogDeviceConfig {
            pages_per_block_log2: 3,
            block_0_offset: 4096,
            physical_size: 1 << 20,
            logical_size: (1 << 20) - 4096,
            uuid: Uuid::from_u128(0xfeed),
        };
        let bytes = config.encode();
        assert_eq!(bytes.len(), PACKED_CONFIG_SLOT_LEN);
        assert_eq!(&bytes[4..6], &[0, 0]);
        assert_eq!(&bytes[48..64], &[0u8; 16]);

        let decoded = PackedLogDeviceConfig::decode(&bytes).expect("decode");
        assert_eq!(decoded, config);
        assert_eq!(decoded.pages_per_block(), 8);
        assert_eq!(decoded.block_size(), 32 * 1024);
    }

    #[test]
    fn device_config_rejects_wrong_tag() {
        let config = PackedLogDeviceConfig {
            pages_per_block_log2: 0,
            block_0_offset: 0,
            physical_size: 0,
            logical_size: 0,
            uuid: Uuid::nil(),
        };
        let mut bytes = config.encode();
        bytes[0] = 0xFF;
        assert!(matches!(
            PackedLogDeviceConfig::decode(&bytes),
            Err(PagelogError::Corruption(_))
        ));
    }
}
