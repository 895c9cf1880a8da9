//! Producer handle: writes payloads into slots through the coordinator

use crate::coordinator::SlotRWCoordinator;
use crate::error::{DataBlockError, DataBlockResult};
use crate::metrics::record_bytes_written;
use crate::segment::{DataBlockLayout, DataBlockSegment};
use datablock_common::layout::region_checksum;
use std::path::Path;
use std::sync::atomic::Ordering;
use tracing::{debug, info};

/// Writes slot payloads and maintains their checksums.
///
/// Slot selection is the caller's policy. The flexible zone has no slot
/// protocol and is owned by a single producer.
#[derive(Debug)]
pub struct DataBlockProducer {
    segment: DataBlockSegment,
}

impl DataBlockProducer {
    /// Create a segment in the default shm directory and produce into it.
    pub fn create(name: &str, layout: DataBlockLayout) -> DataBlockResult<Self> {
        Ok(Self::attach(DataBlockSegment::create(name, layout)?))
    }

    /// Create a segment in `dir` and produce into it.
    pub fn create_in(dir: &Path, name: &str, layout: DataBlockLayout) -> DataBlockResult<Self> {
        Ok(Self::attach(DataBlockSegment::create_in(dir, name, layout)?))
    }

    /// Produce into an already mapped segment.
    pub fn attach(segment: DataBlockSegment) -> Self {
        info!(segment = segment.name(), "producer attached");
        Self { segment }
    }

    /// The underlying segment.
    pub fn segment(&self) -> &DataBlockSegment {
        &self.segment
    }

    /// Coordinator for slot `index` with metrics bookkeeping.
    pub fn coordinator(&self, index: usize) -> DataBlockResult<SlotRWCoordinator<'_>> {
        Ok(SlotRWCoordinator::with_header(
            self.segment.slot_state(index)?,
            self.segment.header(),
        ))
    }

    /// Write `data` into slot `index` and publish it.
    ///
    /// The unit is zero-padded past `data`. Returns the committed generation.
    pub fn write_slot(&self, index: usize, data: &[u8], timeout_ms: i32) -> DataBlockResult<u64> {
        let unit = self.segment.layout().logical_unit_size() as usize;
        if data.len() > unit {
            return Err(DataBlockError::InvalidArgument(format!(
                "{} bytes do not fit a {unit}-byte unit",
                data.len()
            )));
        }

        let coordinator = self.coordinator(index)?;
        let payload = self.segment.payload_ptr(index)?;
        let checksum = self.segment.slot_checksum(index)?;

        coordinator.acquire_write(timeout_ms)?;

        // Safety: the write lock is held and no reader is inside the slot
        let crc = unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), payload.as_ptr(), data.len());
            std::ptr::write_bytes(payload.as_ptr().add(data.len()), 0, unit - data.len());
            region_checksum(std::slice::from_raw_parts(payload.as_ptr(), unit))
        };
        if self.segment.header().checksums_enabled() {
            checksum.store(crc);
        }

        let generation = match coordinator.commit() {
            Ok(generation) => generation,
            Err(err) => {
                let _ = coordinator.release_write();
                return Err(err.into());
            }
        };
        coordinator.release_write()?;

        self.record_bytes_written(data.len() as u64);
        debug!(slot = index, generation, bytes = data.len(), "slot written");
        Ok(generation)
    }

    /// Recompute the checksum of a committed slot.
    ///
    /// The payload is hashed inside a read window so no writer can change it
    /// meanwhile.
    pub fn update_checksum_slot(&self, index: usize) -> DataBlockResult<u32> {
        self.require_checksums()?;
        let state = self.segment.slot_state(index)?;
        let payload = self.segment.payload_ptr(index)?;
        let unit = self.segment.layout().logical_unit_size() as usize;

        // No header: recomputing is not consumer traffic
        let coordinator = SlotRWCoordinator::new(state);
        let generation = coordinator.acquire_read(0)?;
        // Safety: inside the read window the payload is stable
        let crc = region_checksum(unsafe { std::slice::from_raw_parts(payload.as_ptr(), unit) });
        let stable = coordinator.validate_read(generation);
        if stable {
            self.segment.slot_checksum(index)?.store(crc);
        }
        coordinator.release_read()?;

        if !stable {
            return Err(DataBlockError::VersionConflict { index });
        }
        Ok(crc)
    }

    /// Copy `data` into the flexible zone, zero-padding the rest.
    pub fn write_flexible_zone(&self, data: &[u8]) -> DataBlockResult<()> {
        let size = self.segment.layout().zone_size() as usize;
        if data.len() > size {
            return Err(DataBlockError::InvalidArgument(format!(
                "{} bytes do not fit a {size}-byte flexible zone",
                data.len()
            )));
        }
        let zone = self.segment.flexible_zone_ptr()?;
        // Safety: `flexible_zone_ptr` checked `size` bytes are mapped
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), zone.as_ptr(), data.len());
            std::ptr::write_bytes(zone.as_ptr().add(data.len()), 0, size - data.len());
        }
        if self.segment.header().checksums_enabled() {
            self.update_checksum_flexible_zone()?;
        }
        Ok(())
    }

    /// Recompute the checksum of the flexible zone.
    pub fn update_checksum_flexible_zone(&self) -> DataBlockResult<u32> {
        self.require_checksums()?;
        let crc = region_checksum(&self.segment.flexible_zone_bytes()?);
        let header = self.segment.header();
        header.flexible_zone_checksum.store(crc, Ordering::Relaxed);
        header
            .flexible_zone_checksum_valid
            .store(1, Ordering::Release);
        Ok(crc)
    }

    /// Account payload bytes written outside [`write_slot`](Self::write_slot).
    pub fn record_bytes_written(&self, bytes: u64) {
        record_bytes_written(self.segment.header(), bytes);
    }

    fn require_checksums(&self) -> DataBlockResult<()> {
        if !self.segment.header().checksums_enabled() {
            return Err(DataBlockError::InvalidArgument(
                "segment was created without checksums".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SlotError;
    use crate::slot::SlotState;
    use tempfile::TempDir;

    fn producer(dir: &TempDir, checksums: bool) -> DataBlockProducer {
        let name = format!("producer_test_{}", std::process::id());
        let layout = DataBlockLayout::new(4, 16)
            .flexible_zone_size(32)
            .checksums(checksums);
        DataBlockProducer::create_in(dir.path(), &name, layout).unwrap()
    }

    #[test]
    fn test_write_slot_publishes_payload() {
        let dir = TempDir::new().unwrap();
        let producer = producer(&dir, true);

        assert_eq!(producer.write_slot(1, b"hello", 0).unwrap(), 1);
        assert_eq!(producer.write_slot(1, b"hi", 0).unwrap(), 2);

        let segment = producer.segment();
        let state = segment.slot_state(1).unwrap();
        assert_eq!(state.state(), Some(SlotState::Committed));
        assert_eq!(state.writer_pid(), 0);

        let bytes = segment.payload_bytes(1).unwrap();
        assert_eq!(&bytes[..2], b"hi");
        assert!(bytes[2..].iter().all(|&b| b == 0));
        assert_eq!(
            segment.slot_checksum(1).unwrap().load(),
            Some(region_checksum(&bytes))
        );
        assert_eq!(segment.header().commit_index.load(Ordering::Relaxed), 2);
        assert_eq!(
            segment.header().metrics.total_bytes_written.load(Ordering::Relaxed),
            7
        );
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let dir = TempDir::new().unwrap();
        let producer = producer(&dir, false);
        let err = producer.write_slot(0, &[0u8; 17], 0).unwrap_err();
        assert!(matches!(err, DataBlockError::InvalidArgument(_)));
        assert!(matches!(
            producer.write_slot(4, b"x", 0),
            Err(DataBlockError::InvalidSlot { .. })
        ));
    }

    #[test]
    fn test_write_blocked_by_other_writer() {
        let dir = TempDir::new().unwrap();
        let producer = producer(&dir, false);
        let other = producer.coordinator(0).unwrap().with_pid(u64::from(u32::MAX) + 7);
        other.acquire_write(0).unwrap();

        assert!(matches!(
            producer.write_slot(0, b"x", 0),
            Err(DataBlockError::Slot {
                source: SlotError::Locked
            })
        ));
        other.release_write().unwrap();
        assert!(producer.write_slot(0, b"x", 0).is_ok());
    }

    #[test]
    fn test_checksum_recompute() {
        let dir = TempDir::new().unwrap();
        let producer = producer(&dir, true);
        producer.write_slot(2, b"payload", 0).unwrap();

        let checksum = producer.segment().slot_checksum(2).unwrap();
        let expected = checksum.load().unwrap();
        checksum.store(0xBAD);
        assert_eq!(producer.update_checksum_slot(2).unwrap(), expected);
        assert_eq!(checksum.load(), Some(expected));

        // Never committed
        assert!(producer.update_checksum_slot(3).is_err());
    }

    #[test]
    fn test_checksum_ops_need_checksums() {
        let dir = TempDir::new().unwrap();
        let producer = producer(&dir, false);
        producer.write_slot(0, b"x", 0).unwrap();
        assert!(producer.segment().slot_checksum(0).unwrap().load().is_none());
        assert!(matches!(
            producer.update_checksum_slot(0),
            Err(DataBlockError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_flexible_zone() {
        let dir = TempDir::new().unwrap();
        let producer = producer(&dir, true);
        producer.write_flexible_zone(b"config-v1").unwrap();

        let header = producer.segment().header();
        let zone = producer.segment().flexible_zone_bytes().unwrap();
        assert_eq!(&zone[..9], b"config-v1");
        assert_eq!(header.flexible_zone_checksum_valid.load(Ordering::Relaxed), 1);
        assert_eq!(
            header.flexible_zone_checksum.load(Ordering::Relaxed),
            region_checksum(&zone)
        );
        assert!(producer.write_flexible_zone(&[1u8; 33]).is_err());
    }
}
