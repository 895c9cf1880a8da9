//! Consumer handle: reads slot payloads with generation validation

use crate::coordinator::SlotRWCoordinator;
use crate::error::{DataBlockError, DataBlockResult};
use crate::metrics::record_bytes_read;
use crate::platform::{get_current_pid, now_ns};
use crate::segment::DataBlockSegment;
use datablock_common::config::resolve_shm_dir;
use datablock_common::layout::region_checksum;
use std::path::Path;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Reads slot payloads and keeps a heartbeat entry in the segment.
///
/// The heartbeat is keyed by PID, so every consumer in one process shares a
/// single entry.
#[derive(Debug)]
pub struct DataBlockConsumer {
    segment: DataBlockSegment,
    pid: u64,
}

impl DataBlockConsumer {
    /// Attach to segment `name` in the default shm directory.
    pub fn attach(name: &str) -> DataBlockResult<Self> {
        Self::attach_in(&resolve_shm_dir(None), name)
    }

    /// Attach to segment `name` in `dir`.
    pub fn attach_in(dir: &Path, name: &str) -> DataBlockResult<Self> {
        Self::from_segment(DataBlockSegment::open_in(dir, name)?)
    }

    /// Consume from an already mapped segment.
    pub fn from_segment(segment: DataBlockSegment) -> DataBlockResult<Self> {
        let pid = get_current_pid();
        let entry = segment
            .header()
            .register_consumer(pid, now_ns())
            .ok_or(DataBlockError::HeartbeatTableFull)?;
        info!(segment = segment.name(), pid, entry, "consumer attached");
        Ok(Self { segment, pid })
    }

    /// The underlying segment.
    pub fn segment(&self) -> &DataBlockSegment {
        &self.segment
    }

    /// Copy the payload of slot `index`.
    ///
    /// Returns the generation together with the bytes. Fails with
    /// `VersionConflict` if the slot was rewritten during the copy.
    pub fn read_slot(&self, index: usize, timeout_ms: i32) -> DataBlockResult<(u64, Vec<u8>)> {
        let (generation, bytes) = self.read_window(index, timeout_ms, <[u8]>::to_vec)?;
        record_bytes_read(self.segment.header(), bytes.len() as u64);
        Ok((generation, bytes))
    }

    /// Check slot `index` against its stored checksum.
    pub fn verify_checksum_slot(&self, index: usize) -> DataBlockResult<()> {
        if !self.segment.header().checksums_enabled() {
            return Err(DataBlockError::InvalidArgument(
                "segment was created without checksums".to_string(),
            ));
        }
        let checksum = self.segment.slot_checksum(index)?;
        let (_, (stored, computed)) =
            self.read_window(index, 0, |bytes| (checksum.load(), region_checksum(bytes)))?;

        match stored {
            Some(stored) if stored == computed => Ok(()),
            Some(stored) => Err(DataBlockError::ChecksumMismatch {
                index,
                stored,
                computed,
            }),
            None => Err(DataBlockError::Corrupted {
                reason: format!("slot {index} has no stored checksum"),
            }),
        }
    }

    /// Copy the flexible zone.
    pub fn read_flexible_zone(&self) -> DataBlockResult<Vec<u8>> {
        self.segment.flexible_zone_bytes()
    }

    /// Refresh this process's heartbeat entry.
    ///
    /// Re-registers if a sweep removed the entry.
    pub fn heartbeat(&self) -> DataBlockResult<()> {
        let header = self.segment.header();
        if header.update_heartbeat(self.pid, now_ns()) {
            return Ok(());
        }
        warn!(segment = self.segment.name(), pid = self.pid, "heartbeat entry lost, re-registering");
        header
            .register_consumer(self.pid, now_ns())
            .map(|_| ())
            .ok_or(DataBlockError::HeartbeatTableFull)
    }

    fn read_window<T>(
        &self,
        index: usize,
        timeout_ms: i32,
        read: impl FnOnce(&[u8]) -> T,
    ) -> DataBlockResult<(u64, T)> {
        let coordinator = SlotRWCoordinator::with_header(
            self.segment.slot_state(index)?,
            self.segment.header(),
        );
        let payload = self.segment.payload_ptr(index)?;
        let unit = self.segment.layout().logical_unit_size() as usize;

        let generation = coordinator.acquire_read(timeout_ms)?;
        // Safety: inside the read window no writer touches the payload
        let value = read(unsafe { std::slice::from_raw_parts(payload.as_ptr(), unit) });
        let valid = coordinator.validate_read(generation);
        coordinator.release_read()?;

        if !valid {
            debug!(slot = index, generation, "read invalidated by a newer generation");
            return Err(DataBlockError::VersionConflict { index });
        }
        Ok((generation, value))
    }
}

impl Drop for DataBlockConsumer {
    fn drop(&mut self) {
        let header = self.segment.header();
        if header.unregister_consumer(self.pid) {
            debug!(
                segment = self.segment.name(),
                pid = self.pid,
                remaining = header.active_consumer_count.load(Ordering::Relaxed),
                "consumer detached"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SlotError;
    use crate::producer::DataBlockProducer;
    use crate::segment::DataBlockLayout;
    use tempfile::TempDir;

    fn setup(checksums: bool) -> (TempDir, String, DataBlockProducer) {
        let dir = TempDir::new().unwrap();
        let name = format!("consumer_test_{}", std::process::id());
        let layout = DataBlockLayout::new(4, 8)
            .flexible_zone_size(16)
            .checksums(checksums);
        let producer = DataBlockProducer::create_in(dir.path(), &name, layout).unwrap();
        (dir, name, producer)
    }

    #[test]
    fn test_read_committed_slot() {
        let (dir, name, producer) = setup(false);
        let generation = producer.write_slot(0, b"abc", 0).unwrap();

        let consumer = DataBlockConsumer::attach_in(dir.path(), &name).unwrap();
        let (read_generation, bytes) = consumer.read_slot(0, 0).unwrap();
        assert_eq!(read_generation, generation);
        assert_eq!(&bytes[..3], b"abc");
        assert_eq!(bytes.len(), 8);

        let header = consumer.segment().header();
        assert_eq!(header.metrics.total_slots_read.load(Ordering::Relaxed), 1);
        assert_eq!(header.metrics.total_bytes_read.load(Ordering::Relaxed), 8);
        assert_eq!(consumer.segment().slot_state(0).unwrap().readers(), 0);
    }

    #[test]
    fn test_read_uncommitted_slot() {
        let (dir, name, _producer) = setup(false);
        let consumer = DataBlockConsumer::attach_in(dir.path(), &name).unwrap();
        assert!(matches!(
            consumer.read_slot(1, 0),
            Err(DataBlockError::Slot {
                source: SlotError::NotReady
            })
        ));
    }

    #[test]
    fn test_heartbeat_registration_lifecycle() {
        let (dir, name, producer) = setup(false);
        let header = producer.segment().header();

        let consumer = DataBlockConsumer::attach_in(dir.path(), &name).unwrap();
        assert_eq!(header.active_consumer_count.load(Ordering::Relaxed), 1);
        consumer.heartbeat().unwrap();

        // A sweep that wrongly removed us is healed by the next heartbeat
        header.unregister_consumer(get_current_pid());
        consumer.heartbeat().unwrap();
        assert_eq!(header.active_consumer_count.load(Ordering::Relaxed), 1);

        drop(consumer);
        assert_eq!(header.active_consumer_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_checksum_verification() {
        let (dir, name, producer) = setup(true);
        producer.write_slot(2, b"data", 0).unwrap();
        let consumer = DataBlockConsumer::attach_in(dir.path(), &name).unwrap();
        consumer.verify_checksum_slot(2).unwrap();

        producer.segment().slot_checksum(2).unwrap().store(1);
        assert!(matches!(
            consumer.verify_checksum_slot(2),
            Err(DataBlockError::ChecksumMismatch { index: 2, stored: 1, .. })
        ));
    }

    #[test]
    fn test_flexible_zone_is_shared() {
        let (dir, name, producer) = setup(true);
        producer.write_flexible_zone(b"zone").unwrap();
        let consumer = DataBlockConsumer::attach_in(dir.path(), &name).unwrap();
        assert_eq!(&consumer.read_flexible_zone().unwrap()[..4], b"zone");
    }
}
