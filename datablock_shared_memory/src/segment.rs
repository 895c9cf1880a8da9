//! Segment layout and memory mapping
//!
//! A segment is a single file in the shm directory holding, in order:
//!
//! ```text
//! [header][SlotRWState x capacity][SlotChecksum x capacity][flexible zone][payload x capacity]
//! ```
//!
//! Every region starts on a cache line and the file is rounded up to the
//! physical page size.

use crate::error::{DataBlockError, DataBlockResult};
use crate::header::SharedMemoryHeader;
use crate::platform::{attach_segment_mmap, create_segment_mmap};
use crate::slot::{SlotChecksum, SlotRWState};
use datablock_common::config::resolve_shm_dir;
use datablock_common::consts::{
    CACHE_LINE_SIZE, DATABLOCK_MAGIC, DATABLOCK_VERSION_MAJOR, DEFAULT_PAGE_SIZE,
    HEADER_FLAG_CHECKSUMS, MAX_RING_CAPACITY, SHM_MAX_SIZE, SHM_PREFIX,
};
use datablock_common::layout::LayoutHasher;
use memmap2::MmapMut;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{Ordering, fence};
use tracing::{debug, info};

const fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Immutable layout parameters of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlockLayout {
    capacity: u32,
    logical_unit_size: u32,
    physical_page_size: u32,
    flexible_zone_size: u32,
    checksums: bool,
}

impl DataBlockLayout {
    /// Ring of `capacity` slots carrying `logical_unit_size` bytes each.
    pub const fn new(capacity: u32, logical_unit_size: u32) -> Self {
        Self {
            capacity,
            logical_unit_size,
            physical_page_size: DEFAULT_PAGE_SIZE,
            flexible_zone_size: 0,
            checksums: false,
        }
    }

    /// Page size the segment is rounded up to.
    pub const fn physical_page_size(mut self, size: u32) -> Self {
        self.physical_page_size = size;
        self
    }

    /// Size of the auxiliary flexible zone.
    pub const fn flexible_zone_size(mut self, size: u32) -> Self {
        self.flexible_zone_size = size;
        self
    }

    /// Maintain per-slot and flexible-zone checksums.
    pub const fn checksums(mut self, enabled: bool) -> Self {
        self.checksums = enabled;
        self
    }

    /// Number of slots.
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Payload bytes per slot.
    pub const fn logical_unit_size(&self) -> u32 {
        self.logical_unit_size
    }

    /// Page size.
    pub const fn page_size(&self) -> u32 {
        self.physical_page_size
    }

    /// Flexible zone size.
    pub const fn zone_size(&self) -> u32 {
        self.flexible_zone_size
    }

    /// Whether checksums are maintained.
    pub const fn checksums_enabled(&self) -> bool {
        self.checksums
    }

    /// Header flags for this layout.
    pub const fn flags(&self) -> u32 {
        if self.checksums {
            HEADER_FLAG_CHECKSUMS
        } else {
            0
        }
    }

    /// Reject layouts that cannot be mapped.
    pub fn validate(&self) -> DataBlockResult<()> {
        let invalid = |reason: String| Err(DataBlockError::InvalidLayout { reason });

        if self.capacity == 0 || self.capacity > MAX_RING_CAPACITY {
            return invalid(format!(
                "capacity {} outside 1..={MAX_RING_CAPACITY}",
                self.capacity
            ));
        }
        if self.logical_unit_size == 0 {
            return invalid("logical unit size must be non-zero".to_string());
        }
        let page = self.physical_page_size as usize;
        if !page.is_power_of_two() || page < CACHE_LINE_SIZE {
            return invalid(format!("page size {page} is not a power of two >= {CACHE_LINE_SIZE}"));
        }
        if self.total_size() > SHM_MAX_SIZE {
            return invalid(format!(
                "segment size {} exceeds {SHM_MAX_SIZE}",
                self.total_size()
            ));
        }
        Ok(())
    }

    /// Offset of the slot state array.
    pub const fn slot_states_offset(&self) -> usize {
        align_up(size_of::<SharedMemoryHeader>(), CACHE_LINE_SIZE)
    }

    /// Offset of the checksum table.
    pub const fn checksum_table_offset(&self) -> usize {
        self.slot_states_offset() + self.capacity as usize * size_of::<SlotRWState>()
    }

    /// Offset of the flexible zone.
    pub const fn flexible_zone_offset(&self) -> usize {
        align_up(
            self.checksum_table_offset() + self.capacity as usize * size_of::<SlotChecksum>(),
            CACHE_LINE_SIZE,
        )
    }

    /// Offset of the first payload unit.
    pub const fn payload_offset(&self) -> usize {
        align_up(
            self.flexible_zone_offset() + self.flexible_zone_size as usize,
            CACHE_LINE_SIZE,
        )
    }

    /// Distance between consecutive payload units.
    pub const fn unit_stride(&self) -> usize {
        align_up(self.logical_unit_size as usize, CACHE_LINE_SIZE)
    }

    /// Mapped size in bytes.
    pub const fn total_size(&self) -> usize {
        align_up(
            self.payload_offset() + self.capacity as usize * self.unit_stride(),
            if self.physical_page_size == 0 {
                1
            } else {
                self.physical_page_size as usize
            },
        )
    }

    /// CRC-32 over the layout parameters and the shared struct layouts.
    pub fn checksum(&self) -> u32 {
        LayoutHasher::new()
            .u16(DATABLOCK_VERSION_MAJOR)
            .u32(self.capacity)
            .u32(self.logical_unit_size)
            .u32(self.physical_page_size)
            .u32(self.flexible_zone_size)
            .u32(self.flags())
            .struct_of::<SharedMemoryHeader>()
            .struct_of::<SlotRWState>()
            .struct_of::<SlotChecksum>()
            .finish()
    }
}

/// A mapped DataBlock segment.
///
/// This is the boundary between this process and memory other processes
/// mutate concurrently. Every accessor hands out shared references to atomic
/// structures or raw pointers to payload bytes; nothing here takes a lock.
pub struct DataBlockSegment {
    name: String,
    dir: PathBuf,
    path: PathBuf,
    layout: DataBlockLayout,
    // Keeps the mapping alive; `base` points into it
    _mmap: MmapMut,
    base: NonNull<u8>,
    len: usize,
    is_owner: bool,
}

// Safety: all shared fields are atomics; payload access goes through raw
// pointers whose synchronization is the slot protocol.
unsafe impl Send for DataBlockSegment {}
unsafe impl Sync for DataBlockSegment {}

impl DataBlockSegment {
    /// Create a segment in the default shm directory.
    pub fn create(name: &str, layout: DataBlockLayout) -> DataBlockResult<Self> {
        Self::create_in(&resolve_shm_dir(None), name, layout)
    }

    /// Create a segment in `dir`.
    ///
    /// Fails with `AlreadyExists` if the backing file is present. The
    /// returned segment owns the file and removes it on drop.
    pub fn create_in(dir: &Path, name: &str, layout: DataBlockLayout) -> DataBlockResult<Self> {
        validate_name(name)?;
        layout.validate()?;

        let path = segment_path(dir, name);
        let size = layout.total_size();
        let mut mmap = create_segment_mmap(&path, size).map_err(|err| match err {
            DataBlockError::Io { source } if source.kind() == std::io::ErrorKind::AlreadyExists => {
                DataBlockError::AlreadyExists {
                    name: name.to_string(),
                }
            }
            other => other,
        })?;

        let base = base_pointer(&mut mmap)?;
        // Safety: the mapping is at least one header long, aligned, and
        // nobody else can have a reference yet
        unsafe {
            base.cast::<SharedMemoryHeader>()
                .as_ptr()
                .write(SharedMemoryHeader::new(&layout));
        }
        fence(Ordering::Release);

        info!(
            segment = name,
            capacity = layout.capacity(),
            unit_size = layout.logical_unit_size(),
            size,
            "created segment"
        );

        Ok(Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            path,
            layout,
            len: mmap.len(),
            _mmap: mmap,
            base,
            is_owner: true,
        })
    }

    /// Attach to a segment in the default shm directory.
    pub fn open(name: &str) -> DataBlockResult<Self> {
        Self::open_in(&resolve_shm_dir(None), name)
    }

    /// Attach to a segment in `dir`, validating the header.
    pub fn open_in(dir: &Path, name: &str) -> DataBlockResult<Self> {
        let segment = Self::open_unchecked_in(dir, name)?;
        segment.check_header()?;
        Ok(segment)
    }

    /// Attach without validating anything but the mapping size.
    ///
    /// Used by integrity checks that need to report a damaged header rather
    /// than refuse to look at it. Slot accessors stay bounds-checked against
    /// the real mapping length.
    pub fn open_unchecked_in(dir: &Path, name: &str) -> DataBlockResult<Self> {
        validate_name(name)?;
        let path = segment_path(dir, name);
        let mut mmap = attach_segment_mmap(&path).map_err(|err| match err {
            DataBlockError::Io { source } if source.kind() == std::io::ErrorKind::NotFound => {
                DataBlockError::NotFound {
                    name: name.to_string(),
                }
            }
            other => other,
        })?;

        if mmap.len() < size_of::<SharedMemoryHeader>() {
            return Err(DataBlockError::Corrupted {
                reason: format!("mapping of {} bytes is smaller than the header", mmap.len()),
            });
        }
        fence(Ordering::Acquire);

        let base = base_pointer(&mut mmap)?;
        // Safety: bounds checked above
        let layout = unsafe { base.cast::<SharedMemoryHeader>().as_ref() }.layout();
        debug!(segment = name, "attached segment");

        Ok(Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            path,
            layout,
            len: mmap.len(),
            _mmap: mmap,
            base,
            is_owner: false,
        })
    }

    /// Fresh, validated, non-owning mapping of the same segment.
    pub fn reopen(&self) -> DataBlockResult<Self> {
        Self::open_in(&self.dir, &self.name)
    }

    /// Validate magic, major version, layout checksum and mapping size.
    pub fn check_header(&self) -> DataBlockResult<()> {
        let header = self.header();
        if header.magic_number != DATABLOCK_MAGIC {
            return Err(DataBlockError::Corrupted {
                reason: format!("bad magic {:#018x}", header.magic_number),
            });
        }
        if header.version_major != DATABLOCK_VERSION_MAJOR {
            return Err(DataBlockError::Corrupted {
                reason: format!(
                    "version {}.{} not supported (expected major {DATABLOCK_VERSION_MAJOR})",
                    header.version_major, header.version_minor
                ),
            });
        }
        let computed = self.layout.checksum();
        if header.layout_checksum != computed {
            return Err(DataBlockError::Corrupted {
                reason: format!(
                    "layout checksum {:#010x} does not match {computed:#010x}",
                    header.layout_checksum
                ),
            });
        }
        self.layout.validate()?;
        if self.len < self.layout.total_size() {
            return Err(DataBlockError::Corrupted {
                reason: format!(
                    "mapping of {} bytes is smaller than the layout's {}",
                    self.len,
                    self.layout.total_size()
                ),
            });
        }
        Ok(())
    }

    /// Segment name, without the file prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Layout recorded in the header.
    pub fn layout(&self) -> &DataBlockLayout {
        &self.layout
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.layout.capacity() as usize
    }

    /// Shared header.
    pub fn header(&self) -> &SharedMemoryHeader {
        // Safety: every constructor checks the mapping holds a header
        unsafe { self.base.cast::<SharedMemoryHeader>().as_ref() }
    }

    /// Control block of slot `index`.
    pub fn slot_state(&self, index: usize) -> DataBlockResult<&SlotRWState> {
        let offset = self.slot_offset(index, self.layout.slot_states_offset(), size_of::<SlotRWState>())?;
        // Safety: in bounds, 64-aligned, zero is a valid bit pattern
        Ok(unsafe { self.base.add(offset).cast::<SlotRWState>().as_ref() })
    }

    /// All control blocks that lie within the mapping.
    pub fn slot_states(&self) -> &[SlotRWState] {
        let offset = self.layout.slot_states_offset();
        let available = self.len.saturating_sub(offset) / size_of::<SlotRWState>();
        let count = self.capacity().min(available);
        // Safety: `count` elements fit in the mapping
        unsafe {
            std::slice::from_raw_parts(self.base.add(offset).cast::<SlotRWState>().as_ptr(), count)
        }
    }

    /// Checksum entry of slot `index`.
    pub fn slot_checksum(&self, index: usize) -> DataBlockResult<&SlotChecksum> {
        let offset =
            self.slot_offset(index, self.layout.checksum_table_offset(), size_of::<SlotChecksum>())?;
        // Safety: in bounds and 4-aligned
        Ok(unsafe { self.base.add(offset).cast::<SlotChecksum>().as_ref() })
    }

    /// Start of the payload unit of slot `index`.
    ///
    /// The unit is `logical_unit_size` bytes long. Reading or writing it is
    /// only sound while holding the slot through the coordinator.
    pub fn payload_ptr(&self, index: usize) -> DataBlockResult<NonNull<u8>> {
        let offset =
            self.slot_offset(index, self.layout.payload_offset(), self.layout.unit_stride())?;
        // Safety: the whole stride, which covers the unit, is mapped
        Ok(unsafe { self.base.add(offset) })
    }

    /// Start of the flexible zone, `flexible_zone_size` bytes long.
    pub fn flexible_zone_ptr(&self) -> DataBlockResult<NonNull<u8>> {
        let offset = self.layout.flexible_zone_offset();
        if offset + self.layout.zone_size() as usize > self.len {
            return Err(DataBlockError::Corrupted {
                reason: "flexible zone lies outside the mapping".to_string(),
            });
        }
        // Safety: bounds checked above
        Ok(unsafe { self.base.add(offset) })
    }

    /// Copy of the payload bytes of slot `index`.
    ///
    /// Callers must hold the slot or accept a torn copy.
    pub fn payload_bytes(&self, index: usize) -> DataBlockResult<Vec<u8>> {
        let ptr = self.payload_ptr(index)?;
        let len = self.layout.logical_unit_size() as usize;
        // Safety: `payload_ptr` checked `len` bytes are mapped
        Ok(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }.to_vec())
    }

    /// Copy of the flexible zone.
    pub fn flexible_zone_bytes(&self) -> DataBlockResult<Vec<u8>> {
        let ptr = self.flexible_zone_ptr()?;
        let len = self.layout.zone_size() as usize;
        // Safety: `flexible_zone_ptr` checked `len` bytes are mapped
        Ok(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }.to_vec())
    }

    /// Remove the backing file of this segment now.
    pub fn unlink(&self) -> DataBlockResult<()> {
        unlink_in(&self.dir, &self.name)
    }

    fn slot_offset(&self, index: usize, region: usize, stride: usize) -> DataBlockResult<usize> {
        if index >= self.capacity() {
            return Err(DataBlockError::InvalidSlot {
                index,
                capacity: self.capacity(),
            });
        }
        let offset = region + index * stride;
        if offset + stride > self.len {
            return Err(DataBlockError::Corrupted {
                reason: format!("slot {index} lies outside the mapping"),
            });
        }
        Ok(offset)
    }
}

impl std::fmt::Debug for DataBlockSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBlockSegment")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("layout", &self.layout)
            .field("is_owner", &self.is_owner)
            .finish()
    }
}

impl Drop for DataBlockSegment {
    fn drop(&mut self) {
        if self.is_owner {
            if let Err(err) = std::fs::remove_file(&self.path) {
                debug!(segment = %self.name, %err, "backing file already gone");
            }
        }
    }
}

/// Backing file of segment `name` in `dir`.
pub fn segment_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{SHM_PREFIX}{name}"))
}

/// Remove segment `name` from the default shm directory.
pub fn unlink(name: &str) -> DataBlockResult<()> {
    unlink_in(&resolve_shm_dir(None), name)
}

/// Remove segment `name` from `dir`.
pub fn unlink_in(dir: &Path, name: &str) -> DataBlockResult<()> {
    validate_name(name)?;
    std::fs::remove_file(segment_path(dir, name)).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            DataBlockError::NotFound {
                name: name.to_string(),
            }
        } else {
            DataBlockError::Io { source }
        }
    })
}

fn validate_name(name: &str) -> DataBlockResult<()> {
    if name.is_empty() || name.contains(['/', '\0']) || name == "." || name == ".." {
        return Err(DataBlockError::InvalidArgument(format!(
            "invalid segment name {name:?}"
        )));
    }
    Ok(())
}

fn base_pointer(mmap: &mut MmapMut) -> DataBlockResult<NonNull<u8>> {
    let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| DataBlockError::Corrupted {
        reason: "null mapping".to_string(),
    })?;
    if base.as_ptr() as usize % CACHE_LINE_SIZE != 0 {
        return Err(DataBlockError::Corrupted {
            reason: format!("mapping at {:p} is not cache-line aligned", base.as_ptr()),
        });
    }
    Ok(base)
}
