//! Layout hashing for cross-process compatibility detection.
//!
//! Two processes built from different versions of the shared structs must not
//! interpret each other's segments. The creator stores a checksum over the
//! immutable header parameters and the sizes of the shared structs; attaching
//! processes recompute it and refuse to proceed on mismatch.

use crc32fast::Hasher;

/// Compile-time version hash for struct compatibility detection.
///
/// Computes a hash from `size_of::<T>()` and `align_of::<T>()`.
/// If the struct layout changes, the hash changes.
///
/// **Known limitation**: Does not detect field reordering within the
/// same total size/alignment. This is acceptable because `#[repr(C)]`
/// structs with explicit padding have deterministic field order.
pub const fn struct_version_hash<T>() -> u32 {
    let size = core::mem::size_of::<T>() as u32;
    let align = core::mem::align_of::<T>() as u32;
    size.wrapping_mul(0x9E3779B9) ^ align.wrapping_mul(0x517CC1B7)
}

/// Incremental CRC-32 builder over little-endian encoded fields.
///
/// Fields are fed in a canonical order so that the result is identical on
/// every process that agrees on the layout.
#[derive(Default)]
pub struct LayoutHasher {
    hasher: Hasher,
}

impl LayoutHasher {
    /// Create an empty hasher.
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    /// Feed a `u16` field.
    pub fn u16(mut self, value: u16) -> Self {
        self.hasher.update(&value.to_le_bytes());
        self
    }

    /// Feed a `u32` field.
    pub fn u32(mut self, value: u32) -> Self {
        self.hasher.update(&value.to_le_bytes());
        self
    }

    /// Feed a `u64` field.
    pub fn u64(mut self, value: u64) -> Self {
        self.hasher.update(&value.to_le_bytes());
        self
    }

    /// Feed the layout hash of a shared struct.
    pub fn struct_of<T>(self) -> Self {
        self.u32(struct_version_hash::<T>())
    }

    /// Finish and return the checksum.
    pub fn finish(self) -> u32 {
        self.hasher.finalize()
    }
}

/// CRC-32 of a byte region (slot payloads, flexible zone).
pub fn region_checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_hash_determinism() {
        assert_eq!(struct_version_hash::<u64>(), struct_version_hash::<u64>());
    }

    #[test]
    fn version_hash_differs_for_different_types() {
        assert_ne!(struct_version_hash::<u64>(), struct_version_hash::<u8>());
        assert_ne!(
            struct_version_hash::<[u64; 2]>(),
            struct_version_hash::<[u64; 3]>()
        );
    }

    #[test]
    fn layout_hasher_is_order_sensitive() {
        let a = LayoutHasher::new().u32(1).u32(2).finish();
        let b = LayoutHasher::new().u32(2).u32(1).finish();
        assert_ne!(a, b);
        assert_eq!(a, LayoutHasher::new().u32(1).u32(2).finish());
    }

    #[test]
    fn region_checksum_detects_single_bit_flip() {
        let mut data = vec![0x5Au8; 256];
        let before = region_checksum(&data);
        data[17] ^= 0x01;
        assert_ne!(before, region_checksum(&data));
    }
}
