//! CRC32 checksums for log records and table blocks.

use crc32fast::Hasher;

/// Compute the CRC32 checksum of a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Extend an existing checksum with more data.
pub fn crc32_extend(crc: u32, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new_with_initial(crc);
    hasher.update(data);
    hasher.finalize()
}

/// Mask a CRC before storing it in a file.
///
/// Stored checksums are masked so that computing the CRC of a byte string
/// that itself embeds CRCs does not produce degenerate values.
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282ead8)
}

/// Invert [`mask_crc`].
pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(0xa282ead8);
    (rot >> 17) | (rot << 15)
}

/// Check a byte slice against a stored masked CRC.
pub fn verify_masked_crc(data: &[u8], masked: u32) -> bool {
    crc32(data) == unmask_crc(masked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_values_differ() {
        assert_ne!(crc32(b"a"), crc32(b"b"));
        assert_eq!(crc32(b"hello"), crc32(b"hello"));
    }

    #[test]
    fn test_crc_extend() {
        let whole = crc32(b"hello world");
        let split = crc32_extend(crc32(b"hello "), b"world");
        assert_eq!(whole, split);
    }

    #[test]
    fn test_mask_roundtrip() {
        for data in [&b"foo"[..], b"", b"some longer payload"] {
            let crc = crc32(data);
            let masked = mask_crc(crc);
            assert_ne!(crc, masked);
            assert_eq!(unmask_crc(masked), crc);
            assert!(verify_masked_crc(data, masked));
        }
    }
}
