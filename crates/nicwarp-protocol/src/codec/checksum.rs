//! CRC-32 over a descriptor and its inline payload.

use crc32fast::Hasher;

/// Computes the frame checksum.
pub fn frame_checksum(descriptor: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(descriptor);
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_covers_both_parts() {
        let base = frame_checksum(&[1, 2, 3], &[4, 5]);
        assert_eq!(base, frame_checksum(&[1, 2, 3], &[4, 5]));
        assert_ne!(base, frame_checksum(&[1, 2, 3], &[4, 6]));
        assert_ne!(base, frame_checksum(&[1, 2, 4], &[4, 5]));
    }
}
