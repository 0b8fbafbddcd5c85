//! CRC32C digest helpers for the optional header and data digests.
//!
//! Both digests are plain CRC32C (Castagnoli) values transmitted
//! little-endian in a 4-byte trailer: the header digest covers the PDU
//! header bytes, the data digest covers the payload.

/// Compute the header digest over the header bytes.
pub fn header_digest(header: &[u8]) -> u32 {
    crc32c::crc32c(header)
}

/// Compute a data digest over payload segments in order.
pub fn data_digest<'a, I>(segments: I) -> u32
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut crc = 0;
    for seg in segments {
        crc = crc32c::crc32c_append(crc, seg);
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_check_value() {
        // Standard CRC32C check value.
        assert_eq!(header_digest(b"123456789"), 0xE3069283);
    }

    #[test]
    fn segmented_matches_contiguous() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let whole = header_digest(data);
        let split = data_digest([&data[..13], &data[13..30], &data[30..]]);
        assert_eq!(whole, split);
    }

    #[test]
    fn empty_digest() {
        assert_eq!(header_digest(&[]), 0);
        assert_eq!(data_digest(std::iter::empty::<&[u8]>()), 0);
    }
}
