//! CRC32C header and data digests

use crc::{Crc, CRC_32_ISCSI};

/// Size of a header or data digest in bytes
pub const DIGEST_SIZE: usize = 4;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Compute the CRC32C digest of `data`
pub fn crc32c(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

/// Compute a digest over several discontiguous segments
pub fn crc32c_segments<'a>(segments: impl IntoIterator<Item = &'a [u8]>) -> u32 {
    let mut digest = CRC32C.digest();
    for segment in segments {
        digest.update(segment);
    }
    digest.finalize()
}

/// Digest options negotiated for a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DigestOptions {
    /// Header digest in use
    pub header: bool,
    /// Data digest in use
    pub data: bool,
}

impl DigestOptions {
    /// No digests
    pub const NONE: Self = Self {
        header: false,
        data: false,
    };

    /// Create digest options
    pub fn new(header: bool, data: bool) -> Self {
        Self { header, data }
    }

    /// Bytes appended after the PDU header
    pub fn header_len(&self) -> usize {
        if self.header {
            DIGEST_SIZE
        } else {
            0
        }
    }

    /// Bytes appended after the PDU data (only when data is present)
    pub fn data_len(&self, data_len: usize) -> usize {
        if self.data && data_len > 0 {
            DIGEST_SIZE
        } else {
            0
        }
    }
}
