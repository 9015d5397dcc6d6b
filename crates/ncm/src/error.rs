//! Codec error types

use thiserror::Error;

/// Errors raised while reading or writing NCM Transfer Blocks
#[derive(Debug, Error)]
pub enum NcmError {
    /// The first four bytes of a block are not `NCMH`
    #[error("Invalid NTH signature: {found:#010x}")]
    InvalidNthSignature { found: u32 },

    /// The transfer header declares a length other than 12
    #[error("Invalid NTH header length: {found}")]
    InvalidHeaderLength { found: u16 },

    /// A datagram pointer table does not start with `NCM0`
    #[error("Invalid NDP signature at offset {offset}: {found:#010x}")]
    InvalidNdpSignature { offset: usize, found: u32 },

    /// A slice of the block extends past the available bytes
    #[error("Truncated block: needed {needed} bytes, got {available}")]
    TruncatedBlock { needed: usize, available: usize },

    /// A pointer table or datagram pointer falls outside its bounds
    #[error("Pointer out of bounds: offset {offset} in block of {block_len} bytes")]
    PointerOutOfBounds { offset: usize, block_len: usize },

    /// Encoding would exceed the 16-bit block length field
    #[error("Block too large: {size} bytes (max: {max})")]
    BlockTooLarge { size: usize, max: usize },

    /// No `NCMH` signature was found while resynchronising
    #[error("Resync failed: no NTH signature within {scanned} bytes")]
    ResyncFailed { scanned: usize },

    /// I/O error from the underlying byte stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NcmError {
    /// True for errors caused by malformed block contents rather than the stream
    pub fn is_malformed(&self) -> bool {
        !matches!(self, NcmError::Io(_) | NcmError::ResyncFailed { .. })
    }
}

/// Type alias for codec results
pub type Result<T> = std::result::Result<T, NcmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_error_display() {
        let err = NcmError::InvalidNthSignature { found: 0 };
        assert_eq!(err.to_string(), "Invalid NTH signature: 0x00000000");
    }

    #[test]
    fn test_is_malformed() {
        assert!(NcmError::TruncatedBlock { needed: 72, available: 50 }.is_malformed());
        assert!(!NcmError::ResyncFailed { scanned: 10 }.is_malformed());
        let io = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert!(!NcmError::from(io).is_malformed());
    }
}
