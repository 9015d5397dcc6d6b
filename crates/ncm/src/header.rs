//! NTB header structures
//!
//! An NTB starts with a 12 byte transfer header (NTH16) that points at the
//! first datagram pointer table (NDP16). Each table lists (offset, length)
//! pairs terminated by a zero entry and may chain to another table.
//!
//! ```text
//! NTH:  [sig "NCMH": u32][header_len: u16][sequence: u16][block_len: u16][ndp_index: u16]
//! NDP:  [sig "NCM0": u32][length: u16][next_ndp_index: u16][(offset: u16, len: u16)...][0, 0]
//! ```
//!
//! All fields are little-endian.

use crate::error::{NcmError, Result};
use bytes::{Buf, BufMut};
use std::fmt;

/// `NCMH` read as a little-endian u32
pub const NTH_SIGNATURE: u32 = 0x484D_434E;

/// `NCM0` read as a little-endian u32
pub const NDP_SIGNATURE: u32 = 0x304D_434E;

/// Length of the transfer header
pub const NTH_LEN: usize = 12;

/// Length of a pointer table header, before its entries
pub const NDP_HEADER_LEN: usize = 8;

/// Length of a single (offset, length) entry
pub const NDP_ENTRY_LEN: usize = 4;

/// Largest block the 16-bit length field can describe
pub const MAX_BLOCK_LEN: usize = u16::MAX as usize;

/// NCM Transfer Header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    pub sequence: u16,
    pub block_len: u16,
    pub ndp_index: u16,
}

impl TransferHeader {
    /// Parse a transfer header from the start of `bytes`
    ///
    /// The signature is checked before anything else is looked at.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(NcmError::TruncatedBlock {
                needed: NTH_LEN,
                available: bytes.len(),
            });
        }

        let mut buf = bytes;
        let signature = buf.get_u32_le();
        if signature != NTH_SIGNATURE {
            return Err(NcmError::InvalidNthSignature { found: signature });
        }

        if bytes.len() < NTH_LEN {
            return Err(NcmError::TruncatedBlock {
                needed: NTH_LEN,
                available: bytes.len(),
            });
        }

        let header_len = buf.get_u16_le();
        if header_len as usize != NTH_LEN {
            return Err(NcmError::InvalidHeaderLength { found: header_len });
        }

        Ok(Self {
            sequence: buf.get_u16_le(),
            block_len: buf.get_u16_le(),
            ndp_index: buf.get_u16_le(),
        })
    }

    pub fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(NTH_SIGNATURE);
        buf.put_u16_le(NTH_LEN as u16);
        buf.put_u16_le(self.sequence);
        buf.put_u16_le(self.block_len);
        buf.put_u16_le(self.ndp_index);
    }
}

impl fmt::Display for TransferHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NTH[seq={}, block_len={}, ndp_index={}]",
            self.sequence, self.block_len, self.ndp_index
        )
    }
}

/// NCM Datagram Pointer table header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerTableHeader {
    /// Length of the table including this header and the terminator
    pub length: u16,
    /// Offset of the next table, 0 if this is the last one
    pub next_ndp_index: u16,
}

impl PointerTableHeader {
    /// Parse a table header located at `offset` within `block`
    pub fn parse(block: &[u8], offset: usize) -> Result<Self> {
        let end = offset + NDP_HEADER_LEN;
        if end > block.len() {
            return Err(NcmError::TruncatedBlock {
                needed: end,
                available: block.len(),
            });
        }

        let mut buf = &block[offset..end];
        let signature = buf.get_u32_le();
        if signature != NDP_SIGNATURE {
            return Err(NcmError::InvalidNdpSignature {
                offset,
                found: signature,
            });
        }

        Ok(Self {
            length: buf.get_u16_le(),
            next_ndp_index: buf.get_u16_le(),
        })
    }

    pub fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(NDP_SIGNATURE);
        buf.put_u16_le(self.length);
        buf.put_u16_le(self.next_ndp_index);
    }
}

impl fmt::Display for PointerTableHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NDP[len={}, next={}]", self.length, self.next_ndp_index)
    }
}

/// A single datagram pointer entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramPointer {
    pub offset: u16,
    pub length: u16,
}

impl DatagramPointer {
    pub const TERMINATOR: DatagramPointer = DatagramPointer {
        offset: 0,
        length: 0,
    };

    pub fn parse(mut entry: &[u8]) -> Self {
        Self {
            offset: entry.get_u16_le(),
            length: entry.get_u16_le(),
        }
    }

    /// A zero offset or zero length ends the table
    pub fn is_terminator(&self) -> bool {
        self.offset == 0 || self.length == 0
    }

    pub fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(self.offset);
        buf.put_u16_le(self.length);
    }
}
