//! NTB encoding
//!
//! Every block is laid out as NTH, one NDP, then the datagrams:
//!
//! ```text
//! [NTH 12][NDP header 8][entry 4 * n][terminator 4][pad][frame 0][pad][frame 1]...
//! ```
//!
//! Datagram offsets are kept at 2 modulo 4 so the IP header that follows the
//! 14 byte Ethernet header is word aligned. For a single frame this puts the
//! datagram at offset 30.

use crate::error::{NcmError, Result};
use crate::header::{
    DatagramPointer, MAX_BLOCK_LEN, NDP_ENTRY_LEN, NDP_HEADER_LEN, NTH_LEN, PointerTableHeader,
    TransferHeader,
};
use bytes::{BufMut, Bytes, BytesMut};

/// Round `pos` up to the next offset that is 2 modulo 4
fn align_datagram(pos: usize) -> usize {
    ((pos + 1) & !3) + 2
}

fn table_len(count: usize) -> usize {
    NDP_HEADER_LEN + NDP_ENTRY_LEN * (count + 1)
}

/// Total NTB length for datagrams of the given lengths
///
/// Used to decide whether another frame still fits a batch.
pub fn block_len<I>(lengths: I) -> usize
where
    I: IntoIterator<Item = usize>,
    I::IntoIter: Clone,
{
    let lengths = lengths.into_iter();
    let mut end = NTH_LEN + table_len(lengths.clone().count());
    for len in lengths {
        end = align_datagram(end) + len;
    }
    end
}

/// Stateful NTB writer for one direction
///
/// Owns the direction's sequence counter, which increments by one for every
/// block produced and wraps at 2^16.
#[derive(Debug, Default)]
pub struct NtbEncoder {
    sequence: u16,
}

impl NtbEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a specific sequence number
    pub fn with_sequence(sequence: u16) -> Self {
        Self { sequence }
    }

    /// Sequence number the next block will carry
    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }

    /// Encode a single frame
    pub fn encode_frame(&mut self, frame: &[u8]) -> Result<Bytes> {
        self.encode(&[frame])
    }

    /// Encode any number of frames into one block
    ///
    /// The sequence number is only consumed when encoding succeeds.
    pub fn encode<F: AsRef<[u8]>>(&mut self, frames: &[F]) -> Result<Bytes> {
        let total = block_len(frames.iter().map(|f| f.as_ref().len()));
        if total > MAX_BLOCK_LEN {
            return Err(NcmError::BlockTooLarge {
                size: total,
                max: MAX_BLOCK_LEN,
            });
        }

        let mut buf = BytesMut::with_capacity(total);
        TransferHeader {
            sequence: self.sequence,
            block_len: total as u16,
            ndp_index: NTH_LEN as u16,
        }
        .write(&mut buf);
        PointerTableHeader {
            length: table_len(frames.len()) as u16,
            next_ndp_index: 0,
        }
        .write(&mut buf);

        let mut end = NTH_LEN + table_len(frames.len());
        for frame in frames {
            let offset = align_datagram(end);
            let len = frame.as_ref().len();
            DatagramPointer {
                offset: offset as u16,
                length: len as u16,
            }
            .write(&mut buf);
            end = offset + len;
        }
        DatagramPointer::TERMINATOR.write(&mut buf);

        for frame in frames {
            buf.resize(align_datagram(buf.len()), 0);
            buf.put_slice(frame.as_ref());
        }
        debug_assert_eq!(buf.len(), total);

        self.sequence = self.sequence.wrapping_add(1);
        Ok(buf.freeze())
    }
}
