//! NTB decoding
//!
//! Splits a complete NTB into the Ethernet frames it carries. The returned
//! frames are zero-copy slices of the input block.

use crate::error::{NcmError, Result};
use crate::header::{
    DatagramPointer, NDP_ENTRY_LEN, NDP_HEADER_LEN, NTH_LEN, PointerTableHeader, TransferHeader,
};
use bytes::Bytes;

/// Decode one NTB into its datagrams
///
/// `block` must hold at least the declared block length; any bytes past it
/// are ignored. Chained pointer tables are followed in order, yielding frames
/// in table order then entry order.
pub fn decode(block: Bytes) -> Result<Vec<Bytes>> {
    let header = TransferHeader::parse(&block)?;
    let block_len = header.block_len as usize;

    if block_len < NTH_LEN {
        return Err(NcmError::TruncatedBlock {
            needed: NTH_LEN,
            available: block_len,
        });
    }
    if block.len() < block_len {
        return Err(NcmError::TruncatedBlock {
            needed: block_len,
            available: block.len(),
        });
    }
    let block = block.slice(..block_len);

    let mut frames = Vec::new();
    let mut ndp_index = header.ndp_index as usize;
    // Every table needs at least a header's worth of bytes, which bounds a cyclic chain
    let mut tables_left = block_len / NDP_HEADER_LEN;

    loop {
        if tables_left == 0 || ndp_index < NTH_LEN || ndp_index + NDP_HEADER_LEN > block_len {
            return Err(NcmError::PointerOutOfBounds {
                offset: ndp_index,
                block_len,
            });
        }
        tables_left -= 1;

        let table = PointerTableHeader::parse(&block, ndp_index)?;
        let table_len = table.length as usize;
        if table_len < NDP_HEADER_LEN || ndp_index + table_len > block_len {
            return Err(NcmError::PointerOutOfBounds {
                offset: ndp_index,
                block_len,
            });
        }

        let entries = &block[ndp_index + NDP_HEADER_LEN..ndp_index + table_len];
        for entry in entries.chunks_exact(NDP_ENTRY_LEN) {
            let pointer = DatagramPointer::parse(entry);
            if pointer.is_terminator() {
                break;
            }

            let start = pointer.offset as usize;
            let end = start + pointer.length as usize;
            if start < NTH_LEN {
                return Err(NcmError::PointerOutOfBounds {
                    offset: start,
                    block_len,
                });
            }
            if end > block_len {
                return Err(NcmError::TruncatedBlock {
                    needed: end,
                    available: block_len,
                });
            }
            frames.push(block.slice(start..end));
        }

        if table.next_ndp_index == 0 {
            break;
        }
        ndp_index = table.next_ndp_index as usize;
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{NDP_SIGNATURE, NTH_SIGNATURE};
    use bytes::BufMut;

    fn block_with_table(table_len: u16, entries: &[(u16, u16)], total: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(total);
        TransferHeader {
            sequence: 0,
            block_len: total as u16,
            ndp_index: 12,
        }
        .write(&mut buf);
        buf.put_u32_le(NDP_SIGNATURE);
        buf.put_u16_le(table_len);
        buf.put_u16_le(0);
        for (offset, len) in entries {
            buf.put_u16_le(*offset);
            buf.put_u16_le(*len);
        }
        buf.resize(total, 0xEE);
        buf
    }

    #[test]
    fn test_decode_empty_table() {
        let block = block_with_table(12, &[(0, 0)], 24);
        let frames = decode(Bytes::from(block)).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut block = block_with_table(16, &[(28, 4), (0, 0)], 32);
        block.extend_from_slice(&[1, 2, 3]);
        let frames = decode(Bytes::from(block)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), &[0xEE; 4]);
    }

    #[test]
    fn test_decode_table_overruns_block() {
        let block = block_with_table(64, &[(28, 4), (0, 0)], 32);
        assert!(matches!(
            decode(Bytes::from(block)),
            Err(NcmError::PointerOutOfBounds { offset: 12, .. })
        ));
    }

    #[test]
    fn test_decode_datagram_overlapping_header() {
        let block = block_with_table(16, &[(4, 8), (0, 0)], 32);
        assert!(matches!(
            decode(Bytes::from(block)),
            Err(NcmError::PointerOutOfBounds { offset: 4, .. })
        ));
    }

    #[test]
    fn test_decode_datagram_past_end() {
        let block = block_with_table(16, &[(28, 40), (0, 0)], 32);
        assert!(matches!(
            decode(Bytes::from(block)),
            Err(NcmError::TruncatedBlock { needed: 68, .. })
        ));
    }

    #[test]
    fn test_decode_bad_ndp_signature() {
        let mut block = block_with_table(16, &[(28, 4), (0, 0)], 32);
        block[12] = b'X';
        assert!(matches!(
            decode(Bytes::from(block)),
            Err(NcmError::InvalidNdpSignature { offset: 12, .. })
        ));
    }

    #[test]
    fn test_decode_ndp_index_inside_header() {
        let mut block = block_with_table(16, &[(28, 4), (0, 0)], 32);
        block[10] = 4;
        assert!(matches!(
            decode(Bytes::from(block)),
            Err(NcmError::PointerOutOfBounds { offset: 4, .. })
        ));
    }

    #[test]
    fn test_decode_cyclic_chain_terminates() {
        // Table at 12 points back at itself
        let mut block = block_with_table(12, &[(0, 0)], 24);
        block[18] = 12;
        assert!(matches!(
            decode(Bytes::from(block)),
            Err(NcmError::PointerOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_decode_block_len_smaller_than_header() {
        let mut block = vec![0u8; 12];
        block[..4].copy_from_slice(&NTH_SIGNATURE.to_le_bytes());
        block[4] = 12;
        block[8] = 8;
        assert!(matches!(
            decode(Bytes::from(block)),
            Err(NcmError::TruncatedBlock { needed: 12, available: 8 })
        ));
    }
}
