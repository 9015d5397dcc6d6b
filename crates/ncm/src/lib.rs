//! USB CDC-NCM transfer block codec
//!
//! NCM lets a USB device and host move one or more Ethernet frames in a
//! single bulk transfer, formatted as an NCM Transfer Block (NTB). This crate
//! converts between frames and NTBs. It performs no device I/O; the stream
//! reader works over any [`std::io::Read`].
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use ncm::{NtbEncoder, decode};
//!
//! let mut encoder = NtbEncoder::new();
//! let frame = [0xAAu8; 42];
//! let ntb = encoder.encode_frame(&frame).unwrap();
//! assert_eq!(ntb.len(), 72);
//!
//! let frames = decode(ntb).unwrap();
//! assert_eq!(frames, vec![Bytes::copy_from_slice(&frame)]);
//! ```

pub mod decode;
pub mod encode;
pub mod error;
pub mod header;
pub mod stream;

pub use decode::decode;
pub use encode::{NtbEncoder, block_len};
pub use error::{NcmError, Result};
pub use header::{
    DatagramPointer, MAX_BLOCK_LEN, NDP_ENTRY_LEN, NDP_HEADER_LEN, NDP_SIGNATURE, NTH_LEN,
    NTH_SIGNATURE, PointerTableHeader, TransferHeader,
};
pub use stream::{DEFAULT_RESYNC_LIMIT, NtbReader};

/// Largest Ethernet frame (without FCS) carried in one datagram
pub const MAX_FRAME_LEN: usize = 1514;
