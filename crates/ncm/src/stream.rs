//! Reading NTBs from a byte stream
//!
//! The bulk IN endpoint delivers a plain byte stream. [`NtbReader`] frames it
//! by reading the 12 byte header, validating the signature and then reading
//! exactly `block_len - 12` further bytes, so it never consumes bytes that
//! belong to the next block.

use crate::error::{NcmError, Result};
use crate::header::{NTH_LEN, NTH_SIGNATURE, TransferHeader};
use bytes::{Bytes, BytesMut};
use std::io::{ErrorKind, Read};

/// Default number of bytes scanned while looking for the next `NCMH`
pub const DEFAULT_RESYNC_LIMIT: usize = 64 * 1024;

/// Reads one NTB at a time from an underlying reader
pub struct NtbReader<R> {
    inner: R,
    /// Last four bytes read where a signature was expected
    window: [u8; 4],
}

impl<R: Read> NtbReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            window: [0; 4],
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the next complete block
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a block boundary.
    /// On a signature mismatch only the four signature bytes are consumed.
    pub fn read_block(&mut self) -> Result<Option<Bytes>> {
        let mut signature = [0u8; 4];
        if !self.read_or_eof(&mut signature)? {
            return Ok(None);
        }

        let found = u32::from_le_bytes(signature);
        if found != NTH_SIGNATURE {
            self.window = signature;
            return Err(NcmError::InvalidNthSignature { found });
        }

        self.read_after_signature().map(Some)
    }

    /// Discard bytes until the next `NCMH`, then read that block
    ///
    /// Scanning starts from the signature bytes of the last failed
    /// [`read_block`](Self::read_block), so a signature straddling them is
    /// still found.
    pub fn resync(&mut self, limit: usize) -> Result<Option<Bytes>> {
        let mut scanned = 0;
        while u32::from_le_bytes(self.window) != NTH_SIGNATURE {
            if scanned >= limit {
                return Err(NcmError::ResyncFailed { scanned });
            }
            let mut byte = [0u8; 1];
            if !self.read_or_eof(&mut byte)? {
                return Ok(None);
            }
            self.window.rotate_left(1);
            self.window[3] = byte[0];
            scanned += 1;
        }
        self.window = [0; 4];

        self.read_after_signature().map(Some)
    }

    fn read_after_signature(&mut self) -> Result<Bytes> {
        let mut header = [0u8; NTH_LEN];
        header[..4].copy_from_slice(&NTH_SIGNATURE.to_le_bytes());
        self.inner.read_exact(&mut header[4..])?;

        let parsed = TransferHeader::parse(&header)?;
        let block_len = parsed.block_len as usize;
        if block_len < NTH_LEN {
            return Err(NcmError::TruncatedBlock {
                needed: NTH_LEN,
                available: block_len,
            });
        }

        let mut block = BytesMut::zeroed(block_len);
        block[..NTH_LEN].copy_from_slice(&header);
        self.inner.read_exact(&mut block[NTH_LEN..])?;
        Ok(block.freeze())
    }

    /// Fill `buf`, or return `false` if the stream ended before the first byte
    fn read_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        let first = loop {
            match self.inner.read(buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if first == 0 {
            return Ok(false);
        }
        self.inner.read_exact(&mut buf[first..])?;
        Ok(true)
    }
}
