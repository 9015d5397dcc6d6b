//! USB transport
//!
//! Finds iOS devices, moves them into the configuration that carries the
//! NCM function and exposes its two bulk endpoints as a [`UsbLink`].

pub mod activation;
pub mod device;
pub mod discovery;
pub mod transport;

pub use discovery::{DeviceInfo, UsbScanner};
pub use transport::{BulkReader, NcmTransport};

use std::io;
use thiserror::Error;

/// Apple Inc.
pub const APPLE_VENDOR_ID: u16 = 0x05AC;

/// iPhone in the mode that exposes the NCM function
pub const NCM_PRODUCT_ID: u16 = 0x12A8;

#[derive(Debug, Error)]
pub enum UsbError {
    #[error("USB error: {0}")]
    Rusb(#[from] rusb::Error),

    #[error("Vendor request {request} failed: {source}")]
    ControlTransfer {
        request: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("Configuration {0} is not advertised by the device")]
    ConfigurationNotFound(u8),

    #[error("Configuration {0} has no CDC Data alternate setting with two bulk endpoints")]
    NoDataInterface(u8),

    #[error("Endpoint mismatch: {0}")]
    EndpointMismatch(String),

    #[error("Device at bus {bus} address {address} is gone")]
    DeviceGone { bus: u8, address: u8 },
}

/// Bulk endpoint pair of one device
///
/// One pump reads while the other writes, so both sides take `&self`.
pub trait UsbLink: Send + Sync {
    /// Read one bulk IN transfer into `buf`
    ///
    /// Returns `Ok(0)` once the link has been closed.
    fn read_bulk(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one complete NTB to the bulk OUT endpoint
    fn write_bulk(&self, ntb: &[u8]) -> io::Result<()>;

    /// Size of the buffer handed to [`read_bulk`](Self::read_bulk)
    fn read_chunk_len(&self) -> usize;

    /// Stop both directions; pending and later calls return promptly
    fn close(&self);
}

/// Map a rusb failure to an I/O error for the pumps
pub(crate) fn io_error(error: rusb::Error) -> io::Error {
    match error {
        rusb::Error::NoDevice => io::Error::new(io::ErrorKind::NotConnected, error),
        rusb::Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, error),
        rusb::Error::Interrupted => io::Error::new(io::ErrorKind::Interrupted, error),
        other => io::Error::other(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kinds() {
        assert_eq!(
            io_error(rusb::Error::NoDevice).kind(),
            io::ErrorKind::NotConnected
        );
        assert_eq!(io_error(rusb::Error::Pipe).kind(), io::ErrorKind::Other);
    }

    #[test]
    fn test_control_transfer_error_names_request() {
        let err = UsbError::ControlTransfer {
            request: 82,
            source: rusb::Error::Pipe,
        };
        assert!(err.to_string().contains("82"));
    }
}
