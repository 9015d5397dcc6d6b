//! Bulk transport over an activated device
//!
//! libusb has no way to cancel a synchronous transfer from another thread,
//! so every bulk call runs with a short timeout and re-checks the closed
//! flag between attempts. rusb drops the transferred count of a timed-out
//! transfer, so each call moves at most one packet: a timeout then means
//! nothing was moved and the same packet can be retried.

use super::activation::{LinkState, NcmInterface, activate, log_transition};
use super::device::RusbDevice;
use super::{UsbError, UsbLink, io_error};
use rusb::{Context, Device};
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

pub struct NcmTransport {
    device: RusbDevice,
    ncm: NcmInterface,
    serial: String,
    timeout: Duration,
    closed: AtomicBool,
}

impl NcmTransport {
    /// Open `device`, activate NCM and return a Ready transport
    pub fn open(
        device: Device<Context>,
        serial: &str,
        timeout: Duration,
    ) -> Result<Self, UsbError> {
        let mut control = RusbDevice::open(device)?;
        let ncm = activate(&mut control, serial)?;

        Ok(Self {
            device: control,
            ncm,
            serial: serial.to_string(),
            timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn interface(&self) -> &NcmInterface {
        &self.ncm
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A zero-length packet must end a transfer of whole packets
fn needs_zlp(len: usize, max_packet: usize) -> bool {
    max_packet > 0 && len % max_packet == 0
}

/// Split one NTB into the packets of its bulk OUT transfer, ZLP included
fn bulk_packets(data: &[u8], max_packet: usize) -> impl Iterator<Item = &[u8]> {
    let chunk = if max_packet == 0 { data.len().max(1) } else { max_packet };
    let zlp: &[u8] = &[];
    data.chunks(chunk)
        .chain(needs_zlp(data.len(), max_packet).then_some(zlp))
}

/// Send `data` packet by packet through `transfer`, retrying timeouts
///
/// Fails with `BrokenPipe` once `closed` is set.
fn write_packets<F>(
    data: &[u8],
    max_packet: usize,
    closed: &AtomicBool,
    mut transfer: F,
) -> io::Result<()>
where
    F: FnMut(&[u8]) -> Result<usize, rusb::Error>,
{
    for packet in bulk_packets(data, max_packet) {
        loop {
            if closed.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "USB link closed"));
            }
            match transfer(packet) {
                Ok(n) if n == packet.len() => break,
                Ok(n) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short bulk OUT packet: {} of {} bytes", n, packet.len()),
                    ));
                }
                Err(rusb::Error::Timeout) => continue,
                Err(e) => return Err(io_error(e)),
            }
        }
    }
    Ok(())
}

impl UsbLink for NcmTransport {
    fn read_bulk(&self, buf: &mut [u8]) -> io::Result<usize> {
        let endpoint = self.ncm.bulk_in.address;
        loop {
            if self.is_closed() {
                return Ok(0);
            }
            match self.device.handle().read_bulk(endpoint, buf, self.timeout) {
                // zero-length packets only terminate a transfer
                Ok(0) => continue,
                Ok(n) => return Ok(n),
                Err(rusb::Error::Timeout) => continue,
                Err(e) => return Err(io_error(e)),
            }
        }
    }

    fn write_bulk(&self, ntb: &[u8]) -> io::Result<()> {
        let endpoint = self.ncm.bulk_out.address;
        let max_packet = usize::from(self.ncm.bulk_out.max_packet_size);
        if needs_zlp(ntb.len(), max_packet) {
            trace!("{}: sending ZLP after {} bytes", self.serial, ntb.len());
        }

        let handle = self.device.handle();
        write_packets(ntb, max_packet, &self.closed, |packet| {
            handle.write_bulk(endpoint, packet, self.timeout)
        })
    }

    fn read_chunk_len(&self) -> usize {
        self.ncm.read_chunk_len()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log_transition(&self.serial, LinkState::Ready, LinkState::Closed);
        }
    }
}

impl Drop for NcmTransport {
    fn drop(&mut self) {
        self.close();
        self.device.release();
        debug!("{}: USB handle closed", self.serial);
    }
}

/// Byte stream over bulk IN transfers
///
/// Every transfer is read into a buffer of [`UsbLink::read_chunk_len`]
/// bytes so a packet is never split by a short caller buffer.
pub struct BulkReader {
    link: Arc<dyn UsbLink>,
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,
}

impl BulkReader {
    pub fn new(link: Arc<dyn UsbLink>) -> Self {
        let len = link.read_chunk_len().max(1);
        Self {
            link,
            buf: vec![0u8; len].into_boxed_slice(),
            pos: 0,
            filled: 0,
        }
    }
}

impl Read for BulkReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.pos == self.filled {
            let n = self.link.read_bulk(&mut self.buf)?;
            if n == 0 {
                return Ok(0);
            }
            self.pos = 0;
            self.filled = n;
        }

        let n = out.len().min(self.filled - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
