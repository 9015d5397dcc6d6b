//! Per-device bridge between a USB link and a TAP endpoint
//!
//! Two pump threads move traffic: host-to-device reads frames from the TAP
//! endpoint and writes NTBs to bulk OUT, device-to-host reads NTBs from
//! bulk IN and writes their frames to the TAP endpoint. The first pump to
//! stop closes both endpoints, which makes the other pump stop too.

use crate::tap::FrameDevice;
use crate::usb::{BulkReader, UsbLink};
use common::{Counter, TelemetrySink};
use ncm::{DEFAULT_RESYNC_LIMIT, NcmError, NtbEncoder, NtbReader};
use std::io;
use std::iter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Room for a frame plus a VLAN tag
const FRAME_BUFFER_LEN: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOptions {
    /// Pack already queued frames into one NTB
    pub batch_frames: bool,
    /// Upper bound for a batched NTB
    pub max_ntb_size: usize,
    /// Scan for the next NTH after a bad signature instead of closing
    pub resync: bool,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            batch_frames: false,
            max_ntb_size: 16 * 1024,
            resync: true,
        }
    }
}

#[derive(Debug, Error)]
enum PumpError {
    #[error("USB I/O failed: {0}")]
    Usb(#[source] io::Error),

    #[error("TAP I/O failed: {0}")]
    Tap(#[source] io::Error),

    #[error("NCM framing error: {0}")]
    Codec(#[source] NcmError),
}

impl From<NcmError> for PumpError {
    fn from(error: NcmError) -> Self {
        match error {
            // the block reader only does I/O on the USB side
            NcmError::Io(e) => PumpError::Usb(e),
            other => PumpError::Codec(other),
        }
    }
}

impl PumpError {
    /// The device sent bytes that are not a valid NTB
    fn is_malformed(&self) -> bool {
        matches!(self, PumpError::Codec(e) if e.is_malformed())
    }
}

struct Shared {
    serial: String,
    usb: Arc<dyn UsbLink>,
    tap: Arc<dyn FrameDevice>,
    telemetry: Arc<dyn TelemetrySink>,
    closed: AtomicBool,
}

impl Shared {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("{}: closing bridge", self.serial);
        self.usb.close();
        self.tap.close();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn count(&self, counter: Counter, n: usize) {
        self.telemetry.add(counter, &self.serial, n as u64);
    }
}

pub struct Bridge {
    shared: Arc<Shared>,
    pumps: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Start both pumps
    pub fn start(
        serial: &str,
        usb: Arc<dyn UsbLink>,
        tap: Arc<dyn FrameDevice>,
        telemetry: Arc<dyn TelemetrySink>,
        options: BridgeOptions,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            serial: serial.to_string(),
            usb,
            tap,
            telemetry,
            closed: AtomicBool::new(false),
        });
        info!(
            "{}: starting bridge on {} (batching {})",
            serial,
            shared.tap.name(),
            if options.batch_frames { "on" } else { "off" }
        );

        let mut bridge = Self {
            shared: shared.clone(),
            pumps: Vec::with_capacity(2),
        };

        let tx_options = options.clone();
        bridge.spawn_pump("ncm-tx", move |s| host_to_device(s, &tx_options))?;
        bridge.spawn_pump("ncm-rx", move |s| device_to_host(s, &options))?;

        Ok(bridge)
    }

    /// Spawn one pump; on failure the bridge is closed and dropped by the caller
    fn spawn_pump<F>(&mut self, name: &'static str, pump: F) -> io::Result<()>
    where
        F: FnOnce(&Shared) -> Result<(), PumpError> + Send + 'static,
    {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_pump(name, &shared, pump))?;
        self.pumps.push(handle);
        Ok(())
    }

    pub fn serial(&self) -> &str {
        &self.shared.serial
    }

    /// Close both endpoints; safe to call any number of times
    pub fn close(&self) {
        self.shared.close();
    }

    /// Both pumps have exited
    pub fn is_finished(&self) -> bool {
        self.pumps.iter().all(JoinHandle::is_finished)
    }

    /// Close and wait for both pumps
    pub fn join(mut self) {
        self.shared.close();
        for pump in self.pumps.drain(..) {
            if pump.join().is_err() {
                warn!("{}: pump thread panicked", self.shared.serial);
            }
        }
        info!("{}: bridge stopped", self.shared.serial);
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shared.close();
    }
}

fn run_pump<F>(name: &str, shared: &Shared, pump: F)
where
    F: FnOnce(&Shared) -> Result<(), PumpError>,
{
    debug!("{}: {} pump started", shared.serial, name);
    match pump(shared) {
        Ok(()) => debug!("{}: {} pump reached end of stream", shared.serial, name),
        Err(e) if shared.is_closed() => {
            debug!("{}: {} pump stopped after close: {}", shared.serial, name, e)
        }
        Err(e) if e.is_malformed() => {
            warn!("{}: {} pump dropped a malformed NTB: {}", shared.serial, name, e)
        }
        Err(e) => error!("{}: {} pump failed: {}", shared.serial, name, e),
    }
    shared.close();
}

fn host_to_device(shared: &Shared, options: &BridgeOptions) -> Result<(), PumpError> {
    let mut encoder = NtbEncoder::new();
    let mut buf = vec![0u8; FRAME_BUFFER_LEN];
    // frame read while batching that did not fit the previous NTB
    let mut carried: Option<Vec<u8>> = None;

    loop {
        let mut batch = Vec::with_capacity(1);
        match carried.take() {
            Some(frame) => batch.push(frame),
            None => {
                let n = shared.tap.read_frame(&mut buf).map_err(PumpError::Tap)?;
                if n == 0 {
                    return Ok(());
                }
                shared.count(Counter::NetworkReceiveBytes, n);
                trace!("{}: tap in {}", shared.serial, frame_summary(&buf[..n]));
                batch.push(buf[..n].to_vec());
            }
        }

        if options.batch_frames {
            while let Some(n) = shared.tap.try_read_frame(&mut buf).map_err(PumpError::Tap)? {
                shared.count(Counter::NetworkReceiveBytes, n);
                trace!("{}: tap in {}", shared.serial, frame_summary(&buf[..n]));

                let frame = buf[..n].to_vec();
                let projected =
                    ncm::block_len(batch.iter().map(Vec::len).chain(iter::once(frame.len())));
                if projected > options.max_ntb_size {
                    carried = Some(frame);
                    break;
                }
                batch.push(frame);
            }
        }

        let ntb = encoder.encode(&batch)?;
        shared.usb.write_bulk(&ntb).map_err(PumpError::Usb)?;
        shared.count(Counter::UsbSendBytes, ntb.len());
        trace!(
            "{}: usb out {} bytes, {} frame(s)",
            shared.serial,
            ntb.len(),
            batch.len()
        );
    }
}

fn device_to_host(shared: &Shared, options: &BridgeOptions) -> Result<(), PumpError> {
    let mut reader = NtbReader::new(BulkReader::new(shared.usb.clone()));

    loop {
        let block = match reader.read_block() {
            Ok(Some(block)) => block,
            Ok(None) => return Ok(()),
            Err(NcmError::InvalidNthSignature { found }) if options.resync => {
                warn!(
                    "{}: bad NTH signature {:#010x}, resynchronising",
                    shared.serial, found
                );
                match reader.resync(DEFAULT_RESYNC_LIMIT)? {
                    Some(block) => block,
                    None => return Ok(()),
                }
            }
            Err(e) => return Err(e.into()),
        };
        shared.count(Counter::UsbReceiveBytes, block.len());

        let frames = ncm::decode(block)?;
        trace!("{}: usb in {} frame(s)", shared.serial, frames.len());
        for frame in frames {
            trace!("{}: tap out {}", shared.serial, frame_summary(&frame));
            shared.tap.write_frame(&frame).map_err(PumpError::Tap)?;
            shared.count(Counter::NetworkSendBytes, frame.len());
        }
    }
}

/// One-line Ethernet header summary for trace output
fn frame_summary(frame: &[u8]) -> String {
    if frame.len() < 14 {
        return format!("runt frame ({} bytes)", frame.len());
    }
    format!(
        "{} > {} type {:#06x} len {}",
        mac(&frame[6..12]),
        mac(&frame[0..6]),
        u16::from_be_bytes([frame[12], frame[13]]),
        frame.len()
    )
}

fn mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
