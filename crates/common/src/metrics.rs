//! Byte counters and device gauge for active bridges
//!
//! Bridges report every successful USB and TAP transfer through the
//! [`TelemetrySink`] trait. [`MetricsRegistry`] is the in-process sink: it
//! keeps one set of atomic counters per device serial and renders them in
//! the Prometheus text exposition format for the `/metrics` endpoint.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// Content type of [`MetricsRegistry::render`] output
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

const DEVICE_COUNT: &str = "device_count";
const DEVICE_COUNT_HELP: &str = "How many iOS devices are connected";

/// Per-device counter families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Bytes read from the bulk IN endpoint
    UsbReceiveBytes,
    /// Bytes written to the bulk OUT endpoint
    UsbSendBytes,
    /// Bytes read from the TAP interface
    NetworkReceiveBytes,
    /// Bytes written to the TAP interface
    NetworkSendBytes,
}

impl Counter {
    pub const ALL: [Counter; 4] = [
        Counter::UsbReceiveBytes,
        Counter::UsbSendBytes,
        Counter::NetworkReceiveBytes,
        Counter::NetworkSendBytes,
    ];

    /// Metric name as exposed to scrapers
    pub fn name(self) -> &'static str {
        match self {
            Counter::UsbReceiveBytes => "usb_receive_bytes",
            Counter::UsbSendBytes => "usb_send_bytes",
            Counter::NetworkReceiveBytes => "network_receive_bytes",
            Counter::NetworkSendBytes => "network_send_bytes",
        }
    }

    fn help(self) -> &'static str {
        match self {
            Counter::UsbReceiveBytes => "Counter metric for received bytes on the USB endpoint",
            Counter::UsbSendBytes => "Counter metric for sent bytes on the USB endpoint",
            Counter::NetworkReceiveBytes => {
                "Counter metric for received bytes on the virtual TAP device"
            }
            Counter::NetworkSendBytes => "Counter metric for bytes sent to the virtual TAP device",
        }
    }

    /// Network counters also carry the TAP interface name
    fn has_device_label(self) -> bool {
        matches!(
            self,
            Counter::NetworkReceiveBytes | Counter::NetworkSendBytes
        )
    }
}

/// Destination for bridge telemetry
///
/// Implementations must not block: bridges call [`add`](Self::add) on their
/// I/O paths after every transfer.
pub trait TelemetrySink: Send + Sync {
    /// Add `n` to `counter` for the device with this serial
    fn add(&self, counter: Counter, serial: &str, n: u64);

    /// Set the number of devices currently bridged
    fn set_device_count(&self, count: u64);
}

#[derive(Debug, Default)]
struct DeviceCounters {
    interface: String,
    values: [AtomicU64; 4],
}

impl DeviceCounters {
    fn slot(&self, counter: Counter) -> &AtomicU64 {
        let index = match counter {
            Counter::UsbReceiveBytes => 0,
            Counter::UsbSendBytes => 1,
            Counter::NetworkReceiveBytes => 2,
            Counter::NetworkSendBytes => 3,
        };
        &self.values[index]
    }
}

/// In-process telemetry registry
///
/// Counters survive a device detaching so that re-attaching the same serial
/// keeps them monotonic.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    devices: RwLock<HashMap<String, DeviceCounters>>,
    device_count: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the TAP interface a serial is bridged to
    ///
    /// Existing counter values are kept.
    pub fn register_device(&self, serial: &str, interface: &str) {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        devices.entry(serial.to_string()).or_default().interface = interface.to_string();
    }

    /// Current value of one counter, 0 for unknown serials
    pub fn counter(&self, counter: Counter, serial: &str) -> u64 {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices
            .get(serial)
            .map(|d| d.slot(counter).load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Current value of the device gauge
    pub fn device_count(&self) -> u64 {
        self.device_count.load(Ordering::Relaxed)
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "# HELP {} {}", DEVICE_COUNT, DEVICE_COUNT_HELP);
        let _ = writeln!(out, "# TYPE {} gauge", DEVICE_COUNT);
        let _ = writeln!(out, "{} {}", DEVICE_COUNT, self.device_count());

        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        let mut serials: Vec<&String> = devices.keys().collect();
        serials.sort();

        for counter in Counter::ALL {
            let _ = writeln!(out, "# HELP {} {}", counter.name(), counter.help());
            let _ = writeln!(out, "# TYPE {} counter", counter.name());

            for serial in &serials {
                let entry = &devices[*serial];
                let value = entry.slot(counter).load(Ordering::Relaxed);
                if counter.has_device_label() {
                    let _ = writeln!(
                        out,
                        "{}{{device=\"{}\",serial=\"{}\"}} {}",
                        counter.name(),
                        escape_label(&entry.interface),
                        escape_label(serial),
                        value
                    );
                } else {
                    let _ = writeln!(
                        out,
                        "{}{{serial=\"{}\"}} {}",
                        counter.name(),
                        escape_label(serial),
                        value
                    );
                }
            }
        }

        out
    }
}

impl TelemetrySink for MetricsRegistry {
    fn add(&self, counter: Counter, serial: &str, n: u64) {
        {
            let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = devices.get(serial) {
                entry.slot(counter).fetch_add(n, Ordering::Relaxed);
                return;
            }
        }

        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        devices
            .entry(serial.to_string())
            .or_default()
            .slot(counter)
            .fetch_add(n, Ordering::Relaxed);
    }

    fn set_device_count(&self, count: u64) {
        self.device_count.store(count, Ordering::Relaxed);
    }
}

/// Escape a label value for the text exposition format
fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}
