//! Device enumeration

use super::UsbError;
use crate::supervisor::DeviceScanner;
use rusb::{Context, Device, DeviceDescriptor, UsbContext};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Matching device as seen by one scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial: String,
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub num_configurations: u8,
}

pub struct UsbScanner {
    context: Context,
    vendor_id: u16,
    product_ids: Vec<u16>,
    /// Serial numbers by (bus, address), so known devices are not reopened
    serials: HashMap<(u8, u8), String>,
}

impl UsbScanner {
    pub fn new(context: Context, vendor_id: u16, product_ids: Vec<u16>) -> Self {
        Self {
            context,
            vendor_id,
            product_ids,
            serials: HashMap::new(),
        }
    }

    fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        descriptor.vendor_id() == self.vendor_id
            && self.product_ids.contains(&descriptor.product_id())
    }

    /// Enumerate all attached devices with a matching VID/PID
    ///
    /// Devices whose serial cannot be read are skipped with a warning.
    pub fn matching_devices(&mut self) -> Result<Vec<DeviceInfo>, UsbError> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();

        for device in self.context.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    debug!(
                        "Skipping device at bus {:03} address {:03}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };
            if !self.matches(&descriptor) {
                continue;
            }

            let key = (device.bus_number(), device.address());
            seen.insert(key);

            let serial = match self.serials.get(&key) {
                Some(serial) => serial.clone(),
                None => match read_serial(&device, &descriptor) {
                    Ok(serial) => {
                        self.serials.insert(key, serial.clone());
                        serial
                    }
                    Err(e) => {
                        warn!(
                            "Could not read serial of {:04x}:{:04x} at bus {:03} address {:03}: {}",
                            descriptor.vendor_id(),
                            descriptor.product_id(),
                            key.0,
                            key.1,
                            e
                        );
                        continue;
                    }
                },
            };

            found.push(DeviceInfo {
                serial,
                bus: key.0,
                address: key.1,
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
                num_configurations: descriptor.num_configurations(),
            });
        }

        self.serials.retain(|key, _| seen.contains(key));
        Ok(found)
    }
}

impl DeviceScanner for UsbScanner {
    fn scan(&mut self) -> Result<Vec<DeviceInfo>, UsbError> {
        self.matching_devices()
    }
}

fn read_serial(
    device: &Device<Context>,
    descriptor: &DeviceDescriptor,
) -> Result<String, rusb::Error> {
    let handle = device.open()?;
    let serial = handle.read_serial_number_string_ascii(descriptor)?;
    Ok(clean_serial(&serial))
}

fn clean_serial(raw: &str) -> String {
    raw.trim_matches('\0').trim().to_string()
}

/// Find the device currently at (bus, address)
pub fn find_device(context: &Context, bus: u8, address: u8) -> Result<Device<Context>, UsbError> {
    context
        .devices()?
        .iter()
        .find(|d| d.bus_number() == bus && d.address() == address)
        .ok_or(UsbError::DeviceGone { bus, address })
}
