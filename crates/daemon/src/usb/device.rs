//! rusb-backed device handle
//!
//! Wraps an opened [`rusb::DeviceHandle`] with its cached descriptor and
//! remembers what it claimed so [`RusbDevice::release`] can undo it.

use super::UsbError;
use super::activation::{AltSetting, Direction, EndpointInfo, UsbControl, VendorRequest};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, TransferType};
use std::time::Duration;
use tracing::{debug, warn};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

pub struct RusbDevice {
    device: Device<Context>,
    descriptor: DeviceDescriptor,
    handle: DeviceHandle<Context>,
    /// Interface claimed by us
    claimed: Option<u8>,
    /// Whether a kernel driver was detached from `claimed`
    detached_driver: bool,
}

impl RusbDevice {
    pub fn open(device: Device<Context>) -> Result<Self, UsbError> {
        let descriptor = device.device_descriptor()?;
        let handle = device.open()?;
        debug!(
            "Opened device bus {:03} address {:03}",
            device.bus_number(),
            device.address()
        );

        Ok(Self {
            device,
            descriptor,
            handle,
            claimed: None,
            detached_driver: false,
        })
    }

    pub fn handle(&self) -> &DeviceHandle<Context> {
        &self.handle
    }

    /// Release the claimed interface and give it back to the kernel
    pub fn release(&mut self) {
        let Some(interface) = self.claimed.take() else {
            return;
        };

        if let Err(e) = self.handle.release_interface(interface) {
            warn!("Failed to release interface {}: {}", interface, e);
        }
        if self.detached_driver {
            match self.handle.attach_kernel_driver(interface) {
                Ok(()) => debug!("Reattached kernel driver to interface {}", interface),
                Err(e) => debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                ),
            }
            self.detached_driver = false;
        }
        debug!("Released interface {}", interface);
    }
}

impl UsbControl for RusbDevice {
    fn num_configurations(&self) -> u8 {
        self.descriptor.num_configurations()
    }

    fn vendor_request(&mut self, request: &VendorRequest) -> Result<(), UsbError> {
        let mut response = vec![0u8; usize::from(request.length)];
        let n = self
            .handle
            .read_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                &mut response,
                CONTROL_TIMEOUT,
            )
            .map_err(|source| UsbError::ControlTransfer {
                request: request.request,
                source,
            })?;
        debug!(
            "Vendor request {} returned {:02x?}",
            request.request,
            &response[..n]
        );
        Ok(())
    }

    fn alt_settings(&self, configuration: u8) -> Result<Vec<AltSetting>, UsbError> {
        for index in 0..self.descriptor.num_configurations() {
            let config = self.device.config_descriptor(index)?;
            if config.number() != configuration {
                continue;
            }

            let mut settings = Vec::new();
            for interface in config.interfaces() {
                for descriptor in interface.descriptors() {
                    let endpoints = descriptor
                        .endpoint_descriptors()
                        .map(|e| EndpointInfo {
                            address: e.address(),
                            direction: match e.direction() {
                                rusb::Direction::In => Direction::In,
                                rusb::Direction::Out => Direction::Out,
                            },
                            bulk: e.transfer_type() == TransferType::Bulk,
                            max_packet_size: e.max_packet_size(),
                        })
                        .collect();

                    settings.push(AltSetting {
                        interface: descriptor.interface_number(),
                        setting: descriptor.setting_number(),
                        class: descriptor.class_code(),
                        sub_class: descriptor.sub_class_code(),
                        endpoints,
                    });
                }
            }
            return Ok(settings);
        }

        Err(UsbError::ConfigurationNotFound(configuration))
    }

    fn select_configuration(&mut self, configuration: u8) -> Result<(), UsbError> {
        if self.handle.active_configuration()? == configuration {
            debug!("Configuration {} already active", configuration);
            return Ok(());
        }
        self.handle.set_active_configuration(configuration)?;
        debug!("Selected configuration {}", configuration);
        Ok(())
    }

    fn claim(&mut self, interface: u8, setting: u8) -> Result<(), UsbError> {
        match self.handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                self.handle.detach_kernel_driver(interface)?;
                self.detached_driver = true;
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        self.handle.claim_interface(interface)?;
        self.claimed = Some(interface);
        self.handle.set_alternate_setting(interface, setting)?;
        debug!("Claimed interface {} alt {}", interface, setting);
        Ok(())
    }
}

impl Drop for RusbDevice {
    fn drop(&mut self) {
        self.release();
    }
}
