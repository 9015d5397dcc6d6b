//! Bridge launcher for real devices

use crate::bridge::{Bridge, BridgeOptions};
use crate::supervisor::{BridgeLauncher, BridgeSession};
use crate::tap::TapDevice;
use crate::usb::{DeviceInfo, NcmTransport, discovery};
use anyhow::{Context as _, Result};
use common::MetricsRegistry;
use rusb::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct UsbBridgeLauncher {
    context: Context,
    metrics: Arc<MetricsRegistry>,
    options: BridgeOptions,
    transfer_timeout: Duration,
}

impl UsbBridgeLauncher {
    pub fn new(
        context: Context,
        metrics: Arc<MetricsRegistry>,
        options: BridgeOptions,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            context,
            metrics,
            options,
            transfer_timeout,
        }
    }
}

impl BridgeLauncher for UsbBridgeLauncher {
    fn launch(&mut self, device: &DeviceInfo, interface: &str) -> Result<Box<dyn BridgeSession>> {
        let usb_device = discovery::find_device(&self.context, device.bus, device.address)?;
        let transport = NcmTransport::open(usb_device, &device.serial, self.transfer_timeout)
            .with_context(|| format!("Failed to activate NCM on {}", device.serial))?;
        debug!(
            "{}: read chunk {} bytes",
            device.serial,
            transport.interface().read_chunk_len()
        );

        let tap = TapDevice::create(interface)
            .with_context(|| format!("Failed to create TAP interface {}", interface))?;
        tap.bring_up()?;

        self.metrics.register_device(&device.serial, interface);
        let bridge = Bridge::start(
            &device.serial,
            Arc::new(transport),
            Arc::new(tap),
            self.metrics.clone(),
            self.options.clone(),
        )
        .with_context(|| format!("Failed to start pumps for {}", device.serial))?;
        debug!("{}: bridge launched", bridge.serial());

        Ok(Box::new(bridge))
    }
}
