//! NCM activation sequence
//!
//! A freshly plugged iPhone advertises four configurations. Two vendor
//! requests make it re-enumerate with a fifth configuration whose CDC Data
//! interface carries the NCM bulk endpoints. [`activate`] drives that
//! sequence against anything implementing [`UsbControl`], so it can run
//! against a real handle or a recorded fake.

use super::UsbError;
use tracing::{debug, info};

/// Configuration value that carries the NCM function
pub const NCM_CONFIGURATION: u8 = 5;

/// Configuration count of a device already in NCM mode
pub const NCM_CONFIGURATION_COUNT: u8 = 5;

/// Interface and alternate setting real devices use for NCM data
pub const NCM_INTERFACE: u8 = 5;
pub const NCM_ALT_SETTING: u8 = 1;

/// USB class code for CDC Data
pub const CDC_DATA_CLASS: u8 = 10;
pub const CDC_DATA_SUBCLASS: u8 = 0;

/// Device-to-host vendor request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// Requests that switch the device into NCM mode, in order
pub const ENABLE_NCM: [VendorRequest; 2] = [
    VendorRequest {
        request_type: 0xC0,
        request: 69,
        value: 0,
        index: 0,
        length: 4,
    },
    VendorRequest {
        request_type: 0xC0,
        request: 82,
        value: 0,
        index: 3,
        length: 1,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub direction: Direction,
    pub bulk: bool,
    pub max_packet_size: u16,
}

/// One alternate setting of an interface in a configuration descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSetting {
    pub interface: u8,
    pub setting: u8,
    pub class: u8,
    pub sub_class: u8,
    pub endpoints: Vec<EndpointInfo>,
}

impl AltSetting {
    /// CDC Data with exactly two bulk endpoints
    pub fn is_ncm_data(&self) -> bool {
        self.class == CDC_DATA_CLASS
            && self.sub_class == CDC_DATA_SUBCLASS
            && self.endpoints.len() == 2
            && self.endpoints.iter().all(|e| e.bulk)
    }
}

/// Claimed NCM data interface and its endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NcmInterface {
    pub interface: u8,
    pub setting: u8,
    pub bulk_in: EndpointInfo,
    pub bulk_out: EndpointInfo,
}

impl NcmInterface {
    /// IN reads cover one packet, so a timed-out read never holds data
    pub fn read_chunk_len(&self) -> usize {
        usize::from(self.bulk_in.max_packet_size)
    }
}

/// Lifecycle of a device link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Opened,
    Reconfigured,
    Claimed,
    Ready,
    Closed,
}

pub(crate) fn log_transition(serial: &str, from: LinkState, to: LinkState) {
    debug!("{}: {:?} -> {:?}", serial, from, to);
}

/// Control operations needed to bring up the NCM interface
pub trait UsbControl {
    /// Number of configurations in the device descriptor
    fn num_configurations(&self) -> u8;

    /// Issue one vendor request, discarding the response payload
    fn vendor_request(&mut self, request: &VendorRequest) -> Result<(), UsbError>;

    /// All alternate settings of every interface in `configuration`
    fn alt_settings(&self, configuration: u8) -> Result<Vec<AltSetting>, UsbError>;

    fn select_configuration(&mut self, configuration: u8) -> Result<(), UsbError>;

    /// Detach any kernel driver, claim the interface and select the setting
    fn claim(&mut self, interface: u8, setting: u8) -> Result<(), UsbError>;
}

/// Bring a device from Opened to Ready
///
/// Errors are fatal for this attempt; the caller drops the device and the
/// supervisor retries on its next scan.
pub fn activate<D: UsbControl>(device: &mut D, serial: &str) -> Result<NcmInterface, UsbError> {
    let configurations = device.num_configurations();
    if configurations < NCM_CONFIGURATION_COUNT {
        info!(
            "{}: {} configurations advertised, enabling NCM",
            serial, configurations
        );
        for request in &ENABLE_NCM {
            device.vendor_request(request)?;
        }
    } else {
        debug!("{}: NCM configuration already present", serial);
    }
    log_transition(serial, LinkState::Opened, LinkState::Reconfigured);

    device.select_configuration(NCM_CONFIGURATION)?;
    let settings = device.alt_settings(NCM_CONFIGURATION)?;
    let data = settings
        .iter()
        .find(|s| s.interface == NCM_INTERFACE && s.setting == NCM_ALT_SETTING && s.is_ncm_data())
        .or_else(|| settings.iter().find(|s| s.is_ncm_data()))
        .ok_or(UsbError::NoDataInterface(NCM_CONFIGURATION))?;

    device.claim(data.interface, data.setting)?;
    log_transition(serial, LinkState::Reconfigured, LinkState::Claimed);

    let endpoint = |direction: Direction| {
        data.endpoints
            .iter()
            .find(|e| e.direction == direction)
            .copied()
            .ok_or_else(|| {
                UsbError::EndpointMismatch(format!(
                    "interface {} alt {} has no bulk {:?} endpoint",
                    data.interface, data.setting, direction
                ))
            })
    };
    let ncm = NcmInterface {
        interface: data.interface,
        setting: data.setting,
        bulk_in: endpoint(Direction::In)?,
        bulk_out: endpoint(Direction::Out)?,
    };

    log_transition(serial, LinkState::Claimed, LinkState::Ready);
    info!(
        "{}: NCM ready on interface {} alt {} (in {:#04x}, out {:#04x})",
        serial, ncm.interface, ncm.setting, ncm.bulk_in.address, ncm.bulk_out.address
    );
    Ok(ncm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Vendor(VendorRequest),
        Select(u8),
        Claim(u8, u8),
    }

    struct FakeDevice {
        configurations: u8,
        settings: Vec<AltSetting>,
        calls: Vec<Call>,
        fail_request: Option<u8>,
    }

    fn bulk(address: u8, direction: Direction) -> EndpointInfo {
        EndpointInfo {
            address,
            direction,
            bulk: true,
            max_packet_size: 512,
        }
    }

    fn data_setting(interface: u8, setting: u8) -> AltSetting {
        AltSetting {
            interface,
            setting,
            class: CDC_DATA_CLASS,
            sub_class: CDC_DATA_SUBCLASS,
            endpoints: vec![bulk(0x86, Direction::In), bulk(0x05, Direction::Out)],
        }
    }

    impl FakeDevice {
        fn new(configurations: u8) -> Self {
            Self {
                configurations,
                settings: vec![
                    AltSetting {
                        interface: 4,
                        setting: 0,
                        class: 2,
                        sub_class: 13,
                        endpoints: Vec::new(),
                    },
                    AltSetting {
                        endpoints: Vec::new(),
                        ..data_setting(5, 0)
                    },
                    data_setting(5, 1),
                ],
                calls: Vec::new(),
                fail_request: None,
            }
        }
    }

    impl UsbControl for FakeDevice {
        fn num_configurations(&self) -> u8 {
            self.configurations
        }

        fn vendor_request(&mut self, request: &VendorRequest) -> Result<(), UsbError> {
            self.calls.push(Call::Vendor(*request));
            if self.fail_request == Some(request.request) {
                return Err(UsbError::ControlTransfer {
                    request: request.request,
                    source: rusb::Error::Pipe,
                });
            }
            Ok(())
        }

        fn alt_settings(&self, _configuration: u8) -> Result<Vec<AltSetting>, UsbError> {
            Ok(self.settings.clone())
        }

        fn select_configuration(&mut self, configuration: u8) -> Result<(), UsbError> {
            self.calls.push(Call::Select(configuration));
            Ok(())
        }

        fn claim(&mut self, interface: u8, setting: u8) -> Result<(), UsbError> {
            self.calls.push(Call::Claim(interface, setting));
            Ok(())
        }
    }

    #[test]
    fn test_no_control_transfers_with_five_configurations() {
        let mut device = FakeDevice::new(5);
        activate(&mut device, "S1").unwrap();

        assert_eq!(device.calls, vec![Call::Select(5), Call::Claim(5, 1)]);
    }

    #[test]
    fn test_two_control_transfers_with_four_configurations() {
        let mut device = FakeDevice::new(4);
        activate(&mut device, "S1").unwrap();

        assert_eq!(
            device.calls,
            vec![
                Call::Vendor(ENABLE_NCM[0]),
                Call::Vendor(ENABLE_NCM[1]),
                Call::Select(5),
                Call::Claim(5, 1),
            ]
        );
        assert_eq!(
            ENABLE_NCM[0],
            VendorRequest {
                request_type: 0xC0,
                request: 69,
                value: 0,
                index: 0,
                length: 4
            }
        );
        assert_eq!(
            ENABLE_NCM[1],
            VendorRequest {
                request_type: 0xC0,
                request: 82,
                value: 0,
                index: 3,
                length: 1
            }
        );
    }

    #[test]
    fn test_control_transfer_failure_stops_activation() {
        let mut device = FakeDevice::new(4);
        device.fail_request = Some(69);

        let err = activate(&mut device, "S1").unwrap_err();
        assert!(matches!(err, UsbError::ControlTransfer { request: 69, .. }));
        assert_eq!(device.calls, vec![Call::Vendor(ENABLE_NCM[0])]);
    }

    #[test]
    fn test_endpoints_by_direction() {
        let mut device = FakeDevice::new(5);
        device.settings = vec![AltSetting {
            endpoints: vec![bulk(0x02, Direction::Out), bulk(0x81, Direction::In)],
            ..data_setting(5, 1)
        }];

        let ncm = activate(&mut device, "S1").unwrap();
        assert_eq!(ncm.bulk_in.address, 0x81);
        assert_eq!(ncm.bulk_out.address, 0x02);
        assert_eq!(ncm.read_chunk_len(), 512);
    }

    #[test]
    fn test_falls_back_to_any_data_setting() {
        let mut device = FakeDevice::new(5);
        device.settings = vec![data_setting(3, 2)];

        let ncm = activate(&mut device, "S1").unwrap();
        assert_eq!((ncm.interface, ncm.setting), (3, 2));
        assert_eq!(device.calls.last(), Some(&Call::Claim(3, 2)));
    }

    #[test]
    fn test_missing_data_interface() {
        let mut device = FakeDevice::new(5);
        device.settings.retain(|s| s.setting != 1);

        assert!(matches!(
            activate(&mut device, "S1"),
            Err(UsbError::NoDataInterface(5))
        ));
    }

    #[test]
    fn test_same_direction_endpoints_rejected() {
        let mut device = FakeDevice::new(5);
        device.settings = vec![AltSetting {
            endpoints: vec![bulk(0x81, Direction::In), bulk(0x82, Direction::In)],
            ..data_setting(5, 1)
        }];

        assert!(matches!(
            activate(&mut device, "S1"),
            Err(UsbError::EndpointMismatch(_))
        ));
    }

    #[test]
    fn test_is_ncm_data_requires_bulk() {
        let mut setting = data_setting(5, 1);
        assert!(setting.is_ncm_data());
        setting.endpoints[0].bulk = false;
        assert!(!setting.is_ncm_data());
    }
}
