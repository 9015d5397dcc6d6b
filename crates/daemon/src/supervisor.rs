//! Device supervisor
//!
//! Owns one bridge per attached serial. Every scan launches bridges for new
//! serials, closes bridges whose device is gone and relaunches bridges that
//! stopped while their device stayed attached. Runs on its own thread and
//! stops on [`SupervisorCommand::Shutdown`].

use crate::bridge::Bridge;
use crate::tap::MAX_INTERFACE_NAME_LEN;
use crate::usb::{DeviceInfo, UsbError};
use async_channel::{Receiver, TryRecvError};
use common::TelemetrySink;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often the run loop checks for commands between scans
const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Source of attached devices
pub trait DeviceScanner: Send {
    fn scan(&mut self) -> Result<Vec<DeviceInfo>, UsbError>;
}

/// Builds a running bridge for one device
pub trait BridgeLauncher: Send {
    fn launch(
        &mut self,
        device: &DeviceInfo,
        interface: &str,
    ) -> anyhow::Result<Box<dyn BridgeSession>>;
}

/// Running bridge as seen by the supervisor
pub trait BridgeSession: Send {
    /// Idempotent
    fn close(&self);

    /// Both pumps have exited
    fn is_finished(&self) -> bool;

    fn join(self: Box<Self>);
}

impl BridgeSession for Bridge {
    fn close(&self) {
        Bridge::close(self);
    }

    fn is_finished(&self) -> bool {
        Bridge::is_finished(self)
    }

    fn join(self: Box<Self>) {
        Bridge::join(*self);
    }
}

#[derive(Debug)]
pub enum SupervisorCommand {
    Shutdown,
}

/// What one scan changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub attached: Vec<String>,
    pub detached: Vec<String>,
    pub relaunched: Vec<String>,
    pub failed: Vec<String>,
}

/// Stable TAP interface names per serial
#[derive(Debug)]
struct InterfaceNames {
    base: String,
    assigned: HashMap<String, String>,
}

impl InterfaceNames {
    fn new(base: &str) -> Self {
        Self {
            base: base.to_string(),
            assigned: HashMap::new(),
        }
    }

    /// First serial gets the base name, later ones a serial suffix
    ///
    /// Names never repeat; a clash falls back to a numeric tag.
    fn name_for(&mut self, serial: &str) -> String {
        if let Some(name) = self.assigned.get(serial) {
            return name.clone();
        }

        let preferred = if self.is_taken(&self.base) {
            suffixed_name(&self.base, serial)
        } else {
            self.base.clone()
        };
        let name = self.unique(preferred);
        self.assigned.insert(serial.to_string(), name.clone());
        name
    }

    fn is_taken(&self, name: &str) -> bool {
        self.assigned.values().any(|n| n == name)
    }

    fn unique(&self, candidate: String) -> String {
        if !self.is_taken(&candidate) {
            return candidate;
        }

        let mut n: u32 = 1;
        loop {
            let tag = n.to_string();
            let mut name = candidate.clone();
            fit(&mut name, MAX_INTERFACE_NAME_LEN - tag.len());
            name.push_str(&tag);
            if !self.is_taken(&name) {
                return name;
            }
            n += 1;
        }
    }
}

fn suffixed_name(base: &str, serial: &str) -> String {
    let suffix: String = serial.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    let room = MAX_INTERFACE_NAME_LEN.saturating_sub(base.len() + 1);
    let tail = &suffix[suffix.len().saturating_sub(room)..];

    let mut name = format!("{}-{}", base, tail);
    fit(&mut name, MAX_INTERFACE_NAME_LEN);
    name
}

/// Shorten `name` to at most `max` bytes on a char boundary
fn fit(name: &mut String, max: usize) {
    while name.len() > max {
        name.pop();
    }
}

pub struct Supervisor<S, L> {
    scanner: S,
    launcher: L,
    telemetry: Arc<dyn TelemetrySink>,
    bridges: HashMap<String, Box<dyn BridgeSession>>,
    names: InterfaceNames,
}

impl<S: DeviceScanner, L: BridgeLauncher> Supervisor<S, L> {
    pub fn new(
        scanner: S,
        launcher: L,
        telemetry: Arc<dyn TelemetrySink>,
        interface_name: &str,
    ) -> Self {
        Self {
            scanner,
            launcher,
            telemetry,
            bridges: HashMap::new(),
            names: InterfaceNames::new(interface_name),
        }
    }

    /// Serials with a registered bridge, sorted
    pub fn active_serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self.bridges.keys().cloned().collect();
        serials.sort();
        serials
    }

    /// Reconcile the registry with the attached devices
    pub fn scan(&mut self) -> Result<ScanReport, UsbError> {
        let devices = self.scanner.scan()?;
        let present: BTreeSet<&str> = devices.iter().map(|d| d.serial.as_str()).collect();
        let mut report = ScanReport::default();

        let gone: Vec<String> = self
            .bridges
            .keys()
            .filter(|serial| !present.contains(serial.as_str()))
            .cloned()
            .collect();
        for serial in gone {
            if let Some(bridge) = self.bridges.remove(&serial) {
                info!("{}: device detached", serial);
                bridge.close();
                bridge.join();
                report.detached.push(serial);
            }
        }

        let stopped: Vec<String> = self
            .bridges
            .iter()
            .filter(|(_, bridge)| bridge.is_finished())
            .map(|(serial, _)| serial.clone())
            .collect();
        for serial in &stopped {
            if let Some(bridge) = self.bridges.remove(serial) {
                warn!("{}: bridge stopped while attached, relaunching", serial);
                bridge.join();
            }
        }

        let mut seen = BTreeSet::new();
        for device in &devices {
            if !seen.insert(device.serial.as_str()) || self.bridges.contains_key(&device.serial) {
                continue;
            }

            let interface = self.names.name_for(&device.serial);
            match self.launcher.launch(device, &interface) {
                Ok(bridge) => {
                    self.bridges.insert(device.serial.clone(), bridge);
                    if stopped.contains(&device.serial) {
                        report.relaunched.push(device.serial.clone());
                    } else {
                        info!("{}: device attached as {}", device.serial, interface);
                        report.attached.push(device.serial.clone());
                    }
                }
                Err(e) => {
                    warn!(
                        "{}: failed to start bridge, retrying next scan: {:#}",
                        device.serial, e
                    );
                    report.failed.push(device.serial.clone());
                }
            }
        }

        self.telemetry.set_device_count(self.bridges.len() as u64);
        debug!("Scan complete: {} active bridge(s)", self.bridges.len());
        Ok(report)
    }

    /// Close every bridge and wait for its pumps
    pub fn shutdown(&mut self) {
        for bridge in self.bridges.values() {
            bridge.close();
        }
        for (serial, bridge) in self.bridges.drain() {
            bridge.join();
            debug!("{}: bridge joined", serial);
        }
        self.telemetry.set_device_count(0);
    }

    /// Scan every `interval` until told to stop
    pub fn run(mut self, interval: Duration, commands: Receiver<SupervisorCommand>) {
        info!("Supervisor started, scanning every {:?}", interval);

        loop {
            match self.scan() {
                Ok(report) if report != ScanReport::default() => {
                    info!("Active devices: {:?}", self.active_serials());
                }
                Ok(_) => {}
                Err(e) => error!("Device scan failed: {}", e),
            }

            let deadline = Instant::now() + interval;
            while Instant::now() < deadline {
                match commands.try_recv() {
                    Ok(SupervisorCommand::Shutdown) | Err(TryRecvError::Closed) => {
                        info!("Supervisor shutting down");
                        self.shutdown();
                        info!("Supervisor stopped");
                        return;
                    }
                    Err(TryRecvError::Empty) => thread::sleep(COMMAND_POLL_INTERVAL),
                }
            }
        }
    }
}

/// Run the supervisor on a dedicated thread
pub fn spawn_supervisor<S, L>(
    supervisor: Supervisor<S, L>,
    interval: Duration,
    commands: Receiver<SupervisorCommand>,
) -> std::io::Result<JoinHandle<()>>
where
    S: DeviceScanner + 'static,
    L: BridgeLauncher + 'static,
{
    thread::Builder::new()
        .name("supervisor".to_string())
        .spawn(move || supervisor.run(interval, commands))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::MetricsRegistry;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn device(serial: &str) -> DeviceInfo {
        DeviceInfo {
            serial: serial.to_string(),
            bus: 1,
            address: 2,
            vendor_id: 0x05AC,
            product_id: 0x12A8,
            num_configurations: 5,
        }
    }

    #[derive(Clone, Default)]
    struct FakeScanner {
        devices: Arc<Mutex<Vec<DeviceInfo>>>,
    }

    impl FakeScanner {
        fn set(&self, serials: &[&str]) {
            *self.devices.lock().unwrap() = serials.iter().map(|s| device(s)).collect();
        }
    }

    impl DeviceScanner for FakeScanner {
        fn scan(&mut self) -> Result<Vec<DeviceInfo>, UsbError> {
            Ok(self.devices.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct SessionState {
        close_calls: AtomicUsize,
        joined: AtomicBool,
        finished: AtomicBool,
    }

    struct FakeSession(Arc<SessionState>);

    impl BridgeSession for FakeSession {
        fn close(&self) {
            self.0.close_calls.fetch_add(1, Ordering::SeqCst);
        }

        fn is_finished(&self) -> bool {
            self.0.finished.load(Ordering::SeqCst)
        }

        fn join(self: Box<Self>) {
            self.0.joined.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct FakeLauncher {
        launched: Arc<Mutex<Vec<(String, String, Arc<SessionState>)>>>,
        failing: Arc<Mutex<Vec<String>>>,
    }

    impl FakeLauncher {
        fn sessions(&self, serial: &str) -> Vec<Arc<SessionState>> {
            self.launched
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _, _)| s == serial)
                .map(|(_, _, state)| state.clone())
                .collect()
        }

        fn interface(&self, serial: &str) -> String {
            self.launched
                .lock()
                .unwrap()
                .iter()
                .find(|(s, _, _)| s == serial)
                .map(|(_, name, _)| name.clone())
                .unwrap()
        }
    }

    impl BridgeLauncher for FakeLauncher {
        fn launch(
            &mut self,
            device: &DeviceInfo,
            interface: &str,
        ) -> anyhow::Result<Box<dyn BridgeSession>> {
            if self.failing.lock().unwrap().contains(&device.serial) {
                anyhow::bail!("control transfer failed");
            }
            let state = Arc::new(SessionState::default());
            self.launched.lock().unwrap().push((
                device.serial.clone(),
                interface.to_string(),
                state.clone(),
            ));
            Ok(Box::new(FakeSession(state)))
        }
    }

    struct Fixture {
        scanner: FakeScanner,
        launcher: FakeLauncher,
        metrics: Arc<MetricsRegistry>,
        supervisor: Supervisor<FakeScanner, FakeLauncher>,
    }

    fn fixture() -> Fixture {
        let scanner = FakeScanner::default();
        let launcher = FakeLauncher::default();
        let metrics = Arc::new(MetricsRegistry::new());
        let supervisor = Supervisor::new(
            scanner.clone(),
            launcher.clone(),
            metrics.clone(),
            "iphone",
        );
        Fixture {
            scanner,
            launcher,
            metrics,
            supervisor,
        }
    }

    #[test]
    fn test_attach_then_detach_closes_once() {
        let mut f = fixture();

        f.scanner.set(&["S1"]);
        let report = f.supervisor.scan().unwrap();
        assert_eq!(report.attached, vec!["S1"]);
        assert_eq!(f.supervisor.active_serials(), vec!["S1"]);
        assert_eq!(f.metrics.device_count(), 1);

        f.scanner.set(&[]);
        let report = f.supervisor.scan().unwrap();
        assert_eq!(report.detached, vec!["S1"]);
        assert!(f.supervisor.active_serials().is_empty());
        assert_eq!(f.metrics.device_count(), 0);

        let sessions = f.launcher.sessions("S1");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].close_calls.load(Ordering::SeqCst), 1);
        assert!(sessions[0].joined.load(Ordering::SeqCst));
    }

    #[test]
    fn test_repeat_scan_keeps_bridge() {
        let mut f = fixture();
        f.scanner.set(&["S1"]);

        f.supervisor.scan().unwrap();
        let report = f.supervisor.scan().unwrap();

        assert_eq!(report, ScanReport::default());
        assert_eq!(f.launcher.sessions("S1").len(), 1);
        assert_eq!(
            f.launcher.sessions("S1")[0].close_calls.load(Ordering::SeqCst),
            0
        );
    }

    #[test]
    fn test_reattach_creates_new_bridge() {
        let mut f = fixture();

        f.scanner.set(&["S1"]);
        f.supervisor.scan().unwrap();
        f.scanner.set(&[]);
        f.supervisor.scan().unwrap();
        f.scanner.set(&["S1"]);
        f.supervisor.scan().unwrap();

        let sessions = f.launcher.sessions("S1");
        assert_eq!(sessions.len(), 2);
        assert!(!Arc::ptr_eq(&sessions[0], &sessions[1]));
        assert_eq!(sessions[1].close_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.supervisor.active_serials(), vec!["S1"]);
    }

    #[test]
    fn test_failed_launch_retried_next_scan() {
        let mut f = fixture();
        f.scanner.set(&["S1"]);
        f.launcher.failing.lock().unwrap().push("S1".to_string());

        let report = f.supervisor.scan().unwrap();
        assert_eq!(report.failed, vec!["S1"]);
        assert!(f.supervisor.active_serials().is_empty());
        assert_eq!(f.metrics.device_count(), 0);

        f.launcher.failing.lock().unwrap().clear();
        let report = f.supervisor.scan().unwrap();
        assert_eq!(report.attached, vec!["S1"]);
    }

    #[test]
    fn test_finished_bridge_relaunched() {
        let mut f = fixture();
        f.scanner.set(&["S1"]);
        f.supervisor.scan().unwrap();

        f.launcher.sessions("S1")[0]
            .finished
            .store(true, Ordering::SeqCst);
        let report = f.supervisor.scan().unwrap();

        assert_eq!(report.relaunched, vec!["S1"]);
        let sessions = f.launcher.sessions("S1");
        assert_eq!(sessions.len(), 2);
        assert!(sessions[0].joined.load(Ordering::SeqCst));
        assert_eq!(f.launcher.interface("S1"), "iphone");
    }

    #[test]
    fn test_duplicate_serial_launched_once() {
        let mut f = fixture();
        f.scanner.set(&["S1", "S1"]);

        f.supervisor.scan().unwrap();
        assert_eq!(f.launcher.sessions("S1").len(), 1);
    }

    #[test]
    fn test_interface_names() {
        let mut f = fixture();
        f.scanner.set(&["00008030-001A2B3C"]);
        f.supervisor.scan().unwrap();
        f.scanner.set(&["00008030-001A2B3C", "00008101-000F1E2D"]);
        f.supervisor.scan().unwrap();

        assert_eq!(f.launcher.interface("00008030-001A2B3C"), "iphone");
        assert_eq!(f.launcher.interface("00008101-000F1E2D"), "iphone-000F1E2D");
    }

    #[test]
    fn test_name_kept_across_reattach() {
        let mut names = InterfaceNames::new("iphone");
        assert_eq!(names.name_for("A1"), "iphone");
        assert_eq!(names.name_for("B2"), "iphone-B2");
        assert_eq!(names.name_for("A1"), "iphone");
    }

    #[test]
    fn test_suffixed_name_fits() {
        assert_eq!(suffixed_name("iphone", "00008030-001A2B3C"), "iphone-001A2B3C");
        assert_eq!(suffixed_name("averylongname", "ABCDEF"), "averylongname-F");
        assert!(suffixed_name("averylongnamex", "ABCDEF").len() <= MAX_INTERFACE_NAME_LEN);
        assert_eq!(suffixed_name("iphoneé", "ABC"), "iphoneé-ABC");
        assert_eq!(suffixed_name("abcdefghijklmé", "ABC"), "abcdefghijklmé");
    }

    fn assert_distinct(base: &str, serials: &[&str]) {
        let mut names = InterfaceNames::new(base);
        let assigned: Vec<String> = serials.iter().map(|s| names.name_for(s)).collect();
        for (i, name) in assigned.iter().enumerate() {
            assert!(name.len() <= MAX_INTERFACE_NAME_LEN, "{} too long", name);
            assert!(!assigned[..i].contains(name), "{} assigned twice", name);
        }
    }

    #[test]
    fn test_names_distinct_for_full_length_base() {
        assert_distinct("abcdefghijklmno", &["S1", "S2", "S3"]);

        let mut names = InterfaceNames::new("abcdefghijklmno");
        assert_eq!(names.name_for("S1"), "abcdefghijklmno");
        assert_eq!(names.name_for("S2"), "abcdefghijklmn1");
    }

    #[test]
    fn test_names_distinct_without_suffix_room() {
        assert_distinct("abcdefghijklmn", &["S1", "S2", "S3", "S4"]);
    }

    #[test]
    fn test_names_distinct_for_shared_serial_tail() {
        let serials = ["00008030-00000000", "AAAA-11111111", "BBBB-11111111", "CCCC-11111111"];
        assert_distinct("iphone", &serials);

        let mut names = InterfaceNames::new("iphone");
        let assigned: Vec<String> = serials.iter().map(|s| names.name_for(s)).collect();
        assert_eq!(assigned[1], "iphone-11111111");
        assert_eq!(assigned[2], "iphone-11111112");
    }

    #[test]
    fn test_shutdown_closes_all() {
        let mut f = fixture();
        f.scanner.set(&["S1", "S2"]);
        f.supervisor.scan().unwrap();

        f.supervisor.shutdown();
        for serial in ["S1", "S2"] {
            let state = &f.launcher.sessions(serial)[0];
            assert_eq!(state.close_calls.load(Ordering::SeqCst), 1);
            assert!(state.joined.load(Ordering::SeqCst));
        }
        assert!(f.supervisor.active_serials().is_empty());
        assert_eq!(f.metrics.device_count(), 0);
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let f = fixture();
        f.scanner.set(&["S1"]);
        let launcher = f.launcher.clone();
        let (tx, rx) = async_channel::unbounded();

        let handle = spawn_supervisor(f.supervisor, Duration::from_secs(60), rx).unwrap();
        tx.send_blocking(SupervisorCommand::Shutdown).unwrap();
        handle.join().unwrap();

        let sessions = launcher.sessions("S1");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].close_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.metrics.device_count(), 0);
    }
}
