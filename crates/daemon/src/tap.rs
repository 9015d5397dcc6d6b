//! TAP endpoint
//!
//! A layer 2 TAP interface carries one Ethernet frame per read or write.
//! Reads poll the descriptor with a short timeout so [`FrameDevice::close`]
//! from another thread unblocks a pending reader.

use nix::errno::Errno;
use nix::libc::{c_int, c_short};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info};

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

const TUN_DEVICE: &str = "/dev/net/tun";
const IFF_TAP: c_short = 0x0002;
const IFF_NO_PI: c_short = 0x1000;
const POLL_INTERVAL_MS: u16 = 100;

#[repr(C)]
struct IfReq {
    name: [u8; 16],
    flags: c_short,
    _pad: [u8; 22],
}

impl IfReq {
    fn new(name: &str, flags: c_short) -> Self {
        let mut req = Self {
            name: [0; 16],
            flags,
            _pad: [0; 22],
        };
        req.name[..name.len()].copy_from_slice(name.as_bytes());
        req
    }
}

nix::ioctl_write_ptr_bad!(
    tun_set_iff,
    nix::request_code_write!(b'T', 202, std::mem::size_of::<c_int>()),
    IfReq
);

#[derive(Debug, Error)]
pub enum TapError {
    #[error("Invalid interface name '{0}'")]
    InvalidName(String),

    #[error("Failed to open {path}: {source}")]
    Open {
        path: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("TUNSETIFF failed for {name}: {source}")]
    Ioctl {
        name: String,
        #[source]
        source: Errno,
    },

    #[error("Failed to bring {name} up: {reason}")]
    LinkUp { name: String, reason: String },
}

/// Frame-oriented network endpoint
pub trait FrameDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Block until one frame arrives; `Ok(0)` once closed
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Read a frame only if one is already queued
    ///
    /// Returns `Ok(None)` when nothing is queued or the device is closed.
    fn try_read_frame(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Write exactly one frame
    fn write_frame(&self, frame: &[u8]) -> io::Result<()>;

    fn close(&self);
}

/// Check a name against the kernel's interface name rules
pub fn validate_name(name: &str) -> Result<(), TapError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME_LEN
        && name != "."
        && name != ".."
        && !name
            .bytes()
            .any(|b| b == b'/' || b == b':' || b == 0 || b.is_ascii_whitespace());
    if valid {
        Ok(())
    } else {
        Err(TapError::InvalidName(name.to_string()))
    }
}

pub struct TapDevice {
    name: String,
    file: File,
    closed: AtomicBool,
}

impl TapDevice {
    /// Create (or attach to) the TAP interface `name`
    pub fn create(name: &str) -> Result<Self, TapError> {
        validate_name(name)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE)
            .map_err(|source| TapError::Open {
                path: TUN_DEVICE,
                source,
            })?;

        let req = IfReq::new(name, IFF_TAP | IFF_NO_PI);
        // SAFETY: req is a live, correctly sized ifreq and the descriptor is open
        unsafe { tun_set_iff(file.as_raw_fd(), &req) }.map_err(|source| TapError::Ioctl {
            name: name.to_string(),
            source,
        })?;

        info!("Created TAP interface {}", name);
        Ok(Self {
            name: name.to_string(),
            file,
            closed: AtomicBool::new(false),
        })
    }

    /// Set the link administratively up
    pub fn bring_up(&self) -> Result<(), TapError> {
        let output = Command::new("ip")
            .args(["link", "set", "dev", &self.name, "up"])
            .output()
            .map_err(|e| TapError::LinkUp {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(TapError::LinkUp {
                name: self.name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!("{} is up", self.name);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn wait_readable(&self, timeout: PollTimeout) -> io::Result<bool> {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => Ok(false),
            // errors and hangups surface from the following read
            Ok(_) => Ok(true),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read_ready(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match (&self.file).read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl FrameDevice for TapDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.is_closed() {
                return Ok(0);
            }
            if !self.wait_readable(PollTimeout::from(POLL_INTERVAL_MS))? {
                continue;
            }
            if let Some(n) = self.read_ready(buf)? {
                return Ok(n);
            }
        }
    }

    fn try_read_frame(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        if self.is_closed() || !self.wait_readable(PollTimeout::ZERO)? {
            return Ok(None);
        }
        self.read_ready(buf)
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "TAP device closed"));
        }
        let n = (&self.file).write(frame)?;
        if n != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short TAP write: {} of {} bytes", n, frame.len()),
            ));
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closing TAP interface {}", self.name);
        }
    }
}
