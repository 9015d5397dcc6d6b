//! Startup checks
//!
//! Run in order: operating system, usbmuxd version, effective user.

use semver::Version;
use std::io;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

const USBMUXD: &str = "usbmuxd";

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("cdc-ncm only runs on linux, not {0}")]
    UnsupportedOs(String),

    #[error("cdc-ncm must run as root (effective uid is {0})")]
    NotRoot(u32),

    #[error("Could not run usbmuxd --version, is usbmuxd installed? ({0})")]
    UsbmuxdMissing(#[source] io::Error),

    #[error("Could not parse usbmuxd version from '{output}': {source}")]
    UnparseableVersion {
        output: String,
        #[source]
        source: semver::Error,
    },

    #[error("usbmuxd {found} is too old, at least {required} is required")]
    VersionTooOld { found: Version, required: Version },
}

#[derive(Debug, Clone)]
pub struct PreflightOptions {
    pub min_usbmuxd_version: Version,
    pub skip_usbmuxd_check: bool,
}

pub fn check_os(os: &str) -> Result<(), PreflightError> {
    if os == "linux" {
        Ok(())
    } else {
        Err(PreflightError::UnsupportedOs(os.to_string()))
    }
}

pub fn check_root(euid: u32) -> Result<(), PreflightError> {
    if euid == 0 {
        Ok(())
    } else {
        Err(PreflightError::NotRoot(euid))
    }
}

/// Parse `usbmuxd --version` output such as `usbmuxd 1.1.1-56-g360619c`
pub fn parse_usbmuxd_version(output: &str) -> Result<Version, PreflightError> {
    let line = output.trim().lines().next().unwrap_or_default().trim();
    let version = line.strip_prefix("usbmuxd ").unwrap_or(line).trim();

    Version::parse(version).map_err(|source| PreflightError::UnparseableVersion {
        output: line.to_string(),
        source,
    })
}

pub fn check_usbmuxd_version(found: &Version, required: &Version) -> Result<(), PreflightError> {
    if found >= required {
        Ok(())
    } else {
        Err(PreflightError::VersionTooOld {
            found: found.clone(),
            required: required.clone(),
        })
    }
}

fn usbmuxd_version() -> Result<Version, PreflightError> {
    let output = Command::new(USBMUXD)
        .arg("--version")
        .output()
        .map_err(PreflightError::UsbmuxdMissing)?;

    // some builds print the version on stderr
    let text = if output.stdout.iter().all(u8::is_ascii_whitespace) {
        String::from_utf8_lossy(&output.stderr).into_owned()
    } else {
        String::from_utf8_lossy(&output.stdout).into_owned()
    };
    debug!("usbmuxd --version: {}", text.trim());
    parse_usbmuxd_version(&text)
}

/// Run all checks; any error is fatal for the process
pub fn run(options: &PreflightOptions) -> Result<(), PreflightError> {
    check_os(std::env::consts::OS)?;

    if options.skip_usbmuxd_check {
        debug!("Skipping usbmuxd version check");
    } else {
        let found = usbmuxd_version()?;
        check_usbmuxd_version(&found, &options.min_usbmuxd_version)?;
        info!("usbmuxd {}", found);
    }

    check_root(nix::unistd::geteuid().as_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> Version {
        Version::parse("1.1.1-56-g360619c").unwrap()
    }

    #[test]
    fn test_parse_git_describe_version() {
        let version = parse_usbmuxd_version("usbmuxd 1.1.1-56-g360619c\n").unwrap();
        assert_eq!(version, required());
    }

    #[test]
    fn test_parse_release_version() {
        let version = parse_usbmuxd_version("usbmuxd 1.1.1").unwrap();
        assert_eq!(version, Version::new(1, 1, 1));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_usbmuxd_version("usbmuxd: command not found"),
            Err(PreflightError::UnparseableVersion { .. })
        ));
        assert!(parse_usbmuxd_version("").is_err());
    }

    #[test]
    fn test_version_ordering() {
        assert!(check_usbmuxd_version(&required(), &required()).is_ok());
        assert!(check_usbmuxd_version(&Version::new(1, 1, 1), &required()).is_ok());
        assert!(check_usbmuxd_version(&Version::new(1, 2, 0), &required()).is_ok());
        assert!(matches!(
            check_usbmuxd_version(&Version::new(1, 1, 0), &required()),
            Err(PreflightError::VersionTooOld { .. })
        ));
    }

    #[test]
    fn test_check_os() {
        assert!(check_os("linux").is_ok());
        assert!(matches!(
            check_os("macos"),
            Err(PreflightError::UnsupportedOs(_))
        ));
    }

    #[test]
    fn test_check_root() {
        assert!(check_root(0).is_ok());
        assert!(matches!(check_root(1000), Err(PreflightError::NotRoot(1000))));
    }
}
