//! Common utilities for cdc-ncm
//!
//! This crate provides the pieces shared by the bridge daemon that are not
//! tied to USB or the host network stack: error handling, logging setup and
//! the telemetry registry.

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use metrics::{Counter, MetricsRegistry, TelemetrySink};
