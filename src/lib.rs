//! Async command buses for a multi-instrument sequencing machine.
//!
//! The machine hangs a dozen instruments off independent serial links:
//! motion stages, lasers, syringe pumps, selector valves, a fluidics
//! controller and an FPGA. Each speaks its own half-duplex ASCII dialect,
//! acknowledges on its own schedule and occasionally volunteers banner
//! lines nobody asked for. This crate gives every link a [`com::Bus`]
//! that serializes writes, paces them, and correlates replies back to
//! callers, and wraps each instrument in a typed façade under
//! [`instruments`].
//!
//! The [`fakes`] module provides in-process stand-ins for every
//! instrument so the whole stack runs without hardware.

pub mod com;
pub mod config;
pub mod error;
pub mod fakes;
pub mod instruments;

pub use com::{Bus, BusOptions, Cmd, Instrument};
pub use config::Settings;
pub use error::{ComError, ComResult};
