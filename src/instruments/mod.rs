//! Instrument façades.
//!
//! Each façade owns a [`Bus`](crate::com::Bus) for its link, renders the
//! instrument's command vocabulary in a `cmd` submodule, and layers
//! whatever serialization the hardware demands (most of these devices
//! misbehave when a second command lands mid-operation) on top with a
//! per-façade async lock. The bus itself stays lock-free for callers.

pub mod arm9chem;
pub mod capabilities;
pub mod fpga;
pub mod laser;
pub mod pump;
pub mod valve;
pub mod xstage;
pub mod ystage;

pub use arm9chem::Arm9Chem;
pub use capabilities::{Positionable, UsesSerial};
pub use fpga::Fpga;
pub use laser::{Laser, LaserColor};
pub use pump::Pump;
pub use valve::Valve;
pub use xstage::XStage;
pub use ystage::YStage;
