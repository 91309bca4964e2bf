//! Capability contracts implemented by the instrument façades.
//!
//! The bus itself does not consume these; they define the shape every
//! instrument built atop it exposes to the surrounding experiment logic.

use anyhow::Result;
use async_trait::async_trait;

use crate::com::Bus;

/// An instrument that owns a command bus and needs asynchronous
/// initialization before use.
#[async_trait]
pub trait UsesSerial {
    fn bus(&self) -> &Bus;

    async fn initialize(&self) -> Result<()>;
}

/// An instrument with one motion axis.
#[async_trait]
pub trait Positionable {
    /// Allowed position range in steps, inclusive.
    const RANGE: (i32, i32);
    /// Home position in steps.
    const HOME: i32;
    /// Conversion factor from micrometers to steps.
    const STEPS_PER_UM: f64;

    async fn pos(&self) -> Result<i32>;

    /// Command a move to an absolute position in steps.
    async fn move_to(&self, pos: i32) -> Result<()>;

    async fn is_moving(&self) -> Result<bool>;

    /// Convert a position in millimeters to steps.
    fn steps_from_mm(mm: f64) -> i32 {
        (mm * 1000.0 * Self::STEPS_PER_UM) as i32
    }
}
