//! The FPGA, clearinghouse for everything without its own serial port:
//! emission filter, laser shutter, z-motion and tilt.
//!
//! The FPGA is the one instrument wired with separate command and
//! response ports, so it is opened over a split channel. Several logical
//! modules share the single bus; each holds a clone of the same
//! `Arc<Fpga>` and the bus's waiter list keeps their traffic sorted out.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;

use crate::com::Bus;
#[cfg(feature = "serial")]
use crate::com::{BusOptions, Instrument};
use crate::instruments::capabilities::UsesSerial;

pub mod cmd {
    use crate::com::{ok_if_match, ok_re, Cmd};
    use crate::error::{ComError, ComResult};
    use std::time::Duration;

    pub fn reset() -> Cmd<bool> {
        Cmd::new(
            "RESET",
            ok_if_match("@LOG The FPGA is now online.  Enjoy!\nRESET"),
        )
        .lines(2)
        .timeout(Duration::from_secs(10))
    }

    /// Emission filter into or out of the light path.
    pub fn em_filter(in_path: bool) -> Cmd<bool> {
        let text = if in_path { "EM2I" } else { "EM2O" };
        Cmd::new(text, ok_if_match(text))
    }

    /// Open or close a laser shutter.
    pub fn laser_shutter(open: bool) -> Cmd<bool> {
        Cmd::new(
            format!("SWLSRSHUT {}", u8::from(open)),
            ok_if_match("SWLSRSHUT"),
        )
    }

    /// Move the z-stage; the FPGA fires the camera trigger on the way.
    pub fn z_move(pos: u32) -> ComResult<Cmd<bool>> {
        const Z_MAX: u32 = 25000;
        if pos > Z_MAX {
            return Err(ComError::InvalidArgument {
                cmd: "ZMV",
                reason: format!("{pos} beyond {Z_MAX} steps"),
            });
        }
        Ok(Cmd::new(
            format!("ZMV {pos}"),
            ok_if_match("@LOG Trigger Camera\nZMV"),
        )
        .lines(2))
    }

    /// Tilt motor readback.
    pub fn tilt_pos(motor: u8) -> ComResult<Cmd<i32>> {
        if !(1..=3).contains(&motor) {
            return Err(ComError::InvalidArgument {
                cmd: "T_RD",
                reason: format!("tilt motor {motor} does not exist"),
            });
        }
        Ok(Cmd::new(
            format!("T{motor}RD"),
            crate::com::re_parse(&format!(r"T{motor}RD (\-?\d+)")),
        ))
    }

    pub fn tilt_move(motor: u8, pos: i32) -> ComResult<Cmd<bool>> {
        if !(1..=3).contains(&motor) {
            return Err(ComError::InvalidArgument {
                cmd: "T_MOVETO",
                reason: format!("tilt motor {motor} does not exist"),
            });
        }
        Ok(Cmd::new(
            format!("T{motor}MOVETO {pos}"),
            ok_re(&format!(r"T{motor}MOVETO \d+")),
        ))
    }
}

pub struct Fpga {
    bus: Bus,
}

impl Fpga {
    pub fn new(bus: Bus) -> Self {
        Self { bus }
    }

    /// The FPGA transmits commands on one port and replies on another.
    #[cfg(feature = "serial")]
    pub fn open(port_tx: &str, port_rx: &str) -> Result<Self> {
        let bus = Bus::open_pair(Instrument::Fpga, port_tx, port_rx, BusOptions::default())
            .context("failed to open FPGA ports")?;
        Ok(Self::new(bus))
    }

    pub async fn em_filter(&self, in_path: bool) -> Result<()> {
        self.bus.send(cmd::em_filter(in_path)).await?;
        Ok(())
    }

    pub async fn laser_shutter(&self, open: bool) -> Result<()> {
        self.bus.send(cmd::laser_shutter(open)).await?;
        Ok(())
    }

    pub async fn z_move(&self, pos: u32) -> Result<()> {
        self.bus.send(cmd::z_move(pos)?).await?;
        Ok(())
    }

    pub async fn tilt_pos(&self, motor: u8) -> Result<i32> {
        Ok(self.bus.send(cmd::tilt_pos(motor)?).await?)
    }

    pub async fn tilt_move(&self, motor: u8, pos: i32) -> Result<()> {
        self.bus.send(cmd::tilt_move(motor, pos)?).await?;
        Ok(())
    }
}

#[async_trait]
impl UsesSerial for Fpga {
    fn bus(&self) -> &Bus {
        &self.bus
    }

    async fn initialize(&self) -> Result<()> {
        info!("[fpga] resetting");
        self.bus.send(cmd::reset()).await?;
        Ok(())
    }
}
