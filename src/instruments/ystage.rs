//! Parker ViX-250IH y-stage.
//!
//! The controller is addressed as axis 1; the bus framing adds the `1`
//! prefix to every command and the controller echoes it back. Moves are
//! two-event exchanges: `GOTO(CHKMV)` is acknowledged immediately and the
//! downloaded `CHKMV` program emits `Move Done` once the axis settles,
//! which is what the delayed parser waits for.
//!
//! Reference: Parker ViX-IH user guide 7-03.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use tokio::sync::Mutex;

use crate::com::Bus;
#[cfg(feature = "serial")]
use crate::com::{BusOptions, Instrument};
use crate::instruments::capabilities::{Positionable, UsesSerial};

pub const RANGE: (i32, i32) = (-7_000_000, 7_500_000);

/// Servo tuning and velocity presets. Imaging crawls so the TDI camera
/// can keep up; moving runs the axis flat out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Imaging,
    Moving,
}

impl Mode {
    fn velocity(self) -> f64 {
        match self {
            Mode::Imaging => 0.154,
            Mode::Moving => 1.5,
        }
    }
}

pub mod cmd {
    use super::RANGE;
    use crate::com::{ok_if_match, ok_re, re_map, re_parse, Cmd};
    use crate::error::{ComError, ComResult};
    use std::time::Duration;

    /// Commands the controller answers by echoing them back.
    pub fn echo(text: &str) -> Cmd<bool> {
        Cmd::new(text, ok_if_match(format!("1{text}")))
    }

    pub fn set_pos(pos: i32) -> ComResult<Cmd<bool>> {
        if !(RANGE.0..=RANGE.1).contains(&pos) {
            return Err(ComError::InvalidArgument {
                cmd: "SET_POS",
                reason: format!("{pos} outside {RANGE:?}"),
            });
        }
        Ok(Cmd::new(format!("D{pos}"), ok_re(r"1D\-?\d+")))
    }

    pub fn get_pos() -> Cmd<i32> {
        Cmd::new("R(PA)", re_parse(r"1R\(PA\)\n1?\*([\d\+\-]+)")).lines(2)
    }

    pub fn target_pos() -> Cmd<i32> {
        Cmd::new("R(PT)", re_parse(r"1R\(PT\)\n1?\*([\d\+\-]+)")).lines(2)
    }

    pub fn is_moving() -> Cmd<bool> {
        Cmd::new(
            "R(MV)",
            re_map(r"1R\(MV\)\n1?\*([\d\+\-]+)", |caps| {
                caps.get(1)?.as_str().parse::<i32>().ok().map(|v| v != 0)
            }),
        )
        .lines(2)
    }

    /// Acknowledged now, resolved when the axis reports `Move Done`.
    pub fn move_done() -> Cmd<bool> {
        Cmd::new("GOTO(CHKMV)", ok_if_match("1GOTO(CHKMV)"))
            .delayed(ok_if_match("Move Done"))
            .timeout(Duration::from_secs(60))
    }

    pub fn gains(g: &str) -> Cmd<bool> {
        Cmd::new(format!("GAINS({g})"), ok_re(r"GAINS\(([\d\.,]+)\)"))
    }

    pub fn velocity(v: f64) -> ComResult<Cmd<bool>> {
        if !(0.0..=1.5).contains(&v) {
            return Err(ComError::InvalidArgument {
                cmd: "VELO",
                reason: format!("{v} outside [0, 1.5] rev/s"),
            });
        }
        Ok(Cmd::new(format!("V{v}"), ok_re(r"V([\d\.]+)")))
    }

    pub fn reset() -> Cmd<bool> {
        Cmd::new(
            "Z",
            ok_re(r"1Z\n\*ViX250IH\-Servo Drive\n\*REV 2\..+\n\*Copyright 2003 Parker\-Hannifin"),
        )
        .lines(4)
        .timeout(Duration::from_secs(10))
    }
}

pub struct YStage {
    bus: Bus,
    /// Serializes multi-command sequences (mode change + move).
    lock: Mutex<()>,
    mode: parking_lot::Mutex<Option<Mode>>,
}

impl YStage {
    pub fn new(bus: Bus) -> Self {
        Self {
            bus,
            lock: Mutex::new(()),
            mode: parking_lot::Mutex::new(None),
        }
    }

    #[cfg(feature = "serial")]
    pub fn open(port: &str) -> Result<Self> {
        let bus = Bus::open(
            Instrument::Y,
            port,
            BusOptions::default().min_spacing(Duration::from_millis(20)),
        )
        .context("failed to open y-stage port")?;
        Ok(Self::new(bus))
    }

    /// Move to an absolute position and return once the axis settles.
    pub async fn r#move(&self, pos: i32, slowly: bool) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mode = if slowly { Mode::Imaging } else { Mode::Moving };
        self.set_mode(mode).await?;
        info!("[y] moving to {pos} in {mode:?} mode");
        self.bus.send(cmd::set_pos(pos)?).await?;
        self.bus.send(cmd::echo("G")).await?;
        self.bus.send(cmd::move_done()).await?;
        Ok(())
    }

    pub async fn set_mode(&self, mode: Mode) -> Result<()> {
        if *self.mode.lock() == Some(mode) {
            return Ok(());
        }
        self.bus.send(cmd::velocity(mode.velocity())?).await?;
        *self.mode.lock() = Some(mode);
        Ok(())
    }
}

#[async_trait]
impl UsesSerial for YStage {
    fn bus(&self) -> &Bus {
        &self.bus
    }

    async fn initialize(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        info!("[y] initializing");
        self.bus.send(cmd::reset()).await?;
        // The controller drops characters while rebooting.
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Continuous execution, then download the CHKMV program that
        // reports move completion.
        for text in [
            "W(CQ,0)",
            "DECLARE(CHKMV)",
            "CHKMV:",
            "TR(MV,=,0)",
            "\"Move Done\"",
            "END",
            "BRAKE0",
        ] {
            self.bus.send(cmd::echo(text)).await?;
        }

        self.bus.send(cmd::gains("5,10,7,1.5,0")).await?;
        self.bus.send(cmd::velocity(Mode::Moving.velocity())?).await?;
        *self.mode.lock() = Some(Mode::Moving);
        for text in ["MA", "ON", "GH"] {
            self.bus.send(cmd::echo(text)).await?;
        }
        self.bus.send(cmd::move_done()).await?;
        info!("[y] initialized");
        Ok(())
    }
}

#[async_trait]
impl Positionable for YStage {
    const RANGE: (i32, i32) = RANGE;
    const HOME: i32 = 0;
    const STEPS_PER_UM: f64 = 100.0;

    async fn pos(&self) -> Result<i32> {
        Ok(self.bus.send(cmd::get_pos()).await?)
    }

    async fn move_to(&self, pos: i32) -> Result<()> {
        self.r#move(pos, false).await
    }

    async fn is_moving(&self) -> Result<bool> {
        Ok(self.bus.send(cmd::is_moving()).await?)
    }
}
