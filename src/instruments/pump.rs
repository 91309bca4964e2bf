//! Kloehn syringe pumps (one per flowcell).
//!
//! Instructions compose and run when terminated with `R`: `V` sets speed,
//! `I`/`O` route the pump valve to the flowcell or waste, `A` sets the
//! absolute plunger target. Every reply starts with `/0` followed by a
//! status byte: `` ` `` means ready, `@` means busy.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::info;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::com::Bus;
#[cfg(feature = "serial")]
use crate::com::BusOptions;
use crate::com::Instrument;
use crate::instruments::capabilities::UsesSerial;

/// Full plunger travel in steps.
pub const STEPS: u32 = 48000;
pub const SPEED_RANGE: (u32, u32) = (60, 8000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Pull,
    Push,
}

pub mod cmd {
    use super::{Direction, SPEED_RANGE, STEPS};
    use crate::com::{re_map, re_parse, Cmd, Parser};
    use crate::error::{ComError, ComResult};

    /// Ready/busy status byte.
    pub(super) fn status_parser() -> Parser<bool> {
        re_map(r"/0([`@])", |caps| match caps.get(1)?.as_str() {
            "`" => Some(true),
            "@" => Some(false),
            _ => None,
        })
    }

    pub fn init() -> Cmd<bool> {
        Cmd::new("W4R", status_parser())
    }

    /// An empty instruction still elicits the status byte.
    pub fn status() -> Cmd<bool> {
        Cmd::new("", status_parser())
    }

    pub fn get_pos() -> Cmd<u32> {
        Cmd::new("?", re_parse(r"/0[`@](\d+)"))
    }

    pub fn stop() -> Cmd<bool> {
        Cmd::new("T", status_parser())
    }

    pub fn valve_out() -> Cmd<bool> {
        Cmd::new("OR", status_parser())
    }

    pub fn valve_in() -> Cmd<bool> {
        Cmd::new("IR", status_parser())
    }

    pub(super) fn pushpull(
        dir: Direction,
        pos: u32,
        sps: u32,
        reverse: bool,
    ) -> ComResult<Cmd<bool>> {
        if !(SPEED_RANGE.0..=SPEED_RANGE.1).contains(&sps) {
            return Err(ComError::InvalidArgument {
                cmd: "PUMP",
                reason: format!("speed {sps} outside {SPEED_RANGE:?} steps/s"),
            });
        }
        if pos > STEPS {
            return Err(ComError::InvalidArgument {
                cmd: "PUMP",
                reason: format!("position {pos} beyond {STEPS} steps"),
            });
        }
        // Reversed operation swaps which port the plunger works against.
        let valve = match (dir, reverse) {
            (Direction::Pull, false) | (Direction::Push, true) => 'I',
            (Direction::Push, false) | (Direction::Pull, true) => 'O',
        };
        Ok(Cmd::new(format!("V{sps}{valve}A{pos}R"), status_parser()))
    }
}

pub struct Pump {
    bus: Bus,
    name: &'static str,
    lock: Mutex<()>,
}

impl Pump {
    pub fn new(instrument: Instrument, bus: Bus) -> Self {
        let name = match instrument {
            Instrument::PumpB => "B",
            _ => "A",
        };
        Self {
            bus,
            name,
            lock: Mutex::new(()),
        }
    }

    #[cfg(feature = "serial")]
    pub fn open(instrument: Instrument, port: &str) -> Result<Self> {
        let bus = Bus::open(instrument, port, BusOptions::default())
            .context("failed to open pump port")?;
        Ok(Self::new(instrument, bus))
    }

    pub async fn pos(&self) -> Result<u32> {
        Ok(self.bus.send(cmd::get_pos()).await?)
    }

    pub async fn status(&self) -> Result<bool> {
        Ok(self.bus.send(cmd::status()).await?)
    }

    /// Poll until the pump reports ready.
    pub async fn wait_ready(&self, retries: usize) -> Result<()> {
        for _ in 0..retries {
            if self.bus.send(cmd::status()).await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        bail!("pump {} not ready after {retries} polls", self.name)
    }

    /// Pull the plunger out to `pos` steps.
    pub async fn pull(&self, pos: u32, sps: u32, reverse: bool) -> Result<()> {
        let _guard = self.lock.lock().await;
        let here = self.pos().await?;
        if here >= pos {
            bail!("pump {} already at {here}, cannot pull to {pos}", self.name);
        }
        self.bus
            .send(cmd::pushpull(Direction::Pull, pos, sps, reverse)?)
            .await?;
        Ok(())
    }

    /// Push the plunger back in to `pos` steps.
    pub async fn push(&self, pos: u32, sps: u32, reverse: bool) -> Result<()> {
        let _guard = self.lock.lock().await;
        let here = self.pos().await?;
        if here <= pos {
            bail!("pump {} already at {here}, cannot push to {pos}", self.name);
        }
        self.bus
            .send(cmd::pushpull(Direction::Push, pos, sps, reverse)?)
            .await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.bus.send(cmd::stop()).await?;
        Ok(())
    }

    pub async fn valve_waste(&self) -> Result<()> {
        self.bus.send(cmd::valve_out()).await?;
        Ok(())
    }

    pub async fn valve_flowcell(&self) -> Result<()> {
        self.bus.send(cmd::valve_in()).await?;
        Ok(())
    }
}

#[async_trait]
impl UsesSerial for Pump {
    fn bus(&self) -> &Bus {
        &self.bus
    }

    async fn initialize(&self) -> Result<()> {
        info!("[pump{}] initializing", self.name);
        self.bus.send(cmd::init()).await?;
        if self.pos().await? != 0 {
            info!("[pump{}] homing plunger", self.name);
            self.push(0, 8000, false).await?;
            self.wait_ready(10).await?;
        }
        Ok(())
    }
}
