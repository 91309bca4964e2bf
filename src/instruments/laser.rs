//! MPB Communications laser modules (green and red).
//!
//! `ON`/`OFF` go unanswered, so they are fire-and-forget. The module
//! tends to report a status error on the first queries after power-up;
//! callers should treat an early `DISABLED` with suspicion.

#[cfg(feature = "serial")]
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use tokio::sync::Mutex;

use crate::com::Bus;
#[cfg(feature = "serial")]
use crate::com::BusOptions;
use crate::com::Instrument;
use crate::instruments::capabilities::UsesSerial;

pub const POWER_RANGE: (u32, u32) = (0, 500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaserColor {
    Green,
    Red,
}

impl LaserColor {
    pub fn instrument(self) -> Instrument {
        match self {
            LaserColor::Green => Instrument::LaserG,
            LaserColor::Red => Instrument::LaserR,
        }
    }
}

pub mod cmd {
    use super::POWER_RANGE;
    use crate::com::{ok_if_match_any, re_map, re_parse, Cmd};
    use crate::error::{ComError, ComResult};

    /// The module does not acknowledge setpoint changes, so this renders
    /// a fire-and-forget command string.
    pub fn set_power(mw: u32) -> ComResult<String> {
        if !(POWER_RANGE.0..=POWER_RANGE.1).contains(&mw) {
            return Err(ComError::InvalidArgument {
                cmd: "SET_POWER",
                reason: format!("{mw} mW outside {POWER_RANGE:?}"),
            });
        }
        Ok(format!("POWER={mw}"))
    }

    pub fn get_power() -> Cmd<u32> {
        Cmd::new("POWER?", re_parse(r"^(\d+)mW$"))
    }

    pub fn get_status() -> Cmd<bool> {
        Cmd::new(
            "STAT?",
            re_map(r"^(ENABLED|DISABLED)$", |caps| {
                Some(caps.get(1)?.as_str() == "ENABLED")
            }),
        )
    }

    pub fn version() -> Cmd<bool> {
        Cmd::new(
            "VERSION?",
            ok_if_match_any(&["SMD-G-1.1.2", "SMD-G-1.1.1", "SMD12/6H-3.1.0"]),
        )
    }
}

pub struct Laser {
    bus: Bus,
    color: LaserColor,
    /// The module eats the second command if it arrives before the first
    /// one returns.
    lock: Mutex<()>,
}

impl Laser {
    pub fn new(color: LaserColor, bus: Bus) -> Self {
        Self {
            bus,
            color,
            lock: Mutex::new(()),
        }
    }

    #[cfg(feature = "serial")]
    pub fn open(color: LaserColor, port: &str) -> Result<Self> {
        let bus = Bus::open(
            color.instrument(),
            port,
            BusOptions::default().min_spacing(Duration::from_millis(100)),
        )
        .context("failed to open laser port")?;
        Ok(Self::new(color, bus))
    }

    pub fn color(&self) -> LaserColor {
        self.color
    }

    pub async fn set_onoff(&self, on: bool) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.bus.send_raw(if on { "ON" } else { "OFF" }).await?;
        Ok(())
    }

    pub async fn on(&self) -> Result<()> {
        self.set_onoff(true).await
    }

    pub async fn off(&self) -> Result<()> {
        self.set_onoff(false).await
    }

    /// Set output power. The laser takes a while to warm up; this only
    /// commands the setpoint.
    pub async fn set_power(&self, mw: u32) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.bus.send_raw(&cmd::set_power(mw)?).await?;
        Ok(())
    }

    pub async fn power(&self) -> Result<u32> {
        let _guard = self.lock.lock().await;
        Ok(self.bus.send(cmd::get_power()).await?)
    }

    pub async fn status(&self) -> Result<bool> {
        let _guard = self.lock.lock().await;
        Ok(self.bus.send(cmd::get_status()).await?)
    }
}

#[async_trait]
impl UsesSerial for Laser {
    fn bus(&self) -> &Bus {
        &self.bus
    }

    async fn initialize(&self) -> Result<()> {
        info!("[{}] checking laser firmware", self.bus.instrument());
        self.bus.send(cmd::version()).await?;
        Ok(())
    }
}
