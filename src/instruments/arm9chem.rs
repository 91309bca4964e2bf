//! ARM9 fluidics/temperature controller.
//!
//! Colon-delimited protocol; every reply ends in `:A1` (or `:N0` on
//! error, which the parsers reject by not matching).

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use tokio::sync::Mutex;

use crate::com::Bus;
#[cfg(feature = "serial")]
use crate::com::{BusOptions, Instrument};
use crate::instruments::capabilities::UsesSerial;

pub mod cmd {
    use crate::com::{ok_re, re_map, re_parse, Cmd};
    use crate::error::{ComError, ComResult};

    pub fn identify() -> Cmd<String> {
        Cmd::new(
            "?IDN",
            re_map(r"^(.+):A1$", |caps| Some(caps.get(1)?.as_str().to_string())),
        )
    }

    pub fn init() -> Cmd<bool> {
        Cmd::new("INIT", ok_re(r"^A1$"))
    }

    /// Flowcell temperature in °C.
    pub fn fc_temp(fc: usize) -> ComResult<Cmd<f64>> {
        if fc > 1 {
            return Err(ComError::InvalidArgument {
                cmd: "FCTEMP",
                reason: format!("flowcell {fc} does not exist"),
            });
        }
        Ok(Cmd::new(
            format!("?FCTEMP:{fc}"),
            re_parse(r"^(\-?\d+\.?\d*)C:A1$"),
        ))
    }

    /// Reservoir temperatures: chiller reports three zones.
    pub fn reservoir_temps() -> Cmd<(f64, f64)> {
        Cmd::new(
            "?RETEMP:3",
            re_map(r"^(\-?\d+\.?\d*)C:(\-?\d+\.?\d*)C:.*:A1$", |caps| {
                let a = caps.get(1)?.as_str().parse().ok()?;
                let b = caps.get(2)?.as_str().parse().ok()?;
                Some((a, b))
            }),
        )
    }
}

pub struct Arm9Chem {
    bus: Bus,
    lock: Mutex<()>,
}

impl Arm9Chem {
    pub fn new(bus: Bus) -> Self {
        Self {
            bus,
            lock: Mutex::new(()),
        }
    }

    #[cfg(feature = "serial")]
    pub fn open(port: &str) -> Result<Self> {
        let bus = Bus::open(Instrument::Arm9Chem, port, BusOptions::default())
            .context("failed to open ARM9 port")?;
        Ok(Self::new(bus))
    }

    pub async fn identify(&self) -> Result<String> {
        Ok(self.bus.send(cmd::identify()).await?)
    }

    pub async fn fc_temp(&self, fc: usize) -> Result<f64> {
        let _guard = self.lock.lock().await;
        Ok(self.bus.send(cmd::fc_temp(fc)?).await?)
    }

    pub async fn reservoir_temps(&self) -> Result<(f64, f64)> {
        let _guard = self.lock.lock().await;
        Ok(self.bus.send(cmd::reservoir_temps()).await?)
    }
}

#[async_trait]
impl UsesSerial for Arm9Chem {
    fn bus(&self) -> &Bus {
        &self.bus
    }

    async fn initialize(&self) -> Result<()> {
        info!("[arm9chem] initializing");
        self.bus.send(cmd::identify()).await?;
        self.bus.send(cmd::init()).await?;
        Ok(())
    }
}
