//! VICI rotary selector valves.
//!
//! One valve per physical port; the reagent-to-port pairing tables live
//! with the experiment logic, not here. Moving to the port the valve is
//! already on earns a `Bad command` reply, so moves check first.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::info;
use tokio::sync::Mutex;

use crate::com::Bus;
#[cfg(feature = "serial")]
use crate::com::{BusOptions, Instrument};
use crate::instruments::capabilities::UsesSerial;

pub mod cmd {
    use crate::com::{re_map, re_parse, Cmd};
    use crate::error::{ComError, ComResult};

    pub fn id() -> Cmd<String> {
        Cmd::new(
            "ID",
            re_map(r"ID = (.+)", |caps| Some(caps.get(1)?.as_str().to_string())),
        )
    }

    /// Clears the ID; the valve stays silent.
    pub const CLEAR_ID: &str = "*ID*";

    pub fn get_pos() -> Cmd<u8> {
        Cmd::new("CP", re_parse(r"Position is  = (\d+)"))
    }

    pub fn n_ports() -> Cmd<u8> {
        Cmd::new("NP", re_parse(r"NP = (\d+)"))
    }

    /// Fire-and-forget move; the valve does not reply to `GO`.
    pub fn set_pos(pos: u8, n_ports: u8) -> ComResult<String> {
        if pos < 1 || pos > n_ports {
            return Err(ComError::InvalidArgument {
                cmd: "GO",
                reason: format!("port {pos} outside [1, {n_ports}]"),
            });
        }
        Ok(format!("GO{pos}"))
    }
}

pub struct Valve {
    bus: Bus,
    n_ports: u8,
    lock: Mutex<()>,
}

impl Valve {
    pub fn new(bus: Bus, n_ports: u8) -> Self {
        Self {
            bus,
            n_ports,
            lock: Mutex::new(()),
        }
    }

    #[cfg(feature = "serial")]
    pub fn open(instrument: Instrument, port: &str, n_ports: u8) -> Result<Self> {
        let bus = Bus::open(instrument, port, BusOptions::default())
            .context("failed to open valve port")?;
        Ok(Self::new(bus, n_ports))
    }

    pub fn n_ports(&self) -> u8 {
        self.n_ports
    }

    pub async fn pos(&self) -> Result<u8> {
        Ok(self.bus.send(cmd::get_pos()).await?)
    }

    /// Move to a port, verifying the valve actually got there.
    pub async fn r#move(&self, pos: u8) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.bus.send(cmd::get_pos()).await? == pos {
            return Ok(());
        }
        self.bus.send_raw(&cmd::set_pos(pos, self.n_ports)?).await?;
        let now = self.bus.send(cmd::get_pos()).await?;
        if now != pos {
            bail!(
                "valve {} did not move to {pos}, stuck at {now}",
                self.bus.instrument()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl UsesSerial for Valve {
    fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Some units ship with a stored ID string that corrupts replies;
    /// clear it and verify.
    async fn initialize(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        info!("[{}] initializing", self.bus.instrument());
        if self.bus.send(cmd::id()).await? != "not used" {
            self.bus.send_raw(cmd::CLEAR_ID).await?;
            if self.bus.send(cmd::id()).await? != "not used" {
                bail!("{}: ID still set after clearing", self.bus.instrument());
            }
        }
        let n = self.bus.send(cmd::n_ports()).await?;
        if n != self.n_ports {
            bail!(
                "{}: expected {} ports, hardware reports {n}",
                self.bus.instrument(),
                self.n_ports
            );
        }
        Ok(())
    }
}
