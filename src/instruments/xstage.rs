//! Schneider Electric (IMS) MDrive x-stage.
//!
//! `PR $VAR` prints a variable, `$VAR=$VAL` sets one. The controller
//! echoes set commands behind a `>` prompt. Reset is the bare ETX byte
//! and answers with a copyright banner containing `©`, which is why the
//! bus decodes latin-1 rather than UTF-8. The hardware chokes on closely
//! spaced commands, hence the 300 ms spacing.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use tokio::sync::Mutex;

use crate::com::Bus;
#[cfg(feature = "serial")]
use crate::com::{BusOptions, Instrument};
use crate::instruments::capabilities::{Positionable, UsesSerial};

pub const RANGE: (i32, i32) = (1000, 50000);

pub mod cmd {
    use super::RANGE;
    use crate::com::{ok_if_match, ok_re, re_map, re_parse, Cmd};
    use crate::error::{ComError, ComResult};

    /// Set commands come back behind the `>` prompt.
    pub fn echo(text: &str) -> Cmd<bool> {
        Cmd::new(text, ok_if_match(format!(">{text}")))
    }

    pub fn is_moving() -> Cmd<bool> {
        Cmd::new(
            "PR MV",
            re_map(r"\??PR MV\n(\-?\d+)", |caps| {
                caps.get(1)?.as_str().parse::<i32>().ok().map(|v| v != 0)
            }),
        )
        .lines(2)
    }

    pub fn get_pos() -> Cmd<i32> {
        Cmd::new("PR P", re_parse(r"\??PR P\n(\-?\d+)")).lines(2)
    }

    /// Move absolute; the reply echoes the target.
    pub fn set_pos(pos: i32) -> ComResult<Cmd<bool>> {
        if !(RANGE.0..=RANGE.1).contains(&pos) {
            return Err(ComError::InvalidArgument {
                cmd: "SET_POS",
                reason: format!("{pos} outside {RANGE:?}"),
            });
        }
        Ok(Cmd::new(format!("MA {pos},1"), ok_re(r"\??MA (\d+),1")))
    }

    pub fn reset() -> Cmd<bool> {
        Cmd::new(
            "\x03",
            ok_re(
                r"(Copyright© 2010 Schneider Electric Motion USA)|(Copyright© 2001-2009 by Intelligent Motion Systems, Inc\.)",
            ),
        )
    }
}

pub struct XStage {
    bus: Bus,
    lock: Mutex<()>,
}

impl XStage {
    pub fn new(bus: Bus) -> Self {
        Self {
            bus,
            lock: Mutex::new(()),
        }
    }

    #[cfg(feature = "serial")]
    pub fn open(port: &str) -> Result<Self> {
        let bus = Bus::open(
            Instrument::X,
            port,
            BusOptions::default().min_spacing(std::time::Duration::from_millis(300)),
        )
        .context("failed to open x-stage port")?;
        Ok(Self::new(bus))
    }
}

#[async_trait]
impl UsesSerial for XStage {
    fn bus(&self) -> &Bus {
        &self.bus
    }

    async fn initialize(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        info!("[x] initializing");
        self.bus.send(cmd::reset()).await?;

        for text in [
            "EM=0", "EE=1", "VI=640", "VM=6144", "A=4000", "D=4000", "S1=1,0,0", "S2=3,1,0",
            "S3=2,1,0", "SM=0", "LM=1", "DB=8", "D1=5", "HC=20", "RC=100",
        ] {
            self.bus.send(cmd::echo(text)).await?;
        }

        // Program 1: home to 30000.
        use crate::com::{ok_if_match, Cmd};
        self.bus.send(cmd::echo("PG 1")).await?;
        for (text, reply) in [
            ("HM 1", "1  HM 1"),
            ("H", "5  H"),
            ("P=30000", "7  P=30000"),
            ("E", "12  E"),
            ("PG", "14  PG"),
        ] {
            self.bus.send(Cmd::new(text, ok_if_match(reply))).await?;
        }
        self.bus
            .send(Cmd::new("EX 1", ok_if_match(">EX 1\n>")).lines(2))
            .await?;
        info!("[x] initialized");
        Ok(())
    }
}

#[async_trait]
impl Positionable for XStage {
    const RANGE: (i32, i32) = RANGE;
    const HOME: i32 = 30000;
    const STEPS_PER_UM: f64 = 0.4096;

    async fn pos(&self) -> Result<i32> {
        Ok(self.bus.send(cmd::get_pos()).await?)
    }

    /// Returns once the controller acknowledges the target.
    async fn move_to(&self, pos: i32) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.bus.send(cmd::set_pos(pos)?).await?;
        Ok(())
    }

    async fn is_moving(&self) -> Result<bool> {
        Ok(self.bus.send(cmd::is_moving()).await?)
    }
}
