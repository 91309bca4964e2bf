//! Configuration loading with Figment.
//!
//! Settings come from a TOML file merged with `SEQCOM_`-prefixed
//! environment variables, so a deployment can pin its serial ports in
//! `config.toml` and still override one of them per-shell. Nesting uses
//! a double underscore, keeping single underscores free for field names
//! like `pump_a`:
//!
//! ```text
//! SEQCOM_PORTS__Y=/dev/ttyUSB9
//! SEQCOM_PORTS__PUMP_A=/dev/ttyUSB20
//! SEQCOM_FAKE=true
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("configuration validation error: {0}")]
    Validation(String),
}

/// Serial port assignment for every instrument on the machine.
///
/// The FPGA is the only device with separate command and response ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ports {
    pub x: String,
    pub y: String,
    pub laser_g: String,
    pub laser_r: String,
    pub arm9chem: String,
    pub pump_a: String,
    pub pump_b: String,
    pub valve_a1: String,
    pub valve_a2: String,
    pub valve_b1: String,
    pub valve_b2: String,
    pub fpga_tx: String,
    pub fpga_rx: String,
}

/// Pacing overrides for links whose instruments need extra settling time
/// between commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpacingConfig {
    /// Floor applied to every link unless overridden below.
    #[serde(with = "humantime_serde", default = "default_spacing")]
    pub default: Duration,
    #[serde(with = "humantime_serde", default = "default_y_spacing")]
    pub y: Duration,
    #[serde(with = "humantime_serde", default = "default_x_spacing")]
    pub x: Duration,
    #[serde(with = "humantime_serde", default = "default_laser_spacing")]
    pub laser: Duration,
}

fn default_spacing() -> Duration {
    Duration::from_millis(10)
}

fn default_y_spacing() -> Duration {
    Duration::from_millis(20)
}

fn default_x_spacing() -> Duration {
    Duration::from_millis(300)
}

fn default_laser_spacing() -> Duration {
    Duration::from_millis(100)
}

impl Default for SpacingConfig {
    fn default() -> Self {
        Self {
            default: default_spacing(),
            y: default_y_spacing(),
            x: default_x_spacing(),
            laser: default_laser_spacing(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub ports: Ports,
    /// Run against in-process fake instruments instead of hardware.
    #[serde(default)]
    pub fake: bool,
    #[serde(default)]
    pub spacing: SpacingConfig,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config.toml")
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SEQCOM_").split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.fpga_tx == self.ports.fpga_rx {
            return Err(ConfigError::Validation(
                "fpga_tx and fpga_rx must be distinct ports".to_string(),
            ));
        }
        if self.spacing.default > Duration::from_secs(5) {
            return Err(ConfigError::Validation(format!(
                "default spacing {:?} is implausibly large",
                self.spacing.default
            )));
        }
        Ok(())
    }
}
