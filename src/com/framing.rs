//! Per-instrument wire conventions.
//!
//! Every instrument on the machine speaks its own flavor of line-oriented
//! text over its serial link. This module pins down, per instrument: the
//! outbound framing (prefix and terminator bytes), the inbound separator
//! used to split the byte stream into logical lines, and the baud rate.
//!
//! Replies are 8-bit text, not UTF-8: the x-stage boot banner contains
//! `©` (0xA9), so everything goes through a latin-1 codec.

use std::fmt;

use once_cell::sync::Lazy;
use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::error::{ComError, ComResult};

/// One logical serial link on the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instrument {
    X,
    Y,
    LaserG,
    LaserR,
    Arm9Chem,
    PumpA,
    PumpB,
    ValveA1,
    ValveA2,
    ValveB1,
    ValveB2,
    Fpga,
}

impl Instrument {
    pub fn name(self) -> &'static str {
        match self {
            Instrument::X => "x",
            Instrument::Y => "y",
            Instrument::LaserG => "laser_g",
            Instrument::LaserR => "laser_r",
            Instrument::Arm9Chem => "arm9chem",
            Instrument::PumpA => "pumpa",
            Instrument::PumpB => "pumpb",
            Instrument::ValveA1 => "valve_a1",
            Instrument::ValveA2 => "valve_a2",
            Instrument::ValveB1 => "valve_b1",
            Instrument::ValveB2 => "valve_b2",
            Instrument::Fpga => "fpga",
        }
    }

    pub fn baud(self) -> u32 {
        match self {
            Instrument::Fpga | Instrument::Arm9Chem => 115_200,
            _ => 9600,
        }
    }

    /// Inbound line separator.
    pub fn separator(self) -> u8 {
        b'\n'
    }

    /// Render a command into its on-wire frame for this instrument.
    ///
    /// The y-stage is addressed as axis 1, so every command carries a `1`
    /// prefix. The pumps expect the `/1` device address.
    pub fn frame(self, cmd: &str) -> String {
        match self {
            Instrument::Y => format!("1{cmd}\r\n"),
            Instrument::Fpga => format!("{cmd}\n"),
            Instrument::PumpA | Instrument::PumpB => format!("/1{cmd}\r"),
            _ => format!("{cmd}\r"),
        }
    }

    /// Last byte of an outbound frame. The fake transport reads until this
    /// byte to recover command boundaries from the raw stream.
    pub fn frame_terminator(self) -> u8 {
        match self {
            Instrument::Y | Instrument::Fpga => b'\n',
            _ => b'\r',
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Known first lines of multi-line responses and unsolicited banners.
///
/// A receive buffer matching one of these is kept around waiting for the
/// rest of the response instead of being flagged as a protocol violation.
pub static PREAMBLES: Lazy<RegexSet> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    let set = RegexSet::new([
        r"@LOG The FPGA is now online\.  Enjoy!",
        r"\??PR MV",
        r"\??PR P",
        r">EX 1",
        r"1R\([A-Z]{2}\)",
        r"1Z.*",
        r"@LOG Trigger Camera",
        r"@TILTPOS[123] \-?\d+",
    ])
    .expect("preamble patterns are valid regexes");
    set
});

/// Bytes stripped from both ends of every received line: padding, ETX,
/// terminators, and the 0xFF noise some links emit on power-up.
const WIRE_TRIM: &[u8] = b" \x03\r\n\xff";

/// Trim wire noise from a raw line.
pub fn strip_wire(raw: &[u8]) -> &[u8] {
    let start = raw
        .iter()
        .position(|b| !WIRE_TRIM.contains(b))
        .unwrap_or(raw.len());
    let end = raw
        .iter()
        .rposition(|b| !WIRE_TRIM.contains(b))
        .map_or(start, |i| i + 1);
    &raw[start..end]
}

/// Decode 8-bit instrument text. Every byte maps to the Unicode code
/// point of the same value, so this never fails.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Encode text back to 8-bit instrument bytes. Fails on any character
/// above 0xFF rather than sending a mangled frame.
pub fn encode_latin1(s: &str) -> ComResult<Vec<u8>> {
    s.chars()
        .map(|c| {
            let cp = c as u32;
            if cp <= 0xFF {
                Ok(cp as u8)
            } else {
                Err(ComError::Encoding(c))
            }
        })
        .collect()
}
