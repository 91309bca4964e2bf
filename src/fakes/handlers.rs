//! Scripted per-instrument responders.
//!
//! Each responder maps one received command (framed prefix included,
//! terminator stripped) to the reply text the real hardware would send.
//! Multi-line replies are `\n`-joined; the transport splits and frames
//! them. An empty reply means the device stays silent for that command.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::com::Instrument;

pub trait Responder: Send {
    fn respond(&mut self, cmd: &str) -> String;
}

pub fn responder_for(instrument: Instrument) -> Box<dyn Responder> {
    match instrument {
        Instrument::X => Box::new(FakeX),
        Instrument::Y => Box::new(FakeY),
        Instrument::LaserG | Instrument::LaserR => Box::new(FakeLaser),
        Instrument::Arm9Chem => Box::new(FakeArm9),
        Instrument::PumpA | Instrument::PumpB => Box::new(FakePump::default()),
        Instrument::ValveA1 | Instrument::ValveA2 | Instrument::ValveB1 | Instrument::ValveB2 => {
            Box::new(FakeValve::default())
        }
        Instrument::Fpga => Box::new(FakeFpga),
    }
}

struct FakeX;

impl Responder for FakeX {
    fn respond(&mut self, cmd: &str) -> String {
        if let Some(rest) = cmd.strip_prefix("PR ") {
            // Position reads back 12000; the axis is never moving.
            let value = if rest == "MV" { 0 } else { 12000 };
            return format!("PR {rest}\n{value}");
        }
        if cmd.starts_with("MA ") {
            return "MA 0,1".to_string();
        }
        match cmd {
            "\x03" => "Copyright\u{a9} 2010 Schneider Electric Motion USA".to_string(),
            "HM 1" => "1  HM 1".to_string(),
            "H" => "5  H".to_string(),
            "P=30000" => "7  P=30000".to_string(),
            "E" => "12  E".to_string(),
            "PG" => "14  PG".to_string(),
            "EX 1" => ">EX 1\n>".to_string(),
            other => format!(">{other}"),
        }
    }
}

struct FakeY;

impl Responder for FakeY {
    fn respond(&mut self, cmd: &str) -> String {
        // Commands arrive with the axis-1 prefix.
        let cmd = cmd.strip_prefix('1').unwrap_or(cmd);
        if let Some(rest) = cmd.strip_prefix("R(") {
            return format!("1R({rest}\n*+0");
        }
        match cmd {
            "Z" => {
                "1Z\n*ViX250IH-Servo Drive\n*REV 2.4 Jul 07 2005 10:08:34\n*Copyright 2003 Parker-Hannifin"
                    .to_string()
            }
            "GOTO(CHKMV)" => "1GOTO(CHKMV)\nMove Done".to_string(),
            c if c.starts_with("GAINS") => "1GAINS(5,10,7,1.5,0)".to_string(),
            c => format!("1{c}"),
        }
    }
}

struct FakeLaser;

impl Responder for FakeLaser {
    fn respond(&mut self, cmd: &str) -> String {
        match cmd {
            "ON" | "OFF" => String::new(),
            "POWER?" => "0000mW".to_string(),
            "STAT?" => "ENABLED".to_string(),
            "VERSION?" => "SMD-G-1.1.2".to_string(),
            c if c.starts_with("POWER=") => String::new(),
            _ => "what?".to_string(),
        }
    }
}

#[derive(Default)]
struct FakePump {
    pos: u32,
}

static PUMP_MOVE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    let re = Regex::new(r"^/1V(\d+)[IO]A(\d+)R$").expect("pump pattern is a valid regex");
    re
});

impl Responder for FakePump {
    fn respond(&mut self, cmd: &str) -> String {
        if cmd == "/1?" {
            return format!("/0`{}", self.pos);
        }
        if let Some(caps) = PUMP_MOVE.captures(cmd) {
            if let Some(pos) = caps.get(2).and_then(|m| m.as_str().parse().ok()) {
                self.pos = pos;
            }
        }
        "/0`".to_string()
    }
}

struct FakeValve {
    pos: u8,
}

impl Default for FakeValve {
    fn default() -> Self {
        Self { pos: 1 }
    }
}

impl Responder for FakeValve {
    fn respond(&mut self, cmd: &str) -> String {
        if let Some(pos) = cmd.strip_prefix("GO").and_then(|p| p.parse().ok()) {
            // Moves go unacknowledged.
            self.pos = pos;
            return String::new();
        }
        match cmd {
            "*ID*" => String::new(),
            "ID" => "ID = not used".to_string(),
            "CP" => format!("Position is  = {}", self.pos),
            "NP" => "NP = 10".to_string(),
            _ => "what?".to_string(),
        }
    }
}

struct FakeArm9;

impl Responder for FakeArm9 {
    fn respond(&mut self, cmd: &str) -> String {
        match cmd {
            "?IDN" => "Illumina,Bruno Fluidics Controller,0,v2.0:A1".to_string(),
            "INIT" => "A1".to_string(),
            "?RETEMP:3" => "0.0C:0.0C:0.0:A1".to_string(),
            c if c.starts_with("?FCTEMP:") => "0.0C:A1".to_string(),
            _ => "A1".to_string(),
        }
    }
}

struct FakeFpga;

impl Responder for FakeFpga {
    fn respond(&mut self, cmd: &str) -> String {
        let words: Vec<&str> = cmd.split_whitespace().collect();
        if let [name, _args @ ..] = words.as_slice() {
            match (*name, words.len()) {
                ("TDIYEWR" | "TDIYPOS", 2) | ("TDIYARM3", 4) => return name.to_string(),
                ("ZSTEP" | "ZDACW" | "ZTRG" | "SWYZ_POS" | "SWLSRSHUT", 2) => {
                    return name.to_string()
                }
                ("ZMV", 2) => return "@LOG Trigger Camera\nZMV".to_string(),
                ("T1MOVETO" | "T2MOVETO" | "T3MOVETO", 2) => return format!("{name} 0"),
                ("EX1MV" | "EX2MV", 2) => return name.to_string(),
                _ => {}
            }
        }
        match cmd {
            "RESET" => "@LOG The FPGA is now online.  Enjoy!\nRESET".to_string(),
            "EM2I" | "EM2O" | "EX1HM" | "EX2HM" => cmd.to_string(),
            "TDIYERD" => "TDIYERD 1".to_string(),
            "TDIPULSES" => "TDIPULSES 1".to_string(),
            "ZDACR" | "ZADCR" => format!("{cmd} 0"),
            "T1RD" | "T2RD" | "T3RD" => format!("{cmd} 0"),
            "T1HM" | "T2HM" | "T3HM" => {
                let n = &cmd[1..2];
                format!("@TILTPOS{n} -1\n{cmd}")
            }
            _ => "what?".to_string(),
        }
    }
}
