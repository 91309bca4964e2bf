//! Fake transports for testing without hardware.
//!
//! [`open_fake`] returns a [`Channel`] whose far end is a spawned
//! responder task playing the instrument: it recovers command boundaries
//! from the byte stream, feeds each command to the scripted
//! per-instrument responder, and writes the canned reply back one framed
//! line at a time. [`FakeOptions`] can drop every reply (to exercise
//! timeout and eviction paths) or delay delivery (to exercise the
//! delayed-parser path), and the knobs can be flipped while the bus is
//! running.

pub mod handlers;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::com::framing::{decode_latin1, encode_latin1};
use crate::com::{Channel, Instrument};

/// Runtime-adjustable behavior of a fake transport.
#[derive(Clone, Default)]
pub struct FakeOptions {
    inner: Arc<Knobs>,
}

#[derive(Default)]
struct Knobs {
    drop: AtomicBool,
    delay_ms: AtomicU64,
    split_delay_ms: AtomicU64,
}

impl FakeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swallow every outgoing command without replying.
    pub fn set_drop(&self, drop: bool) {
        self.inner.drop.store(drop, Ordering::Relaxed);
    }

    /// Delay every reply line.
    pub fn set_delay(&self, delay: Duration) {
        self.inner.delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Additionally delay every reply line after the first, splitting an
    /// acknowledgement from its completion event.
    pub fn set_split_delay(&self, delay: Duration) {
        self.inner
            .split_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    fn dropping(&self) -> bool {
        self.inner.drop.load(Ordering::Relaxed)
    }

    fn line_delay(&self, line_index: usize) -> Duration {
        let mut ms = self.inner.delay_ms.load(Ordering::Relaxed);
        if line_index > 0 {
            ms += self.inner.split_delay_ms.load(Ordering::Relaxed);
        }
        Duration::from_millis(ms)
    }
}

/// Open a fake link for an instrument and spawn its responder.
pub fn open_fake(instrument: Instrument, options: FakeOptions) -> Channel {
    let (host, device) = tokio::io::duplex(4096);
    tokio::spawn(run_responder(instrument, device, options));
    Channel::from_stream(host)
}

/// The trim applied to received frames before dispatch. Unlike the bus's
/// receive path this keeps control bytes: `\x03` is a real command for
/// the x-stage.
fn trim_frame(raw: &[u8]) -> &[u8] {
    let junk = |b: &u8| matches!(b, b' ' | b'\r' | b'\n');
    let start = raw.iter().position(|b| !junk(b)).unwrap_or(raw.len());
    let end = raw.iter().rposition(|b| !junk(b)).map_or(start, |i| i + 1);
    &raw[start..end]
}

async fn run_responder(
    instrument: Instrument,
    device: tokio::io::DuplexStream,
    options: FakeOptions,
) {
    let mut responder = handlers::responder_for(instrument);
    let term = instrument.frame_terminator();
    let sep = instrument.separator();

    let (reader, mut writer) = tokio::io::split(device);
    let mut reader = BufReader::new(reader);

    // All reply bytes funnel through one writer task so that immediate
    // lines keep their order while delayed lines slot in whenever their
    // timers fire.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(chunk) = line_rx.recv().await {
            if writer.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    loop {
        let mut raw = Vec::new();
        match reader.read_until(term, &mut raw).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let cmd = decode_latin1(trim_frame(&raw));
        if cmd.is_empty() {
            continue;
        }
        if options.dropping() {
            debug!("[{instrument}] fake dropping {cmd:?}");
            continue;
        }

        let reply = responder.respond(&cmd);
        debug!("[{instrument}] fake {cmd:?} -> {reply:?}");
        for (i, line) in reply.split('\n').enumerate() {
            let Ok(mut bytes) = encode_latin1(line) else {
                continue;
            };
            bytes.push(sep);
            let wait = options.line_delay(i);
            if wait.is_zero() {
                let _ = line_tx.send(bytes);
            } else {
                let tx = line_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    let _ = tx.send(bytes);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;

    #[tokio::test]
    async fn test_fake_fpga_replies_two_framed_lines() {
        let mut channel = open_fake(Instrument::Fpga, FakeOptions::new());
        channel.writer.write_all(b"RESET\n").await.unwrap();

        let mut line = Vec::new();
        channel.reader.read_until(b'\n', &mut line).await.unwrap();
        assert_eq!(line, b"@LOG The FPGA is now online.  Enjoy!\n");
        line.clear();
        channel.reader.read_until(b'\n', &mut line).await.unwrap();
        assert_eq!(line, b"RESET\n");
    }

    #[tokio::test]
    async fn test_fake_drop_goes_silent() {
        let options = FakeOptions::new();
        options.set_drop(true);
        let mut channel = open_fake(Instrument::Fpga, options.clone());
        channel.writer.write_all(b"EM2I\n").await.unwrap();

        let mut line = Vec::new();
        let read = tokio::time::timeout(
            Duration::from_millis(100),
            channel.reader.read_until(b'\n', &mut line),
        )
        .await;
        assert!(read.is_err(), "dropped command must produce no reply");

        options.set_drop(false);
        channel.writer.write_all(b"EM2I\n").await.unwrap();
        line.clear();
        channel.reader.read_until(b'\n', &mut line).await.unwrap();
        assert_eq!(line, b"EM2I\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_split_delay_separates_completion() {
        let options = FakeOptions::new();
        options.set_split_delay(Duration::from_millis(500));
        let mut channel = open_fake(Instrument::Y, options);
        channel.writer.write_all(b"1GOTO(CHKMV)\r\n").await.unwrap();

        let start = tokio::time::Instant::now();
        let mut line = Vec::new();
        channel.reader.read_until(b'\n', &mut line).await.unwrap();
        assert_eq!(line, b"1GOTO(CHKMV)\n");
        assert!(start.elapsed() < Duration::from_millis(500));

        line.clear();
        channel.reader.read_until(b'\n', &mut line).await.unwrap();
        assert_eq!(line, b"Move Done\n");
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
