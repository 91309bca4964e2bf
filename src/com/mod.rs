//! The per-link instrument command bus.
//!
//! One [`Bus`] owns one serial link and turns its raw byte stream into a
//! request/response API with the following guarantees:
//!
//! - Commands are written in issuance order, never closer together than
//!   the instrument's minimum spacing.
//! - Replies are correlated back to callers through an ordered list of
//!   pending waiters: every incoming line is offered to the oldest
//!   still-pending parser first, and the first parser that accepts the
//!   accumulated response claims it.
//! - A command may declare a *delayed* parser for a completion event that
//!   the instrument reports long after the immediate acknowledgement
//!   (the stages answer `GOTO(CHKMV)` right away and emit `Move Done`
//!   only when motion stops). The delayed waiter is enqueued ahead of the
//!   ack waiter so it survives, and keeps being retried, while younger
//!   commands come and go.
//! - Every wait is bounded by the command's timeout; expiry, and equally
//!   cancellation of the sending future, evicts the waiters so a late
//!   reply cannot resolve a promise nobody is awaiting.
//! - The background reader never exits on a bad line. Unsolicited banner
//!   lines are tolerated, anything else unclaimed is logged as a protocol
//!   error and dropped.

pub mod command;
pub mod framing;
pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use command::{ok_if_match, ok_if_match_any, ok_re, re_map, re_parse, Cmd, Parser};
pub use framing::Instrument;
pub use transport::Channel;
#[cfg(feature = "serial")]
pub use transport::{open_serial, open_serial_pair};

use crate::error::{ComError, ComResult};
use framing::{decode_latin1, encode_latin1, strip_wire, PREAMBLES};
use transport::{LinkReader, LinkWriter};

/// How many joined lines the receive buffer may hold while unclaimed; a
/// line past this bound drops the buffer as a protocol error. The longest
/// known response is the four-line y-stage reset banner.
const MAX_BUFFER_LINES: usize = 8;

/// A waiter's claim probe. Returns `true` when the accumulated response
/// text belongs to this waiter; resolving the caller is a side effect of
/// the first successful probe.
type Claim = Box<dyn FnMut(&str) -> bool + Send>;

struct Waiter {
    id: u64,
    claim: Claim,
}

/// Write-side state, guarded by the send lock so that no two writes race
/// the minimum-spacing check.
struct TxState {
    writer: LinkWriter,
    last_sent: Instant,
}

struct Shared {
    instrument: Instrument,
    min_spacing: Duration,
    no_check: bool,
    tx: Mutex<TxState>,
    /// Ordered oldest-first. Mutated by `send` (append, under the send
    /// lock, before bytes are written), by the reader (claim/remove), and
    /// by timeout eviction.
    pending: parking_lot::Mutex<Vec<Waiter>>,
    next_id: AtomicU64,
}

impl Shared {
    fn claim_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Options for opening a bus.
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Minimum gap between consecutive writes on this link.
    pub min_spacing: Duration,
    /// Raw passthrough mode: log every received line and match nothing.
    pub no_check: bool,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_millis(10),
            no_check: false,
        }
    }
}

impl BusOptions {
    pub fn min_spacing(mut self, spacing: Duration) -> Self {
        self.min_spacing = spacing;
        self
    }

    pub fn no_check(mut self) -> Self {
        self.no_check = true;
        self
    }
}

/// One command bus, owning one link for the process lifetime.
pub struct Bus {
    shared: Arc<Shared>,
    reader_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Bus {
    /// Open a bus over an already-connected channel and start its reader.
    pub fn new(instrument: Instrument, channel: Channel) -> Self {
        Self::with_options(instrument, channel, BusOptions::default())
    }

    pub fn with_options(instrument: Instrument, channel: Channel, options: BusOptions) -> Self {
        let shared = Arc::new(Shared {
            instrument,
            min_spacing: options.min_spacing,
            no_check: options.no_check,
            tx: Mutex::new(TxState {
                writer: channel.writer,
                last_sent: Instant::now()
                    .checked_sub(options.min_spacing)
                    .unwrap_or_else(Instant::now),
            }),
            pending: parking_lot::Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let reader_handle = tokio::spawn(read_loop(shared.clone(), channel.reader, shutdown_rx));

        Self {
            shared,
            reader_handle: Some(reader_handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Open a bus on a serial port.
    #[cfg(feature = "serial")]
    pub fn open(instrument: Instrument, port: &str, options: BusOptions) -> ComResult<Self> {
        let channel = transport::open_serial(instrument, port)?;
        Ok(Self::with_options(instrument, channel, options))
    }

    /// Open a bus on a split TX/RX port pair (FPGA wiring).
    #[cfg(feature = "serial")]
    pub fn open_pair(
        instrument: Instrument,
        port_tx: &str,
        port_rx: &str,
        options: BusOptions,
    ) -> ComResult<Self> {
        let channel = transport::open_serial_pair(instrument, port_tx, port_rx)?;
        Ok(Self::with_options(instrument, channel, options))
    }

    pub fn instrument(&self) -> Instrument {
        self.shared.instrument
    }

    /// Fire-and-forget: frame and write `text`, expecting no reply.
    pub async fn send_raw(&self, text: &str) -> ComResult<()> {
        let bytes = encode_latin1(&self.shared.instrument.frame(text))?;
        let mut tx = self.shared.tx.lock().await;
        write_spaced(&self.shared, &mut tx, &bytes).await
    }

    /// Send a command and wait for its (possibly delayed) parsed reply.
    ///
    /// The waiters are registered, in the two-phase order the matching
    /// loop depends on, *before* any byte is written, so a reply can
    /// never arrive ahead of its waiter. Leaving this function by any
    /// route evicts every waiter it registered: timeout, write failure,
    /// and cancellation of the future itself all release the pending
    /// slots, so a reply arriving afterwards cannot be claimed by a
    /// caller that is no longer there.
    pub async fn send<T: Send + 'static>(&self, cmd: Cmd<T>) -> ComResult<T> {
        let bytes = encode_latin1(&self.shared.instrument.frame(&cmd.text))?;

        let (result_tx, result_rx) = oneshot::channel::<T>();
        let mut guard = EvictGuard {
            shared: self.shared.clone(),
            ids: Vec::with_capacity(2),
        };

        {
            let mut tx = self.shared.tx.lock().await;
            {
                let mut pending = self.shared.pending.lock();
                match cmd.delayed_parser {
                    Some(delayed) => {
                        // Two-phase enqueue: the completion waiter goes in
                        // first so the reader tries it ahead of the ack
                        // waiter, and so it stays queued after the ack is
                        // claimed and removed. The caller's result rides
                        // on the completion event; the ack is checked and
                        // discarded.
                        let id = self.shared.claim_id();
                        pending.push(Waiter {
                            id,
                            claim: make_claim(delayed, result_tx),
                        });
                        guard.ids.push(id);

                        let (ack_tx, _ack_rx) = oneshot::channel::<T>();
                        let id = self.shared.claim_id();
                        pending.push(Waiter {
                            id,
                            claim: make_claim(cmd.parser, ack_tx),
                        });
                        guard.ids.push(id);
                    }
                    None => {
                        let id = self.shared.claim_id();
                        pending.push(Waiter {
                            id,
                            claim: make_claim(cmd.parser, result_tx),
                        });
                        guard.ids.push(id);
                    }
                }
            }

            write_spaced(&self.shared, &mut tx, &bytes).await?;
        }

        let instrument = self.shared.instrument.name();
        match cmd.timeout {
            Some(deadline) => match tokio::time::timeout(deadline, result_rx).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(_)) => Err(ComError::LinkClosed { instrument }),
                Err(_) => {
                    error!("[{instrument}] timeout after {deadline:?} from {:?}", cmd.text);
                    Err(ComError::Timeout {
                        instrument,
                        cmd: cmd.text,
                        timeout: deadline,
                    })
                }
            },
            None => result_rx
                .await
                .map_err(|_| ComError::LinkClosed { instrument }),
        }
    }

    /// Block until every pending waiter has been resolved or evicted.
    pub async fn wait(&self) {
        while !self.shared.pending.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Stop the background reader and wait for it to finish.
    pub async fn close(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.await;
        }
    }
}

/// Scope guard tying a `send` call's waiters to the lifetime of the call
/// itself. Runs when the call resolves, fails, or is cancelled by drop;
/// waiters already claimed by the reader are gone from the list and the
/// retain passes over them.
struct EvictGuard {
    shared: Arc<Shared>,
    ids: Vec<u64>,
}

impl Drop for EvictGuard {
    fn drop(&mut self) {
        self.shared
            .pending
            .lock()
            .retain(|w| !self.ids.contains(&w.id));
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn make_claim<T: Send + 'static>(parser: Parser<T>, sender: oneshot::Sender<T>) -> Claim {
    let mut slot = Some(sender);
    Box::new(move |text: &str| match parser(text) {
        Some(value) => {
            // The receiver may be gone (discarded ack, timed-out caller);
            // the claim still counts so the waiter is removed.
            if let Some(tx) = slot.take() {
                let _ = tx.send(value);
            }
            true
        }
        None => false,
    })
}

/// Write one frame, sleeping out whatever remains of the minimum spacing
/// since the previous write. Caller holds the send lock, which is what
/// keeps the spacing check and the write atomic across callers.
async fn write_spaced(shared: &Shared, tx: &mut TxState, bytes: &[u8]) -> ComResult<()> {
    let elapsed = tx.last_sent.elapsed();
    if elapsed < shared.min_spacing {
        tokio::time::sleep(shared.min_spacing - elapsed).await;
    }
    tx.writer.write_all(bytes).await?;
    tx.writer.flush().await?;
    tx.last_sent = Instant::now();
    debug!(
        "[{}] tx: {:?}",
        shared.instrument,
        decode_latin1(bytes)
    );
    Ok(())
}

/// The background reader: one per bus, runs until shutdown or transport
/// failure. A single bad line must never wedge the link, so everything
/// short of a transport error is logged and survived.
async fn read_loop(shared: Arc<Shared>, mut reader: LinkReader, mut shutdown: oneshot::Receiver<()>) {
    let sep = shared.instrument.separator();
    let mut buffer = String::new();
    let mut buffered_lines = 0usize;

    loop {
        let mut raw = Vec::new();
        tokio::select! {
            _ = &mut shutdown => {
                debug!("[{}] reader shutting down", shared.instrument);
                break;
            }
            read = reader.read_until(sep, &mut raw) => match read {
                Ok(0) => {
                    error!("[{}] link closed, stopping reader", shared.instrument);
                    shared.pending.lock().clear();
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("[{}] transport error: {e}", shared.instrument);
                    shared.pending.lock().clear();
                    break;
                }
            }
        }

        let resp = decode_latin1(strip_wire(&raw));
        if resp.is_empty() {
            continue;
        }
        if shared.no_check {
            debug!("[{}] raw: {resp:?}", shared.instrument);
            continue;
        }

        if buffer.is_empty() {
            buffer = resp;
            buffered_lines = 1;
        } else {
            buffer.push('\n');
            buffer.push_str(&resp);
            buffered_lines += 1;
        }

        let matched = {
            let mut pending = shared.pending.lock();
            let hit = (0..pending.len()).find(|&i| (pending[i].claim)(&buffer));
            if let Some(i) = hit {
                pending.remove(i);
            }
            hit.is_some()
        };

        if matched {
            debug!("[{}] rx claimed: {buffer:?}", shared.instrument);
            buffer.clear();
            buffered_lines = 0;
            continue;
        }

        if PREAMBLES.is_match(&buffer) && buffered_lines <= MAX_BUFFER_LINES {
            // Known banner or the first lines of a response still being
            // assembled. Keep accumulating.
            continue;
        }

        warn!(
            "[{}] protocol error, unclaimed response dropped: {buffer:?}",
            shared.instrument
        );
        buffer.clear();
        buffered_lines = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Bus over a raw in-memory stream: the far end plays the instrument.
    fn raw_bus(instrument: Instrument, options: BusOptions) -> (Bus, DuplexStream) {
        let (host, device) = tokio::io::duplex(1024);
        let bus = Bus::with_options(instrument, Channel::from_stream(host), options);
        (bus, device)
    }

    fn fast() -> BusOptions {
        BusOptions::default().min_spacing(Duration::ZERO)
    }

    async fn reply(device: &mut DuplexStream, lines: &str) {
        for line in lines.split('\n') {
            device.write_all(line.as_bytes()).await.unwrap();
            device.write_all(b"\n").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_send_raw_writes_frame() {
        let (bus, mut device) = raw_bus(Instrument::Y, fast());
        bus.send_raw("G").await.unwrap();
        let mut buf = [0u8; 8];
        let n = device.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"1G\r\n");
    }

    #[tokio::test]
    async fn test_simple_exchange() {
        let (bus, mut device) = raw_bus(Instrument::Fpga, fast());
        let send = tokio::spawn(async move {
            bus.send(Cmd::new("EM2I", ok_if_match("EM2I"))).await
        });
        let mut buf = [0u8; 16];
        let n = device.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"EM2I\n");
        reply(&mut device, "EM2I").await;
        assert!(send.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_delayed_waiter_enqueued_first() {
        // Pin the two-phase enqueue order: when a line satisfies both the
        // ack parser and the delayed parser, the delayed waiter (which
        // carries the caller's result) must claim it. If the ack waiter
        // were enqueued first it would swallow the line and the caller
        // would hang until timeout.
        let (bus, mut device) = raw_bus(Instrument::Fpga, fast());
        let cmd = Cmd::new("PING", ok_if_match("PONG"))
            .delayed(ok_if_match("PONG"))
            .timeout(Duration::from_secs(1));
        let send = tokio::spawn(async move { bus.send(cmd).await });
        let mut buf = [0u8; 16];
        device.read(&mut buf).await.unwrap();
        reply(&mut device, "PONG").await;
        assert!(send.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_multiline_response_assembly() {
        let (bus, mut device) = raw_bus(Instrument::Fpga, fast());
        let cmd = Cmd::new(
            "RESET",
            ok_if_match("@LOG The FPGA is now online.  Enjoy!\nRESET"),
        )
        .lines(2);
        let send = tokio::spawn(async move { bus.send(cmd).await });
        let mut buf = [0u8; 16];
        device.read(&mut buf).await.unwrap();
        // First line alone matches no parser but is a known preamble, so
        // the buffer is retained until the echo completes the response.
        reply(&mut device, "@LOG The FPGA is now online.  Enjoy!").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        reply(&mut device, "RESET").await;
        assert!(send.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_garbage_line_does_not_wedge() {
        let (bus, mut device) = raw_bus(Instrument::Fpga, fast());
        reply(&mut device, "what?").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let send = tokio::spawn(async move {
            bus.send(Cmd::new("EM2O", ok_if_match("EM2O"))).await
        });
        let mut buf = [0u8; 16];
        device.read(&mut buf).await.unwrap();
        reply(&mut device, "EM2O").await;
        assert!(send.await.unwrap().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_evicts_waiters() {
        let (bus, mut device) = raw_bus(Instrument::Fpga, fast());
        let bus = Arc::new(bus);

        let err = bus
            .send(
                Cmd::new("EM2I", ok_if_match("EM2I")).timeout(Duration::from_millis(500)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ComError::Timeout { .. }));
        assert!(bus.shared.pending.lock().is_empty());

        // A late reply for the evicted command is a protocol error, not a
        // resolution of anything; the next exchange still works.
        reply(&mut device, "EM2I").await;
        let bus2 = bus.clone();
        let send = tokio::spawn(async move {
            bus2.send(
                Cmd::new("EM2O", ok_if_match("EM2O")).timeout(Duration::from_millis(500)),
            )
            .await
        });
        // The first send's frame is still queued on the device side;
        // drain until the EM2O frame shows up before answering it.
        let mut seen = Vec::new();
        while !seen.windows(5).any(|w| w == b"EM2O\n") {
            let mut buf = [0u8; 32];
            let n = device.read(&mut buf).await.unwrap();
            seen.extend_from_slice(&buf[..n]);
        }
        reply(&mut device, "EM2O").await;
        assert!(send.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_send_evicts_waiters() {
        // Futures cancel by drop. An aborted caller must release its
        // pending slot immediately, or its dead waiter would claim the
        // next matching reply out from under a live caller.
        let (bus, mut device) = raw_bus(Instrument::Fpga, fast());
        let bus = Arc::new(bus);

        let bus2 = bus.clone();
        let task = tokio::spawn(async move {
            bus2.send(Cmd::new("EM2I", ok_if_match("EM2I")).no_timeout())
                .await
        });
        let mut buf = [0u8; 16];
        device.read(&mut buf).await.unwrap();
        task.abort();
        let _ = task.await;
        assert!(bus.shared.pending.lock().is_empty());

        // The same command sent again gets the reply for itself.
        let send = tokio::spawn(async move {
            bus.send(Cmd::new("EM2I", ok_if_match("EM2I"))).await
        });
        device.read(&mut buf).await.unwrap();
        reply(&mut device, "EM2I").await;
        assert!(send.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_buffer_retained_up_to_bound() {
        // A response whose last line lands just past the buffer bound
        // must survive assembly: the buffer holds MAX_BUFFER_LINES
        // unclaimed preamble-matching lines, and the parser claims the
        // whole thing when the closing line arrives.
        let (bus, mut device) = raw_bus(Instrument::Y, fast());
        let lines: Vec<String> = std::iter::once("1Z".to_string())
            .chain((2..=MAX_BUFFER_LINES + 1).map(|i| format!("x{i}")))
            .collect();
        let joined = lines.join("\n");

        let cmd = Cmd::new("Z", ok_if_match(joined.clone()))
            .lines(MAX_BUFFER_LINES + 1)
            .timeout(Duration::from_secs(1));
        let send = tokio::spawn(async move { bus.send(cmd).await });
        let mut buf = [0u8; 16];
        device.read(&mut buf).await.unwrap();
        reply(&mut device, &joined).await;
        assert!(send.await.unwrap().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_spacing_enforced() {
        let (bus, mut device) = raw_bus(
            Instrument::X,
            BusOptions::default().min_spacing(Duration::from_millis(100)),
        );
        // Drain writes so the duplex buffer never blocks the sender.
        tokio::spawn(async move {
            let mut sink = vec![0u8; 64];
            while device.read(&mut sink).await.unwrap_or(0) > 0 {}
        });

        bus.send_raw("EM=0").await.unwrap();
        let start = Instant::now();
        bus.send_raw("EE=1").await.unwrap();
        bus.send_raw("VI=640").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_no_check_passthrough_ignores_replies() {
        let (bus, mut device) = raw_bus(Instrument::Fpga, fast().no_check());
        reply(&mut device, "anything at all").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.send_raw("RESET").await.unwrap();
        assert!(bus.shared.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_link_closed_fails_pending() {
        let (bus, device) = raw_bus(Instrument::Fpga, fast());
        let send = tokio::spawn(async move {
            bus.send(Cmd::new("EM2I", ok_if_match("EM2I")).no_timeout())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(device);
        let err = send.await.unwrap().unwrap_err();
        assert!(matches!(err, ComError::LinkClosed { .. }));
    }
}
