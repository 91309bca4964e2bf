//! Byte transports for one link.
//!
//! A [`Channel`] is the pair of halves the bus actually talks to: a
//! buffered reader with a read-until-separator primitive and a plain
//! writer. Real channels come from serial ports; test channels come from
//! [`crate::fakes::open_fake`]. The FPGA is the one instrument wired with
//! separate command and response ports, so a channel can also be built
//! from two different streams.

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};

pub type LinkReader = Box<dyn AsyncBufRead + Send + Unpin>;
pub type LinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read and write halves of one duplex link.
pub struct Channel {
    pub reader: LinkReader,
    pub writer: LinkWriter,
}

impl Channel {
    pub fn new(reader: LinkReader, writer: LinkWriter) -> Self {
        Self { reader, writer }
    }

    /// Split a single duplex stream into a channel.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: Box::new(BufReader::new(r)),
            writer: Box::new(w),
        }
    }

    /// Build a channel reading from one stream and writing to another.
    /// Used for the FPGA's split command/response ports.
    pub fn from_pair<R, W>(rx: R, tx: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(BufReader::new(rx)),
            writer: Box::new(tx),
        }
    }
}

#[cfg(feature = "serial")]
mod serial {
    use tokio_serial::SerialPortBuilderExt;

    use super::*;
    use crate::com::framing::Instrument;
    use crate::error::ComResult;

    fn open_port(path: &str, baud: u32) -> ComResult<tokio_serial::SerialStream> {
        // 8N1, no flow control. None of the instruments use handshaking.
        let port = tokio_serial::new(path, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;
        Ok(port)
    }

    /// Open the serial link for an instrument on a single port.
    pub fn open_serial(instrument: Instrument, port: &str) -> ComResult<Channel> {
        let stream = open_port(port, instrument.baud())?;
        log::info!("[{instrument}] listening on port {port}");
        Ok(Channel::from_stream(stream))
    }

    /// Open an instrument wired with separate TX and RX ports.
    pub fn open_serial_pair(
        instrument: Instrument,
        port_tx: &str,
        port_rx: &str,
    ) -> ComResult<Channel> {
        let tx = open_port(port_tx, instrument.baud())?;
        let rx = open_port(port_rx, instrument.baud())?;
        let (_, tx_half) = tokio::io::split(tx);
        let (rx_half, _) = tokio::io::split(rx);
        log::info!("[{instrument}] listening on ports {port_tx} and {port_rx}");
        Ok(Channel::from_pair(rx_half, tx_half))
    }
}

#[cfg(feature = "serial")]
pub use serial::{open_serial, open_serial_pair};
