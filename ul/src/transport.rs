//! Framed PDU transport.
//!
//! This module mediates between the PDU codec and a byte stream:
//! it owns the socket, an incremental read buffer,
//! a reusable write buffer,
//! and the ARTIM timer armed by the state machine
//! while waiting for an association request or a connection close.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use snafu::{Backtrace, IntoError, ResultExt, Snafu};

use crate::pdu::reader::ReadError;
use crate::pdu::writer::WriteError;
use crate::pdu::{read_pdu, write_pdu, Pdu, LARGE_PDU_SIZE, PDU_HEADER_SIZE};

/// An error at the transport level.
/// All variants are fatal to the association.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// failed to send PDU message on wire
    #[non_exhaustive]
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to read PDU message from wire
    #[non_exhaustive]
    WireRead {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// the operation timed out
    #[non_exhaustive]
    Timeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("failed to decode incoming PDU: {}", source))]
    ReceivePdu {
        #[snafu(backtrace)]
        source: ReadError,
    },

    #[snafu(display("failed to encode outgoing PDU: {}", source))]
    SendPdu {
        #[snafu(backtrace)]
        source: WriteError,
    },

    #[snafu(display(
        "PDU is too large ({} bytes) to be sent to the remote application entity",
        length
    ))]
    #[non_exhaustive]
    SendTooLongPdu { length: usize, backtrace: Backtrace },

    /// connection closed by peer
    ConnectionClosed,

    /// failed to close the connection
    Close {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Interface for closing the underlying socket of a stream.
pub trait CloseSocket {
    /// Shut down the connection for both directions.
    fn close(&mut self) -> std::io::Result<()>;

    /// Adjust the read timeout of the socket,
    /// bounding how long a single receive operation may block.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()>;
}

impl CloseSocket for std::net::TcpStream {
    fn close(&mut self) -> std::io::Result<()> {
        self.shutdown(std::net::Shutdown::Both)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        std::net::TcpStream::set_read_timeout(self, timeout)
    }
}

#[cfg(feature = "sync-tls")]
impl CloseSocket for rustls::StreamOwned<rustls::ClientConnection, std::net::TcpStream> {
    fn close(&mut self) -> std::io::Result<()> {
        self.get_mut().shutdown(std::net::Shutdown::Both)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.get_ref().set_read_timeout(timeout)
    }
}

#[cfg(feature = "sync-tls")]
impl CloseSocket for rustls::StreamOwned<rustls::ServerConnection, std::net::TcpStream> {
    fn close(&mut self) -> std::io::Result<()> {
        self.get_mut().shutdown(std::net::Shutdown::Both)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.get_ref().set_read_timeout(timeout)
    }
}

/// The association request timer.
///
/// Armed on entry to Sta2 and Sta13,
/// disarmed when the awaited PDU or connection close arrives.
/// Expiry is consumed by the state machine as an event,
/// not as preemption: the driver polls [`expired`](Artim::expired)
/// between blocking operations bounded by
/// [`remaining`](Artim::remaining).
#[derive(Debug, Default)]
pub struct Artim {
    deadline: Option<Instant>,
}

impl Artim {
    /// Start (or restart) the timer with the given duration.
    pub fn arm(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    /// Stop the timer.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Whether the timer is armed and has expired.
    pub fn expired(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    /// Time left until expiry, if the timer is armed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Whether the I/O error is a read or write timeout.
pub(crate) fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}

/// A PDU-framed view over a byte stream.
#[derive(Debug)]
pub struct PduTransport<S> {
    socket: S,
    /// buffer of bytes read but not yet decoded
    read_buffer: BytesMut,
    /// reusable encoding buffer for outgoing PDUs
    write_buffer: Vec<u8>,
    /// ceiling for incoming PDU lengths
    max_pdu_length: u32,
    /// cap for outgoing PDU lengths, `u32::MAX` when the peer
    /// declared no limit
    peer_max_pdu_length: u32,
    /// whether incoming PDUs over the ceiling are refused
    strict: bool,
    /// the association request timer
    pub artim: Artim,
}

impl<S> PduTransport<S>
where
    S: Read + Write,
{
    /// Create a transport over the given stream.
    ///
    /// `max_pdu_length` is the receive ceiling; zero means unlimited.
    pub fn new(socket: S, max_pdu_length: u32, strict: bool) -> Self {
        let max_pdu_length = if max_pdu_length == 0 {
            u32::MAX
        } else {
            max_pdu_length
        };
        PduTransport {
            socket,
            read_buffer: BytesMut::with_capacity(
                (max_pdu_length.min(LARGE_PDU_SIZE) + PDU_HEADER_SIZE) as usize,
            ),
            write_buffer: Vec::with_capacity(max_pdu_length.min(LARGE_PDU_SIZE) as usize),
            max_pdu_length,
            peer_max_pdu_length: u32::MAX,
            strict,
            artim: Artim::default(),
        }
    }

    /// Record the maximum PDU length declared by the peer,
    /// capping subsequent sends. Zero means no limit.
    pub fn set_peer_max_pdu_length(&mut self, length: u32) {
        self.peer_max_pdu_length = if length == 0 { u32::MAX } else { length };
    }

    /// The maximum PDU length declared by the peer.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu_length
    }

    /// The maximum PDU length admitted on receive.
    pub fn max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    /// Encode and send one PDU.
    pub fn send(&mut self, pdu: &Pdu) -> Result<()> {
        self.write_buffer.clear();
        write_pdu(&mut self.write_buffer, pdu).context(SendPduSnafu)?;
        if self.peer_max_pdu_length != u32::MAX
            && self.write_buffer.len() as u64
                > u64::from(self.peer_max_pdu_length) + u64::from(PDU_HEADER_SIZE)
        {
            return SendTooLongPduSnafu {
                length: self.write_buffer.len(),
            }
            .fail();
        }
        self.socket.write_all(&self.write_buffer).map_err(|e| {
            if is_timeout(&e) {
                TimeoutSnafu.into_error(e)
            } else {
                WireSendSnafu.into_error(e)
            }
        })
    }

    /// Receive one PDU, reading from the stream as needed.
    pub fn receive(&mut self) -> Result<Pdu> {
        loop {
            let mut buf = std::io::Cursor::new(&self.read_buffer[..]);
            if let Some(pdu) = read_pdu(&mut buf, self.max_pdu_length, self.strict)
                .context(ReceivePduSnafu)?
            {
                let consumed = buf.position() as usize;
                self.read_buffer.advance(consumed);
                return Ok(pdu);
            }

            let mut chunk = [0u8; 8192];
            let n = self.socket.read(&mut chunk).map_err(|e| {
                if is_timeout(&e) {
                    TimeoutSnafu.into_error(e)
                } else {
                    WireReadSnafu.into_error(e)
                }
            })?;
            if n == 0 {
                return ConnectionClosedSnafu.fail();
            }
            self.read_buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Whether a full PDU is already buffered,
    /// decodable without touching the socket.
    pub fn has_buffered_pdu(&self) -> bool {
        let mut buf = std::io::Cursor::new(&self.read_buffer[..]);
        matches!(
            read_pdu(&mut buf, self.max_pdu_length, self.strict),
            Ok(Some(_))
        )
    }

    /// Obtain access to the inner stream.
    pub fn inner(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Obtain the inner stream and the read buffer,
    /// for APIs which take over PDU reading.
    pub fn parts(&mut self) -> (&mut S, &mut BytesMut) {
        (&mut self.socket, &mut self.read_buffer)
    }
}

impl<S> PduTransport<S>
where
    S: Read + Write + CloseSocket,
{
    /// Shut down the underlying connection.
    pub fn close(&mut self) -> std::io::Result<()> {
        self.socket.close()
    }

    /// Bound how long a single receive may block on the socket.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }
}
