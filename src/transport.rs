//! Byte transports beneath the connection engine.
//!
//! The engine only ever sees a nonblocking byte channel: partial reads and
//! writes are normal, `WouldBlock` means "come back on the next readiness
//! cycle". TLS belongs here too: a wrapper that performs its negotiation
//! internally and exposes the same trait plugs into the engine unchanged.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

/// A nonblocking byte channel owned by one engine.
pub trait Transport {
    /// Read into `buf`, returning the number of bytes read. `Ok(0)` means
    /// the peer closed the channel.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`, returning the number of bytes accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Shut the channel down. Idempotent.
    fn close(&mut self) -> io::Result<()>;

    /// The file descriptor the driver registers with its poller.
    fn raw_fd(&self) -> RawFd;
}

/// Plain TCP transport over a nonblocking [`TcpStream`].
pub struct TcpTransport {
    stream: TcpStream,
    closed: bool,
}

impl TcpTransport {
    /// Wrap a stream, switching it to nonblocking mode.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        // Frames are small and latency-sensitive; Nagle works against both.
        let _ = stream.set_nodelay(true);
        Ok(Self {
            stream,
            closed: false,
        })
    }

    /// The peer's address.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"));
        }
        self.stream.write(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.stream.shutdown(Shutdown::Both) {
            // The peer may already have torn the socket down.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
