//! Transport abstraction over plain and TLS sockets.
//!
//! WHY: The pool and the wire codec only need bytes in, bytes out, a way to
//! bound blocking calls and a way to close. Hiding the socket type behind a
//! trait lets tests substitute in-memory transports.
//!
//! WHAT: The `Transport` trait and `RawStream`, the real TCP / TLS transport.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// TLS client stream produced by the upgrade helper.
pub type ClientTlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// A bidirectional byte transport owned by a single connection.
pub trait Transport: Read + Write + Send + fmt::Debug {
    /// Bounds every following blocking read and write by `timeout`.
    /// `None` removes the bound.
    ///
    /// # Errors
    ///
    /// Returns the socket error when the timeout cannot be applied.
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Closes both directions of the transport.
    ///
    /// # Errors
    ///
    /// Returns the socket error reported by the shutdown.
    fn close(&mut self) -> io::Result<()>;

    /// Returns the remote peer address as text, when known.
    fn peer_addr(&self) -> Option<String>;
}

/// Plain or TLS-upgraded socket.
pub enum RawStream {
    AsPlain(TcpStream),
    AsClientTls(Box<ClientTlsStream>),
}

impl RawStream {
    fn socket(&self) -> &TcpStream {
        match self {
            Self::AsPlain(stream) => stream,
            Self::AsClientTls(stream) => &stream.sock,
        }
    }

    /// Returns true when the stream is TLS-upgraded.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::AsClientTls(_))
    }
}

impl fmt::Debug for RawStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_tls() { "tls" } else { "plain" };
        f.debug_struct("RawStream")
            .field("kind", &kind)
            .field("peer", &self.peer_addr())
            .finish()
    }
}

impl Read for RawStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::AsPlain(stream) => stream.read(buf),
            Self::AsClientTls(stream) => stream.read(buf),
        }
    }
}

impl Write for RawStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::AsPlain(stream) => stream.write(buf),
            Self::AsClientTls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::AsPlain(stream) => stream.flush(),
            Self::AsClientTls(stream) => stream.flush(),
        }
    }
}

impl Transport for RawStream {
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let socket = self.socket();
        socket.set_read_timeout(timeout)?;
        socket.set_write_timeout(timeout)
    }

    fn close(&mut self) -> io::Result<()> {
        if let Self::AsClientTls(stream) = self {
            stream.conn.send_close_notify();
            // best effort, the peer may already be gone
            let _ = stream.conn.complete_io(&mut stream.sock);
        }
        match self.socket().shutdown(Shutdown::Both) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn peer_addr(&self) -> Option<String> {
        self.socket().peer_addr().ok().map(|addr| addr.to_string())
    }
}
