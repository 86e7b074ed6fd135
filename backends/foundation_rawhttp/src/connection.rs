//! A single client connection.
//!
//! WHY: Every request needs a transport, a deadline that bounds each read and
//! write, and a way back into the pool once the response body is done with.
//!
//! WHAT: `Connection` pairs a buffered transport with the wire codec and holds
//! a weak handle to the pool it was dialed by. `release()` hands it back,
//! `close()` shuts it down.
//!
//! HOW: The deadline is an absolute `Instant`. Before every read or write the
//! remaining time is applied as the transport timeout, so a slow peer cannot
//! stretch a call past its deadline by trickling bytes.

use crate::errors::RawHttpError;
use crate::pool::PoolShared;
use crate::stream::Transport;
use crate::wire::{WireRequest, WireResponse};
use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Transport wrapper enforcing an absolute deadline.
pub(crate) struct DeadlineStream {
    inner: Box<dyn Transport>,
    deadline: Option<Instant>,
}

impl DeadlineStream {
    fn arm(&mut self) -> io::Result<()> {
        let Some(deadline) = self.deadline else {
            return Ok(());
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"));
        }
        self.inner.set_io_timeout(Some(remaining))
    }

    fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.deadline = deadline;
        if deadline.is_none() {
            self.inner.set_io_timeout(None)?;
        }
        Ok(())
    }
}

fn timed_out(err: io::Error) -> io::Error {
    if err.kind() == io::ErrorKind::WouldBlock {
        io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
    } else {
        err
    }
}

impl Read for DeadlineStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.arm()?;
        self.inner.read(buf).map_err(timed_out)
    }
}

impl Write for DeadlineStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.arm()?;
        self.inner.write(buf).map_err(timed_out)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.arm()?;
        self.inner.flush().map_err(timed_out)
    }
}

/// Capability to return a connection to the pool that dialed it.
///
/// Weak so an idle connection sitting in the pool does not keep the pool
/// alive through itself.
#[derive(Clone)]
pub(crate) struct PoolHandle(Weak<PoolShared>);

impl PoolHandle {
    pub(crate) fn new(shared: &Arc<PoolShared>) -> Self {
        Self(Arc::downgrade(shared))
    }
}

/// A checked-out or idle client connection.
///
/// Owned by exactly one in-flight call or sitting in exactly one idle list of
/// the pool, never both.
pub struct Connection {
    id: u64,
    address: String,
    stream: BufReader<DeadlineStream>,
    pool: Option<PoolHandle>,
    last_method: String,
    requests: u64,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("transport", &self.stream.get_ref().inner)
            .field("requests", &self.requests)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Connection {
    /// Wraps a freshly dialed transport for `address`.
    pub fn new(address: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            address: address.into(),
            stream: BufReader::new(DeadlineStream {
                inner: transport,
                deadline: None,
            }),
            pool: None,
            last_method: String::from("GET"),
            requests: 0,
        }
    }

    pub(crate) fn with_pool(mut self, handle: PoolHandle) -> Self {
        self.pool = Some(handle);
        self
    }

    /// Process-unique identifier, stable across pool round trips.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The address this connection was dialed for; also its pool key.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Number of requests written on this connection so far.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Sets the absolute deadline for every following read and write.
    /// `None` removes it.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the timeout cannot be cleared.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.stream.get_mut().set_deadline(deadline)
    }

    /// Sets the deadline to `timeout` from now.
    ///
    /// # Errors
    ///
    /// See [`Connection::set_deadline`].
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_deadline(timeout.map(|t| Instant::now() + t))
    }

    /// Serializes and writes `request`.
    ///
    /// # Errors
    ///
    /// `IoError` for write failures, including an expired deadline.
    pub fn write_request(&mut self, request: &WireRequest) -> Result<(), RawHttpError> {
        self.last_method = request.method_token().to_ascii_uppercase();
        self.requests += 1;
        request.write_to(self.stream.get_mut())?;
        Ok(())
    }

    /// Reads the head of the response to the last written request.
    ///
    /// # Errors
    ///
    /// `IoError` for read failures, `MalformedResponse` for invalid heads.
    pub fn read_response(&mut self) -> Result<WireResponse, RawHttpError> {
        WireResponse::read_from(&mut self.stream, &self.last_method)
    }

    pub(crate) fn reader(&mut self) -> &mut BufReader<DeadlineStream> {
        &mut self.stream
    }

    /// Hands the connection back to its pool for reuse.
    ///
    /// A connection without a live pool, or whose deadline cannot be cleared,
    /// is closed instead.
    pub fn release(mut self) {
        let Some(handle) = self.pool.clone() else {
            let _ = self.close();
            return;
        };
        let Some(shared) = handle.0.upgrade() else {
            tracing::debug!("pool gone, closing connection {} to {}", self.id, self.address);
            let _ = self.close();
            return;
        };

        if let Err(err) = self.set_deadline(None) {
            tracing::debug!("not pooling connection {}: {err}", self.id);
            let _ = self.close();
            return;
        }

        shared.put(self);
    }

    /// Shuts the transport down in both directions.
    ///
    /// # Errors
    ///
    /// Returns the shutdown error of the transport.
    pub fn close(mut self) -> io::Result<()> {
        tracing::debug!("closing connection {} to {}", self.id, self.address);
        self.stream.get_mut().inner.close()
    }
}
