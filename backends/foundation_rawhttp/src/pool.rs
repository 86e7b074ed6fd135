//! Dialer and address-keyed connection pool.
//!
//! WHY: Probing many paths on one host should not pay a TCP and TLS handshake
//! per request. Reusing idle connections keyed by the dialed address removes
//! that cost.
//!
//! WHAT: The `Connector` trait (how transports are made), `NetConnector` (TCP
//! plus optional TLS upgrade), the `Dialer` trait the client depends on, and
//! `ConnectionPool`, which implements `Dialer` on top of a `Connector`.
//!
//! HOW: The idle registry is a `Mutex<HashMap<address, Vec<Connection>>>`.
//! The lock is held only to pop or push a connection, never across network
//! I/O, so two concurrent cold dials to one address both dial.
//!
//! Notes:
//! - There is no per-address capacity bound and no idle eviction. A pooled
//!   connection the server has since closed is handed out as is and fails on
//!   first use.

use crate::connection::{Connection, PoolHandle};
use crate::errors::RawHttpError;
use crate::options::Options;
use crate::stream::{RawStream, Transport};
use crate::tls::TlsUpgrader;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// URL scheme of a dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Picks `Https` when `url` starts with `https://`, ignoring case, and
    /// `Http` otherwise.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        if url
            .get(..8)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("https://"))
        {
            Self::Https
        } else {
            Self::Http
        }
    }

    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Appends the scheme's default port unless `address` already has one.
#[must_use]
pub fn with_default_port(address: &str, scheme: Scheme) -> String {
    let has_port = match address.rfind(':') {
        Some(pos) => {
            let port = &address[pos + 1..];
            !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) && {
                // a bare IPv6 literal has colons but no port
                let host = &address[..pos];
                !host.contains(':') || host.ends_with(']')
            }
        }
        None => false,
    };

    if has_port {
        address.to_string()
    } else {
        format!("{address}:{}", scheme.default_port())
    }
}

/// Produces connected transports.
///
/// WHY: The pool owns reuse, not the network. Keeping transport creation
/// behind a trait lets tests count dials without sockets.
pub trait Connector: Send + Sync {
    /// Opens a transport to `address`. For `Https` the transport is already
    /// TLS-upgraded.
    ///
    /// # Errors
    ///
    /// `ConnectionFailed` / `ConnectionTimeout` for socket failures,
    /// `TlsHandshakeFailed` for handshake failures.
    fn connect(
        &self,
        scheme: Scheme,
        address: &str,
        timeout: Option<Duration>,
        sni: Option<&str>,
    ) -> Result<Box<dyn Transport>, RawHttpError>;
}

/// Real TCP connector with TLS upgrade for `https`.
#[derive(Debug, Clone, Default)]
pub struct NetConnector {
    tls: TlsUpgrader,
}

impl NetConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn open_tcp(address: &str, timeout: Option<Duration>) -> Result<TcpStream, RawHttpError> {
        let addrs: Vec<SocketAddr> = address
            .to_socket_addrs()
            .map_err(|err| RawHttpError::ConnectionFailed(format!("{address}: {err}")))?
            .collect();

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut last_err: Option<io::Error> = None;

        for addr in addrs {
            let attempt = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        last_err = Some(io::Error::from(io::ErrorKind::TimedOut));
                        break;
                    }
                    TcpStream::connect_timeout(&addr, remaining)
                }
                None => TcpStream::connect(addr),
            };

            match attempt {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    tracing::debug!("connect to {addr} for {address} failed: {err}");
                    last_err = Some(err);
                }
            }
        }

        Err(match last_err {
            Some(err)
                if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) =>
            {
                RawHttpError::ConnectionTimeout(format!("{address}: {err}"))
            }
            Some(err) => RawHttpError::ConnectionFailed(format!("{address}: {err}")),
            None => RawHttpError::ConnectionFailed(format!("{address}: no addresses resolved")),
        })
    }
}

impl Connector for NetConnector {
    fn connect(
        &self,
        scheme: Scheme,
        address: &str,
        timeout: Option<Duration>,
        sni: Option<&str>,
    ) -> Result<Box<dyn Transport>, RawHttpError> {
        let started = Instant::now();
        let target = with_default_port(address, scheme);
        let tcp = Self::open_tcp(&target, timeout)?;
        let _ = tcp.set_nodelay(true);

        match scheme {
            Scheme::Http => Ok(Box::new(RawStream::AsPlain(tcp))),
            Scheme::Https => {
                let remaining = timeout.map(|t| t.saturating_sub(started.elapsed()));
                let secure = self.tls.upgrade(tcp, address, sni, remaining)?;
                Ok(Box::new(secure))
            }
        }
    }
}

/// Produces connections for the client.
pub trait Dialer: Send + Sync {
    /// Returns a connection for `address`, idle or freshly dialed.
    ///
    /// # Errors
    ///
    /// Dial and handshake failures, unmodified.
    fn dial(&self, scheme: Scheme, address: &str, options: &Options)
        -> Result<Connection, RawHttpError>;

    /// Like [`Dialer::dial`] with the dial bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Dial and handshake failures, unmodified.
    fn dial_timeout(
        &self,
        scheme: Scheme,
        address: &str,
        timeout: Duration,
        options: &Options,
    ) -> Result<Connection, RawHttpError>;
}

/// Idle registry shared by the pool and the connections it dialed.
#[derive(Default)]
pub(crate) struct PoolShared {
    idle: Mutex<HashMap<String, Vec<Connection>>>,
}

impl PoolShared {
    fn take(&self, address: &str) -> Option<Connection> {
        // poisoned lock; treat as empty pool
        let Ok(mut idle) = self.idle.lock() else {
            return None;
        };

        let list = idle.get_mut(address)?;
        let connection = list.pop();
        if list.is_empty() {
            idle.remove(address);
        }
        connection
    }

    pub(crate) fn put(&self, connection: Connection) {
        let rejected = match self.idle.lock() {
            Ok(mut idle) => {
                tracing::debug!(
                    "returning connection {} to pool for {}",
                    connection.id(),
                    connection.address()
                );
                idle.entry(connection.address().to_string())
                    .or_default()
                    .push(connection);
                None
            }
            Err(_) => Some(connection),
        };

        // close outside the lock
        if let Some(connection) = rejected {
            let _ = connection.close();
        }
    }

    fn drain_all(&self) -> Vec<Connection> {
        match self.idle.lock() {
            Ok(mut idle) => idle.drain().flat_map(|(_, list)| list).collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Address-keyed pool of idle connections.
///
/// WHY: Reusing connections avoids TCP and TLS handshakes for repeated
/// requests to the same address.
///
/// WHAT: Thread-safe. Share one pool (usually through one `RawClient`)
/// between threads. Connections find their way back through
/// [`Connection::release`].
pub struct ConnectionPool<C: Connector = NetConnector> {
    shared: Arc<PoolShared>,
    connector: C,
}

impl<C: Connector> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shared.idle.lock() {
            Ok(idle) => {
                let pools: Vec<(String, usize)> = idle
                    .iter()
                    .map(|(address, list)| (address.clone(), list.len()))
                    .collect();
                f.debug_struct("ConnectionPool").field("pools", &pools).finish()
            }
            Err(_) => f
                .debug_struct("ConnectionPool")
                .field("pools", &"<poisoned>")
                .finish(),
        }
    }
}

impl Default for ConnectionPool<NetConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool<NetConnector> {
    /// Creates a pool dialing real TCP / TLS connections.
    #[must_use]
    pub fn new() -> Self {
        Self::with_connector(NetConnector::new())
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn with_connector(connector: C) -> Self {
        Self {
            shared: Arc::new(PoolShared::default()),
            connector,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Pops an idle connection for `address`, or dials a new one.
    ///
    /// # Errors
    ///
    /// Dial and handshake failures from the connector.
    pub fn acquire(
        &self,
        scheme: Scheme,
        address: &str,
        timeout: Option<Duration>,
        options: &Options,
    ) -> Result<Connection, RawHttpError> {
        if let Some(connection) = self.shared.take(address) {
            tracing::debug!("reusing connection {} for {address}", connection.id());
            return Ok(connection);
        }

        tracing::debug!("dialing {scheme}://{address}");
        let transport = self
            .connector
            .connect(scheme, address, timeout, options.sni.as_deref())
            .inspect_err(|err| tracing::warn!("dial {scheme}://{address} failed: {err}"))?;

        Ok(Connection::new(address, transport).with_pool(PoolHandle::new(&self.shared)))
    }

    /// Puts `connection` back into the idle registry.
    pub fn release(&self, connection: Connection) {
        self.shared.put(connection);
    }

    /// Number of idle connections for `address`.
    #[must_use]
    pub fn idle_count(&self, address: &str) -> usize {
        self.shared
            .idle
            .lock()
            .map(|idle| idle.get(address).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Number of idle connections across all addresses.
    #[must_use]
    pub fn total_idle(&self) -> usize {
        self.shared
            .idle
            .lock()
            .map(|idle| idle.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Closes and forgets every idle connection (useful for tests and shutdown).
    pub fn clear(&self) {
        for connection in self.shared.drain_all() {
            let _ = connection.close();
        }
    }
}

impl<C: Connector> Dialer for ConnectionPool<C> {
    fn dial(
        &self,
        scheme: Scheme,
        address: &str,
        options: &Options,
    ) -> Result<Connection, RawHttpError> {
        self.acquire(scheme, address, None, options)
    }

    fn dial_timeout(
        &self,
        scheme: Scheme,
        address: &str,
        timeout: Duration,
        options: &Options,
    ) -> Result<Connection, RawHttpError> {
        self.acquire(scheme, address, Some(timeout), options)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connection::tests::ScriptedTransport;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Connector that counts dials and hands out scripted transports.
    ///
    /// Every dial gets a transport preloaded with the same script. What each
    /// transport was sent is kept per dial, in dial order.
    #[derive(Default)]
    pub(crate) struct CountingConnector {
        script: Vec<u8>,
        dials: AtomicUsize,
        addresses: Mutex<Vec<String>>,
        transcripts: Mutex<Vec<Arc<Mutex<Vec<u8>>>>>,
    }

    impl CountingConnector {
        pub(crate) fn serving(script: &[u8]) -> Self {
            Self {
                script: script.to_vec(),
                ..Self::default()
            }
        }

        pub(crate) fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }

        pub(crate) fn addresses(&self) -> Vec<String> {
            self.addresses.lock().unwrap().clone()
        }

        /// Bytes written on the `index`th dialed transport.
        pub(crate) fn written(&self, index: usize) -> String {
            let transcripts = self.transcripts.lock().unwrap();
            let written = transcripts[index].lock().unwrap();
            String::from_utf8_lossy(&written).into_owned()
        }
    }

    impl Connector for CountingConnector {
        fn connect(
            &self,
            _scheme: Scheme,
            address: &str,
            _timeout: Option<Duration>,
            _sni: Option<&str>,
        ) -> Result<Box<dyn Transport>, RawHttpError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            self.addresses.lock().unwrap().push(address.to_string());

            let transport = ScriptedTransport::new(&self.script);
            self.transcripts
                .lock()
                .unwrap()
                .push(transport.written.clone());
            Ok(Box::new(transport))
        }
    }

    #[test]
    fn test_scheme_from_url() {
        assert_eq!(Scheme::from_url("HTTPS://example.com"), Scheme::Https);
        assert_eq!(Scheme::from_url("https://example.com"), Scheme::Https);
        assert_eq!(Scheme::from_url("http://example.com"), Scheme::Http);
        assert_eq!(Scheme::from_url("ftp://x"), Scheme::Http);
        assert_eq!(Scheme::from_url("htt"), Scheme::Http);
    }

    #[test]
    fn test_with_default_port() {
        assert_eq!(with_default_port("example.com", Scheme::Http), "example.com:80");
        assert_eq!(with_default_port("example.com", Scheme::Https), "example.com:443");
        assert_eq!(with_default_port("example.com:8080", Scheme::Http), "example.com:8080");
        assert_eq!(with_default_port("[::1]:8443", Scheme::Https), "[::1]:8443");
        assert_eq!(with_default_port("[::1]", Scheme::Https), "[::1]:443");
    }

    /// WHY: Pool reuse is the reason the pool exists
    /// WHAT: Tests that a released connection is reused without a second dial
    #[test]
    fn test_released_connection_is_reused() {
        let pool = ConnectionPool::with_connector(CountingConnector::default());
        let options = Options::default();

        let first = pool.dial(Scheme::Http, "example.com", &options).unwrap();
        let first_id = first.id();
        first.release();
        assert_eq!(pool.idle_count("example.com"), 1);

        let second = pool.dial(Scheme::Http, "example.com", &options).unwrap();
        assert_eq!(second.id(), first_id);
        assert_eq!(pool.connector().dials(), 1);
        assert_eq!(pool.total_idle(), 0);
    }

    /// WHY: A connection lives in exactly one idle list
    /// WHAT: Tests that addresses do not share idle connections
    #[test]
    fn test_pool_is_keyed_by_address() {
        let pool = ConnectionPool::with_connector(CountingConnector::default());
        let options = Options::default();

        pool.dial(Scheme::Http, "a.example", &options).unwrap().release();
        let other = pool.dial(Scheme::Http, "b.example", &options).unwrap();

        assert_eq!(pool.connector().dials(), 2);
        assert_eq!(pool.idle_count("a.example"), 1);
        assert_eq!(other.address(), "b.example");
    }

    /// WHY: The lock is never held across a dial
    /// WHAT: Tests that concurrent cold dials each produce a distinct connection
    #[test]
    #[ntest::timeout(5000)]
    fn test_concurrent_cold_dials_are_distinct() {
        let pool = ConnectionPool::with_connector(CountingConnector::default());
        let options = Options::default();

        let ids: Vec<u64> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| pool.dial(Scheme::Http, "example.com", &options).unwrap()))
                .collect();
            let connections: Vec<Connection> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();
            connections.iter().map(Connection::id).collect()
        });

        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 8);
        assert_eq!(pool.connector().dials(), 8);
    }

    #[test]
    fn test_clear_closes_idle_connections() {
        let pool = ConnectionPool::with_connector(CountingConnector::default());
        let options = Options::default();
        let first = pool.dial(Scheme::Http, "example.com", &options).unwrap();
        let second = pool.dial(Scheme::Http, "example.com", &options).unwrap();
        first.release();
        second.release();
        assert_eq!(pool.idle_count("example.com"), 2);

        pool.clear();
        assert_eq!(pool.total_idle(), 0);
        assert!(format!("{pool:?}").contains("ConnectionPool"));
    }

    /// WHY: Connections outliving their pool must not leak into nowhere
    /// WHAT: Tests that release after the pool is dropped closes the transport
    #[test]
    fn test_release_after_pool_dropped_closes() {
        let pool = ConnectionPool::with_connector(CountingConnector::default());
        let connection = pool.dial(Scheme::Http, "example.com", &Options::default()).unwrap();
        drop(pool);
        connection.release();
    }

    /// WHY: Dial failures must surface as dial errors
    /// WHAT: Tests a refused connection against a closed loopback port
    #[test]
    fn test_net_connector_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = NetConnector::new()
            .connect(
                Scheme::Http,
                &format!("127.0.0.1:{port}"),
                Some(Duration::from_secs(1)),
                None,
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Dial);
    }

    #[test]
    fn test_net_connector_unresolvable_host() {
        let err = NetConnector::new()
            .connect(Scheme::Http, "host.invalid", Some(Duration::from_secs(2)), None)
            .unwrap_err();
        assert!(matches!(err, RawHttpError::ConnectionFailed(_)));
    }
}
