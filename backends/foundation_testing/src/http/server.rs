//! Test HTTP server implementation.
//!
//! WHY: Client tests need a real peer on a real socket: pooled connections,
//! deadlines and TLS only behave honestly against one.
//!
//! WHAT: `TestHttpServer` listens on localhost (plain or TLS), serves every
//! connection as keep-alive until the client closes it, records each request
//! and counts accepted connections.
//!
//! HOW: Uses stdlib's `TcpListener` with one thread per connection. Request
//! heads are parsed with `httparse`, bodies are read by `Content-Length`.
//! Responses are hand-crafted HTTP/1.1 bytes.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use derive_more::From;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

type ResponseHandler = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

const MAX_HEADERS: usize = 64;
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors while starting a test server.
#[derive(From, Debug)]
pub enum TestServerError {
    /// Binding or configuring the listener failed.
    #[from]
    Listener(std::io::Error),

    /// Generating the self-signed certificate failed.
    #[from(ignore)]
    Certificate(String),

    /// Building the TLS server configuration failed.
    #[from]
    Tls(rustls::Error),
}

impl std::error::Error for TestServerError {}

impl core::fmt::Display for TestServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Listener(err) => write!(f, "test server listener failed: {err}"),
            Self::Certificate(msg) => write!(f, "test certificate generation failed: {msg}"),
            Self::Tls(err) => write!(f, "test TLS configuration failed: {err}"),
        }
    }
}

/// Simple HTTP request representation for testing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// HTTP method exactly as received
    pub method: String,
    /// Request target exactly as received (e.g., "/test?x=1")
    pub path: String,
    /// Minor HTTP version (1 for HTTP/1.1)
    pub version: u8,
    /// Request headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Body of the request
    pub body: Vec<u8>,
    /// Sequence number of the connection that carried the request, from 1
    pub connection_id: usize,
}

impl HttpRequest {
    /// First value of header `name`, ignoring case.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All values of header `name`, ignoring case.
    #[must_use]
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect()
    }
}

/// Simple HTTP response representation for testing.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code (e.g., 200)
    pub status: u16,
    /// Status text (e.g., "OK")
    pub status_text: String,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
    /// When set, sent instead of the rendered response
    pub raw: Option<Vec<u8>>,
    /// Delay before the response is written
    pub delay: Option<Duration>,
}

impl HttpResponse {
    /// Create 200 OK response with body.
    #[must_use]
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        let body_bytes = body.into();
        Self {
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Content-Length".to_string(), body_bytes.len().to_string()),
            ],
            body: body_bytes,
            raw: None,
            delay: None,
        }
    }

    /// Create 302 redirect response.
    #[must_use]
    pub fn redirect(location: &str) -> Self {
        Self::redirect_with(302, "Found", location)
    }

    /// Create redirect response with a specific status.
    #[must_use]
    pub fn redirect_with(code: u16, text: &str, location: &str) -> Self {
        Self {
            status: code,
            status_text: text.to_string(),
            headers: vec![
                ("Location".to_string(), location.to_string()),
                ("Content-Length".to_string(), "0".to_string()),
            ],
            body: Vec::new(),
            raw: None,
            delay: None,
        }
    }

    /// Create custom status response.
    #[must_use]
    pub fn status(code: u16, text: &str) -> Self {
        Self {
            status: code,
            status_text: text.to_string(),
            headers: vec![("Content-Length".to_string(), "0".to_string())],
            body: Vec::new(),
            raw: None,
            delay: None,
        }
    }

    /// Create a response that sends `bytes` verbatim.
    #[must_use]
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            raw: Some(bytes.into()),
            ..Self::status(200, "OK")
        }
    }

    /// Adds a header line.
    #[must_use]
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    /// Replaces the body and its `Content-Length`.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.headers
            .retain(|(key, _)| !key.eq_ignore_ascii_case("Content-Length"));
        self.headers
            .push(("Content-Length".to_string(), self.body.len().to_string()));
        self
    }

    /// Waits `delay` before writing the response.
    #[must_use]
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn closes_connection(&self) -> bool {
        self.raw.is_some()
            || self.headers.iter().any(|(key, value)| {
                key.eq_ignore_ascii_case("Connection") && value.eq_ignore_ascii_case("close")
            })
    }

    /// Render response to HTTP/1.1 format.
    fn render(&self) -> Vec<u8> {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }

        let mut response = format!("HTTP/1.1 {} {}\r\n", self.status, self.status_text);

        for (key, value) in &self.headers {
            response.push_str(&format!("{key}: {value}\r\n"));
        }

        response.push_str("\r\n");

        let mut bytes = response.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Shared state between the server handle and its threads.
struct ServerState {
    running: AtomicBool,
    connections: AtomicUsize,
    requests: Mutex<Vec<HttpRequest>>,
    handler: ResponseHandler,
}

/// Test HTTP server for integration testing.
///
/// # Purpose (WHY)
///
/// Provides a real HTTP server for testing HTTP clients without external services.
///
/// # What it does
///
/// Starts a local HTTP server on a random port, serves each connection until
/// the client closes it and responds with configurable responses. Runs in a
/// background thread to not block test execution.
///
/// # Examples
///
/// ```rust
/// use foundation_testing::http::TestHttpServer;
///
/// let server = TestHttpServer::start();
/// assert!(server.url("/test").starts_with("http://127.0.0.1:"));
///
/// // Server automatically stops when dropped
/// ```
pub struct TestHttpServer {
    addr: String,
    port: u16,
    state: Arc<ServerState>,
    _handle: Option<thread::JoinHandle<()>>,
}

impl TestHttpServer {
    /// Start a new test HTTP server on random port.
    ///
    /// # Panics
    ///
    /// Panics when no localhost port can be bound.
    #[must_use]
    pub fn start() -> Self {
        Self::with_response(|_req| HttpResponse::ok(b"OK"))
    }

    /// Start server with custom response handler.
    ///
    /// # Arguments
    ///
    /// * `handler` - Function that takes request and returns response
    ///
    /// # Panics
    ///
    /// Panics when no localhost port can be bound.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use foundation_testing::http::{TestHttpServer, HttpResponse};
    ///
    /// let server = TestHttpServer::with_response(|req| {
    ///     if req.path == "/redirect" {
    ///         HttpResponse::redirect("/target")
    ///     } else {
    ///         HttpResponse::ok(b"Success")
    ///     }
    /// });
    /// ```
    #[must_use]
    pub fn with_response<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        Self::try_start(handler, None).expect("Failed to start test HTTP server")
    }

    /// Start a TLS server presenting a fresh self-signed certificate for
    /// `localhost`.
    ///
    /// # Panics
    ///
    /// Panics when the port, certificate or TLS configuration cannot be set up.
    #[must_use]
    pub fn with_tls_response<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        let config = self_signed_config().expect("Failed to build test TLS configuration");
        Self::try_start(handler, Some(config)).expect("Failed to start test HTTPS server")
    }

    /// Start a server, plain or TLS depending on `tls`.
    ///
    /// # Errors
    ///
    /// Returns `TestServerError::Listener` when binding fails.
    pub fn try_start<F>(
        handler: F,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<Self, TestServerError>
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let scheme = if tls.is_some() { "https" } else { "http" };
        let addr = format!("{scheme}://127.0.0.1:{port}");

        // Set non-blocking so we can check running flag
        listener.set_nonblocking(true)?;

        let state = Arc::new(ServerState {
            running: AtomicBool::new(true),
            connections: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            handler: Arc::new(handler),
        });

        let accept_state = Arc::clone(&state);
        let handle = thread::spawn(move || {
            while accept_state.running.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, sock_addr)) => {
                        let connection_id =
                            accept_state.connections.fetch_add(1, Ordering::SeqCst) + 1;
                        tracing::info!("Got a client connection #{connection_id}: {sock_addr:?}");

                        let state = Arc::clone(&accept_state);
                        let tls = tls.clone();
                        // Handle each connection in separate thread
                        thread::spawn(move || {
                            if let Err(e) = Self::handle_connection(stream, connection_id, tls, &state)
                            {
                                tracing::info!("TestHttpServer connection error: {e}");
                            }
                        });
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        // No connection available, sleep briefly and check again
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(e) => {
                        tracing::info!("TestHttpServer accept error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            addr,
            port,
            state,
            _handle: Some(handle),
        })
    }

    /// Get full URL for a path on this test server.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use foundation_testing::http::TestHttpServer;
    ///
    /// let server = TestHttpServer::start();
    /// assert!(server.url("/test").ends_with("/test"));
    /// ```
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Get base URL of this test server (e.g., "<http://127.0.0.1:54321>").
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.addr
    }

    /// `127.0.0.1:port`, the address a client dials.
    #[must_use]
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Port the server listens on.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of TCP connections accepted so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Requests received so far, in completion order.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state
            .requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// Handle one connection until the client closes it.
    fn handle_connection(
        stream: TcpStream,
        connection_id: usize,
        tls: Option<Arc<rustls::ServerConfig>>,
        state: &ServerState,
    ) -> Result<(), Box<dyn std::error::Error>> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(IDLE_TIMEOUT))?;

        match tls {
            Some(config) => {
                let connection = rustls::ServerConnection::new(config)?;
                Self::serve(rustls::StreamOwned::new(connection, stream), connection_id, state)
            }
            None => Self::serve(stream, connection_id, state),
        }
    }

    fn serve<S: Read + Write>(
        stream: S,
        connection_id: usize,
        state: &ServerState,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut reader = BufReader::new(stream);

        loop {
            let Some(request) = read_request(&mut reader, connection_id)? else {
                tracing::debug!("connection #{connection_id} closed by client");
                return Ok(());
            };

            tracing::info!(
                "Received request #{connection_id}: {} {}",
                request.method,
                request.path
            );

            let response = (state.handler)(&request);
            let client_closes = request
                .header("Connection")
                .is_some_and(|value| value.eq_ignore_ascii_case("close"));

            if let Ok(mut requests) = state.requests.lock() {
                requests.push(request);
            }

            if let Some(delay) = response.delay {
                thread::sleep(delay);
            }

            let stream = reader.get_mut();
            stream.write_all(&response.render())?;
            stream.flush()?;

            if client_closes || response.closes_connection() {
                return Ok(());
            }
        }
    }
}

/// Reads one request. `None` when the client closed between requests.
fn read_request<R: BufRead>(
    reader: &mut R,
    connection_id: usize,
) -> Result<Option<HttpRequest>, Box<dyn std::error::Error>> {
    let mut head = Vec::new();
    loop {
        let before = head.len();
        if reader.read_until(b'\n', &mut head)? == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err("connection closed in the middle of a request".into());
        }
        let line = &head[before..];
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }

    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut slots);
    if parsed.parse(&head)?.is_partial() {
        return Err("incomplete request head".into());
    }

    let headers: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();

    let length = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;

    Ok(Some(HttpRequest {
        method: parsed.method.unwrap_or_default().to_string(),
        path: parsed.path.unwrap_or_default().to_string(),
        version: parsed.version.unwrap_or(1),
        headers,
        body,
        connection_id,
    }))
}

/// Builds a server config with a self-signed certificate for `localhost`.
///
/// # Errors
///
/// Returns `TestServerError::Certificate` or `TestServerError::Tls`.
pub fn self_signed_config() -> Result<Arc<rustls::ServerConfig>, TestServerError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|err| TestServerError::Certificate(err.to_string()))?;
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    let cert_der = CertificateDer::from(cert.cert);

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], PrivateKeyDer::from(key))?;
    Ok(Arc::new(config))
}

impl Drop for TestHttpServer {
    fn drop(&mut self) {
        // Signal server thread to stop
        self.state.running.store(false, Ordering::Relaxed);
        // Thread will exit on next loop iteration
    }
}
