//! Raw HTTP client with the redirect loop.
//!
//! WHY: Security tooling needs to send requests exactly as built, including
//! odd paths, duplicate headers and hand-written bytes, while still getting
//! connection reuse and redirect handling.
//!
//! WHAT: `RawClient`, generic over the `Dialer` it gets connections from, and
//! `RawRequest`, an owned description of one call.
//!
//! HOW: `execute` runs one attempt per hop: parse the URL, dial, write, read,
//! translate. Redirects are followed iteratively with a single counter per
//! call. A redirect body is drained and closed before the next hop so its
//! connection goes back to the pool first.

use crate::errors::{first_err, RawHttpError};
use crate::options::{Options, RedirectStatus};
use crate::pool::{ConnectionPool, Dialer, Scheme};
use crate::redirects::resolve_location;
use crate::response::{translate, RawResponse};
use crate::wire::{Header, WireRequest};
use bytes::Bytes;
use std::io;
use url::Url;

/// Owned description of one logical request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRequest {
    pub method: String,
    pub url: String,
    /// Replaces the path and query of `url` on every hop when set.
    pub uri_path: Option<String>,
    pub headers: Vec<Header>,
    pub body: Option<Bytes>,
}

impl RawRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn uri_path(mut self, path: impl Into<String>) -> Self {
        self.uri_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Network location and request target of one hop.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    scheme: Scheme,
    /// `host[:port]` as written in the URL; the dial address and pool key.
    authority: String,
    /// `path[?query]`.
    path: String,
}

impl Target {
    /// Splits `raw` into scheme, authority and request target as written.
    ///
    /// `Url::parse` only validates. Its normalized form lowercases the host,
    /// drops default ports and collapses dot segments, none of which may
    /// reach the wire.
    fn parse(raw: &str) -> Result<Self, RawHttpError> {
        let raw = raw.trim_matches(|c: char| c <= ' ');
        let url = Url::parse(raw)?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(RawHttpError::InvalidUrl(format!("{raw}: missing host")));
        }

        let rest = raw
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(|| RawHttpError::InvalidUrl(format!("{raw}: missing authority")))?;
        let end = rest
            .find(|c: char| matches!(c, '/' | '?' | '#'))
            .unwrap_or(rest.len());
        let authority = match rest[..end].rsplit_once('@') {
            Some((_, host)) => host,
            None => &rest[..end],
        };
        if authority.is_empty() {
            return Err(RawHttpError::InvalidUrl(format!("{raw}: missing host")));
        }

        let target = match rest[end..].split_once('#') {
            Some((before, _)) => before,
            None => &rest[end..],
        };
        let path = if target.is_empty() {
            String::from("/")
        } else if target.starts_with('?') {
            format!("/{target}")
        } else {
            target.to_string()
        };

        Ok(Self {
            scheme: Scheme::from_url(raw),
            authority: authority.to_string(),
            path,
        })
    }
}

/// Direct-socket HTTP/1.1 client.
///
/// WHY: One client (and so one pool) can be shared by many threads probing
/// the same hosts.
///
/// WHAT: Holds the default [`Options`] and a [`Dialer`], by default a
/// [`ConnectionPool`] over real TCP / TLS.
///
/// # Examples
///
/// ```ignore
/// let client = RawClient::new(Options::default().max_redirects(3));
/// let mut response = client.get("http://example.com/admin")?;
/// let body = response.read_body()?;
/// ```
#[derive(Debug)]
pub struct RawClient<D: Dialer = ConnectionPool> {
    dialer: D,
    options: Options,
}

impl RawClient<ConnectionPool> {
    /// Creates a client with its own connection pool.
    #[must_use]
    pub fn new(options: Options) -> Self {
        Self::with_dialer(ConnectionPool::new(), options)
    }
}

impl Default for RawClient<ConnectionPool> {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

impl<D: Dialer> RawClient<D> {
    pub fn with_dialer(dialer: D, options: Options) -> Self {
        Self { dialer, options }
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Sends a `HEAD` request.
    ///
    /// # Errors
    ///
    /// See [`RawClient::execute`].
    pub fn head(&self, url: &str) -> Result<RawResponse, RawHttpError> {
        self.do_raw("HEAD", url, None, &[], None)
    }

    /// Sends a `GET` request.
    ///
    /// # Errors
    ///
    /// See [`RawClient::execute`].
    pub fn get(&self, url: &str) -> Result<RawResponse, RawHttpError> {
        self.do_raw("GET", url, None, &[], None)
    }

    /// Sends a `POST` request with `Content-Type: mimetype`.
    ///
    /// # Errors
    ///
    /// See [`RawClient::execute`].
    pub fn post(
        &self,
        url: &str,
        mimetype: &str,
        body: impl Into<Bytes>,
    ) -> Result<RawResponse, RawHttpError> {
        let headers = [Header::new("Content-Type", mimetype)];
        self.do_raw("POST", url, None, &headers, Some(body.into()))
    }

    /// Sends `request` with the client options.
    ///
    /// # Errors
    ///
    /// See [`RawClient::execute`].
    pub fn do_request(&self, request: &RawRequest) -> Result<RawResponse, RawHttpError> {
        self.do_raw(
            &request.method,
            &request.url,
            request.uri_path.as_deref(),
            &request.headers,
            request.body.clone(),
        )
    }

    /// Sends a request with the client options, always following redirects.
    ///
    /// # Errors
    ///
    /// See [`RawClient::execute`].
    pub fn do_raw(
        &self,
        method: &str,
        url: &str,
        uri_path: Option<&str>,
        headers: &[Header],
        body: Option<Bytes>,
    ) -> Result<RawResponse, RawHttpError> {
        let options = self.options.clone().follow_redirects(true);
        self.execute(method, url, uri_path, headers, body, &options)
    }

    /// Sends a request with caller-supplied options.
    ///
    /// # Errors
    ///
    /// See [`RawClient::execute`].
    pub fn do_raw_with_options(
        &self,
        method: &str,
        url: &str,
        uri_path: Option<&str>,
        headers: &[Header],
        body: Option<Bytes>,
        options: &Options,
    ) -> Result<RawResponse, RawHttpError> {
        self.execute(method, url, uri_path, headers, body, options)
    }

    /// Runs one logical request, following redirects within the budget.
    ///
    /// Every hop reuses `method`, `headers` and `body` unchanged. When the
    /// budget is spent the last redirect response is returned as is.
    ///
    /// # Arguments
    ///
    /// * `method` - Request method, sent verbatim
    /// * `url` - Absolute `http://` or `https://` URL
    /// * `uri_path` - Replaces the path and query of `url` on every hop
    /// * `headers` - Caller headers, duplicates allowed
    /// * `body` - Request body, resent on every hop
    /// * `options` - Per-call options
    ///
    /// # Errors
    ///
    /// `InvalidUrl` for unparseable URLs (including redirect targets), dial
    /// and handshake errors from the dialer, `IoError` / `MalformedResponse`
    /// for write and read failures, and the drain or close error of a
    /// redirect body.
    pub fn execute(
        &self,
        method: &str,
        url: &str,
        uri_path: Option<&str>,
        headers: &[Header],
        body: Option<Bytes>,
        options: &Options,
    ) -> Result<RawResponse, RawHttpError> {
        let mut redirects = RedirectStatus::new(options.follow_redirects, options.max_redirects);
        let mut url = url.to_string();
        let path_override = uri_path.filter(|path| !path.is_empty());

        loop {
            let target = Target::parse(&url)?;
            let mut response =
                self.attempt(method, &target, path_override, headers, body.clone(), options)?;

            if !(response.is_redirect() && redirects.can_follow()) {
                return Ok(response);
            }
            let Some(location) = response.location() else {
                return Ok(response);
            };

            let drained = io::copy(&mut response.body, &mut io::sink()).map(|_| ());
            first_err(drained, response.body.close())?;

            let next = resolve_location(target.scheme, &target.authority, &location);
            redirects.advance();
            tracing::debug!(
                "redirect {}/{}: {} -> {next}",
                redirects.current,
                redirects.max_redirects,
                response.status_code
            );

            url = next;
        }
    }

    fn attempt(
        &self,
        method: &str,
        target: &Target,
        path_override: Option<&str>,
        headers: &[Header],
        body: Option<Bytes>,
        options: &Options,
    ) -> Result<RawResponse, RawHttpError> {
        let timeout = options.effective_timeout();
        let mut connection = match timeout {
            Some(timeout) => {
                self.dialer
                    .dial_timeout(target.scheme, &target.authority, timeout, options)?
            }
            None => self.dialer.dial(target.scheme, &target.authority, options)?,
        };

        let request = build_request(method, target, path_override, headers, body, options);

        let exchange = connection
            .set_timeout(timeout)
            .map_err(RawHttpError::from)
            .and_then(|()| connection.write_request(&request))
            .and_then(|()| connection.read_response());

        match exchange {
            Ok(wire) => translate(connection, wire, options.force_read_all_body),
            Err(err) => {
                tracing::debug!(
                    "request to {}://{} failed: {err}",
                    target.scheme,
                    target.authority
                );
                let _ = connection.close();
                Err(err)
            }
        }
    }
}

/// Builds the wire request for one hop.
///
/// Raw bytes replace everything. Otherwise custom headers replace the caller
/// headers wholesale; with automatic `Host`, any caller `Host` is replaced by
/// the dialed address.
fn build_request(
    method: &str,
    target: &Target,
    path_override: Option<&str>,
    headers: &[Header],
    body: Option<Bytes>,
    options: &Options,
) -> WireRequest {
    if !options.custom_raw_bytes.is_empty() {
        return WireRequest::raw(Bytes::copy_from_slice(&options.custom_raw_bytes));
    }

    let headers = if !options.custom_headers.is_empty() {
        options.custom_headers.clone()
    } else if options.automatic_host_header {
        std::iter::once(Header::new("Host", target.authority.clone()))
            .chain(headers.iter().filter(|h| !h.is("Host")).cloned())
            .collect()
    } else {
        headers.to_vec()
    };

    let request = WireRequest::new(method, path_override.unwrap_or(&target.path))
        .with_headers(headers)
        .with_body(body)
        .with_automatic_content_length(options.automatic_content_length);

    if options.automatic_host_header {
        request.with_automatic_host(target.authority.clone())
    } else {
        request
    }
}
