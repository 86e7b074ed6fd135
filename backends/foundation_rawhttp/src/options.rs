//! Per-call configuration for the raw client.
//!
//! WHY: Every raw request can tweak how much of the HTTP framing the client
//! computes for the caller, which is the whole point of a raw client.
//!
//! WHAT: `Options` (immutable during a call, chainable to build) and
//! `RedirectStatus`, the per-call redirect counter.

use crate::errors::RawHttpError;
use crate::wire::Header;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Configuration for one raw HTTP call.
///
/// WHY: Centralizes the knobs that control dialing, framing and redirects so
/// a single value can be shared across calls or adjusted per call.
///
/// WHAT: Plain data with chainable setters. The client never mutates an
/// `Options` during a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Bounds dialing and sets the read/write deadline. `None` means unbounded.
    #[serde(rename = "timeout_ms", with = "timeout_millis")]
    pub timeout: Option<Duration>,
    /// Upper bound on redirect hops followed.
    pub max_redirects: usize,
    /// When false the redirect loop is disabled entirely.
    pub follow_redirects: bool,
    /// Server name presented during the TLS handshake instead of the host.
    pub sni: Option<String>,
    /// Sets the outgoing `Host` header to the dialed address.
    pub automatic_host_header: bool,
    /// Lets the wire codec compute `Content-Length`.
    pub automatic_content_length: bool,
    /// Replaces the computed header list wholesale when non-empty.
    pub custom_headers: Vec<Header>,
    /// Sent verbatim instead of the constructed request when non-empty.
    pub custom_raw_bytes: Vec<u8>,
    /// Buffers the whole response body before returning.
    pub force_read_all_body: bool,
}

impl Default for Options {
    /// Creates the default options.
    ///
    /// WHAT: 30s timeout, redirects followed up to 10 hops, automatic `Host`
    /// and `Content-Length`, streamed bodies.
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_TIMEOUT),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            follow_redirects: true,
            sni: None,
            automatic_host_header: true,
            automatic_content_length: true,
            custom_headers: Vec::new(),
            custom_raw_bytes: Vec::new(),
            force_read_all_body: false,
        }
    }
}

impl Options {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads options from a TOML document.
    ///
    /// Missing keys fall back to [`Options::default`]. The timeout is read
    /// from `timeout_ms`, where `0` means unbounded.
    ///
    /// # Errors
    ///
    /// A TOML syntax or type error is reported as `RawHttpError::IoError`
    /// with kind `InvalidData`.
    pub fn from_toml_str(content: &str) -> Result<Self, RawHttpError> {
        toml::from_str(content).map_err(|err| {
            RawHttpError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            ))
        })
    }

    /// Sets the dial bound and read/write deadline. `Duration::ZERO` disables it.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    /// Removes any timeout.
    #[must_use]
    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    #[must_use]
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    #[must_use]
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Overrides the TLS server name.
    #[must_use]
    pub fn sni(mut self, server_name: impl Into<String>) -> Self {
        self.sni = Some(server_name.into());
        self
    }

    #[must_use]
    pub fn automatic_host_header(mut self, enabled: bool) -> Self {
        self.automatic_host_header = enabled;
        self
    }

    #[must_use]
    pub fn automatic_content_length(mut self, enabled: bool) -> Self {
        self.automatic_content_length = enabled;
        self
    }

    /// Replaces every computed request header with `headers`.
    #[must_use]
    pub fn custom_headers(mut self, headers: Vec<Header>) -> Self {
        self.custom_headers = headers;
        self
    }

    /// Sends `bytes` verbatim instead of a constructed request.
    #[must_use]
    pub fn custom_raw_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.custom_raw_bytes = bytes.into();
        self
    }

    #[must_use]
    pub fn force_read_all_body(mut self, enabled: bool) -> Self {
        self.force_read_all_body = enabled;
        self
    }

    /// Returns the timeout if one is set and non-zero.
    #[must_use]
    pub fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }
}

/// Redirect bookkeeping for one logical call.
///
/// WHY: The redirect loop needs a single counter that survives every hop of
/// the same call and nothing else.
///
/// WHAT: Created once per call from the options, incremented per hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectStatus {
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub current: usize,
}

impl RedirectStatus {
    #[must_use]
    pub fn new(follow_redirects: bool, max_redirects: usize) -> Self {
        Self {
            follow_redirects,
            max_redirects,
            current: 0,
        }
    }

    /// Returns true when another hop may be followed.
    #[must_use]
    pub fn can_follow(&self) -> bool {
        self.follow_redirects && self.current < self.max_redirects
    }

    /// Records a followed hop.
    pub fn advance(&mut self) {
        self.current += 1;
    }
}

mod timeout_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = value.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok((millis > 0).then(|| Duration::from_millis(millis)))
    }
}
