use super::{Header, Version};
use bytes::Bytes;
use std::io::{self, Write};

/// A request value handed to the wire codec.
///
/// WHY: A raw client must be able to send exactly what the caller built,
/// including duplicate or malformed headers, while still offering the usual
/// computed `Host` and `Content-Length` when asked to.
///
/// WHAT: Built fresh for every hop. `raw_bytes`, when set, replaces the whole
/// serialized request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireRequest {
    pub method: String,
    pub path: String,
    pub query: Vec<String>,
    pub version: Version,
    pub headers: Vec<Header>,
    pub body: Option<Bytes>,
    pub raw_bytes: Option<Bytes>,
    pub automatic_content_length: bool,
    pub automatic_host: bool,
    /// Value used for the automatic `Host` header.
    pub authority: String,
}

impl WireRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Creates a request that is sent verbatim.
    pub fn raw(bytes: impl Into<Bytes>) -> Self {
        Self {
            raw_bytes: Some(bytes.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_query(mut self, query: Vec<String>) -> Self {
        self.query = query;
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Option<Bytes>) -> Self {
        self.body = body;
        self
    }

    #[must_use]
    pub fn with_automatic_content_length(mut self, enabled: bool) -> Self {
        self.automatic_content_length = enabled;
        self
    }

    /// Writes `Host: authority` when no `Host` header is present.
    #[must_use]
    pub fn with_automatic_host(mut self, authority: impl Into<String>) -> Self {
        self.automatic_host = true;
        self.authority = authority.into();
        self
    }

    /// Returns `path` followed by the query parameters joined with `&`.
    #[must_use]
    pub fn request_target(&self) -> String {
        let mut target = if self.path.is_empty() {
            String::from("/")
        } else {
            self.path.clone()
        };

        if !self.query.is_empty() {
            target.push(if target.contains('?') { '&' } else { '?' });
            target.push_str(&self.query.join("&"));
        }

        target
    }

    /// Returns the method that is actually sent. For raw requests this is the
    /// first token of the raw bytes.
    #[must_use]
    pub fn method_token(&self) -> String {
        match &self.raw_bytes {
            Some(raw) => raw
                .split(|b| b.is_ascii_whitespace())
                .next()
                .map(|token| String::from_utf8_lossy(token).into_owned())
                .unwrap_or_default(),
            None => self.method.clone(),
        }
    }

    /// Serializes the request per HTTP/1.1 framing.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        if let Some(raw) = &self.raw_bytes {
            return raw.to_vec();
        }

        let mut head = format!(
            "{} {} {}\r\n",
            self.method,
            self.request_target(),
            self.version
        );

        if self.automatic_host && !self.headers.iter().any(|h| h.is("Host")) {
            head.push_str(&format!("Host: {}\r\n", self.authority));
        }

        for header in &self.headers {
            if self.automatic_content_length && header.is("Content-Length") {
                continue;
            }
            head.push_str(&format!("{header}\r\n"));
        }

        if self.automatic_content_length {
            if let Some(body) = &self.body {
                head.push_str(&format!("Content-Length: {}\r\n", body.len()));
            }
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        if let Some(body) = &self.body {
            out.extend_from_slice(body);
        }
        out
    }

    /// Writes the serialized request to `writer` and flushes it.
    ///
    /// # Errors
    ///
    /// Returns the write or flush error of `writer`.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())?;
        writer.flush()
    }
}
