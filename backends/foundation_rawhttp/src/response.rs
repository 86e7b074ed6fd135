//! Response translation.
//!
//! WHY: Callers want a response they can inspect and stream without caring
//! which connection it came from, and the connection must find its way back
//! to the pool (or be closed) exactly once when they are done.
//!
//! WHAT: `RawResponse` with a multi-valued `HeaderMap` and a `ResponseBody`
//! that owns the connection, decodes gzip transparently and releases or
//! closes the connection on `close()` or drop.
//!
//! HOW: The body tracks whether the framed body was read to its end. Only a
//! fully read, keep-alive body releases its connection to the pool.
//! Everything else is shut down.

use crate::connection::Connection;
use crate::errors::RawHttpError;
use crate::wire::{BodyFraming, FramedState, Header, WireResponse};
use bytes::Bytes;
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Cursor, Read};

/// Upper bound on bytes discarded at close time to make a connection
/// reusable.
const CLOSE_DRAIN_LIMIT: u64 = 64 * 1024;

/// Response headers keyed by name as received, each with its values in
/// arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap(BTreeMap<String, Vec<String>>);

impl HeaderMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the map in one pass, appending every value under its name.
    #[must_use]
    pub fn from_headers(headers: &[Header]) -> Self {
        let mut map = Self::new();
        for header in headers {
            map.append(header.key.clone(), header.value.clone());
        }
        map
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.entry(name.into()).or_default().push(value.into());
    }

    /// Every value of `name`, ignoring ASCII case of the name.
    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .flat_map(|(_, values)| values.iter().map(String::as_str))
            .collect()
    }

    /// First value of `name`, ignoring ASCII case of the name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).into_iter().next()
    }

    /// All values of `name` joined with a single space.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<String> {
        let values = self.get_all(name);
        (!values.is_empty()).then(|| values.join(" "))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.keys().any(|key| key.eq_ignore_ascii_case(name))
    }

    /// Values stored under exactly `name`.
    #[must_use]
    pub fn get_exact(&self, name: &str) -> Option<&[String]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

enum BodySource {
    Framed(FramedState),
    Buffered(Cursor<Bytes>),
}

/// The undecoded body still owned by its connection.
struct ConnectionBody {
    connection: Option<Connection>,
    source: BodySource,
    keep_alive: bool,
}

impl ConnectionBody {
    fn is_complete(&self) -> bool {
        match &self.source {
            BodySource::Framed(state) => state.is_done(),
            BodySource::Buffered(_) => true,
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if self.connection.is_none() {
            return Ok(());
        }

        if self.keep_alive && !self.is_complete() {
            // leftovers such as a chunked terminator after a gzip trailer
            let drained = io::copy(&mut self.by_ref().take(CLOSE_DRAIN_LIMIT), &mut io::sink());
            if let Err(err) = drained {
                tracing::debug!("discarding unread body failed: {err}");
            }
        }

        let reusable = self.keep_alive && self.is_complete();
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };

        if reusable {
            connection.release();
            Ok(())
        } else {
            connection.close()
        }
    }
}

impl Read for ConnectionBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(io::Error::other("read on closed response body"));
        };

        match &mut self.source {
            BodySource::Framed(state) => state.read(connection.reader(), buf),
            BodySource::Buffered(cursor) => cursor.read(buf),
        }
    }
}

enum BodyInner {
    Identity(ConnectionBody),
    Gzip(GzDecoder<ConnectionBody>),
}

impl BodyInner {
    fn into_connection_body(self) -> ConnectionBody {
        match self {
            Self::Identity(body) => body,
            Self::Gzip(decoder) => decoder.into_inner(),
        }
    }
}

/// Closable, streamed response body.
///
/// Reading yields the decoded body. Closing, explicitly or by drop, hands
/// the connection back to the pool when the body was read to its end on a
/// keep-alive connection and shuts it down otherwise. This happens once.
pub struct ResponseBody {
    inner: Option<BodyInner>,
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner {
            None => "closed",
            Some(BodyInner::Identity(_)) => "identity",
            Some(BodyInner::Gzip(_)) => "gzip",
        };
        f.debug_tuple("ResponseBody").field(&state).finish()
    }
}

impl ResponseBody {
    fn new(body: ConnectionBody, gzip: bool) -> Self {
        let inner = if gzip {
            BodyInner::Gzip(GzDecoder::new(body))
        } else {
            BodyInner::Identity(body)
        };
        Self { inner: Some(inner) }
    }

    /// Returns true once `close()` has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Releases or closes the underlying connection. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns the transport shutdown error.
    pub fn close(&mut self) -> io::Result<()> {
        match self.inner.take() {
            Some(inner) => inner.into_connection_body().close(),
            None => Ok(()),
        }
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Some(BodyInner::Identity(body)) => body.read(buf),
            Some(BodyInner::Gzip(decoder)) => decoder.read(buf),
            None => Err(io::Error::other("read on closed response body")),
        }
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::debug!("closing response body failed: {err}");
        }
    }
}

/// A response as returned to callers.
#[derive(Debug)]
pub struct RawResponse {
    pub status_code: u16,
    /// Status line text such as `200 OK`.
    pub status: String,
    pub proto_major: u8,
    pub proto_minor: u8,
    pub headers: HeaderMap,
    /// Declared length of the undecoded body, if known.
    pub content_length: Option<u64>,
    pub body: ResponseBody,
}

impl RawResponse {
    /// All values of `name` joined with a space.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.value(name)
    }

    #[must_use]
    pub fn is_redirect(&self) -> bool {
        crate::redirects::is_redirect_status(self.status_code)
    }

    #[must_use]
    pub fn location(&self) -> Option<String> {
        self.header("Location")
    }

    /// Reads the whole decoded body and closes it.
    ///
    /// # Errors
    ///
    /// The read error if reading failed, otherwise the close error.
    pub fn read_body(&mut self) -> Result<Vec<u8>, RawHttpError> {
        let mut data = Vec::new();
        let read = self.body.read_to_end(&mut data).map(|_| ());
        crate::errors::first_err(read, self.body.close())?;
        Ok(data)
    }

    #[must_use]
    pub fn into_body(self) -> ResponseBody {
        self.body
    }
}

/// Converts a wire response read from `connection` into a [`RawResponse`].
///
/// With `read_all`, the framed body is read into memory before returning.
/// The connection moves into the body either way.
///
/// # Errors
///
/// `IoError` when buffering the body fails. The connection is closed first.
pub fn translate(
    mut connection: Connection,
    wire: WireResponse,
    read_all: bool,
) -> Result<RawResponse, RawHttpError> {
    let headers = HeaderMap::from_headers(&wire.headers);

    let source = if read_all {
        let mut state = FramedState::new(wire.framing);
        let mut data = Vec::new();
        let mut buf = [0u8; 8 * 1024];
        loop {
            match state.read(connection.reader(), &mut buf) {
                Ok(0) => break,
                Ok(n) => data.extend_from_slice(&buf[..n]),
                Err(err) => {
                    let _ = connection.close();
                    return Err(RawHttpError::IoError(err));
                }
            }
        }
        BodySource::Buffered(Cursor::new(Bytes::from(data)))
    } else {
        BodySource::Framed(FramedState::new(wire.framing))
    };

    // a body that cannot carry bytes has no gzip member to decode
    let gzip = !matches!(wire.framing, BodyFraming::Empty | BodyFraming::Length(0))
        && headers
            .get_all("Content-Encoding")
            .iter()
            .any(|value| value.trim().eq_ignore_ascii_case("gzip"));

    let body = ConnectionBody {
        connection: Some(connection),
        source,
        keep_alive: wire.keep_alive,
    };

    Ok(RawResponse {
        status_code: wire.status.code,
        status: wire.status.to_string(),
        proto_major: wire.version.major(),
        proto_minor: wire.version.minor(),
        headers,
        content_length: wire.content_length,
        body: ResponseBody::new(body, gzip),
    })
}
