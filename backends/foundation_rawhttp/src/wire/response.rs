use super::framing::{declared_length, read_raw_line};
use super::{has_token, BodyFraming, Header, Version};
use crate::errors::RawHttpError;
use std::fmt;
use std::io::{self, BufRead};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;

/// Status code and reason phrase of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub reason: String,
}

impl Status {
    /// Returns true for the statuses the redirect loop follows.
    #[must_use]
    pub fn is_redirect(&self) -> bool {
        crate::redirects::is_redirect_status(self.code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, self.reason)
        }
    }
}

/// A parsed response head.
///
/// The body is not part of the value. It stays on the connection and is read
/// through a [`super::FramedState`] built from `framing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    pub status: Status,
    pub version: Version,
    pub headers: Vec<Header>,
    pub framing: BodyFraming,
    /// Declared body length, or 0 when the response cannot carry a body.
    pub content_length: Option<u64>,
    /// True when the connection may carry another request after this body.
    pub keep_alive: bool,
}

impl WireResponse {
    /// Reads a response head from `source`, skipping interim `1xx` responses.
    ///
    /// # Errors
    ///
    /// `IoError` when the peer closes or a read fails, `MalformedResponse`
    /// when the head is not valid HTTP/1.x or exceeds the size limits.
    pub fn read_from<R: BufRead>(source: &mut R, request_method: &str) -> Result<Self, RawHttpError> {
        loop {
            let head = read_head(source)?;
            let response = parse_head(&head, request_method)?;

            // 101 hands the connection over, so it is final
            if (100..200).contains(&response.status.code) && response.status.code != 101 {
                tracing::debug!("skipping interim response {}", response.status);
                continue;
            }

            return Ok(response);
        }
    }

    /// Returns the first value of the named header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.is(name))
            .map(|h| h.value.as_str())
    }
}

fn read_head<R: BufRead>(source: &mut R) -> Result<Vec<u8>, RawHttpError> {
    let mut head = Vec::new();

    loop {
        let budget = MAX_HEAD_BYTES.saturating_sub(head.len()) as u64;
        if budget == 0 {
            return Err(RawHttpError::MalformedResponse(
                "response head too large".to_string(),
            ));
        }

        let line = match read_raw_line(source, budget) {
            Ok(line) => line,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof && head.is_empty() => {
                return Err(RawHttpError::IoError(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before a response was received",
                )));
            }
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                return Err(RawHttpError::MalformedResponse(err.to_string()));
            }
            Err(err) => return Err(RawHttpError::IoError(err)),
        };

        // tolerate stray blank lines before the status line
        if line.is_empty() && head.is_empty() {
            continue;
        }

        head.extend_from_slice(&line);
        head.extend_from_slice(b"\r\n");

        if line.is_empty() {
            return Ok(head);
        }
    }
}

fn parse_head(head: &[u8], request_method: &str) -> Result<WireResponse, RawHttpError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut slots);

    if parsed.parse(head)?.is_partial() {
        return Err(RawHttpError::MalformedResponse(
            "incomplete response head".to_string(),
        ));
    }

    let version = match parsed.version {
        Some(0) => Version::Http10,
        _ => Version::Http11,
    };
    let status = Status {
        code: parsed.code.unwrap_or_default(),
        reason: parsed.reason.unwrap_or_default().to_string(),
    };
    let headers: Vec<Header> = parsed
        .headers
        .iter()
        .map(|h| Header::new(h.name, String::from_utf8_lossy(h.value)))
        .collect();

    let framing = BodyFraming::for_response(request_method, status.code, &headers)?;
    let content_length = match framing {
        BodyFraming::Chunked => None,
        BodyFraming::Length(length) => Some(length),
        BodyFraming::Empty => Some(declared_length(&headers).ok().flatten().unwrap_or(0)),
        BodyFraming::UntilClose => None,
    };
    let keep_alive = status.code != 101
        && framing.is_self_delimiting()
        && match version {
            Version::Http11 => !has_token(&headers, "Connection", "close"),
            Version::Http10 => has_token(&headers, "Connection", "keep-alive"),
        };

    Ok(WireResponse {
        status,
        version,
        headers,
        framing,
        content_length,
        keep_alive,
    })
}
