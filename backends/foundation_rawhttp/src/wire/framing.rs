//! Response body framing.
//!
//! HOW: The framing is decided once from the response head, following the
//! message length rules of RFC 7230 section 3.3.3, and a `FramedState`
//! then pulls exactly that body out of a buffered reader. Chunked bodies are
//! decoded incrementally so a streamed body never buffers more than the
//! caller asks for.

use super::Header;
use crate::errors::RawHttpError;
use std::io::{self, BufRead, Read};

const MAX_CHUNK_LINE: u64 = 4096;
const MAX_TRAILER_BYTES: u64 = 16 * 1024;

/// How the length of a response body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head.
    Empty,
    /// Exactly this many bytes follow.
    Length(u64),
    /// Chunked transfer coding.
    Chunked,
    /// The body runs until the peer closes the connection.
    UntilClose,
}

impl BodyFraming {
    /// Decides the framing of a response to `request_method`.
    ///
    /// # Errors
    ///
    /// Returns `RawHttpError::MalformedResponse` when `Content-Length` is not
    /// a number or several differing values are present.
    pub fn for_response(
        request_method: &str,
        status: u16,
        headers: &[Header],
    ) -> Result<Self, RawHttpError> {
        if request_method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&status)
            || status == 204
            || status == 304
        {
            return Ok(Self::Empty);
        }

        if let Some(coding) = headers
            .iter()
            .filter(|h| h.is("Transfer-Encoding"))
            .flat_map(|h| h.value.split(','))
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .last()
        {
            return Ok(if coding.eq_ignore_ascii_case("chunked") {
                Self::Chunked
            } else {
                Self::UntilClose
            });
        }

        match declared_length(headers)? {
            Some(length) => Ok(Self::Length(length)),
            None => Ok(Self::UntilClose),
        }
    }

    /// Returns true when the end of the body can be found without the peer
    /// closing the connection.
    #[must_use]
    pub fn is_self_delimiting(&self) -> bool {
        !matches!(self, Self::UntilClose)
    }
}

/// Parses the `Content-Length` headers, if any.
///
/// # Errors
///
/// Fails on a non-numeric value or conflicting values.
pub(crate) fn declared_length(headers: &[Header]) -> Result<Option<u64>, RawHttpError> {
    let mut found: Option<u64> = None;

    for value in headers
        .iter()
        .filter(|h| h.is("Content-Length"))
        .flat_map(|h| h.value.split(','))
    {
        let length: u64 = value.trim().parse().map_err(|_| {
            RawHttpError::MalformedResponse(format!("invalid Content-Length: {value:?}"))
        })?;

        match found {
            Some(existing) if existing != length => {
                return Err(RawHttpError::MalformedResponse(format!(
                    "conflicting Content-Length values {existing} and {length}"
                )));
            }
            _ => found = Some(length),
        }
    }

    Ok(found)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dechunker {
    Size,
    Chunk(u64),
    CrLf,
    Trailer,
    Ended,
}

/// Progress through one framed body.
#[derive(Debug)]
pub struct FramedState {
    framing: BodyFraming,
    remaining: u64,
    dechunker: Dechunker,
    done: bool,
}

impl FramedState {
    #[must_use]
    pub fn new(framing: BodyFraming) -> Self {
        let (remaining, done) = match framing {
            BodyFraming::Empty => (0, true),
            BodyFraming::Length(length) => (length, length == 0),
            BodyFraming::Chunked | BodyFraming::UntilClose => (0, false),
        };

        Self {
            framing,
            remaining,
            dechunker: Dechunker::Size,
            done,
        }
    }

    #[must_use]
    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    /// Returns true once the whole body has been read.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Reads the next piece of body into `buf`. Returns 0 at the end.
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedEof` when the peer closes before a length or chunk
    /// is complete, `InvalidData` for broken chunk framing, or the read error
    /// of `source`.
    pub fn read<R: BufRead>(&mut self, source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }

        match self.framing {
            BodyFraming::Empty => {
                self.done = true;
                Ok(0)
            }
            BodyFraming::Length(_) => {
                let n = read_limited(source, buf, self.remaining)?;
                self.remaining -= n as u64;
                self.done = self.remaining == 0;
                Ok(n)
            }
            BodyFraming::UntilClose => {
                let n = source.read(buf)?;
                self.done = n == 0;
                Ok(n)
            }
            BodyFraming::Chunked => self.read_chunked(source, buf),
        }
    }

    fn read_chunked<R: BufRead>(&mut self, source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.dechunker {
                Dechunker::Size => {
                    let line = read_line(source, MAX_CHUNK_LINE)?;
                    let size = parse_chunk_size(&line)?;
                    self.dechunker = if size == 0 {
                        Dechunker::Trailer
                    } else {
                        Dechunker::Chunk(size)
                    };
                }
                Dechunker::Chunk(left) => {
                    let n = read_limited(source, buf, left)?;
                    let left = left - n as u64;
                    self.dechunker = if left == 0 {
                        Dechunker::CrLf
                    } else {
                        Dechunker::Chunk(left)
                    };
                    return Ok(n);
                }
                Dechunker::CrLf => {
                    if !read_raw_line(source, MAX_CHUNK_LINE)?.is_empty() {
                        return Err(invalid_data("expected CRLF after chunk data"));
                    }
                    self.dechunker = Dechunker::Size;
                }
                Dechunker::Trailer => {
                    let mut budget = MAX_TRAILER_BYTES;
                    loop {
                        let line = read_raw_line(source, budget)?;
                        if line.is_empty() {
                            break;
                        }
                        budget = budget.saturating_sub(line.len() as u64 + 2);
                    }
                    self.dechunker = Dechunker::Ended;
                }
                Dechunker::Ended => {
                    self.done = true;
                    return Ok(0);
                }
            }
        }
    }
}

fn read_limited<R: Read>(source: &mut R, buf: &mut [u8], left: u64) -> io::Result<usize> {
    let want = usize::try_from(left).map_or(buf.len(), |left| left.min(buf.len()));
    let n = source.read(&mut buf[..want])?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before the body was complete",
        ));
    }
    Ok(n)
}

/// Reads one CRLF (or bare LF) terminated line of at most `limit` bytes and
/// returns it without the terminator.
///
/// Header and trailer lines may carry obs-text (0x80-0xFF), so the bytes are
/// returned as received.
pub(crate) fn read_raw_line<R: BufRead>(source: &mut R, limit: u64) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    let read = source.by_ref().take(limit).read_until(b'\n', &mut line)?;

    if read == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed in the middle of a line",
        ));
    }
    if line.last() != Some(&b'\n') {
        return Err(invalid_data("line too long or not terminated"));
    }

    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(line)
}

/// Like [`read_raw_line`] for lines that must be text, such as chunk sizes.
pub(crate) fn read_line<R: BufRead>(source: &mut R, limit: u64) -> io::Result<String> {
    String::from_utf8(read_raw_line(source, limit)?)
        .map_err(|_| invalid_data("line is not valid UTF-8"))
}

fn parse_chunk_size(line: &str) -> io::Result<u64> {
    let size = line.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| invalid_data(&format!("invalid chunk size {size:?}")))
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
