use derive_more::From;
use std::io;

/// Coarse classification of a [`RawHttpError`].
///
/// WHY: Callers of a security-probing client mostly care about which stage
/// of a request failed, not the exact variant.
///
/// WHAT: One entry per failure stage of a logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The target URL could not be parsed.
    Parse,
    /// The TCP connection could not be established.
    Dial,
    /// The TLS handshake failed or timed out.
    Handshake,
    /// Writing the request or reading the response failed.
    ReadWrite,
}

/// Raw HTTP client errors.
///
/// These errors can occur during any stage of a raw HTTP request. None of
/// them are retried internally.
#[derive(From, Debug)]
pub enum RawHttpError {
    /// Invalid URL provided.
    #[from(ignore)]
    InvalidUrl(String),

    /// Connection failed.
    #[from(ignore)]
    ConnectionFailed(String),

    /// Connection timeout exceeded while dialing.
    #[from(ignore)]
    ConnectionTimeout(String),

    /// TLS handshake failed.
    #[from(ignore)]
    TlsHandshakeFailed(String),

    /// The peer sent bytes that are not a valid HTTP/1.x response.
    #[from(ignore)]
    MalformedResponse(String),

    /// I/O error while writing the request or reading the response.
    #[from]
    IoError(io::Error),
}

impl RawHttpError {
    /// Returns the failure stage this error belongs to.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUrl(_) => ErrorKind::Parse,
            Self::ConnectionFailed(_) | Self::ConnectionTimeout(_) => ErrorKind::Dial,
            Self::TlsHandshakeFailed(_) => ErrorKind::Handshake,
            Self::MalformedResponse(_) | Self::IoError(_) => ErrorKind::ReadWrite,
        }
    }

    /// Returns true when the error was caused by an expired timeout or deadline.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::ConnectionTimeout(_) => true,
            Self::IoError(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            Self::TlsHandshakeFailed(msg) => msg.contains("timed out"),
            _ => false,
        }
    }
}

impl std::error::Error for RawHttpError {}

impl From<url::ParseError> for RawHttpError {
    fn from(err: url::ParseError) -> Self {
        RawHttpError::InvalidUrl(err.to_string())
    }
}

impl From<httparse::Error> for RawHttpError {
    fn from(err: httparse::Error) -> Self {
        RawHttpError::MalformedResponse(err.to_string())
    }
}

impl core::fmt::Display for RawHttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUrl(url) => write!(f, "Invalid URL: {url}"),
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::ConnectionTimeout(msg) => write!(f, "Connection timeout: {msg}"),
            Self::TlsHandshakeFailed(msg) => write!(f, "TLS handshake failed: {msg}"),
            Self::MalformedResponse(msg) => write!(f, "Malformed response: {msg}"),
            Self::IoError(err) => write!(f, "I/O error: {err}"),
        }
    }
}

/// Returns the first error of two fallible steps, preferring `first`.
pub(crate) fn first_err<E>(first: Result<(), E>, second: Result<(), E>) -> Result<(), E> {
    first?;
    second
}

#[cfg(test)]
mod tests {
    use super::*;

    /// WHY: Verify each variant lands in the right failure stage
    /// WHAT: Tests `kind()` against the four stages
    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            RawHttpError::InvalidUrl("x".into()).kind(),
            ErrorKind::Parse
        );
        assert_eq!(
            RawHttpError::ConnectionFailed("x".into()).kind(),
            ErrorKind::Dial
        );
        assert_eq!(
            RawHttpError::ConnectionTimeout("x".into()).kind(),
            ErrorKind::Dial
        );
        assert_eq!(
            RawHttpError::TlsHandshakeFailed("x".into()).kind(),
            ErrorKind::Handshake
        );
        assert_eq!(
            RawHttpError::MalformedResponse("x".into()).kind(),
            ErrorKind::ReadWrite
        );
        assert_eq!(
            RawHttpError::from(io::Error::from(io::ErrorKind::BrokenPipe)).kind(),
            ErrorKind::ReadWrite
        );
    }

    /// WHY: Deadline expiry surfaces as `WouldBlock` on unix sockets
    /// WHAT: Tests that both io timeout kinds count as timeouts
    #[test]
    fn test_is_timeout_for_io_kinds() {
        let timed_out = RawHttpError::from(io::Error::from(io::ErrorKind::TimedOut));
        let would_block = RawHttpError::from(io::Error::from(io::ErrorKind::WouldBlock));
        let reset = RawHttpError::from(io::Error::from(io::ErrorKind::ConnectionReset));

        assert!(timed_out.is_timeout());
        assert!(would_block.is_timeout());
        assert!(!reset.is_timeout());
    }

    /// WHY: Verify url parse errors become InvalidUrl
    /// WHAT: Tests the `From<url::ParseError>` conversion
    #[test]
    fn test_from_url_parse_error() {
        let err = RawHttpError::from(url::Url::parse("no scheme").unwrap_err());
        assert!(matches!(err, RawHttpError::InvalidUrl(_)));
        assert!(err.to_string().contains("Invalid URL"));
    }

    #[test]
    fn test_first_err_prefers_first() {
        let first: Result<(), &str> = Err("drain");
        assert_eq!(first_err(first, Err("close")), Err("drain"));
        assert_eq!(first_err(Ok(()), Err("close")), Err("close"));
        assert_eq!(first_err::<&str>(Ok(()), Ok(())), Ok(()));
    }
}
