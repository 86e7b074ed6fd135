//! HTTP/1.1 wire codec.
//!
//! WHY: The client core only talks to the wire through two operations, write
//! a request value and read a response value. Keeping the byte-level framing
//! here keeps the core free of parsing details.
//!
//! WHAT: `WireRequest` serialization, `WireResponse` head parsing and the
//! body framing state machine.

mod framing;
mod request;
mod response;

pub use framing::{BodyFraming, FramedState};
pub use request::WireRequest;
pub use response::{Status, WireResponse};

use serde::{Deserialize, Serialize};
use std::fmt;

/// One header line. Duplicate keys are allowed and order is preserved
/// wherever headers are kept in a list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Case-insensitive name comparison.
    #[must_use]
    pub fn is(&self, name: &str) -> bool {
        self.key.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.value)
    }
}

/// HTTP protocol version spoken on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    #[must_use]
    pub fn major(self) -> u8 {
        1
    }

    #[must_use]
    pub fn minor(self) -> u8 {
        match self {
            Self::Http10 => 0,
            Self::Http11 => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true when any comma-separated token of any `name` header equals
/// `token`, ignoring ASCII case.
pub(crate) fn has_token(headers: &[Header], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|h| h.is(name))
        .flat_map(|h| h.value.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}
