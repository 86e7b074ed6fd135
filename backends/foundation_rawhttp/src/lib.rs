//! Direct-socket HTTP/1.1 client for security tooling.
//!
//! This crate provides:
//! - **Raw requests**: method, path, headers and body sent exactly as given,
//!   or hand-written bytes sent verbatim
//! - **Connection pooling**: idle connections reused per dialed address
//! - **TLS without validation**: self-signed and mismatched certificates
//!   are accepted on purpose
//! - **Redirects**: followed iteratively under a hop budget, same method and
//!   body on every hop
//! - **Transparent gzip**: `Content-Encoding: gzip` bodies decoded on read
//!
//! # Examples
//!
//! ```no_run
//! use foundation_rawhttp::{Header, Options, RawClient};
//! use std::time::Duration;
//!
//! let client = RawClient::new(Options::default().timeout(Duration::from_secs(5)));
//! let mut response = client
//!     .do_raw(
//!         "GET",
//!         "http://127.0.0.1:8080/admin",
//!         Some("/admin/../secret"),
//!         &[Header::new("X-Forwarded-For", "127.0.0.1")],
//!         None,
//!     )
//!     .expect("request should succeed");
//!
//! let body = response.read_body();
//! println!("{} {:?}", response.status, body);
//! ```

pub mod client;
pub mod connection;
pub mod errors;
pub mod options;
pub mod pool;
pub mod redirects;
pub mod response;
pub mod stream;
pub mod tls;
pub mod wire;

pub use client::{RawClient, RawRequest};
pub use connection::Connection;
pub use errors::{ErrorKind, RawHttpError};
pub use options::{Options, RedirectStatus};
pub use pool::{ConnectionPool, Connector, Dialer, NetConnector, Scheme};
pub use response::{HeaderMap, RawResponse, ResponseBody};
pub use stream::{RawStream, Transport};
pub use tls::TlsUpgrader;
pub use wire::{Header, Version, WireRequest, WireResponse};
