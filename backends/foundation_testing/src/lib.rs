//! Reusable test infrastructure for the foundation crates.
//!
//! This crate provides:
//! - **Loopback HTTP server**: plain and TLS, keep-alive, request recording
//!
//! # Examples
//!
//! ```rust
//! use foundation_testing::http::{HttpResponse, TestHttpServer};
//!
//! let server = TestHttpServer::with_response(|req| {
//!     if req.path == "/old" {
//!         HttpResponse::redirect("/new")
//!     } else {
//!         HttpResponse::ok(b"hello")
//!     }
//! });
//!
//! assert!(server.url("/old").starts_with("http://127.0.0.1:"));
//! assert_eq!(server.connection_count(), 0);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)] // Common for testing crates

pub mod http;

// Re-export commonly used items
pub use http::{HttpRequest, HttpResponse, TestHttpServer};
