//! HTTP test server utilities.
//!
//! WHY: Provides a real HTTP server built on stdlib TCP for client tests.
//!
//! WHAT: `TestHttpServer` for integration testing HTTP clients, plain or TLS.
//!
//! HOW: Uses stdlib's `TcpListener` with `httparse` for request heads and
//! manually crafted HTTP/1.1 responses.

mod server;

pub use server::{self_signed_config, HttpRequest, HttpResponse, TestHttpServer, TestServerError};
