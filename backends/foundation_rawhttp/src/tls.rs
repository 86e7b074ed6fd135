//! TLS upgrade of plain TCP connections.
//!
//! WHY: A probing client has to talk to self-signed, expired and mismatched
//! endpoints, so certificate validation is switched off on purpose. Changing
//! that must become an explicit policy, never a silent default.
//!
//! WHAT: `TlsUpgrader` wraps a rustls client config with an accept-all
//! certificate verifier and performs a deadline-bounded handshake over an
//! already connected `TcpStream`.
//!
//! HOW: The handshake is driven with `complete_io` in a loop. Before each
//! round the socket timeouts are set to the time left until the deadline, so
//! a stalled peer fails the handshake instead of blocking it.

use crate::errors::RawHttpError;
use crate::stream::RawStream;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};
use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Certificate verifier that accepts every server certificate.
///
/// Handshake signatures are still checked so the session keys belong to
/// whoever holds the presented certificate.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Returns the server name used for the handshake.
///
/// The override wins when present and non-empty. Otherwise the host portion
/// of `address` (text before the last colon) is used, without IPv6 brackets.
#[must_use]
pub fn server_name_for(address: &str, sni: Option<&str>) -> String {
    if let Some(name) = sni.filter(|name| !name.is_empty()) {
        return name.to_string();
    }

    let host = match address.rfind(':') {
        // a colon inside brackets belongs to an IPv6 literal without port
        Some(pos) if !address[pos..].contains(']') => &address[..pos],
        _ => address,
    };

    host.trim_start_matches('[').trim_end_matches(']').to_string()
}

/// Upgrades plain TCP connections to TLS with validation disabled.
#[derive(Clone)]
pub struct TlsUpgrader(Arc<ClientConfig>);

impl std::fmt::Debug for TlsUpgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TlsUpgrader")
            .field(&"accept-any-certificate")
            .finish()
    }
}

impl Default for TlsUpgrader {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsUpgrader {
    /// Creates an upgrader backed by the ring crypto provider.
    #[must_use]
    pub fn new() -> Self {
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
            .with_no_client_auth();
        Self(Arc::new(config))
    }

    /// Performs the TLS handshake over `plain`.
    ///
    /// # Arguments
    ///
    /// * `plain` - Connected TCP stream, consumed by the upgrade
    /// * `address` - Dialed `host[:port]`, used to derive the server name
    /// * `sni` - Optional server name override
    /// * `timeout` - Optional handshake bound
    ///
    /// # Errors
    ///
    /// Returns `RawHttpError::TlsHandshakeFailed` for an invalid server name,
    /// a handshake error or an expired deadline. The socket is shut down
    /// before the error is returned.
    pub fn upgrade(
        &self,
        mut plain: TcpStream,
        address: &str,
        sni: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<RawStream, RawHttpError> {
        let name = server_name_for(address, sni);

        let connection = ServerName::try_from(name.clone())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
            .and_then(|server_name| {
                ClientConnection::new(self.0.clone(), server_name)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
            });

        let handshake = connection.and_then(|mut connection| {
            drive_handshake(&mut connection, &mut plain, timeout)?;
            // deadlines are re-armed per operation by the connection
            plain.set_read_timeout(None)?;
            plain.set_write_timeout(None)?;
            Ok(connection)
        });

        match handshake {
            Ok(connection) => Ok(RawStream::AsClientTls(Box::new(rustls::StreamOwned::new(
                connection, plain,
            )))),
            Err(err) => {
                let _ = plain.shutdown(Shutdown::Both);
                tracing::warn!("TLS handshake with {address} (sni: {name}) failed: {err}");
                Err(RawHttpError::TlsHandshakeFailed(format!("{name}: {}", describe(&err))))
            }
        }
    }
}

fn drive_handshake(
    connection: &mut ClientConnection,
    socket: &mut TcpStream,
    timeout: Option<Duration>,
) -> io::Result<()> {
    let deadline = timeout.map(|t| Instant::now() + t);

    while connection.is_handshaking() {
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"));
            }
            socket.set_read_timeout(Some(remaining))?;
            socket.set_write_timeout(Some(remaining))?;
        }

        match connection.complete_io(socket) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"));
            }
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

fn describe(err: &io::Error) -> String {
    if err.kind() == io::ErrorKind::TimedOut {
        "handshake timed out".to_string()
    } else {
        err.to_string()
    }
}
