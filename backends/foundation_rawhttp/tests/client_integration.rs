//! Integration tests for `RawClient` against a loopback HTTP server.
//!
//! These tests drive real sockets: pooling, redirects, deadlines and TLS are
//! verified against what the server actually received.

use flate2::write::GzEncoder;
use flate2::Compression;
use foundation_rawhttp::{ErrorKind, Header, Options, RawClient, RawHttpError, RawRequest};
use foundation_testing::http::{HttpResponse, TestHttpServer};
use serial_test::serial;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};
use tracing_test::traced_test;

fn client() -> RawClient {
    RawClient::new(Options::default().timeout(Duration::from_secs(5)))
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// WHY: The basic round trip must carry status, headers and body intact
/// WHAT: Tests a GET and that Host names the dialed address
#[test]
fn test_get_round_trip_sets_host() {
    let server = TestHttpServer::start();
    let client = client();

    let mut response = client.get(&server.url("/hello")).unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(response.status, "200 OK");
    assert_eq!(response.header("Content-Type").as_deref(), Some("text/plain"));
    assert_eq!(response.read_body().unwrap(), b"OK");

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/hello");
    assert_eq!(requests[0].header("Host"), Some(server.address().as_str()));
}

/// WHY: Connection reuse is the point of the pool
/// WHAT: Tests that sequential calls share one TCP connection
#[test]
#[traced_test]
fn test_sequential_requests_reuse_one_connection() {
    let server = TestHttpServer::start();
    let client = client();

    for path in ["/a", "/b", "/c"] {
        let mut response = client.get(&server.url(path)).unwrap();
        assert_eq!(response.read_body().unwrap(), b"OK");
    }

    assert_eq!(server.connection_count(), 1);
    assert_eq!(client.dialer().idle_count(&server.address()), 1);
    assert!(logs_contain("reusing connection"));
}

/// WHY: An unread body must not poison the pool
/// WHAT: Tests that dropping an unread response still allows reuse
#[test]
fn test_dropped_response_returns_connection() {
    let server = TestHttpServer::with_response(|_| HttpResponse::ok(vec![b'x'; 1024]));
    let client = client();

    drop(client.get(&server.url("/big")).unwrap());
    let mut response = client.get(&server.url("/big")).unwrap();
    assert_eq!(response.read_body().unwrap().len(), 1024);
    assert_eq!(server.connection_count(), 1);
}

#[test]
fn test_connection_close_response_is_not_pooled() {
    let server =
        TestHttpServer::with_response(|_| HttpResponse::ok("bye").with_header("Connection", "close"));
    let client = client();

    for _ in 0..2 {
        let mut response = client.get(&server.url("/")).unwrap();
        assert_eq!(response.read_body().unwrap(), b"bye");
    }
    assert_eq!(server.connection_count(), 2);
    assert_eq!(client.dialer().total_idle(), 0);
}

/// WHY: Path redirects stay on the dialed host
/// WHAT: Tests `/old` -> `/new` on the same server
#[test]
fn test_follows_relative_redirect() {
    let server = TestHttpServer::with_response(|req| match req.path.as_str() {
        "/old" => HttpResponse::redirect("/new"),
        _ => HttpResponse::ok("arrived"),
    });
    let client = client();

    let mut response = client.get(&server.url("/old")).unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(response.read_body().unwrap(), b"arrived");

    let paths: Vec<String> = server.requests().into_iter().map(|r| r.path).collect();
    assert_eq!(paths, vec!["/old", "/new"]);
    assert_eq!(server.connection_count(), 1);
}

/// WHY: Absolute redirects move to another origin
/// WHAT: Tests a hop to a second server with its own Host header
#[test]
fn test_follows_absolute_redirect_to_other_server() {
    let target = TestHttpServer::with_response(|_| HttpResponse::ok("other"));
    let location = target.url("/path");
    let origin = TestHttpServer::with_response(move |_| HttpResponse::redirect(&location));
    let client = client();

    let mut response = client.get(&origin.url("/start")).unwrap();
    assert_eq!(response.read_body().unwrap(), b"other");

    let requests = target.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/path");
    assert_eq!(requests[0].header("Host"), Some(target.address().as_str()));
}

/// WHY: The hop budget bounds how far a chain is followed
/// WHAT: Tests that max_redirects = 2 follows exactly two of three redirects
#[test]
fn test_redirect_budget_stops_chain() {
    let server = TestHttpServer::with_response(|req| match req.path.as_str() {
        "/r1" => HttpResponse::redirect("/r2"),
        "/r2" => HttpResponse::redirect("/r3"),
        "/r3" => HttpResponse::redirect("/final"),
        _ => HttpResponse::ok("final"),
    });
    let client = client();
    let options = Options::default().max_redirects(2);

    let response = client
        .do_raw_with_options("GET", &server.url("/r1"), None, &[], None, &options)
        .unwrap();
    assert_eq!(response.status_code, 302);
    assert_eq!(response.location().as_deref(), Some("/final"));

    let paths: Vec<String> = server.requests().into_iter().map(|r| r.path).collect();
    assert_eq!(paths, vec!["/r1", "/r2", "/r3"]);
}

#[test]
fn test_zero_redirect_budget_returns_first_response() {
    let server = TestHttpServer::with_response(|_| HttpResponse::redirect("/elsewhere"));
    let client = RawClient::new(Options::default().max_redirects(0));

    let response = client.get(&server.url("/")).unwrap();
    assert_eq!(response.status_code, 302);
    assert_eq!(server.requests().len(), 1);
}

/// WHY: Raw clients replay the request as built on every hop
/// WHAT: Tests that 307 and 303 both keep POST and the body
#[test]
fn test_redirect_keeps_method_and_body() {
    let server = TestHttpServer::with_response(|req| match req.path.as_str() {
        "/307" => HttpResponse::redirect_with(307, "Temporary Redirect", "/303"),
        "/303" => HttpResponse::redirect_with(303, "See Other", "/done"),
        _ => HttpResponse::ok(req.body.clone()),
    });
    let client = client();

    let mut response = client
        .post(&server.url("/307"), "application/json", r#"{"id":7}"#)
        .unwrap();
    assert_eq!(response.read_body().unwrap(), br#"{"id":7}"#);

    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    for request in &requests {
        assert_eq!(request.method, "POST");
        assert_eq!(request.body, br#"{"id":7}"#);
        assert_eq!(request.header("Content-Type"), Some("application/json"));
    }
}

/// WHY: The path override is sent as written on every attempt
/// WHAT: Tests that a redirected call keeps the override path on its second hop
#[test]
fn test_path_override_survives_redirect() {
    let served = AtomicUsize::new(0);
    let server = TestHttpServer::with_response(move |_| {
        if served.fetch_add(1, Ordering::SeqCst) == 0 {
            HttpResponse::redirect("/elsewhere")
        } else {
            HttpResponse::ok("landed")
        }
    });
    let client = client();

    let request = RawRequest::new("GET", server.url("/start")).uri_path("/a/../b");
    let mut response = client.do_request(&request).unwrap();
    assert_eq!(response.read_body().unwrap(), b"landed");

    let paths: Vec<String> = server.requests().into_iter().map(|r| r.path).collect();
    assert_eq!(paths, vec!["/a/../b", "/a/../b"]);
}

/// WHY: HEAD responses advertise gzip without sending a body
/// WHAT: Tests a HEAD against a gzip-encoding server
#[test]
fn test_head_against_gzip_server() {
    let server = TestHttpServer::with_response(|_| {
        HttpResponse::raw(
            &b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: 64\r\n\r\n"[..],
        )
    });
    let client = client();

    let mut response = client.head(&server.url("/")).unwrap();
    assert_eq!(response.content_length, Some(64));
    assert!(response.read_body().unwrap().is_empty());
}

/// WHY: gzip responses must be readable without caller work
/// WHAT: Tests transparent decoding of a gzip body
#[test]
fn test_gzip_body_is_decoded() {
    let server = TestHttpServer::with_response(|_| {
        HttpResponse::ok(gzip(b"compressed payload")).with_header("Content-Encoding", "gzip")
    });
    let client = client();

    let mut response = client.get(&server.url("/gz")).unwrap();
    assert_eq!(response.header("Content-Encoding").as_deref(), Some("gzip"));
    assert_eq!(response.read_body().unwrap(), b"compressed payload");
}

/// WHY: Duplicate headers carry meaning, cookies especially
/// WHAT: Tests that every Set-Cookie arrives in order
#[test]
fn test_duplicate_set_cookie_headers_are_kept() {
    let server = TestHttpServer::with_response(|_| {
        HttpResponse::ok("")
            .with_header("Set-Cookie", "session=1")
            .with_header("Set-Cookie", "theme=dark")
            .with_header("Set-Cookie", "lang=en")
    });
    let client = client();

    let response = client.get(&server.url("/")).unwrap();
    assert_eq!(
        response.headers.get_all("set-cookie"),
        vec!["session=1", "theme=dark", "lang=en"]
    );
}

/// WHY: Raw control over headers and bytes is the reason this client exists
/// WHAT: Tests duplicate request headers, a path override and raw bytes
#[test]
fn test_raw_request_controls() {
    let server = TestHttpServer::start();
    let client = client();

    let request = RawRequest::new("GET", server.url("/ignored"))
        .uri_path("/%2e%2e/admin")
        .header("X-Dup", "one")
        .header("X-Dup", "two");
    client.do_request(&request).unwrap().read_body().unwrap();

    let raw = format!(
        "OPTIONS * HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        server.address()
    );
    let options = Options::default().custom_raw_bytes(raw);
    client
        .do_raw_with_options("GET", &server.url("/"), None, &[], None, &options)
        .unwrap()
        .read_body()
        .unwrap();

    let requests = server.requests();
    assert_eq!(requests[0].path, "/%2e%2e/admin");
    assert_eq!(requests[0].header_values("x-dup"), vec!["one", "two"]);
    assert_eq!(requests[1].method, "OPTIONS");
    assert_eq!(requests[1].path, "*");
}

/// WHY: The pool lock is never held across a dial
/// WHAT: Tests that N concurrent cold calls open N connections
#[test]
#[ntest::timeout(10000)]
fn test_concurrent_cold_calls_get_distinct_connections() {
    const CALLS: usize = 6;
    let barrier = Arc::new(Barrier::new(CALLS));
    let server = TestHttpServer::with_response(move |_| {
        // every request is in flight before any is answered
        barrier.wait();
        HttpResponse::ok("together")
    });
    let client = client();

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..CALLS)
            .map(|_| scope.spawn(|| client.get(&server.url("/")).unwrap().read_body().unwrap()))
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), b"together");
        }
    });

    assert_eq!(server.connection_count(), CALLS);
    let mut ids: Vec<usize> = server.requests().iter().map(|r| r.connection_id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), CALLS);
    assert_eq!(client.dialer().idle_count(&server.address()), CALLS);
}

/// WHY: A slow server must not hold a call past its deadline
/// WHAT: Tests that a delayed response fails with a timeout error
#[test]
#[serial]
fn test_slow_response_times_out() {
    let server = TestHttpServer::with_response(|_| {
        HttpResponse::ok("late").delayed(Duration::from_secs(2))
    });
    let client = RawClient::new(Options::default().timeout(Duration::from_millis(200)));

    let started = Instant::now();
    let err = client.get(&server.url("/slow")).unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err}");
    assert_eq!(err.kind(), ErrorKind::ReadWrite);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(client.dialer().total_idle(), 0);
}

#[test]
fn test_malformed_response_is_error() {
    let server = TestHttpServer::with_response(|_| HttpResponse::raw(&b"garbage\r\n\r\n"[..]));
    let err = client().get(&server.url("/")).unwrap_err();
    assert!(matches!(err, RawHttpError::MalformedResponse(_)));
}

/// WHY: Dial failures are their own error class
/// WHAT: Tests a refused connection on a closed port
#[test]
fn test_refused_connection_is_dial_error() {
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let err = client()
        .get(&format!("http://127.0.0.1:{port}/"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Dial);
}

#[test]
fn test_invalid_url_is_parse_error() {
    let err = client().get("http//missing-colon").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
}

/// WHY: Certificate validation is disabled for probing
/// WHAT: Tests HTTPS against a self-signed server, with connection reuse
#[test]
fn test_https_accepts_self_signed_certificate() {
    let server = TestHttpServer::with_tls_response(|req| HttpResponse::ok(req.path.clone()));
    let client = client();

    for path in ["/one", "/two"] {
        let mut response = client.get(&server.url(path)).unwrap();
        assert_eq!(response.read_body().unwrap(), path.as_bytes());
    }
    assert_eq!(server.connection_count(), 1);
}

#[test]
fn test_https_with_sni_override() {
    let server = TestHttpServer::with_tls_response(|_| HttpResponse::ok("sni"));
    let client = RawClient::new(
        Options::default()
            .timeout(Duration::from_secs(5))
            .sni("localhost"),
    );

    let mut response = client.get(&server.url("/")).unwrap();
    assert_eq!(response.read_body().unwrap(), b"sni");
}

/// WHY: Handshake failures are reported as such, not as I/O errors
/// WHAT: Tests an https URL pointed at a plaintext server
#[test]
fn test_https_against_plain_server_is_handshake_error() {
    let server = TestHttpServer::start();
    let url = format!("https://{}/", server.address());
    let client = RawClient::new(Options::default().timeout(Duration::from_secs(1)));

    let err = client.get(&url).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handshake);
}

/// WHY: A silent TLS peer must not hang the call
/// WHAT: Tests that the handshake is bounded by the call timeout
#[test]
#[serial]
fn test_silent_tls_peer_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let _peer = std::thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        let mut sink = [0u8; 1024];
        // read the ClientHello and never answer
        let _ = socket.read(&mut sink);
        std::thread::sleep(Duration::from_secs(2));
    });

    let client = RawClient::new(Options::default().timeout(Duration::from_millis(200)));
    let started = Instant::now();
    let err = client
        .get(&format!("https://127.0.0.1:{port}/"))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Handshake);
    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_header_values_are_sent_in_order() {
    let server = TestHttpServer::start();
    let client = client();
    let headers = [
        Header::new("Cookie", "a=1"),
        Header::new("Cookie", "b=2"),
        Header::new("User-Agent", "scanner/1.0"),
    ];

    client
        .do_raw("GET", &server.url("/"), None, &headers, None)
        .unwrap()
        .read_body()
        .unwrap();

    let request = &server.requests()[0];
    let names: Vec<&str> = request.headers.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(names, vec!["Host", "Cookie", "Cookie", "User-Agent"]);
    assert_eq!(request.header_values("cookie"), vec!["a=1", "b=2"]);
}
