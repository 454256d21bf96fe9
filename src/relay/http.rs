//! Request-header parsing and the response-header boundary for the relay's
//! downstream HTTP surface.
//!
//! Per spec §1/§6, constructing the actual `ICY 200 OK` response (station
//! name, genre, `icy-metaint`, ...) is an external collaborator's job; this
//! module only parses what a client asked for and defines the trait that
//! collaborator implements.

use std::io::{self, Read};
use std::net::TcpStream;
use std::time::{Duration, Instant};

/// What the relay server needs out of a client's request: whether it wants
/// ICY metadata interleaved into its stream, plus a declared `Content-Length`
/// if any so the leftover body can be drained before the response goes out.
/// Every other header is ignored, per spec §6.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientRequest {
    pub icy_metadata_requested: bool,
    pub content_length: Option<usize>,
}

/// Read a client's HTTP request line-by-line until the terminating blank
/// line (CRLF CRLF, or a bare LF LF from a lenient client), scanning for a
/// case-insensitive `Icy-MetaData:` header. Bounded by `timeout` so a client
/// that never finishes its request can't wedge the acceptor thread.
pub fn parse_client_request(stream: &mut TcpStream, timeout: Duration) -> io::Result<ClientRequest> {
    stream.set_read_timeout(Some(timeout))?;
    let deadline = Instant::now() + timeout;

    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if Instant::now() >= deadline {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "client request header timed out"));
        }
        match stream.read(&mut byte) {
            Ok(0) => break, // peer closed before finishing headers
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n\r\n") || buf.ends_with(b"\n\n") {
                    break;
                }
                if buf.len() > 64 * 1024 {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "request header too large"));
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut => continue,
            Err(err) => return Err(err),
        }
    }

    Ok(parse_header_bytes(&buf))
}

fn parse_header_bytes(buf: &[u8]) -> ClientRequest {
    let text = String::from_utf8_lossy(buf);
    let mut req = ClientRequest::default();
    for line in text.lines() {
        if let Some(value) = strip_header(line, "icy-metadata:") {
            let requested = value.trim().parse::<i64>().unwrap_or(0) != 0;
            req.icy_metadata_requested = requested;
        } else if let Some(value) = strip_header(line, "content-length:") {
            req.content_length = value.trim().parse::<usize>().ok();
        }
    }
    req
}

/// Discard whatever request body bytes the client already sent, per spec
/// §4.5 step 3.b, so they don't get misread as the start of a second
/// request on a keep-alive-style connection. Bounded by `content_length`
/// when the client declared one; otherwise a capped best-effort drain of
/// whatever's already sitting in the socket's receive buffer. Never blocks
/// waiting for more bytes to arrive.
pub fn drain_request_body(stream: &mut TcpStream, content_length: Option<usize>) -> io::Result<()> {
    const BEST_EFFORT_CAP: usize = 64 * 1024;
    let mut remaining = content_length.unwrap_or(BEST_EFFORT_CAP);

    stream.set_nonblocking(true)?;
    let result = (|| {
        let mut buf = [0u8; 4096];
        while remaining > 0 {
            let want = remaining.min(buf.len());
            match stream.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => remaining -= n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    })();
    stream.set_nonblocking(false)?;
    result
}

fn strip_header<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    if line.len() < name.len() {
        return None;
    }
    if line[..name.len()].eq_ignore_ascii_case(name) {
        Some(&line[name.len()..])
    } else {
        None
    }
}

/// External collaborator that builds the bytes sent back to a client
/// immediately after its request: must begin with `ICY 200 OK\r\n` and end
/// with `\r\n\r\n`. The relay server has no opinion on the contents beyond
/// transmitting them intact (station name/genre/`icy-metaint` construction
/// is out of this crate's scope per spec §1).
pub trait ResponseHeaderSource: Send + Sync {
    fn generate(&self, client_wants_icy: bool, icy_metaint: Option<usize>) -> Vec<u8>;
}

/// Minimal stand-in used by tests and as a reference implementation: a
/// plain `ICY 200 OK` with an `icy-metaint` line when applicable. Real
/// deployments supply their own `ResponseHeaderSource` carrying the
/// station's advertised name/genre/URL.
pub struct MinimalResponseHeaders;

impl ResponseHeaderSource for MinimalResponseHeaders {
    fn generate(&self, client_wants_icy: bool, icy_metaint: Option<usize>) -> Vec<u8> {
        let mut out = String::from("ICY 200 OK\r\n");
        out.push_str("Content-Type: audio/mpeg\r\n");
        if client_wants_icy {
            if let Some(interval) = icy_metaint {
                out.push_str(&format!("icy-metaint: {interval}\r\n"));
            }
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}
