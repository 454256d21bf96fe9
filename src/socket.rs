//! Thin facade over the handful of platform-varying socket operations the
//! relay server needs, so `relay::server`/`relay::client` never touch a raw
//! `SOCKET`/`int` distinction directly (design note in spec §9). Backed by
//! `std::net` plus `socket2` for the bits `std::net` doesn't expose
//! (`SO_REUSEADDR`), the same split the pack's `webrtc-rs-webrtc` mdns
//! crate uses `socket2` for.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};

use socket2::{Domain, Socket, Type};

/// Bind a listening socket with `SO_REUSEADDR` set and backlog 10. Left in
/// blocking mode; the acceptor sets it non-blocking itself once bound so it
/// can poll the shutdown flag between `accept()` attempts (spec §5).
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(10)?;
    Ok(socket.into())
}

/// Try each port in `start..=end` in turn, returning the first that binds.
pub fn bind_listener_search(ip: std::net::IpAddr, start: u16, end: u16) -> io::Result<TcpListener> {
    let mut last_err = None;
    for port in start..=end {
        match bind_listener(SocketAddr::new(ip, port)) {
            Ok(listener) => return Ok(listener),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no ports tried")))
}

/// Put a freshly-accepted client socket into non-blocking mode for the
/// sender thread's poll loop.
pub fn make_nonblocking(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)
}

/// `true` if `err` is the "would block" family (including the Windows
/// equivalent, `WSAEWOULDBLOCK`, which `std::io::ErrorKind::WouldBlock`
/// already normalizes to on every target `std` supports).
pub fn is_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn bind_listener_search_finds_a_free_port() {
        let listener = bind_listener_search(IpAddr::V4(Ipv4Addr::LOCALHOST), 41000, 41010).unwrap();
        assert!(listener.local_addr().unwrap().port() >= 41000);
    }

    #[test]
    fn would_block_is_recognized() {
        let err = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(is_would_block(&err));
        let other = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(!is_would_block(&other));
    }
}
