//! The relay's two cooperating threads: an acceptor that binds, accepts,
//! and primes clients, and a sender that drains every client's cursor each
//! pass. Generalizes the teacher's `src/eloop/control.rs` two-thread
//! pattern (`client_acceptor` thread + a core behind `Arc<Mutex<_>>`) from
//! "one control port speaking a binary RPC" to "one relay port speaking
//! ICY/HTTP to N clients."

use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{RelayError, RelayResult};
use crate::relay::client::RelayClient;
use crate::relay::http::{self, ResponseHeaderSource};
use crate::ring::Ring;
use crate::socket;

/// Every tunable the spec lists for the relay listener, the direct
/// descendant of the teacher's `Config`/`IceCastWriterOptions` structs:
/// `serde`-derived so an external loader only has to deserialize TOML/JSON
/// into it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RelayOptions {
    pub port: u16,
    pub search_ports: bool,
    pub max_port: u16,
    pub bind_ip: Option<IpAddr>,
    pub max_connections: usize,
    pub burst_bytes: usize,
    #[serde(with = "duration_ms")]
    pub accept_poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub client_request_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub sender_sleep: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        RelayOptions {
            port: 8000,
            search_ports: false,
            max_port: 8010,
            bind_ip: None,
            max_connections: 0,
            burst_bytes: 64 * 1024,
            accept_poll_interval: Duration::from_millis(200),
            client_request_timeout: Duration::from_secs(5),
            sender_sleep: Duration::from_millis(10),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// How many polls `stop()` waits for each thread to notice `running` has
/// gone false before it proceeds to close resources anyway. A real, bounded
/// wait rather than an oversight — spec §5/§9 calls this out explicitly.
const SHUTDOWN_POLL_ITERATIONS: u32 = 20;
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub struct RelayServer {
    running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    send_thread: Option<JoinHandle<()>>,
    clients: Arc<Mutex<Vec<RelayClient>>>,
    local_addr: SocketAddr,
}

impl RelayServer {
    /// Bind per `options`, spawn the acceptor and sender threads, and
    /// return immediately; both threads run until [`RelayServer::stop`].
    pub fn start(
        ring: Arc<Mutex<Ring>>,
        options: RelayOptions,
        headers: Arc<dyn ResponseHeaderSource>,
        icy_metaint: Option<usize>,
    ) -> RelayResult<RelayServer> {
        let bind_ip = options.bind_ip.unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        let listener = if options.search_ports {
            socket::bind_listener_search(bind_ip, options.port, options.max_port)
                .map_err(|_| RelayError::NoPortAvailable { start: options.port, end: options.max_port })?
        } else {
            socket::bind_listener(SocketAddr::new(bind_ip, options.port))?
        };
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        log::info!("relay: listening on {local_addr}");

        let running = Arc::new(AtomicBool::new(true));
        let clients: Arc<Mutex<Vec<RelayClient>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_thread = {
            let running = running.clone();
            let ring = ring.clone();
            let clients = clients.clone();
            let options = options.clone();
            thread::spawn(move || accept_loop(listener, running, ring, clients, headers, icy_metaint, options))
        };

        let send_thread = {
            let running = running.clone();
            let ring = ring.clone();
            let clients = clients.clone();
            let sleep = options.sender_sleep;
            thread::spawn(move || send_loop(running, ring, clients, sleep))
        };

        Ok(RelayServer {
            running,
            accept_thread: Some(accept_thread),
            send_thread: Some(send_thread),
            clients,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Sets `running = false`, waits a bounded number of iterations for
    /// both threads to notice, then closes every client regardless. A
    /// thread that's mid-blocking-call when this runs may still exit a
    /// beat late; this is the behavior spec §5/§9 directs us to preserve.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for _ in 0..SHUTDOWN_POLL_ITERATIONS {
            let accept_done = self.accept_thread.as_ref().map(|h| h.is_finished()).unwrap_or(true);
            let send_done = self.send_thread.as_ref().map(|h| h.is_finished()).unwrap_or(true);
            if accept_done && send_done {
                break;
            }
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.send_thread.take() {
            let _ = handle.join();
        }
        self.clients.lock().unwrap().clear();
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_loop(
    listener: TcpListener,
    running: Arc<AtomicBool>,
    ring: Arc<Mutex<Ring>>,
    clients: Arc<Mutex<Vec<RelayClient>>>,
    headers: Arc<dyn ResponseHeaderSource>,
    icy_metaint: Option<usize>,
    options: RelayOptions,
) {
    while running.load(Ordering::SeqCst) {
        let mut stream = match listener.accept() {
            Ok((stream, _addr)) => stream,
            Err(err) if socket::is_would_block(&err) => {
                thread::sleep(options.accept_poll_interval);
                continue;
            }
            Err(err) => {
                log::warn!("relay: accept error: {err}");
                continue;
            }
        };

        if options.max_connections > 0 && clients.lock().unwrap().len() >= options.max_connections {
            log::debug!("relay: rejecting client, at max_connections={}", options.max_connections);
            continue;
        }

        let request = match http::parse_client_request(&mut stream, options.client_request_timeout) {
            Ok(req) => req,
            Err(err) => {
                log::debug!("relay: dropping client, bad request: {err}");
                continue;
            }
        };

        if let Err(err) = http::drain_request_body(&mut stream, request.content_length) {
            log::debug!("relay: dropping client, failed to drain request body: {err}");
            continue;
        }

        let response = headers.generate(request.icy_metadata_requested, icy_metaint);
        if let Err(err) = std::io::Write::write_all(&mut stream, &response) {
            log::debug!("relay: dropping client, short response send: {err}");
            continue;
        }

        if let Err(err) = socket::make_nonblocking(&stream) {
            log::warn!("relay: failed to set client non-blocking: {err}");
            continue;
        }

        let wants_icy = icy_metaint.is_some() && request.icy_metadata_requested;
        let entry = {
            let mut ring = ring.lock().unwrap();
            ring.init_relay_entry(options.burst_bytes, wants_icy)
        };
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::debug!("relay: dropping client, cannot seed burst: {err}");
                continue;
            }
        };

        let client = RelayClient::new(stream, entry.cursor, wants_icy, entry.header_copy);
        clients.lock().unwrap().insert(0, client);
        log::info!("relay: client connected (wants_icy={wants_icy})");
    }
}

fn send_loop(running: Arc<AtomicBool>, ring: Arc<Mutex<Ring>>, clients: Arc<Mutex<Vec<RelayClient>>>, sleep: Duration) {
    while running.load(Ordering::SeqCst) {
        {
            let mut ring = ring.lock().unwrap();
            let mut clients = clients.lock().unwrap();

            for id in ring.drain_too_slow() {
                if let Some(idx) = clients.iter().position(|c| c.cursor == id) {
                    log::info!("relay: disconnecting client, fell too far behind");
                    clients.remove(idx);
                }
            }

            let mut to_disconnect = Vec::new();
            for (idx, client) in clients.iter_mut().enumerate() {
                if client.is_new {
                    client.reset_for_new_pass();
                }

                if client.is_idle() {
                    if client.has_pending_header() {
                        let chunk = client.take_header_chunk(ring.chunk_size() + 16 * 256);
                        if chunk.is_empty() {
                            continue;
                        }
                        client.load_buffer(chunk);
                    } else {
                        let capacity = ring.chunk_size() + 16 * 256;
                        match ring.extract_relay(client.cursor, capacity) {
                            Ok(Some(data)) => client.load_buffer(data),
                            Ok(None) => continue,
                            Err(err) => {
                                log::debug!("relay: extract_relay error, disconnecting client: {err}");
                                to_disconnect.push(idx);
                                continue;
                            }
                        }
                    }
                }

                match std::io::Write::write(&mut client.stream, client.pending_slice()) {
                    Ok(0) => to_disconnect.push(idx),
                    Ok(n) => client.advance(n),
                    Err(err) if socket::is_would_block(&err) => {}
                    Err(_err) => to_disconnect.push(idx),
                }
            }

            for idx in to_disconnect.into_iter().rev() {
                clients.remove(idx);
            }
        }
        thread::sleep(sleep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::http::MinimalResponseHeaders;
    use crate::ring::ContentType;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn start_server(ring: Ring) -> RelayServer {
        let ring = Arc::new(Mutex::new(ring));
        let options = RelayOptions {
            port: 0,
            search_ports: false,
            accept_poll_interval: Duration::from_millis(10),
            sender_sleep: Duration::from_millis(5),
            client_request_timeout: Duration::from_millis(500),
            ..RelayOptions::default()
        };
        RelayServer::start(ring, options, Arc::new(MinimalResponseHeaders), Some(16384)).unwrap()
    }

    #[test]
    fn client_receives_icy_response_and_burst_bytes() {
        let mut ring = Ring::init(ContentType::Mp3, true, 16384, 8).unwrap();
        ring.insert_chunk(&vec![0xABu8; 16384], None).unwrap();

        let mut server = start_server(ring);
        let addr = server.local_addr();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"GET / HTTP/1.0\r\nIcy-MetaData: 1\r\n\r\n").unwrap();

        let mut response = [0u8; 64];
        let n = stream.read(&mut response).unwrap();
        assert!(String::from_utf8_lossy(&response[..n]).starts_with("ICY 200 OK"));

        // Give the sender thread a few passes to fill the client's buffer.
        thread::sleep(Duration::from_millis(100));
        stream.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let mut body = vec![0u8; 16384];
        stream.read_exact(&mut body).unwrap();

        server.stop();
    }

    #[test]
    fn max_connections_rejects_extra_clients() {
        let ring = Ring::init(ContentType::Mp3, true, 1024, 4).unwrap();
        let ring = Arc::new(Mutex::new(ring));
        let options = RelayOptions {
            port: 0,
            max_connections: 1,
            accept_poll_interval: Duration::from_millis(10),
            sender_sleep: Duration::from_millis(5),
            client_request_timeout: Duration::from_millis(500),
            ..RelayOptions::default()
        };
        let mut server = RelayServer::start(ring, options, Arc::new(MinimalResponseHeaders), None).unwrap();
        let addr = server.local_addr();

        let mut first = TcpStream::connect(addr).unwrap();
        first.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(server.client_count(), 1);

        let mut second = TcpStream::connect(addr).unwrap();
        second.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(server.client_count(), 1);

        server.stop();
    }
}
