//! The relay server: accepts downstream HTTP clients, primes each with a
//! burst of back-buffered stream, then streams chunk-by-chunk until it
//! falls behind or disconnects.

pub mod client;
pub mod http;
pub mod server;

pub use client::RelayClient;
pub use http::{ClientRequest, MinimalResponseHeaders, ResponseHeaderSource};
pub use server::{RelayOptions, RelayServer};
