//! `ripcore`: the content-addressed ring buffer, format-aware framing,
//! charset conversion, track writer, and relay server that sit between an
//! upstream audio source and a set of downstream ICY/HTTP clients.
//!
//! What this crate does *not* do, by design: establish or maintain the
//! upstream connection (reconnect, redirects, playlist parsing), load
//! configuration from a file, speak TLS or any auth scheme, or write
//! ID3v2/WAV containers. Those are external collaborators; see
//! [`ingest::StreamSource`] and [`relay::ResponseHeaderSource`] for the
//! trait boundaries a caller plugs them in through.

pub mod charset;
pub mod error;
pub mod ingest;
pub mod metadata;
pub mod oggframer;
pub mod relay;
pub mod ring;
pub mod socket;
pub mod trackwriter;

pub use error::{
    CharsetError, CharsetResult, IngestError, IngestResult, MetadataError, MetadataResult,
    RelayError, RelayResult, RingError, RingResult, TrackWriterError, TrackWriterResult,
};
pub use ingest::{IngestDriver, IngestOptions, ReadOutcome, StreamSource};
pub use metadata::TrackInfo;
pub use relay::{RelayOptions, RelayServer, ResponseHeaderSource};
pub use ring::{ContentType, Ring};
pub use trackwriter::{OverwritePolicy, TrackWriter, TrackWriterOptions};
