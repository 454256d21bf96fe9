//! Error taxonomy for the core, grouped by component.
//!
//! Buffer-empty/buffer-full are flow-control signals, not errors, so they
//! get their own non-error variants on `RingError` rather than being folded
//! in with invalid-argument/IO failures.

use thiserror::Error;

/// Errors raised by [`crate::ring::Ring`] operations.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum RingError {
    #[error("ring parameters must be non-zero (chunk_size={chunk_size}, num_chunks={num_chunks})")]
    InvalidParam { chunk_size: usize, num_chunks: usize },

    #[error("insert of {requested} bytes exceeds {available} free bytes")]
    BufferFull { requested: usize, available: usize },

    #[error("extract of {requested} bytes exceeds {available} buffered bytes")]
    BufferEmpty { requested: usize, available: usize },

    #[error("no ogg pages are buffered yet, cannot seed a relay client")]
    NoOggPagesForRelay,
}

pub type RingResult<T> = Result<T, RingError>;

/// Errors raised while parsing or composing metadata (ICY frames, Vorbis
/// comments). Malformed input is recoverable at this layer per spec: the
/// caller substitutes a replacement character rather than aborting, so this
/// type is reserved for cases where there is nothing sensible to recover.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum MetadataError {
    #[error("metadata frame exceeds the maximum SHOUTcast length (4080 bytes)")]
    FrameTooLong,

    #[error("vorbis comment packet is malformed")]
    MalformedCommentPacket,
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Errors raised by the charset conversion pipeline.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CharsetError {
    #[error("unknown charset name: {0}")]
    UnknownCharset(String),

    #[error("input ended mid-sequence")]
    Truncated,

    #[error("invalid byte 0x{0:02x} for this encoding")]
    InvalidByte(u8),

    #[error("overlong encoding of an otherwise valid code point")]
    Overlong,

    #[error("unpaired surrogate in UTF-16 input")]
    UnpairedSurrogate,
}

pub type CharsetResult<T> = Result<T, CharsetError>;

/// Errors raised by the track writer.
#[derive(Debug, Error)]
pub enum TrackWriterError {
    #[error("unknown content type, cannot pick a file extension")]
    UnknownContentType,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TrackWriterResult<T> = Result<T, TrackWriterError>;

/// Errors raised by the relay server's listener setup. Per-client failures
/// (bad request, short send, reset) are not represented here: they only
/// ever cause that one client to be disconnected, never a returned error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no free port found in {start}..={end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error(transparent)]
    Ring(#[from] RingError),
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Errors raised by the ingest driver. Per spec §7, only upstream socket
/// death, OOM, or explicit shutdown end the session; everything else (a
/// single bad metadata frame, a writer hiccup on one track) is absorbed
/// inside the driver loop.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("upstream read timed out")]
    Timeout,

    #[error("upstream socket closed")]
    SocketClosed,

    #[error("ingest aborted by shutdown signal")]
    Aborted,

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Writer(#[from] TrackWriterError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type IngestResult<T> = Result<T, IngestError>;
