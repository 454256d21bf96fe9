//! The content-addressed circular buffer sitting between ingest and every
//! consumer (the track writer, plus one cursor per relay client).
//!
//! This is the one piece of the core every other thread touches, so its
//! invariants are deliberately narrow: one writer (`insert_chunk`,
//! `set_next_song`), any number of readers identified by a [`CursorId`],
//! eviction only ever moves `base` forward. Callers are expected to wrap a
//! `Ring` in a `Mutex` (see `src/relay/server.rs` and `src/ingest.rs`) —
//! nothing in here does its own locking.

use std::collections::VecDeque;

use crate::error::{RingError, RingResult};
use crate::metadata::TrackInfo;
use crate::oggframer::{OggFramer, PageMarker};

/// The four wire formats the ingest side can hand us, plus the legacy
/// Ultravox framing, which behaves like AAC/NSV from the ring's point of
/// view (raw chunks, no ICY interleave, no page structure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Mp3,
    Aac,
    Nsv,
    Ogg,
    Ultravox,
}

impl ContentType {
    pub fn is_ogg(self) -> bool {
        matches!(self, ContentType::Ogg)
    }
}

/// Opaque handle to a relay client's read cursor. Stable across the
/// cursor's lifetime; never reused while live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId(u64);

struct Cursor {
    /// Ring-relative position of the next byte this reader wants.
    offset: usize,
    wants_icy: bool,
}

/// What [`Ring::init_relay_entry`] hands back: where a fresh relay client
/// should start reading, plus header bytes it must send first if it's
/// joining an OGG stream mid-flight.
pub struct RelayEntry {
    pub cursor: CursorId,
    pub ring_offset: usize,
    pub header_copy: Option<Vec<u8>>,
}

/// Point-in-time counters useful for logging/diagnostics; not used by any
/// correctness-sensitive path.
#[derive(Debug, Clone, Copy)]
pub struct RingStats {
    pub count: usize,
    pub free_bytes: usize,
    pub cursor_count: usize,
}

pub struct Ring {
    content_type: ContentType,
    chunk_size: usize,
    num_chunks: usize,
    size: usize,
    buf: Vec<u8>,

    base: usize,
    count: usize,
    next_song: usize,

    metadata_list: VecDeque<(usize, TrackInfo)>,
    page_list: VecDeque<PageMarker>,
    /// How many page markers this ring has ever evicted, so the OGG
    /// framer's globally-increasing page indices (which don't know about
    /// eviction) can be translated into a live `page_list` index.
    pages_evicted: usize,
    framer: Option<OggFramer>,

    cursors: std::collections::HashMap<CursorId, Cursor>,
    next_cursor_id: u64,
    too_slow: Vec<CursorId>,
}

impl Ring {
    /// Allocate a ring of `chunk_size * num_chunks` bytes. Both dimensions
    /// must be non-zero.
    pub fn init(
        content_type: ContentType,
        _have_relay: bool,
        chunk_size: usize,
        num_chunks: usize,
    ) -> RingResult<Ring> {
        if chunk_size == 0 || num_chunks == 0 {
            return Err(RingError::InvalidParam {
                chunk_size,
                num_chunks,
            });
        }
        let size = chunk_size * num_chunks;
        Ok(Ring {
            content_type,
            chunk_size,
            num_chunks,
            size,
            buf: vec![0u8; size],
            base: 0,
            count: 0,
            next_song: 0,
            metadata_list: VecDeque::new(),
            page_list: VecDeque::new(),
            pages_evicted: 0,
            framer: content_type.is_ogg().then(OggFramer::new),
            cursors: std::collections::HashMap::new(),
            next_cursor_id: 0,
            too_slow: Vec::new(),
        })
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn free_bytes(&self) -> usize {
        self.size - self.count
    }

    pub fn free_tail(&self) -> usize {
        let write_index = self.write_index();
        (self.size - write_index).min(self.free_bytes())
    }

    pub fn write_index(&self) -> usize {
        (self.base + self.count) % self.size
    }

    pub fn next_song(&self) -> usize {
        self.next_song
    }

    pub fn set_next_song(&mut self, pos: usize) {
        self.next_song = pos;
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            count: self.count,
            free_bytes: self.free_bytes(),
            cursor_count: self.cursors.len(),
        }
    }

    // -----------------------------------------------------------------
    // Writer side
    // -----------------------------------------------------------------

    /// Append `data` to the ring. If `track_info` is given, a metadata-list
    /// entry is recorded at the write position preceding this chunk.
    pub fn insert_chunk(&mut self, data: &[u8], track_info: Option<TrackInfo>) -> RingResult<()> {
        let len = data.len();
        if len > self.free_bytes() {
            return Err(RingError::BufferFull {
                requested: len,
                available: self.free_bytes(),
            });
        }

        let write_pos = self.count;
        if let Some(info) = track_info {
            log::debug!(
                "ring: recording metadata entry at position {write_pos} (artist={:?}, title={:?})",
                info.artist,
                info.title
            );
            self.metadata_list.push_back((write_pos, info));
        }

        self.write_physical(data);
        self.count += len;

        if let Some(framer) = self.framer.as_mut() {
            let scan = framer.scan(data, write_pos);
            for marker in scan.pages {
                self.page_list.push_back(marker);
            }
            for (global_index, header_bytes) in scan.header_attachments {
                if let Some(local_index) = global_index.checked_sub(self.pages_evicted) {
                    if let Some(marker) = self.page_list.get_mut(local_index) {
                        marker.optional_header_copy = Some(header_bytes);
                    }
                }
            }
            for (pos, info) in scan.metadata {
                self.metadata_list.push_back((pos, info));
            }
        }

        Ok(())
    }

    fn write_physical(&mut self, data: &[u8]) {
        let mut remaining = data;
        let mut write_index = self.write_index();
        while !remaining.is_empty() {
            let tail = self.size - write_index;
            let chunk = remaining.len().min(tail);
            self.buf[write_index..write_index + chunk].copy_from_slice(&remaining[..chunk]);
            remaining = &remaining[chunk..];
            write_index = (write_index + chunk) % self.size;
        }
    }

    // -----------------------------------------------------------------
    // Extraction (consuming reads that advance the base)
    // -----------------------------------------------------------------

    /// Copy out the oldest `count_req` bytes, advancing `base`. Returns the
    /// bytes, the pre-extraction `next_song` value, and any `TrackInfo`
    /// entries evicted in the process (the caller — the ingest driver —
    /// gets first refusal on these before they're gone for good).
    pub fn extract(&mut self, count_req: usize) -> RingResult<ExtractResult> {
        if count_req > self.count {
            return Err(RingError::BufferEmpty {
                requested: count_req,
                available: self.count,
            });
        }
        let data = self.read_physical(self.base, count_req);
        let prev_next_song = self.next_song;

        self.base = (self.base + count_req) % self.size;
        self.count -= count_req;
        self.next_song = self.next_song.saturating_sub(count_req);

        self.advance_cursors(count_req);
        let evicted_track_infos = self.evict_metadata(count_req);
        self.evict_pages(count_req);

        Ok(ExtractResult {
            data,
            prev_next_song,
            evicted_track_infos,
        })
    }

    /// Like [`Ring::extract`] but discards the bytes.
    pub fn fastforward(&mut self, count_req: usize) -> RingResult<FastForwardResult> {
        if count_req > self.count {
            return Err(RingError::BufferEmpty {
                requested: count_req,
                available: self.count,
            });
        }
        let prev_next_song = self.next_song;

        self.base = (self.base + count_req) % self.size;
        self.count -= count_req;
        self.next_song = self.next_song.saturating_sub(count_req);

        self.advance_cursors(count_req);
        let evicted_track_infos = self.evict_metadata(count_req);
        self.evict_pages(count_req);

        Ok(FastForwardResult {
            prev_next_song,
            evicted_track_infos,
        })
    }

    /// Read the oldest `count_req` bytes without advancing anything.
    pub fn peek(&self, count_req: usize) -> RingResult<Vec<u8>> {
        if count_req > self.count {
            return Err(RingError::BufferEmpty {
                requested: count_req,
                available: self.count,
            });
        }
        Ok(self.read_physical(self.base, count_req))
    }

    /// Read `length` bytes starting at ring-relative offset `start_offset`,
    /// without advancing anything.
    pub fn peek_region(&self, start_offset: usize, length: usize) -> RingResult<Vec<u8>> {
        if start_offset + length > self.count {
            return Err(RingError::BufferEmpty {
                requested: start_offset + length,
                available: self.count,
            });
        }
        let physical_start = (self.base + start_offset) % self.size;
        Ok(self.read_physical(physical_start, length))
    }

    fn read_physical(&self, start: usize, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut pos = start;
        let mut remaining = len;
        while remaining > 0 {
            let tail = self.size - pos;
            let chunk = remaining.min(tail);
            out.extend_from_slice(&self.buf[pos..pos + chunk]);
            pos = (pos + chunk) % self.size;
            remaining -= chunk;
        }
        out
    }

    /// Repeatedly fast-forward whole OGG pages until at least `needed_free`
    /// bytes are free, always landing exactly on a page boundary. No-op
    /// (and a poor fit) for non-OGG content.
    pub fn advance_ogg(&mut self, needed_free: usize) -> RingResult<()> {
        while self.free_bytes() < needed_free {
            let next_len = match self.page_list.front() {
                Some(marker) => marker.page_len,
                None => break,
            };
            if next_len > self.count {
                break;
            }
            self.fastforward(next_len)?;
        }
        Ok(())
    }

    fn advance_cursors(&mut self, count_req: usize) {
        let mut too_slow = Vec::new();
        for (&id, cursor) in self.cursors.iter_mut() {
            if cursor.offset < count_req {
                too_slow.push(id);
            } else {
                cursor.offset -= count_req;
            }
        }
        for id in &too_slow {
            self.cursors.remove(id);
        }
        self.too_slow.extend(too_slow);
    }

    fn evict_metadata(&mut self, count_req: usize) -> Vec<TrackInfo> {
        let mut evicted = Vec::new();
        while let Some((pos, _)) = self.metadata_list.front() {
            if *pos < count_req {
                let (_, info) = self.metadata_list.pop_front().unwrap();
                evicted.push(info);
            } else {
                break;
            }
        }
        for (pos, _) in self.metadata_list.iter_mut() {
            *pos -= count_req;
        }
        evicted
    }

    fn evict_pages(&mut self, count_req: usize) {
        while let Some(marker) = self.page_list.front() {
            if marker.page_start < count_req {
                self.page_list.pop_front();
                self.pages_evicted += 1;
            } else {
                break;
            }
        }
        for marker in self.page_list.iter_mut() {
            marker.shift(count_req);
        }
    }

    /// Clients whose cursor went negative on the last eviction and were
    /// dropped; the relay server drains this each pass to know who to
    /// disconnect.
    pub fn drain_too_slow(&mut self) -> Vec<CursorId> {
        std::mem::take(&mut self.too_slow)
    }

    /// Pop the metadata entry sitting exactly at the current base, if any.
    /// The ingest driver calls this right after extracting exactly
    /// `next_song` bytes: the `TrackInfo` for the track that's about to
    /// start was inserted at that same position, so after the eviction
    /// shift it now sits at position 0.
    pub fn take_track_info_at_front(&mut self) -> Option<TrackInfo> {
        if matches!(self.metadata_list.front(), Some((0, _))) {
            self.metadata_list.pop_front().map(|(_, info)| info)
        } else {
            None
        }
    }

    // -----------------------------------------------------------------
    // Relay side
    // -----------------------------------------------------------------

    /// Register a new relay client's read cursor and pick its starting
    /// position per the burst rules.
    pub fn init_relay_entry(&mut self, burst_request: usize, wants_icy: bool) -> RingResult<RelayEntry> {
        let (ring_offset, header_copy) = if self.content_type.is_ogg() {
            self.ogg_burst_anchor(burst_request)?
        } else {
            let start = self.count.saturating_sub(burst_request);
            let rounded = start - (start % self.chunk_size.max(1));
            (rounded, None)
        };

        let id = CursorId(self.next_cursor_id);
        self.next_cursor_id += 1;
        self.cursors.insert(
            id,
            Cursor {
                offset: ring_offset,
                wants_icy,
            },
        );

        Ok(RelayEntry {
            cursor: id,
            ring_offset,
            header_copy,
        })
    }

    fn ogg_burst_anchor(&self, burst_request: usize) -> RingResult<(usize, Option<Vec<u8>>)> {
        if self.page_list.is_empty() {
            return Err(RingError::NoOggPagesForRelay);
        }
        let window_start = self.count.saturating_sub(burst_request);

        let in_window = self
            .page_list
            .iter()
            .rev()
            .find(|m| m.flags.bos && !m.flags.secondary_header && m.page_start >= window_start);

        let chosen = in_window.or_else(|| {
            self.page_list
                .iter()
                .rev()
                .find(|m| m.flags.bos && !m.flags.secondary_header)
        });

        match chosen {
            Some(marker) => {
                // `header_copy`, when present, already covers the BOS page
                // through the last secondary-header page as fully framed
                // bytes. The cursor must resume right after that region,
                // at the first data page, or the client would see it
                // twice: once correctly framed in `header_copy`, once
                // again from plain ring extraction.
                let header_copy = marker.optional_header_copy.clone();
                let ring_offset = match &header_copy {
                    Some(bytes) => marker.page_start + bytes.len(),
                    None => marker.page_start,
                };
                Ok((ring_offset, header_copy))
            }
            None => Err(RingError::NoOggPagesForRelay),
        }
    }

    pub fn unregister_cursor(&mut self, id: CursorId) {
        self.cursors.remove(&id);
    }

    pub fn cursor_offset(&self, id: CursorId) -> Option<usize> {
        self.cursors.get(&id).map(|c| c.offset)
    }

    /// Build the next chunk of wire bytes for a relay client, advancing its
    /// cursor. Returns `Ok(None)` if nothing is available yet (the caller
    /// should try again on the next pass rather than treat it as an error).
    pub fn extract_relay(&mut self, id: CursorId, buffer_capacity: usize) -> RingResult<Option<Vec<u8>>> {
        let (offset, wants_icy) = match self.cursors.get(&id) {
            Some(c) => (c.offset, c.wants_icy),
            None => return Ok(None),
        };

        match self.content_type {
            ContentType::Ogg => {
                let available = self.count.saturating_sub(offset);
                if available == 0 {
                    return Ok(None);
                }
                let take = available.min(buffer_capacity);
                let data = self.peek_region(offset, take)?;
                if let Some(c) = self.cursors.get_mut(&id) {
                    c.offset += take;
                }
                Ok(Some(data))
            }
            ContentType::Mp3 if wants_icy => {
                if offset + self.chunk_size > self.count {
                    return Ok(None);
                }
                let mut out = self.peek_region(offset, self.chunk_size)?;
                let meta_frame = self.metadata_frame_for_chunk(offset, self.chunk_size);
                out.extend(meta_frame);
                if let Some(c) = self.cursors.get_mut(&id) {
                    c.offset += self.chunk_size;
                }
                Ok(Some(out))
            }
            ContentType::Mp3 | ContentType::Aac | ContentType::Nsv | ContentType::Ultravox => {
                if offset + self.chunk_size > self.count {
                    return Ok(None);
                }
                let data = self.peek_region(offset, self.chunk_size)?;
                if let Some(c) = self.cursors.get_mut(&id) {
                    c.offset += self.chunk_size;
                }
                Ok(Some(data))
            }
        }
    }

    fn metadata_frame_for_chunk(&self, chunk_start: usize, chunk_len: usize) -> Vec<u8> {
        let hit = self
            .metadata_list
            .iter()
            .find(|(pos, _)| *pos >= chunk_start && *pos < chunk_start + chunk_len);
        match hit {
            Some((_, info)) => info.composed_metadata(),
            None => vec![0u8],
        }
    }
}

pub struct ExtractResult {
    pub data: Vec<u8>,
    pub prev_next_song: usize,
    pub evicted_track_infos: Vec<TrackInfo>,
}

pub struct FastForwardResult {
    pub prev_next_song: usize,
    pub evicted_track_infos: Vec<TrackInfo>,
}
