//! Incremental OGG page parsing over ring-resident bytes.
//!
//! Page layout follows the OGG bitstream spec, the same layout
//! `examples/0xAA55-rs-tinyogg` decodes whole-buffer; this module instead
//! scans a byte stream incrementally, since the ring only ever hands the
//! framer whatever bytes just landed from the network, which rarely line
//! up with page boundaries.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};

use crate::metadata::{self, TrackInfo};

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
const PAGE_HEADER_LEN: usize = 27;

/// Flags on a page marker. More than one bit can legitimately be set (a
/// page can be the lone page of a one-page logical stream, BOS and EOS
/// together).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageFlags {
    pub bos: bool,
    pub eos: bool,
    /// Set for a non-BOS header page (Vorbis comment / setup) that must
    /// never be chosen as a relay burst anchor.
    pub secondary_header: bool,
}

/// One parsed OGG page's position within the ring, plus enough of its
/// header to drive relay burst selection and ring bookkeeping.
#[derive(Debug, Clone)]
pub struct PageMarker {
    /// Ring-relative byte offset of this page's first byte.
    pub page_start: usize,
    /// Total length in bytes (header + segment table + body).
    pub page_len: usize,
    pub serial: u32,
    pub sequence: u32,
    pub granule_position: u64,
    pub flags: PageFlags,
    /// Fully framed BOS + secondary-header pages for this logical stream
    /// (capture pattern, segment table and all, a valid OGG prefix on its
    /// own), attached to the BOS marker once header capture completes.
    /// `None` until then, and for every page that isn't a BOS.
    pub optional_header_copy: Option<Vec<u8>>,
}

impl PageMarker {
    /// Shift this marker's position down after `n` bytes are evicted from
    /// the ring's base. Saturates at 0 rather than underflowing; callers
    /// are expected to have already dropped markers with `page_start < n`.
    pub fn shift(&mut self, n: usize) {
        self.page_start = self.page_start.saturating_sub(n);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NeedBos,
    InHeaders,
    InData,
    EosSeen,
}

struct StreamState {
    phase: Phase,
    /// Fully framed page bytes (capture pattern through body) for every
    /// header page seen so far. This is what a late-joining relay client
    /// actually needs to replay: a real, decodable OGG prefix, not bare
    /// packet payloads.
    header_accum: Vec<u8>,
    /// Packet payloads only (header/segment table stripped), concatenated
    /// for the `\x03vorbis` comment-packet scan at EOS. Kept separate from
    /// `header_accum` because the two buffers serve different consumers.
    payload_accum: Vec<u8>,
    /// Index into the page list of this stream's BOS marker, so the
    /// completed header copy can be attached to it once header capture
    /// finishes.
    bos_marker_index: Option<usize>,
}

impl Default for StreamState {
    fn default() -> Self {
        StreamState {
            phase: Phase::NeedBos,
            header_accum: Vec::new(),
            payload_accum: Vec::new(),
            bos_marker_index: None,
        }
    }
}

/// Output of a single [`OggFramer::scan`] call.
#[derive(Debug, Default)]
pub struct ScanOutput {
    pub pages: Vec<PageMarker>,
    /// `(ring-relative position, TrackInfo)` pairs to enqueue on the
    /// ring's metadata list, emitted when a logical stream's EOS page
    /// completes its Vorbis comment extraction.
    pub metadata: Vec<(usize, TrackInfo)>,
    /// `(global page index, captured header bytes)` patches for BOS
    /// markers whose header capture completed on *this* call. The global
    /// page index counts every page ever emitted by this framer,
    /// regardless of ring eviction, so the owner (the ring) has to
    /// translate it to a live position in its own page list (subtracting
    /// however many pages it has evicted so far) before applying it, and
    /// may simply drop the patch if that marker is already gone.
    pub header_attachments: Vec<(usize, Vec<u8>)>,
}

/// Incremental framer: owns whatever trailing partial-page bytes didn't
/// form a complete page on the last call, plus per-serial header-capture
/// state.
pub struct OggFramer {
    pending: Vec<u8>,
    pending_start: usize,
    streams: HashMap<u32, StreamState>,
    next_global_index: usize,
}

impl Default for OggFramer {
    fn default() -> Self {
        OggFramer {
            pending: Vec::new(),
            pending_start: 0,
            streams: HashMap::new(),
            next_global_index: 0,
        }
    }
}

impl OggFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan newly-written bytes. `start_pos` is the ring-relative position
    /// of `data[0]` (i.e. the ring's `count` before this insert).
    pub fn scan(&mut self, data: &[u8], start_pos: usize) -> ScanOutput {
        let mut out = ScanOutput::default();

        // Bytes we're scanning this round = carried-over partial page +
        // the newly written bytes. `base` is the ring-relative position
        // of buf[0].
        let mut buf = std::mem::take(&mut self.pending);
        let base = self.pending_start;
        debug_assert_eq!(base + buf.len(), start_pos, "framer lost track of position");
        buf.extend_from_slice(data);

        let mut offset = 0usize;
        loop {
            match find_capture_pattern(&buf, offset) {
                None => {
                    // No capture pattern anywhere in the remainder: keep
                    // it all as pending (it might be the start of a page
                    // whose rest hasn't arrived yet).
                    break;
                }
                Some(found) => {
                    if found != offset {
                        log::debug!(
                            "oggframer: skipped {} bytes of non-page data resyncing on OggS",
                            found - offset
                        );
                    }
                    match parse_page(&buf[found..]) {
                        ParseResult::Page(header, total_len) => {
                            let page_start = base + found;
                            self.handle_page(&header, &buf[found..found + total_len], page_start, &mut out);
                            offset = found + total_len;
                        }
                        ParseResult::Incomplete => {
                            offset = found;
                            break;
                        }
                        ParseResult::Malformed => {
                            // Capture pattern matched but header didn't
                            // parse; resync past it and keep scanning.
                            offset = found + 1;
                        }
                    }
                }
            }
        }

        self.pending_start = base + offset;
        self.pending = buf[offset..].to_vec();
        out
    }

    fn handle_page(
        &mut self,
        header: &PageHeader,
        page_bytes: &[u8],
        page_start: usize,
        out: &mut ScanOutput,
    ) {
        let global_index = self.next_global_index;
        self.next_global_index += 1;

        let state = self.streams.entry(header.serial).or_default();
        let body = &page_bytes[PAGE_HEADER_LEN + header.segment_table.len()..];

        let mut flags = PageFlags {
            bos: header.bos,
            eos: header.eos,
            secondary_header: false,
        };

        if header.bos {
            state.phase = Phase::InHeaders;
            state.header_accum.clear();
            state.header_accum.extend_from_slice(page_bytes);
            state.payload_accum.clear();
            state.payload_accum.extend_from_slice(body);
        } else if state.phase == Phase::InHeaders && looks_like_vorbis_header(body) {
            flags.secondary_header = true;
            state.header_accum.extend_from_slice(page_bytes);
            state.payload_accum.extend_from_slice(body);
        } else if state.phase == Phase::InHeaders {
            // First non-header page: headers are complete, attach the
            // captured copy to the BOS marker we stashed the index of.
            state.phase = Phase::InData;
            if let Some(bos_index) = state.bos_marker_index.take() {
                out.header_attachments.push((bos_index, state.header_accum.clone()));
            }
        }

        if header.eos {
            state.phase = Phase::EosSeen;
            if let Some(comments) =
                find_comment_packet(&state.payload_accum).and_then(metadata::parse_vorbis_comment_packet)
            {
                let info = metadata::track_info_from_vorbis_comments(&comments);
                out.metadata.push((page_start, info));
            }
        }

        let marker = PageMarker {
            page_start,
            page_len: page_bytes.len(),
            serial: header.serial,
            sequence: header.sequence,
            granule_position: header.granule_position,
            flags,
            optional_header_copy: None,
        };

        if header.bos {
            state.bos_marker_index = Some(global_index);
        }
        out.pages.push(marker);
    }
}

fn find_capture_pattern(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(4)
        .position(|w| w == CAPTURE_PATTERN)
        .map(|p| p + from)
}

struct PageHeader {
    serial: u32,
    sequence: u32,
    granule_position: u64,
    /// Kept for completeness of the parsed header even though this
    /// framer's burst/eviction logic doesn't currently branch on it.
    #[allow(dead_code)]
    continuation: bool,
    bos: bool,
    eos: bool,
    segment_table: Vec<u8>,
}

enum ParseResult {
    Page(PageHeader, usize),
    Incomplete,
    Malformed,
}

fn parse_page(buf: &[u8]) -> ParseResult {
    if buf.len() < PAGE_HEADER_LEN {
        return ParseResult::Incomplete;
    }
    if &buf[0..4] != CAPTURE_PATTERN {
        return ParseResult::Malformed;
    }
    let version = buf[4];
    if version != 0 {
        return ParseResult::Malformed;
    }
    let flags_byte = buf[5];
    if flags_byte & !0x07 != 0 {
        return ParseResult::Malformed;
    }

    let granule_position = LittleEndian::read_u64(&buf[6..14]);
    let serial = LittleEndian::read_u32(&buf[14..18]);
    let sequence = LittleEndian::read_u32(&buf[18..22]);
    // CRC at [22..26]; not verified here (framer resync on "OggS" already
    // covers corruption recovery well enough for relay/write purposes).
    let segment_count = buf[26] as usize;

    let table_end = PAGE_HEADER_LEN + segment_count;
    if buf.len() < table_end {
        return ParseResult::Incomplete;
    }
    let segment_table = buf[PAGE_HEADER_LEN..table_end].to_vec();
    let body_len: usize = segment_table.iter().map(|&s| s as usize).sum();
    let total_len = table_end + body_len;
    if buf.len() < total_len {
        return ParseResult::Incomplete;
    }

    ParseResult::Page(
        PageHeader {
            serial,
            sequence,
            granule_position,
            continuation: flags_byte & 0x01 != 0,
            bos: flags_byte & 0x02 != 0,
            eos: flags_byte & 0x04 != 0,
            segment_table,
        },
        total_len,
    )
}

fn looks_like_vorbis_header(body: &[u8]) -> bool {
    body.len() >= 7 && (body[0] == 0x01 || body[0] == 0x03 || body[0] == 0x05) && &body[1..7] == b"vorbis"
}

/// The header_accum buffer concatenates the identification, comment and
/// setup packets back to back without packet-length delimiters (pages
/// rarely split mid-packet in practice for header pages); find the comment
/// packet by scanning for its `\x03vorbis` tag.
fn find_comment_packet(header_accum: &[u8]) -> Option<&[u8]> {
    let tag = b"\x03vorbis";
    let pos = header_accum
        .windows(tag.len())
        .position(|w| w == tag)?;
    Some(&header_accum[pos..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_page(serial: u32, sequence: u32, bos: bool, eos: bool, granule: u64, body: &[u8]) -> Vec<u8> {
        let mut segments = Vec::new();
        let mut remaining = body.len();
        if remaining == 0 {
            segments.push(0);
        }
        while remaining > 0 {
            if remaining >= 255 {
                segments.push(255);
                remaining -= 255;
            } else {
                segments.push(remaining as u8);
                remaining = 0;
            }
        }

        let mut flags = 0u8;
        if bos {
            flags |= 0x02;
        }
        if eos {
            flags |= 0x04;
        }

        let mut page = Vec::new();
        page.extend(CAPTURE_PATTERN);
        page.push(0); // version
        page.push(flags);
        page.extend(granule.to_le_bytes());
        page.extend(serial.to_le_bytes());
        page.extend(sequence.to_le_bytes());
        page.extend(0u32.to_le_bytes()); // crc, unchecked
        page.push(segments.len() as u8);
        page.extend(&segments);
        page.extend(body);
        page
    }

    #[test]
    fn scans_a_single_complete_page() {
        let page = build_page(1, 0, true, false, 0, b"hello");
        let mut framer = OggFramer::new();
        let out = framer.scan(&page, 0);
        assert_eq!(out.pages.len(), 1);
        assert_eq!(out.pages[0].page_start, 0);
        assert_eq!(out.pages[0].page_len, page.len());
        assert!(out.pages[0].flags.bos);
    }

    #[test]
    fn carries_over_a_partial_page_across_calls() {
        let page = build_page(1, 0, true, false, 0, b"hello world");
        let (first, second) = page.split_at(page.len() - 3);
        let mut framer = OggFramer::new();

        let out1 = framer.scan(first, 0);
        assert!(out1.pages.is_empty());

        let out2 = framer.scan(second, first.len());
        assert_eq!(out2.pages.len(), 1);
        assert_eq!(out2.pages[0].page_start, 0);
    }

    #[test]
    fn resyncs_past_garbage_bytes() {
        let mut buf = vec![0xFFu8; 10];
        buf.extend(build_page(1, 0, true, false, 0, b"x"));
        let mut framer = OggFramer::new();
        let out = framer.scan(&buf, 0);
        assert_eq!(out.pages.len(), 1);
        assert_eq!(out.pages[0].page_start, 10);
    }

    #[test]
    fn eos_with_comment_packet_emits_track_info() {
        let mut comment_packet = vec![0x03];
        comment_packet.extend(b"vorbis");
        comment_packet.extend(0u32.to_le_bytes());
        let entry = b"ARTIST=A - TITLE=T1".to_vec(); // single malformed-ish entry is fine, separate test covers real parse
        let _ = entry;
        comment_packet.extend(1u32.to_le_bytes());
        let kv = b"TITLE=Boundary Track";
        comment_packet.extend((kv.len() as u32).to_le_bytes());
        comment_packet.extend(kv);

        let mut framer = OggFramer::new();
        let bos = build_page(42, 0, true, false, 0, b"\x01vorbisIDHEADER");
        let comment_page = build_page(42, 1, false, false, 0, &comment_packet);
        let eos = build_page(42, 2, false, true, 100, b"tail");

        let mut all = Vec::new();
        all.extend(&bos);
        all.extend(&comment_page);
        all.extend(&eos);

        let out = framer.scan(&all, 0);
        assert_eq!(out.pages.len(), 3);
        assert!(out.pages[1].flags.secondary_header);
        assert_eq!(out.metadata.len(), 1);
        assert_eq!(out.metadata[0].1.title, "Boundary Track");
        assert_eq!(out.header_attachments.len(), 1);
        assert_eq!(out.header_attachments[0].0, 0); // global index of the BOS page

        let mut expected_header_copy = Vec::new();
        expected_header_copy.extend(&bos);
        expected_header_copy.extend(&comment_page);
        assert_eq!(
            out.header_attachments[0].1, expected_header_copy,
            "header copy must be fully framed pages, not bare packet payloads"
        );
        assert!(out.header_attachments[0].1.starts_with(CAPTURE_PATTERN));
    }
}
