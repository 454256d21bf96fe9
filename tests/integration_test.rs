//! Cross-module scenarios that exercise the ring, ingest driver, and track
//! writer together rather than one module in isolation.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ripcore::ingest::{IngestDriver, IngestOptions, ReadOutcome, StreamSource};
use ripcore::metadata::{self, TrackInfo};
use ripcore::ring::{ContentType, Ring};
use ripcore::trackwriter::{TrackWriter, TrackWriterOptions};
use ripcore::OverwritePolicy;

/// Serves a fixed byte stream then reports the upstream as closed, the way
/// a source would at the end of a finite test fixture.
struct FixtureSource {
    bytes: VecDeque<u8>,
    meta_interval: Option<usize>,
    content_type: ContentType,
}

impl StreamSource for FixtureSource {
    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<ReadOutcome> {
        if self.bytes.is_empty() {
            return Ok(ReadOutcome::SocketClosed);
        }
        let n = buf.len().min(self.bytes.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.bytes.pop_front().unwrap();
        }
        Ok(ReadOutcome::Bytes(n))
    }

    fn meta_interval(&self) -> Option<usize> {
        self.meta_interval
    }

    fn content_type(&self) -> ContentType {
        self.content_type
    }
}

#[test]
fn mp3_ingest_of_two_tracks_writes_two_complete_files() {
    let _ = env_logger::try_init();

    let chunk_size = 16384usize;
    let ring = Arc::new(Mutex::new(Ring::init(ContentType::Mp3, false, chunk_size, 8).unwrap()));

    let track1 = TrackInfo::new("A", "T1");
    let track2 = TrackInfo::new("A", "T2");
    let track3 = TrackInfo::new("A", "T3");
    let meta1 = metadata::compose_icy_metadata(track1.stream_title_text().as_bytes());
    let meta2 = metadata::compose_icy_metadata(track2.stream_title_text().as_bytes());
    let meta3 = metadata::compose_icy_metadata(track3.stream_title_text().as_bytes());

    // First cycle announces T1 (so the driver can open it before the data
    // that belongs to it arrives); the data that follows is T1's audio,
    // closed out by T2's announcement; the data after that is T2's audio,
    // closed out in turn by T3's announcement. Without that last
    // announcement T2 would still be sitting open when the stream closes,
    // so it would never be moved out of the incomplete directory.
    let mut bytes = VecDeque::new();
    bytes.extend(vec![0u8; chunk_size]); // dead-air lead-in, no track open yet
    bytes.extend(meta1);
    bytes.extend(vec![0xAAu8; chunk_size]); // T1's audio
    bytes.extend(meta2);
    bytes.extend(vec![0xBBu8; chunk_size]); // T2's audio
    bytes.extend(meta3);

    let source = FixtureSource {
        bytes,
        meta_interval: Some(chunk_size),
        content_type: ContentType::Mp3,
    };

    let output_dir = tempfile::tempdir().unwrap();
    let writer_opts = TrackWriterOptions {
        output_directory: output_dir.path().to_path_buf(),
        ..TrackWriterOptions::default()
    };
    let writer = TrackWriter::init(ContentType::Mp3, writer_opts, chunk_size as u64).unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let mut driver = IngestDriver::new(source, ring.clone(), Some(writer), running.clone(), IngestOptions::default());

    // `run()` drives metadata/data cycles until the fixture reports the
    // socket closed, at which point T3's announcement has already closed
    // out T2 and both finished files are sitting in `output_dir`.
    let _ = driver.run();

    let complete: Vec<_> = std::fs::read_dir(output_dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();

    assert!(complete.iter().any(|name| name.contains("T1")), "expected a T1 file, got {complete:?}");
    assert!(complete.iter().any(|name| name.contains("T2")), "expected a T2 file, got {complete:?}");
}

#[test]
fn overwrite_larger_keeps_the_bigger_existing_file() {
    let output_dir = tempfile::tempdir().unwrap();
    let existing = output_dir.path().join("X-Y.mp3");
    std::fs::write(&existing, vec![0u8; 50]).unwrap();

    let opts = TrackWriterOptions {
        output_directory: output_dir.path().to_path_buf(),
        pattern: "%a-%T".to_string(),
        ..TrackWriterOptions::default()
    };
    let mut writer = TrackWriter::init(ContentType::Mp3, opts, 1).unwrap();
    writer.start(TrackInfo::new("X", "Y")).unwrap();
    writer.write(&[0u8; 5]).unwrap();
    let final_path = writer.end(OverwritePolicy::Larger, false).unwrap();

    assert_eq!(final_path, existing);
    assert_eq!(std::fs::metadata(&existing).unwrap().len(), 50);
}

#[test]
fn ring_buffer_full_insert_leaves_state_untouched() {
    let mut ring = Ring::init(ContentType::Mp3, false, 100, 10).unwrap();
    ring.insert_chunk(&vec![0u8; 500], None).unwrap();
    assert_eq!(ring.free_bytes(), 500);

    let before_count = ring.count();
    let err = ring.insert_chunk(&vec![0u8; 600], None).unwrap_err();
    assert!(matches!(err, ripcore::RingError::BufferFull { .. }));
    assert_eq!(ring.count(), before_count);
}

#[test]
fn utf8_to_ascii_uses_replacement_character_on_non_ascii_input() {
    let (output, kind) = ripcore::charset::convert_named("UTF-8", "US-ASCII", "caf\u{e9}".as_bytes()).unwrap();
    assert_eq!(output, b"caf?");
    assert_eq!(kind, ripcore::charset::ConvertKind::Lossy);
}

/// Build one raw OGG page (capture pattern through body), the same layout
/// `src/oggframer.rs`'s own tests build, so this module doesn't need to
/// expose its private test helper.
fn build_ogg_page(serial: u32, sequence: u32, bos: bool, eos: bool, granule: u64, body: &[u8]) -> Vec<u8> {
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
    page.extend(b"OggS");
    page.push(0); // version
    page.push(flags);
    page.extend(granule.to_le_bytes());
    page.extend(serial.to_le_bytes());
    page.extend(sequence.to_le_bytes());
    page.extend(0u32.to_le_bytes()); // crc, unchecked by the framer
    page.push(segments.len() as u8);
    page.extend(&segments);
    page.extend(body);
    page
}

fn vorbis_comment_packet(artist: &str, title: &str) -> Vec<u8> {
    let mut packet = vec![0x03];
    packet.extend(b"vorbis");
    packet.extend(0u32.to_le_bytes()); // empty vendor string
    let comments = [("ARTIST", artist), ("TITLE", title)];
    packet.extend((comments.len() as u32).to_le_bytes());
    for (k, v) in comments {
        let entry = format!("{k}={v}");
        packet.extend((entry.len() as u32).to_le_bytes());
        packet.extend(entry.as_bytes());
    }
    packet
}

/// Spec scenario: BOS + header pages + many data pages + EOS, then a client
/// joins late. It must receive a valid, non-duplicated OGG byte sequence:
/// the captured header region followed immediately by whatever of the
/// stream is still in the ring, with no gap and no repeated bytes.
#[test]
fn ogg_late_relay_client_gets_headers_then_a_clean_continuation() {
    let serial = 7u32;
    let bos = build_ogg_page(serial, 0, true, false, 0, b"\x01vorbisIDHEADER");
    let comment_page = build_ogg_page(serial, 1, false, false, 0, &vorbis_comment_packet("Artist", "Title"));
    let setup_page = build_ogg_page(serial, 2, false, false, 0, b"\x05vorbisSETUPDATA");

    let mut data_pages = Vec::new();
    for i in 0..50u32 {
        let body = vec![i as u8; 40];
        data_pages.push(build_ogg_page(serial, 3 + i, false, false, (i as u64 + 1) * 64, &body));
    }
    let eos = build_ogg_page(serial, 53, false, true, 3300, b"tail");

    let mut all = Vec::new();
    all.extend(&bos);
    all.extend(&comment_page);
    all.extend(&setup_page);
    for page in &data_pages {
        all.extend(page);
    }
    all.extend(&eos);

    let mut ring = Ring::init(ContentType::Ogg, true, 4096, 16).unwrap();
    ring.insert_chunk(&all, None).unwrap();

    // burst_request 0 puts the acceptable window entirely behind the
    // current write position, so the anchor search falls back to the only
    // BOS page this ring has ever seen, exactly like a client joining long
    // after stream start.
    let entry = ring.init_relay_entry(0, false).unwrap();
    let header_copy = entry.header_copy.clone().expect("BOS+header pages must have been captured");

    assert!(header_copy.starts_with(b"OggS"), "captured header bytes must be a real framed OGG page");
    let mut expected_header = Vec::new();
    expected_header.extend(&bos);
    expected_header.extend(&comment_page);
    expected_header.extend(&setup_page);
    assert_eq!(header_copy, expected_header, "header replay must match the original framed pages exactly");

    let mut continuation = Vec::new();
    loop {
        match ring.extract_relay(entry.cursor, 4096).unwrap() {
            Some(chunk) if !chunk.is_empty() => continuation.extend(chunk),
            _ => break,
        }
    }

    let mut received = header_copy;
    received.extend(continuation);

    assert_eq!(received, all, "header replay plus continuation must equal the original stream with no gap or duplication");
}
