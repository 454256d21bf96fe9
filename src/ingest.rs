//! Pumps bytes from the upstream socket into the [`Ring`], honoring
//! `meta_interval` to split audio data from ICY metadata, and runs the
//! writer pass that drains completed chunks (and finished tracks) into the
//! [`TrackWriter`] on the same thread.
//!
//! The upstream connect/redirect/playlist-parse logic that produces a
//! [`StreamSource`] is an external collaborator per spec §1/§4.6; this
//! module only consumes the trait.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{IngestError, IngestResult};
use crate::metadata::{self, TrackInfo};
use crate::ring::{ContentType, Ring};
use crate::trackwriter::{OverwritePolicy, TrackWriter};

/// What a single [`StreamSource::read`] call can report back, mirroring
/// the spec's `bytes_read | TIMEOUT | SOCKET_CLOSED | ABORTED` union.
#[derive(Debug)]
pub enum ReadOutcome {
    Bytes(usize),
    Timeout,
    SocketClosed,
    Aborted,
}

/// The external collaborator boundary: an upstream byte stream plus the two
/// bits of context the ingest driver needs (`meta_interval`, content type).
/// Connect/redirect/playlist parsing to obtain one of these is explicitly
/// out of this crate's scope.
pub trait StreamSource {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<ReadOutcome>;
    /// Bytes of audio data between ICY metadata frames, or `None` if the
    /// upstream carries no in-band metadata at all.
    fn meta_interval(&self) -> Option<usize>;
    fn content_type(&self) -> ContentType;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IngestOptions {
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
    pub overwrite_policy: OverwritePolicy,
    pub truncate_dup: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        IngestOptions {
            read_timeout: Duration::from_secs(10),
            overwrite_policy: OverwritePolicy::default(),
            truncate_dup: false,
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

impl serde::Serialize for OverwritePolicy {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let name = match self {
            OverwritePolicy::Always => "always",
            OverwritePolicy::Never => "never",
            OverwritePolicy::Larger => "larger",
            OverwritePolicy::Version => "version",
        };
        s.serialize_str(name)
    }
}

impl<'de> serde::Deserialize<'de> for OverwritePolicy {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let name = String::deserialize(d)?;
        Ok(match name.as_str() {
            "always" => OverwritePolicy::Always,
            "larger" => OverwritePolicy::Larger,
            "version" => OverwritePolicy::Version,
            _ => OverwritePolicy::Never,
        })
    }
}

pub struct IngestDriver<S: StreamSource> {
    source: S,
    ring: Arc<Mutex<Ring>>,
    writer: Option<TrackWriter>,
    running: Arc<AtomicBool>,
    options: IngestOptions,

    /// Title text of the last metadata frame that actually changed
    /// something, so a repeated (unchanged) `StreamTitle` doesn't start a
    /// new track every `meta_interval` bytes.
    last_title: Option<String>,
}

impl<S: StreamSource> IngestDriver<S> {
    pub fn new(
        source: S,
        ring: Arc<Mutex<Ring>>,
        writer: Option<TrackWriter>,
        running: Arc<AtomicBool>,
        options: IngestOptions,
    ) -> Self {
        IngestDriver {
            source,
            ring,
            writer,
            running,
            options,
            last_title: None,
        }
    }

    /// Run until the upstream socket dies or an abort is observed. Per
    /// spec §7, a single bad metadata frame never ends the session; only
    /// upstream socket death, OOM, or explicit shutdown do.
    pub fn run(&mut self) -> IngestResult<()> {
        while self.running.load(Ordering::SeqCst) {
            match self.source.meta_interval() {
                Some(interval) => self.ingest_metadata_cycle(interval)?,
                None => self.ingest_plain_chunk()?,
            }
            self.writer_pass()?;
        }
        Ok(())
    }

    /// Reads `interval` data bytes belonging to whatever track is currently
    /// playing, then the trailing length-byte + metadata frame that
    /// announces the track the *next* interval belongs to.
    ///
    /// A changed `StreamTitle` marks the ring's current tail (right after
    /// this cycle's data) as the song boundary: `writer_pass` closes the
    /// old track out with everything buffered up to that point and opens
    /// the new one, however short of a full chunk that leaves either file.
    fn ingest_metadata_cycle(&mut self, interval: usize) -> IngestResult<()> {
        let data = self.read_exact(interval)?;
        self.ring.lock().unwrap().insert_chunk(&data, None)?;

        let mut len_byte = [0u8; 1];
        self.read_into(&mut len_byte)?;
        let length_units = len_byte[0];
        if length_units == 0 {
            return Ok(());
        }

        let meta_bytes = self.read_exact(16 * length_units as usize)?;
        match metadata::parse_icy_metadata(&meta_bytes) {
            Some(info) => {
                let title = info.stream_title_text();
                if self.last_title.as_deref() != Some(title.as_str()) {
                    log::info!("ingest: new track announced: {title}");
                    self.last_title = Some(title);

                    let mut ring = self.ring.lock().unwrap();
                    let boundary = ring.count();
                    if boundary == 0 {
                        // Nothing buffered ahead of this point; nothing for
                        // `writer_pass` to flush first, so the transition
                        // happens immediately instead of through next_song
                        // (which uses 0 to mean "no boundary queued").
                        drop(ring);
                        self.transition_track(info);
                    } else {
                        ring.insert_chunk(&[], Some(info))?;
                        ring.set_next_song(boundary);
                    }
                } else {
                    log::trace!("ingest: repeated StreamTitle, no track change");
                }
            }
            None => {
                log::debug!("ingest: metadata frame present but no parseable StreamTitle tag");
            }
        }
        Ok(())
    }

    fn transition_track(&mut self, info: TrackInfo) {
        if let Some(writer) = self.writer.as_mut() {
            if writer.is_open() {
                if let Err(err) = writer.end(self.options.overwrite_policy, self.options.truncate_dup) {
                    log::warn!("ingest: track writer end failed: {err}");
                }
            }
            if let Err(err) = writer.start(info) {
                log::warn!("ingest: track writer start failed: {err}");
            }
        }
    }

    fn ingest_plain_chunk(&mut self) -> IngestResult<()> {
        let chunk_size = self.ring.lock().unwrap().chunk_size();
        let mut buf = vec![0u8; chunk_size];
        let n = self.read_some(&mut buf)?;
        buf.truncate(n);

        let mut ring = self.ring.lock().unwrap();
        ring.insert_chunk(&buf, None)?;
        Ok(())
    }

    /// Read exactly `len` bytes, looping over short reads/timeouts.
    fn read_exact(&mut self, len: usize) -> IngestResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read_into(&mut out)?;
        Ok(out)
    }

    fn read_into(&mut self, buf: &mut [u8]) -> IngestResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            if !self.running.load(Ordering::SeqCst) {
                return Err(IngestError::Aborted);
            }
            match self.source.read(&mut buf[filled..], self.options.read_timeout)? {
                ReadOutcome::Bytes(0) => return Err(IngestError::SocketClosed),
                ReadOutcome::Bytes(n) => filled += n,
                ReadOutcome::Timeout => continue,
                ReadOutcome::SocketClosed => return Err(IngestError::SocketClosed),
                ReadOutcome::Aborted => return Err(IngestError::Aborted),
            }
        }
        Ok(())
    }

    /// Read at least one byte, for the no-metadata content-dictated path
    /// where we don't need to fill the whole buffer before moving on.
    fn read_some(&mut self, buf: &mut [u8]) -> IngestResult<usize> {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(IngestError::Aborted);
            }
            match self.source.read(buf, self.options.read_timeout)? {
                ReadOutcome::Bytes(0) => return Err(IngestError::SocketClosed),
                ReadOutcome::Bytes(n) => return Ok(n),
                ReadOutcome::Timeout => continue,
                ReadOutcome::SocketClosed => return Err(IngestError::SocketClosed),
                ReadOutcome::Aborted => return Err(IngestError::Aborted),
            }
        }
    }

    /// Drains completed chunks into the writer, and on a song boundary
    /// closes the finished track and opens the next one, pulling its
    /// `TrackInfo` back out of the ring's metadata list.
    fn writer_pass(&mut self) -> IngestResult<()> {
        loop {
            let (count, next_song, chunk_size) = {
                let ring = self.ring.lock().unwrap();
                (ring.count(), ring.next_song(), ring.chunk_size())
            };

            // A boundary the ring has fully buffered up to takes priority
            // over a plain chunk drain: the old track closes out with
            // whatever's left before it, however short of a full chunk.
            if next_song > 0 && count >= next_song {
                let extract = {
                    let mut ring = self.ring.lock().unwrap();
                    ring.extract(next_song)?
                };
                if let Some(writer) = self.writer.as_mut() {
                    if writer.is_open() {
                        if let Err(err) = writer.write(&extract.data) {
                            log::warn!("ingest: track writer write failed: {err}");
                        }
                    }
                }

                let next_info = {
                    let mut ring = self.ring.lock().unwrap();
                    ring.take_track_info_at_front()
                };
                if let Some(info) = next_info {
                    self.transition_track(info);
                }
                continue;
            }

            if count >= chunk_size {
                let extract = {
                    let mut ring = self.ring.lock().unwrap();
                    ring.extract(chunk_size)?
                };
                if let Some(writer) = self.writer.as_mut() {
                    if let Err(err) = writer.write(&extract.data) {
                        log::warn!("ingest: track writer write failed: {err}");
                    }
                }
                continue;
            }

            break;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trackwriter::TrackWriterOptions;
    use std::collections::VecDeque;

    /// A fixed byte stream consumed sequentially, never losing bytes to a
    /// caller's smaller-than-chunk read like popping whole `Vec`s would.
    struct ScriptedSource {
        bytes: VecDeque<u8>,
        meta_interval: Option<usize>,
        content_type: ContentType,
    }

    impl StreamSource for ScriptedSource {
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

    fn driver_with(chunks: Vec<Vec<u8>>, ring: Arc<Mutex<Ring>>) -> IngestDriver<ScriptedSource> {
        let bytes = chunks.into_iter().flatten().collect();
        let source = ScriptedSource {
            bytes,
            meta_interval: Some(1024),
            content_type: ContentType::Mp3,
        };
        let running = Arc::new(AtomicBool::new(true));
        IngestDriver::new(source, ring, None, running, IngestOptions::default())
    }

    #[test]
    fn metadata_change_sets_a_boundary_at_the_current_tail() {
        let ring = Arc::new(Mutex::new(Ring::init(ContentType::Mp3, false, 1024, 16).unwrap()));
        let track1 = TrackInfo::new("A", "T1");
        let meta1 = metadata::compose_icy_metadata(track1.stream_title_text().as_bytes());

        let chunks = vec![vec![0xAAu8; 1024], meta1, vec![0u8; 1]];
        let mut driver = driver_with(chunks, ring.clone());

        driver.ingest_metadata_cycle(1024).unwrap();
        assert_eq!(ring.lock().unwrap().next_song(), 1024);
    }

    #[test]
    fn repeated_stream_title_does_not_requeue_a_boundary() {
        let ring = Arc::new(Mutex::new(Ring::init(ContentType::Mp3, false, 1024, 16).unwrap()));
        let track1 = TrackInfo::new("A", "T1");
        let meta1 = metadata::compose_icy_metadata(track1.stream_title_text().as_bytes());

        let chunks = vec![
            vec![0xAAu8; 1024],
            meta1.clone(),
            vec![0xBBu8; 1024],
            meta1,
            vec![0u8; 1],
        ];
        let mut driver = driver_with(chunks, ring.clone());

        driver.ingest_metadata_cycle(1024).unwrap();
        assert_eq!(ring.lock().unwrap().next_song(), 1024);

        // Simulate writer_pass consuming up through the boundary: next_song
        // resets to 0. The repeated title in the second cycle must not
        // requeue a new one.
        ring.lock().unwrap().extract(1024).unwrap();
        driver.ingest_metadata_cycle(1024).unwrap();
        assert_eq!(ring.lock().unwrap().next_song(), 0);
    }

    #[test]
    fn metadata_change_on_an_empty_ring_opens_the_track_immediately() {
        let ring = Arc::new(Mutex::new(Ring::init(ContentType::Mp3, false, 1024, 16).unwrap()));
        let track1 = TrackInfo::new("A", "T1");
        let meta1 = metadata::compose_icy_metadata(track1.stream_title_text().as_bytes());

        // No leading data chunk: the metadata cycle's own data read leaves
        // the ring at count 0 once a prior pass has drained it, so the
        // very first announcement on a fresh driver exercises the
        // immediate-transition path rather than queuing next_song.
        let chunks = vec![vec![0u8; 0], meta1];
        let mut driver = driver_with(chunks, ring.clone());

        let output_dir = tempfile::tempdir().unwrap();
        let writer_opts = TrackWriterOptions {
            output_directory: output_dir.path().to_path_buf(),
            ..TrackWriterOptions::default()
        };
        let writer = TrackWriter::init(ContentType::Mp3, writer_opts, 1024).unwrap();
        driver.writer = Some(writer);

        driver.ingest_metadata_cycle(0).unwrap();
        assert_eq!(ring.lock().unwrap().next_song(), 0, "nothing queued, transition already happened");
        assert!(driver.writer.as_ref().unwrap().is_open());
    }

    #[test]
    fn aborted_flag_stops_the_run_loop_promptly() {
        let ring = Arc::new(Mutex::new(Ring::init(ContentType::Mp3, false, 1024, 16).unwrap()));
        let source = ScriptedSource {
            bytes: VecDeque::new(),
            meta_interval: Some(1024),
            content_type: ContentType::Mp3,
        };
        let running = Arc::new(AtomicBool::new(false));
        let mut driver = IngestDriver::new(source, ring, None, running, IngestOptions::default());
        driver.run().unwrap();
    }
}
