//! Transforms `TrackInfo` + a byte extent of the ring into a named file on
//! disk: pattern expansion, illegal-character scrubbing, incomplete/
//! complete staging, overwrite policy, optional show/cue sheet generation.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{TrackWriterError, TrackWriterResult};
use crate::metadata::TrackInfo;
use crate::ring::ContentType;

/// Characters forbidden in a path component on the common target
/// filesystems; replaced with `-` wherever a pattern substitution would
/// otherwise introduce one.
const ILLEGAL_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '~'];

/// What happens when `end()`'s target complete-path already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverwritePolicy {
    /// Overwrite unconditionally.
    Always,
    /// Keep both (suffix the incoming file) unless `truncate_dup`, in which
    /// case the incomplete file is deleted instead of moved.
    #[default]
    Never,
    /// Overwrite only if the incoming file is strictly larger.
    Larger,
    /// Always rename the incoming file to a non-colliding suffix.
    Version,
}

/// Knobs supplied at [`TrackWriter::init`] time; the direct descendant of
/// the teacher's `IceCastWriterOptions` / `Config`, serializable so an
/// external loader can deserialize a whole fleet of these from one file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TrackWriterOptions {
    pub output_directory: PathBuf,
    /// Pattern escapes: `%A` artist, `%T` title, `%a` album, `%S` stream
    /// name, `%d` session date (`YYYY-MM-DD`), `%q` auto-counter, `%N`
    /// track number. `/` in the pattern itself is a directory separator;
    /// `/` *substituted in* from a field is scrubbed like any other illegal
    /// character.
    pub pattern: String,
    pub keep_incomplete: bool,
    pub individual_tracks: bool,
    pub show_file: bool,
    pub separate_dirs: bool,
    pub date_stamp: String,
    pub icy_name: String,
    pub count_start: u32,
}

impl Default for TrackWriterOptions {
    fn default() -> Self {
        TrackWriterOptions {
            output_directory: PathBuf::from("."),
            pattern: "%A - %T".to_string(),
            keep_incomplete: true,
            individual_tracks: true,
            show_file: false,
            separate_dirs: false,
            date_stamp: String::new(),
            icy_name: String::new(),
            count_start: 1,
        }
    }
}

fn scrub(field: &str) -> String {
    let mut out: String = field
        .chars()
        .map(|c| if ILLEGAL_CHARS.contains(&c) { '-' } else { c })
        .collect();
    while out.starts_with('.') {
        out.remove(0);
    }
    while out.ends_with('.') {
        out.pop();
    }
    out
}

fn extension_for(content_type: ContentType) -> TrackWriterResult<&'static str> {
    match content_type {
        ContentType::Mp3 => Ok("mp3"),
        ContentType::Aac => Ok("aac"),
        ContentType::Nsv => Ok("nsv"),
        ContentType::Ogg => Ok("ogg"),
        ContentType::Ultravox => Err(TrackWriterError::UnknownContentType),
    }
}

/// Expand `pattern` against `info`, scrubbing every substituted field (but
/// not the literal `/` separators the pattern itself contains).
fn expand_pattern(pattern: &str, info: &TrackInfo, opts: &TrackWriterOptions, count: u32) -> String {
    let mut fields: HashMap<char, String> = HashMap::new();
    fields.insert('A', scrub(&info.artist));
    fields.insert('T', scrub(&info.title));
    fields.insert('a', scrub(&info.album));
    fields.insert('S', scrub(&opts.icy_name));
    fields.insert('d', opts.date_stamp.clone());
    fields.insert('q', format!("{count:04}"));
    fields.insert('N', scrub(&info.track_number));

    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.next() {
                Some(code) => match fields.get(&code) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('%');
                        out.push(code);
                    }
                },
                None => out.push('%'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Find a name that doesn't collide with anything in `dir`, by trying
/// `base`, then `base_01`, `base_02`, ... (extension preserved).
fn next_free_versioned(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let plain = dir.join(format!("{stem}.{ext}"));
    if !plain.exists() {
        return plain;
    }
    for n in 1..10_000u32 {
        let candidate = dir.join(format!("{stem}_{n:02}.{ext}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    dir.join(format!("{stem}_overflow.{ext}"))
}

pub struct TrackWriter {
    content_type: ContentType,
    ext: &'static str,
    output_dir: PathBuf,
    incomplete_dir: PathBuf,
    stream_dir: Option<PathBuf>,
    opts: TrackWriterOptions,

    track_no: u32,
    count: u32,

    current_incomplete_path: Option<PathBuf>,
    current_file: Option<File>,
    current_track_info: Option<TrackInfo>,

    show_file: Option<File>,
    cue_file: Option<File>,
    show_bytes_written: u64,
    bitrate_bytes_per_sec: u64,
}

impl TrackWriter {
    /// Choose the extension from `content_type`, sanitize `icy_name` into
    /// the stream-directory name, and create the output/incomplete/
    /// (optional) stream directories.
    pub fn init(
        content_type: ContentType,
        opts: TrackWriterOptions,
        bitrate_bytes_per_sec: u64,
    ) -> TrackWriterResult<TrackWriter> {
        let ext = extension_for(content_type)?;

        let stream_dirname = scrub(&opts.icy_name);
        let complete_root = if opts.separate_dirs && !stream_dirname.is_empty() {
            opts.output_directory.join(&stream_dirname)
        } else {
            opts.output_directory.clone()
        };
        let incomplete_dir = complete_root.join("incomplete");

        fs::create_dir_all(&opts.output_directory)?;
        fs::create_dir_all(&complete_root)?;
        fs::create_dir_all(&incomplete_dir)?;
        log::info!(
            "trackwriter: initialized for {:?}, output={:?}, incomplete={:?}",
            content_type,
            complete_root,
            incomplete_dir
        );

        let (show_file, cue_file) = if opts.show_file {
            let show_path = complete_root.join(format!("show.{ext}"));
            let show = OpenOptions::new().create(true).append(true).open(&show_path)?;
            let cue = if content_type != ContentType::Ogg {
                let cue_path = complete_root.join("show.cue");
                Some(OpenOptions::new().create(true).append(true).open(&cue_path)?)
            } else {
                None
            };
            (Some(show), cue)
        } else {
            (None, None)
        };

        Ok(TrackWriter {
            content_type,
            ext,
            output_dir: opts.output_directory.clone(),
            incomplete_dir,
            stream_dir: if opts.separate_dirs { Some(complete_root) } else { None },
            count: opts.count_start,
            track_no: 0,
            opts,
            current_incomplete_path: None,
            current_file: None,
            current_track_info: None,
            show_file,
            cue_file,
            show_bytes_written: 0,
            bitrate_bytes_per_sec: bitrate_bytes_per_sec.max(1),
        })
    }

    fn complete_dir(&self) -> PathBuf {
        self.stream_dir.clone().unwrap_or_else(|| self.output_dir.clone())
    }

    /// Whether a track is currently open (a `start()` without a matching
    /// `end()` yet). Callers should check this before `end()`: calling it
    /// with nothing open is a programmer error, not a recoverable one.
    pub fn is_open(&self) -> bool {
        self.current_incomplete_path.is_some()
    }

    /// Open a fresh incomplete file for `track_info`. If the same
    /// incomplete name already exists: versioned (`_01`, `_02`, ...) when
    /// `keep_incomplete`, else overwritten in place.
    pub fn start(&mut self, track_info: TrackInfo) -> TrackWriterResult<()> {
        self.track_no += 1;
        let stem = expand_pattern(&self.opts.pattern, &track_info, &self.opts, self.count);

        let path = if self.opts.keep_incomplete {
            next_free_versioned(&self.incomplete_dir, &stem, self.ext)
        } else {
            self.incomplete_dir.join(format!("{stem}.{}", self.ext))
        };

        log::debug!("trackwriter: start track -> {path:?}");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        self.current_incomplete_path = Some(path);
        self.current_file = Some(file);
        self.current_track_info = Some(track_info);
        Ok(())
    }

    /// Direct write of extracted ring bytes to both the current incomplete
    /// file and, if enabled, the show file.
    pub fn write(&mut self, bytes: &[u8]) -> TrackWriterResult<()> {
        if let Some(file) = self.current_file.as_mut() {
            file.write_all(bytes)?;
        }
        if let Some(show) = self.show_file.as_mut() {
            show.write_all(bytes)?;
            self.show_bytes_written += bytes.len() as u64;
        }
        Ok(())
    }

    /// Close the incomplete file, move it to the complete directory per
    /// `overwrite_policy`, and (if a show file is active and the format
    /// supports it) append a cue-sheet `TRACK` entry. Returns the final
    /// path the bytes ended up at.
    pub fn end(
        &mut self,
        overwrite_policy: OverwritePolicy,
        truncate_dup: bool,
    ) -> TrackWriterResult<PathBuf> {
        let incomplete_path = self
            .current_incomplete_path
            .take()
            .expect("end() called without a matching start()");
        let info = self.current_track_info.take();
        self.current_file = None; // drop -> flush+close

        let incomplete_size = fs::metadata(&incomplete_path).map(|m| m.len()).unwrap_or(0);
        let stem = match &info {
            Some(info) => expand_pattern(&self.opts.pattern, info, &self.opts, self.count),
            None => "track".to_string(),
        };
        self.count += 1;

        let complete_dir = self.complete_dir();
        let target = complete_dir.join(format!("{stem}.{}", self.ext));

        let final_path = match overwrite_policy {
            OverwritePolicy::Always => {
                fs::rename(&incomplete_path, &target)?;
                target
            }
            OverwritePolicy::Never => {
                if target.exists() {
                    if truncate_dup {
                        log::debug!("trackwriter: {target:?} exists, discarding incomplete (truncate_dup)");
                        fs::remove_file(&incomplete_path)?;
                        target
                    } else {
                        let versioned = next_free_versioned(&complete_dir, &stem, self.ext);
                        fs::rename(&incomplete_path, &versioned)?;
                        versioned
                    }
                } else {
                    fs::rename(&incomplete_path, &target)?;
                    target
                }
            }
            OverwritePolicy::Larger => {
                if target.exists() {
                    let existing_size = fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
                    if incomplete_size > existing_size {
                        fs::rename(&incomplete_path, &target)?;
                        target
                    } else {
                        log::debug!(
                            "trackwriter: existing {target:?} ({existing_size}B) >= incoming ({incomplete_size}B), keeping existing"
                        );
                        fs::remove_file(&incomplete_path)?;
                        target
                    }
                } else {
                    fs::rename(&incomplete_path, &target)?;
                    target
                }
            }
            OverwritePolicy::Version => {
                let versioned = next_free_versioned(&complete_dir, &stem, self.ext);
                fs::rename(&incomplete_path, &versioned)?;
                versioned
            }
        };

        if let (Some(cue), Some(info)) = (self.cue_file.as_mut(), info.as_ref()) {
            let seconds = self.show_bytes_written as f64 / self.bitrate_bytes_per_sec as f64;
            let total_frames = (seconds * 75.0) as u64; // CD-style 75 frames/sec
            let mm = total_frames / (75 * 60);
            let ss = (total_frames / 75) % 60;
            let ff = total_frames % 75;
            writeln!(cue, "  TRACK {:02} AUDIO", self.track_no)?;
            writeln!(cue, "    TITLE \"{}\"", info.title)?;
            writeln!(cue, "    PERFORMER \"{}\"", info.artist)?;
            writeln!(cue, "    INDEX 01 {mm:02}:{ss:02}:{ff:02}")?;
        }

        log::info!("trackwriter: finished track -> {final_path:?}");
        Ok(final_path)
    }

    /// Close any open handles. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.current_file = None;
        self.show_file = None;
        self.cue_file = None;
    }
}

impl Drop for TrackWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
