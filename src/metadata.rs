//! Track metadata: ICY in-band frames and OGG Vorbis comments, both
//! reduced to the same [`TrackInfo`] record the rest of the core deals in.

/// Free-form fields are bounded to this many bytes; callers should
/// transcode/scrub before handing strings to a [`TrackInfo`], but this is
/// the backstop.
pub const MAX_TRACK_LEN: usize = 1000;

/// The maximum SHOUTcast ICY metadata frame: one length byte can only
/// describe up to 255 * 16 bytes of text.
pub const MAX_ICY_METADATA_BYTES: usize = 255 * 16;

/// A single track's metadata, as it flows through the ring's metadata list
/// and on into the track writer / relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackInfo {
    pub artist: String,
    pub title: String,
    pub album: String,
    pub track_number: String,

    /// True once any field has been populated from upstream metadata.
    pub have_track_info: bool,
    /// Writer hint: false suppresses writing this particular track (e.g.
    /// an ad break or station ID the operator doesn't want ripped).
    pub save_track: bool,
    /// Edge-trigger: true only for the insert that introduced this
    /// `TrackInfo`, so the ingest driver knows to open a new file.
    pub new_track: bool,
}

impl TrackInfo {
    pub fn new(artist: impl Into<String>, title: impl Into<String>) -> Self {
        TrackInfo {
            artist: clamp(artist.into()),
            title: clamp(title.into()),
            album: String::new(),
            track_number: String::new(),
            have_track_info: true,
            save_track: true,
            new_track: true,
        }
    }

    /// The SHOUTcast `StreamTitle='artist - title';` text, without ICY
    /// framing, in the style the original upstream emits it.
    pub fn stream_title_text(&self) -> String {
        let display = match (self.artist.is_empty(), self.title.is_empty()) {
            (false, false) => format!("{} - {}", self.artist, self.title),
            (true, false) => self.title.clone(),
            (false, true) => self.artist.clone(),
            (true, true) => String::new(),
        };
        format!("StreamTitle='{}';", escape_quotes(&display))
    }

    /// Prebuilt ICY metadata block: one length byte (units of 16) followed
    /// by `16 * length` bytes of text, NUL-padded.
    pub fn composed_metadata(&self) -> Vec<u8> {
        compose_icy_metadata(self.stream_title_text().as_bytes())
    }
}

fn clamp(mut s: String) -> String {
    if s.len() > MAX_TRACK_LEN {
        // Truncate on a char boundary so we never split a multi-byte
        // sequence in half.
        let mut end = MAX_TRACK_LEN;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

fn escape_quotes(s: &str) -> String {
    s.replace('\'', "\\'")
}

/// Build a SHOUTcast ICY metadata frame body (the bytes sent *after* the
/// length byte). `text` is truncated to [`MAX_ICY_METADATA_BYTES`] if
/// necessary.
pub fn compose_icy_metadata(text: &[u8]) -> Vec<u8> {
    let truncated = if text.len() > MAX_ICY_METADATA_BYTES {
        &text[..MAX_ICY_METADATA_BYTES]
    } else {
        text
    };
    let length_units = truncated.len().div_ceil(16);
    let mut out = Vec::with_capacity(1 + length_units * 16);
    out.push(length_units as u8);
    out.extend_from_slice(truncated);
    out.resize(1 + length_units * 16, 0);
    out
}

/// Number of bytes a composed ICY frame with a NUL-padded text of length
/// `length_units * 16` occupies on the wire, length byte included.
pub fn icy_frame_len(length_units: u8) -> usize {
    1 + 16 * length_units as usize
}

/// Parse a `StreamTitle='...';` frame body (post length-byte, NUL padded or
/// not) into a [`TrackInfo`]. Returns `None` if no `StreamTitle` tag is
/// present, which callers treat as "no change" per the spec's zero-length
/// metadata convention.
pub fn parse_icy_metadata(frame_body: &[u8]) -> Option<TrackInfo> {
    let end = frame_body
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(frame_body.len());
    let text = String::from_utf8_lossy(&frame_body[..end]);
    parse_stream_title(&text)
}

fn parse_stream_title(text: &str) -> Option<TrackInfo> {
    const TAG: &str = "StreamTitle='";
    let start = text.find(TAG)? + TAG.len();
    let rest = &text[start..];
    let end = rest.find("';")?;
    let display = rest[..end].replace("\\'", "'");

    let (artist, title) = match display.split_once(" - ") {
        Some((a, t)) => (a.to_string(), t.to_string()),
        None => (String::new(), display),
    };

    Some(TrackInfo {
        artist: clamp(artist),
        title: clamp(title),
        album: String::new(),
        track_number: String::new(),
        have_track_info: true,
        save_track: true,
        new_track: true,
    })
}

/// A single `KEY=value` entry from a Vorbis comment packet.
pub type VorbisComment = (String, String);

/// Parse a raw Vorbis comment packet (type byte `0x03`, `"vorbis"` magic,
/// vendor string, then a list of `KEY=value` comments) into a flat list of
/// comments. Returns `None` if the packet doesn't look like a comment
/// packet at all; malformed individual comment entries are skipped rather
/// than failing the whole packet.
pub fn parse_vorbis_comment_packet(data: &[u8]) -> Option<Vec<VorbisComment>> {
    if data.len() < 7 || data[0] != 0x03 || &data[1..7] != b"vorbis" {
        return None;
    }
    let mut pos = 7usize;

    let vendor_len = read_u32_le(data, pos)? as usize;
    pos += 4;
    pos = pos.checked_add(vendor_len)?;
    if pos > data.len() {
        return None;
    }

    let comment_count = read_u32_le(data, pos)? as usize;
    pos += 4;

    let mut comments = Vec::with_capacity(comment_count.min(64));
    for _ in 0..comment_count {
        let len = match read_u32_le(data, pos) {
            Some(l) => l as usize,
            None => break,
        };
        pos += 4;
        let end = match pos.checked_add(len) {
            Some(e) if e <= data.len() => e,
            _ => break,
        };
        if let Ok(entry) = std::str::from_utf8(&data[pos..end]) {
            if let Some((key, value)) = entry.split_once('=') {
                comments.push((key.to_ascii_uppercase(), value.to_string()));
            }
        }
        pos = end;
    }
    Some(comments)
}

fn read_u32_le(data: &[u8], pos: usize) -> Option<u32> {
    let end = pos.checked_add(4)?;
    if end > data.len() {
        return None;
    }
    Some(u32::from_le_bytes(data[pos..end].try_into().unwrap()))
}

/// Reduce a flat Vorbis comment list to a [`TrackInfo`], the way the OGG
/// framer does at end-of-stream.
pub fn track_info_from_vorbis_comments(comments: &[VorbisComment]) -> TrackInfo {
    let mut info = TrackInfo {
        have_track_info: true,
        save_track: true,
        new_track: true,
        ..Default::default()
    };
    for (key, value) in comments {
        match key.as_str() {
            "ARTIST" => info.artist = clamp(value.clone()),
            "TITLE" => info.title = clamp(value.clone()),
            "ALBUM" => info.album = clamp(value.clone()),
            "TRACKNUMBER" => info.track_number = clamp(value.clone()),
            _ => {}
        }
    }
    info
}
