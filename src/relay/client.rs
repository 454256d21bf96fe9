//! A single downstream relay connection: its socket, its ring cursor, and
//! the send-buffer state machine the sender thread drives each pass.

use std::net::TcpStream;

use crate::ring::CursorId;

/// One connected relay client. Owned exclusively by the relay client list
/// under the list mutex (spec §5): the acceptor thread builds one and
/// inserts it, the sender thread is the only other thing that ever reads
/// or writes its fields.
pub struct RelayClient {
    pub stream: TcpStream,
    pub cursor: CursorId,
    pub wants_icy: bool,

    /// True from construction until the first successful `extract_relay`
    /// fill, so the sender resets stale `offset`/`left_to_send` state
    /// before touching this client for the first time.
    pub is_new: bool,

    /// For OGG clients joining mid-stream: captured BOS/setup header bytes
    /// that must be sent once, before any ring content.
    header_buf: Option<Vec<u8>>,
    header_buf_offset: usize,

    buffer: Vec<u8>,
    offset: usize,
    left_to_send: usize,
}

impl RelayClient {
    pub fn new(stream: TcpStream, cursor: CursorId, wants_icy: bool, header_buf: Option<Vec<u8>>) -> Self {
        RelayClient {
            stream,
            cursor,
            wants_icy,
            is_new: true,
            header_buf,
            header_buf_offset: 0,
            buffer: Vec::new(),
            offset: 0,
            left_to_send: 0,
        }
    }

    pub fn has_pending_header(&self) -> bool {
        self.header_buf.is_some()
    }

    /// Pull up to `capacity` bytes out of the pending header buffer,
    /// advancing its offset and clearing it once exhausted.
    pub fn take_header_chunk(&mut self, capacity: usize) -> Vec<u8> {
        let Some(header) = self.header_buf.as_ref() else {
            return Vec::new();
        };
        let remaining = &header[self.header_buf_offset..];
        let take = remaining.len().min(capacity);
        let chunk = remaining[..take].to_vec();
        self.header_buf_offset += take;
        if self.header_buf_offset >= header.len() {
            self.header_buf = None;
            self.header_buf_offset = 0;
        }
        chunk
    }

    pub fn reset_for_new_pass(&mut self) {
        self.offset = 0;
        self.left_to_send = 0;
        self.is_new = false;
    }

    pub fn load_buffer(&mut self, data: Vec<u8>) {
        self.left_to_send = data.len();
        self.buffer = data;
        self.offset = 0;
    }

    pub fn is_idle(&self) -> bool {
        self.left_to_send == 0
    }

    pub fn pending_slice(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.left_to_send]
    }

    pub fn advance(&mut self, n: usize) {
        self.offset += n;
        self.left_to_send -= n;
    }
}
