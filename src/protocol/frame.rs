//! Wire framing
//!
//! Every record on a cluster connection is a 4-byte big-endian length
//! followed by that many payload bytes:
//!
//! ```text
//! record := length:u32_be payload:bytes[length]
//! ```
//!
//! [`RecordParser`] is a push parser running a two-state machine: in
//! `Header` it waits for the 4 length bytes, in `Body` it waits for the
//! announced payload. Partial reads buffer internally; complete payloads
//! come out as whole [`Bytes`]. PING recognition happens above this
//! layer, from the decoded payload's codec field; framing is oblivious
//! to payload kinds.
//!
//! The PONG acknowledgement is a single literal byte written *outside*
//! the length framing; it never passes through this parser on the
//! server side.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// The 1-byte PONG acknowledgement, sent unframed.
pub const PONG: u8 = 0x01;

/// Length prefix size in bytes.
const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Waiting for the 4-byte length prefix
    Header,
    /// Waiting for a payload of the given size
    Body(usize),
}

/// Push parser for length-prefixed records
#[derive(Debug)]
pub struct RecordParser {
    buf: BytesMut,
    state: ParseState,
    max_record_size: usize,
}

impl RecordParser {
    /// Create a parser that rejects records larger than `max_record_size`.
    pub fn new(max_record_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            state: ParseState::Header,
            max_record_size,
        }
    }

    /// Feed raw bytes from the socket into the parser.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pull the next complete payload, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. An announced
    /// length above the configured maximum is a decode error; the
    /// caller is expected to close the connection.
    pub fn next_record(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                ParseState::Header => {
                    if self.buf.len() < LENGTH_PREFIX {
                        return Ok(None);
                    }
                    let len = self.buf.get_u32() as usize;
                    if len > self.max_record_size {
                        return Err(Error::InvalidMessage(format!(
                            "record length {} exceeds maximum {}",
                            len, self.max_record_size
                        )));
                    }
                    self.state = ParseState::Body(len);
                }
                ParseState::Body(len) => {
                    if self.buf.len() < len {
                        return Ok(None);
                    }
                    let payload = self.buf.split_to(len).freeze();
                    self.state = ParseState::Header;
                    return Ok(Some(payload));
                }
            }
        }
    }
}

/// Prefix a payload with its big-endian length.
pub fn encode_record(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}
