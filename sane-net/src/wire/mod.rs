#![forbid(unsafe_code)]

//! Binary wire codec for the SANE network protocol.
//!
//! All integers travel as 32-bit signed words in network byte order.
//! Strings are length-prefixed (length includes the NUL terminator); a
//! length of zero denotes a null string, which is distinct from an empty
//! one. Nullable pointers are a word flag followed by the payload, arrays
//! a word count followed by that many elements.
//!
//! [`WireWriter`] stages a whole message in a buffer and writes it out in
//! one `flush`. [`WireReader`] refills its buffer from the transport as a
//! decode consumes it, so the protocol needs no outer message framing.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on the bytes a single reply may ask the decoder to
/// allocate. Replies declaring more abort the connection.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed mid-message")]
    Eof,
    #[error("message exceeds the {MAX_MESSAGE_BYTES} byte decode limit")]
    TooLarge,
    #[error("bad {what} on the wire: {value}")]
    BadValue { what: &'static str, value: i64 },
    #[error("string on the wire is not valid utf-8")]
    BadString,
}

impl WireError {
    pub(crate) fn bad(what: &'static str, value: i64) -> Self {
        WireError::BadValue { what, value }
    }
}

/// Decoding half of the codec.
pub struct WireReader<R> {
    io: R,
    buf: BytesMut,
    budget: usize,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub fn new(io: R) -> Self {
        Self { io, buf: BytesMut::with_capacity(READ_CHUNK), budget: MAX_MESSAGE_BYTES }
    }

    /// Reset the allocation budget at a message boundary.
    pub fn begin_message(&mut self) {
        self.budget = MAX_MESSAGE_BYTES;
    }

    pub fn into_inner(self) -> R {
        self.io
    }

    /// Charge `n` bytes against the per-message budget before allocating.
    fn charge(&mut self, n: usize) -> Result<(), WireError> {
        if n > self.budget {
            return Err(WireError::TooLarge);
        }
        self.budget -= n;
        Ok(())
    }

    async fn fill(&mut self, need: usize) -> Result<(), WireError> {
        while self.buf.len() < need {
            self.buf.reserve(READ_CHUNK.max(need - self.buf.len()));
            let n = self.io.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(WireError::Eof);
            }
        }
        Ok(())
    }

    pub async fn read_byte(&mut self) -> Result<u8, WireError> {
        self.fill(1).await?;
        Ok(self.buf.get_u8())
    }

    pub async fn read_word(&mut self) -> Result<i32, WireError> {
        self.fill(4).await?;
        Ok(self.buf.get_i32())
    }

    pub async fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_word().await? != 0)
    }

    /// Read an array length and charge `elem_size` bytes per element.
    pub async fn read_len(&mut self, elem_size: usize) -> Result<usize, WireError> {
        let n = self.read_word().await?;
        if n < 0 {
            return Err(WireError::bad("array length", n as i64));
        }
        let n = n as usize;
        self.charge(n.saturating_mul(elem_size))?;
        Ok(n)
    }

    /// Read the flag word of a nullable pointer.
    pub async fn read_ptr_flag(&mut self) -> Result<bool, WireError> {
        Ok(self.read_word().await? != 0)
    }

    /// Read a string; `None` is the null string, `Some("")` the empty one.
    pub async fn read_string(&mut self) -> Result<Option<String>, WireError> {
        let len = self.read_word().await?;
        if len == 0 {
            return Ok(None);
        }
        if len < 0 {
            return Err(WireError::bad("string length", len as i64));
        }
        let len = len as usize;
        self.charge(len)?;
        self.fill(len).await?;
        let mut raw = self.buf.split_to(len).to_vec();
        // The terminator is included in the length; anything past the
        // first NUL is padding.
        if let Some(pos) = raw.iter().position(|&b| b == 0) {
            raw.truncate(pos);
        }
        String::from_utf8(raw).map(Some).map_err(|_| WireError::BadString)
    }
}

/// Encoding half of the codec.
pub struct WireWriter<W> {
    io: W,
    buf: BytesMut,
}

impl<W> WireWriter<W> {
    pub fn new(io: W) -> Self {
        Self { io, buf: BytesMut::with_capacity(READ_CHUNK) }
    }

    pub fn into_inner(self) -> W {
        self.io
    }

    pub fn put_byte(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_word(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_word(v as i32);
    }

    pub fn put_ptr_flag(&mut self, present: bool) {
        self.put_word(present as i32);
    }

    pub fn put_string(&mut self, s: Option<&str>) {
        match s {
            None => self.put_word(0),
            Some(s) => {
                self.put_word(s.len() as i32 + 1);
                self.buf.put_slice(s.as_bytes());
                self.buf.put_u8(0);
            }
        }
    }
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    /// Write the staged message to the transport and clear the buffer.
    pub async fn flush(&mut self) -> Result<(), WireError> {
        self.io.write_all(&self.buf).await?;
        self.buf.clear();
        self.io.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded<F: FnOnce(&mut WireWriter<Vec<u8>>)>(f: F) -> Vec<u8> {
        let mut w = WireWriter::new(Vec::new());
        f(&mut w);
        w.buf.to_vec()
    }

    fn reader(bytes: &[u8]) -> WireReader<&[u8]> {
        WireReader::new(bytes)
    }

    #[tokio::test]
    async fn word_is_big_endian() {
        let bytes = encoded(|w| w.put_word(0x0102_0304));
        assert_eq!(bytes, [0x01, 0x02, 0x03, 0x04]);
        let mut r = reader(&bytes);
        assert_eq!(r.read_word().await.unwrap(), 0x0102_0304);
    }

    #[tokio::test]
    async fn negative_word_round_trips() {
        let bytes = encoded(|w| w.put_word(-2));
        let mut r = reader(&bytes);
        assert_eq!(r.read_word().await.unwrap(), -2);
    }

    #[tokio::test]
    async fn string_carries_terminator() {
        let bytes = encoded(|w| w.put_string(Some("alice")));
        assert_eq!(bytes, [0, 0, 0, 6, b'a', b'l', b'i', b'c', b'e', 0]);
        let mut r = reader(&bytes);
        assert_eq!(r.read_string().await.unwrap().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn null_and_empty_strings_are_distinct() {
        let bytes = encoded(|w| {
            w.put_string(None);
            w.put_string(Some(""));
        });
        let mut r = reader(&bytes);
        assert_eq!(r.read_string().await.unwrap(), None);
        assert_eq!(r.read_string().await.unwrap().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn string_decoding_stops_at_first_nul() {
        // A peer may send a fixed-size buffer with padding after the NUL.
        let mut bytes = vec![0, 0, 0, 8];
        bytes.extend_from_slice(b"abc\0pad\0");
        let mut r = reader(&bytes);
        assert_eq!(r.read_string().await.unwrap().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn oversized_string_is_rejected_without_reading_payload() {
        let bytes = encoded(|w| w.put_word((MAX_MESSAGE_BYTES + 1) as i32));
        let mut r = reader(&bytes);
        assert!(matches!(r.read_string().await, Err(WireError::TooLarge)));
    }

    #[tokio::test]
    async fn budget_accumulates_within_a_message() {
        let half = (MAX_MESSAGE_BYTES / 2 + 1) as i32;
        let mut bytes = Vec::new();
        for _ in 0..2 {
            bytes.extend_from_slice(&half.to_be_bytes());
            // No payload follows; the second length alone must trip the cap.
        }
        let mut r = reader(&bytes);
        assert!(matches!(r.read_len(1).await, Ok(_)));
        assert!(matches!(r.read_len(1).await, Err(WireError::TooLarge)));
    }

    #[tokio::test]
    async fn begin_message_resets_the_budget() {
        let big = (MAX_MESSAGE_BYTES - 8) as i32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&big.to_be_bytes());
        bytes.extend_from_slice(&big.to_be_bytes());
        let mut r = reader(&bytes);
        assert!(r.read_len(1).await.is_ok());
        r.begin_message();
        assert!(r.read_len(1).await.is_ok());
    }

    #[tokio::test]
    async fn short_input_reports_eof() {
        let mut r = reader(&[0, 0]);
        assert!(matches!(r.read_word().await, Err(WireError::Eof)));
    }
}
