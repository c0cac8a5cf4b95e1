//! Newline-delimited JSON codec.
//!
//! Each frame is one JSON object followed by `\n`. Works over any
//! AsyncRead/AsyncWrite through `FramedRead` / `FramedWrite`.
//!
//! Decoding is tolerant: a line that is not valid JSON, or that does not
//! deserialize into the target type, is dropped and decoding continues with the
//! next line. The only fatal condition is a buffered line exceeding the
//! configured maximum.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default cap on buffered, unterminated input.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("message too large: {size} bytes buffered without newline (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Codec that frames messages by newline and serializes with JSON.
pub struct LineJsonCodec<T> {
    max_length: usize,
    /// Bytes of the current buffer already scanned for a newline.
    next_index: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for LineJsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LineJsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            _phantom: PhantomData,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl<T: DeserializeOwned> Decoder for LineJsonCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            let Some(newline) = newline else {
                if src.len() > self.max_length {
                    return Err(CodecError::MessageTooLarge {
                        size: src.len(),
                        max: self.max_length,
                    });
                }
                self.next_index = src.len();
                return Ok(None);
            };

            if newline > self.max_length {
                return Err(CodecError::MessageTooLarge {
                    size: newline,
                    max: self.max_length,
                });
            }

            let line = src.split_to(newline + 1);
            self.next_index = 0;

            let body = trim_line(&line);
            if body.is_empty() {
                continue;
            }

            match serde_json::from_slice::<T>(body) {
                Ok(item) => return Ok(Some(item)),
                Err(e) => {
                    tracing::trace!(error = %e, line_len = body.len(), "Dropping unparseable line");
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // An unterminated tail at EOF is an incomplete message; drop it.
        let item = self.decode(src)?;
        if item.is_none() && !src.is_empty() {
            tracing::trace!(bytes = src.len(), "Discarding unterminated data at EOF");
            src.clear();
            self.next_index = 0;
        }
        Ok(item)
    }
}

impl<T, I: Serialize> Encoder<I> for LineJsonCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: I, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding line");
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    let start = line[..end]
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(end);
    &line[start..end]
}
