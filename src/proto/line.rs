//! Newline-delimited line codec for the transport read path.
//!
//! Lines are limited to 512 bytes by default (the classic IRC limit;
//! tag-bearing servers may need more, so the limit is configurable).
//! Decoding is UTF-8 with lossy replacement: a hostile peer must not be
//! able to wedge the read path with an invalid byte sequence. An
//! over-long line is reported once and then discarded up to the next
//! newline, so the buffer cannot grow without bound either.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

pub struct LineCodec {
    /// Index of next byte to check for a newline.
    next_index: usize,
    max_len: usize,
    /// Skipping the remainder of an over-long line.
    discarding: bool,
}

impl LineCodec {
    pub fn new() -> LineCodec {
        LineCodec::with_max_len(512)
    }

    pub fn with_max_len(max_len: usize) -> LineCodec {
        LineCodec {
            next_index: 0,
            max_len,
            discarding: false,
        }
    }
}

impl Default for LineCodec {
    fn default() -> LineCodec {
        LineCodec::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        loop {
            if self.discarding {
                match src.iter().position(|b| *b == b'\n') {
                    Some(offset) => {
                        src.advance(offset + 1);
                        self.discarding = false;
                        self.next_index = 0;
                    }
                    None => {
                        src.clear();
                        return Ok(None);
                    }
                }
                continue;
            }

            if let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') {
                let line = src.split_to(self.next_index + offset + 1);
                self.next_index = 0;

                if line.len() > self.max_len {
                    // The line is already consumed; the next decode call
                    // starts clean.
                    return Err(ProtocolError::LineTooLong {
                        actual: line.len(),
                        limit: self.max_len,
                    });
                }

                let text = String::from_utf8_lossy(&line);
                return Ok(Some(text.trim_end_matches(['\r', '\n']).to_owned()));
            }

            self.next_index = src.len();
            if src.len() > self.max_len {
                let actual = src.len();
                src.clear();
                self.next_index = 0;
                self.discarding = true;
                return Err(ProtocolError::LineTooLong {
                    actual,
                    limit: self.max_len,
                });
            }
            return Ok(None);
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.reserve(item.len() + 2);
        dst.put_slice(item.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
