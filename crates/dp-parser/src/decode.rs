//! Streaming decode adapter
//!
//! Turns an asynchronous stream of byte chunks into a stream of text lines.
//! Lines are only decoded once their terminating `\n` has arrived, so a
//! multi-byte UTF-8 sequence split across two chunks decodes intact. Invalid
//! byte sequences are replaced with U+FFFD instead of failing the stream.

use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::io;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

/// Line codec that decodes UTF-8 lossily
///
/// Frames are split on `\n`; the terminator is removed but a preceding `\r`
/// is preserved. Residual bytes without a terminator are emitted once at end
/// of input.
#[derive(Debug, Default)]
pub struct LossyLinesCodec {
    /// Index in the buffer up to which no `\n` has been found yet
    next_index: usize,
}

impl LossyLinesCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LossyLinesCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        let search_from = self.next_index.min(buf.len());
        match buf[search_from..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let newline = search_from + offset;
                self.next_index = 0;
                let frame = buf.split_to(newline + 1);
                Ok(Some(decode_lossy(&frame[..newline])))
            },
            None => {
                self.next_index = buf.len();
                Ok(None)
            },
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() {
            return Ok(None);
        }

        self.next_index = 0;
        let rest = buf.split_to(buf.len());
        Ok(Some(decode_lossy(&rest)))
    }
}

fn decode_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Adapt a byte-chunk stream into a stream of decoded lines
///
/// Errors from the underlying stream are surfaced as `io::Error` items;
/// decoding itself never fails.
pub fn decode_lines<S, E>(chunks: S) -> impl Stream<Item = io::Result<String>>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<io::Error>,
{
    FramedRead::new(StreamReader::new(chunks), LossyLinesCodec::new())
}
