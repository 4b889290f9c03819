//! Newline-delimited JSON framing for stdio MCP servers

use crate::core::protocol::JsonRpcRequest;
use bytes::{BufMut, BytesMut};
use serde_json::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// One decoded line
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A complete JSON document
    Message(Value),
    /// A line that was not valid JSON; carried so the reader can log it
    Malformed(String),
}

/// Splits the byte stream on `\n`, one JSON document per line.
///
/// Bytes without a terminating newline stay buffered until more arrive.
/// Blank lines are skipped.
#[derive(Debug, Default)]
pub struct JsonLineCodec {
    /// Index up to which the buffer is known to hold no newline
    next_index: usize,
}

impl JsonLineCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_line(line: &[u8]) -> Option<Frame> {
        let line = trim_line(line);
        if line.is_empty() {
            return None;
        }
        Some(match serde_json::from_slice::<Value>(line) {
            Ok(value) => Frame::Message(value),
            Err(_) => Frame::Malformed(String::from_utf8_lossy(line).into_owned()),
        })
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &line[start..end.max(start)]
}

impl Decoder for JsonLineCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            let newline = src[self.next_index..].iter().position(|b| *b == b'\n');
            match newline {
                Some(offset) => {
                    let line = src.split_to(self.next_index + offset + 1);
                    self.next_index = 0;
                    if let Some(frame) = Self::parse_line(&line) {
                        return Ok(Some(frame));
                    }
                }
                None => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        Ok(Self::parse_line(&rest))
    }
}

impl Encoder<JsonRpcRequest> for JsonLineCodec {
    type Error = io::Error;

    fn encode(&mut self, request: JsonRpcRequest, dst: &mut BytesMut) -> Result<(), io::Error> {
        let json = serde_json::to_vec(&request)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
