//! Persisted frame codec
//!
//! Frame layout, all integers big-endian:
//!
//! ```text
//! [i32 body_len][body][i32 header_count]{[u16 key_len][key utf8][u16 value_len][value utf8]}*
//! ```
//!
//! Header strings are limited to 65535 bytes each.

use super::event::Event;
use crate::core::{RelayError, Result};
use std::collections::BTreeMap;

const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Encode an event into a flat frame
pub fn encode(event: &Event) -> Result<Vec<u8>> {
    let body = event.body();
    let headers = event.headers();
    let body_len = i32::try_from(body.len())
        .map_err(|_| RelayError::codec(format!("body too large: {} bytes", body.len())))?;
    let header_count = i32::try_from(headers.len())
        .map_err(|_| RelayError::codec("too many headers"))?;

    let headers_size: usize = headers.iter().map(|(k, v)| 4 + k.len() + v.len()).sum();
    let mut frame = Vec::with_capacity(8 + body.len() + headers_size);
    frame.extend_from_slice(&body_len.to_be_bytes());
    frame.extend_from_slice(body);
    frame.extend_from_slice(&header_count.to_be_bytes());
    for (key, value) in headers {
        write_string(&mut frame, key)?;
        write_string(&mut frame, value)?;
    }
    Ok(frame)
}

/// Decode a frame produced by [`encode`]
pub fn decode(frame: &[u8]) -> Result<Event> {
    let mut reader = FrameReader { buf: frame, pos: 0 };

    let body_len = reader.read_len()?;
    let body = reader.take(body_len)?.to_vec();
    let header_count = reader.read_len()?;

    let mut headers = BTreeMap::new();
    for _ in 0..header_count {
        let key = reader.read_string()?;
        let value = reader.read_string()?;
        headers.insert(key, value);
    }
    if reader.pos != frame.len() {
        return Err(RelayError::codec(format!(
            "{} trailing bytes after frame",
            frame.len() - reader.pos
        )));
    }

    Event::from_parts(headers, body).ok_or_else(|| RelayError::codec("frame has no event id"))
}

fn write_string(frame: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.len() > MAX_STRING_LEN {
        return Err(RelayError::codec(format!(
            "header string of {} bytes exceeds {} byte limit",
            s.len(),
            MAX_STRING_LEN
        )));
    }
    frame.extend_from_slice(&(s.len() as u16).to_be_bytes());
    frame.extend_from_slice(s.as_bytes());
    Ok(())
}

struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                RelayError::codec(format!(
                    "truncated frame: wanted {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.buf.len() - self.pos
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_len(&mut self) -> Result<usize> {
        let bytes = self.take(4)?;
        let value = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        usize::try_from(value).map_err(|_| RelayError::codec(format!("negative length {}", value)))
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes = self.take(2)?;
        let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| RelayError::codec(e.to_string()))
    }
}
