/*
 * Copyright 2020 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Incremental RESP decoding.
//!
//! The decoder is a resumable state machine rather than a restart-from-zero
//! parser: it remembers what it was waiting for (a type byte, the rest of a
//! line, the body of a bulk string) plus a stack of partially-filled arrays,
//! and it remembers how far it has already searched the buffer for a line
//! terminator.  Feeding it a byte stream in arbitrary chunks yields the same
//! replies as feeding it whole, and bytes are never scanned twice.

use std::str;

use bytes::{Buf, BytesMut};

use tokio_util::codec::Decoder;

use crate::{error::Error, protocol::resp::RespValue};

#[inline]
fn parse_error(message: String) -> Error {
    Error::RESP(message, None)
}

/// Many RESP types have their length (which is either bytes or "number of
/// elements", depending on context) encoded as a string, terminated by
/// "\r\n"; integer replies use the same form.
fn parse_length(bytes: &[u8]) -> Result<i64, Error> {
    match str::from_utf8(bytes) {
        Ok(string) => match string.parse() {
            Ok(int) => Ok(int),
            Err(_) => Err(parse_error(format!("Not an integer: {}", string))),
        },
        Err(_) => Err(parse_error(format!("Not a valid string: {:?}", bytes))),
    }
}

#[derive(Debug, Clone, Copy)]
enum LineKind {
    Simple,
    Error,
    Integer,
    BulkLen,
    ArrayLen,
}

#[derive(Debug, Clone, Copy)]
enum FrameState {
    /// Awaiting the type byte of the next value
    Type,
    /// Awaiting the `\r\n` that ends the current line
    Line(LineKind),
    /// Awaiting the body (plus terminator) of a bulk string of known length
    BulkBody(usize),
}

/// An array whose header has been read but whose elements are still arriving
#[derive(Debug)]
struct ArrayFrame {
    remaining: usize,
    items: Vec<RespValue>,
}

/// Codec to read and write frames.
///
/// The buffer it is given always holds exactly the unparsed suffix of the
/// stream: completed values are split off the front as soon as they are
/// recognised.
#[derive(Debug)]
pub(crate) struct RespCodec {
    state: FrameState,
    /// How far the current line has already been searched for its terminator
    scan: usize,
    /// Enclosing arrays, outermost first
    stack: Vec<ArrayFrame>,
}

impl RespCodec {
    pub(crate) fn new() -> Self {
        RespCodec {
            state: FrameState::Type,
            scan: 0,
            stack: Vec::new(),
        }
    }

    /// Scan for the line terminator, resuming where the previous call left
    /// off.  Returns the index of the `\r` once the whole `\r\n` is present.
    /// A trailing `\r` stays unexamined until its successor arrives.
    fn find_line_end(&mut self, buf: &BytesMut) -> Result<Option<usize>, Error> {
        while self.scan + 1 < buf.len() {
            if buf[self.scan] == b'\r' {
                if buf[self.scan + 1] == b'\n' {
                    return Ok(Some(self.scan));
                }
                return Err(parse_error(format!(
                    "CR not followed by LF: {}",
                    buf[self.scan + 1]
                )));
            }
            self.scan += 1;
        }
        Ok(None)
    }

    /// Fold a finished value into the enclosing array, if any.  Returns the
    /// value once it is complete at the top level.
    fn complete(&mut self, value: RespValue) -> Option<RespValue> {
        self.state = FrameState::Type;
        let mut value = value;
        while let Some(mut frame) = self.stack.pop() {
            frame.items.push(value);
            frame.remaining -= 1;
            if frame.remaining > 0 {
                self.stack.push(frame);
                return None;
            }
            value = RespValue::Array(frame.items);
        }
        Some(value)
    }
}

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let completed = match self.state {
                FrameState::Type => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let first_byte = buf[0];
                    let kind = match first_byte {
                        b'+' => LineKind::Simple,
                        b'-' => LineKind::Error,
                        b':' => LineKind::Integer,
                        b'$' => LineKind::BulkLen,
                        b'*' => LineKind::ArrayLen,
                        _ => return Err(parse_error(format!("Unexpected byte: {}", first_byte))),
                    };
                    buf.advance(1);
                    self.scan = 0;
                    self.state = FrameState::Line(kind);
                    continue;
                }
                FrameState::Line(kind) => {
                    let at = match self.find_line_end(buf)? {
                        Some(at) => at,
                        None => return Ok(None),
                    };
                    let line = buf.split_to(at + 2);
                    let content = &line[..at];
                    match kind {
                        LineKind::Simple => self.complete(RespValue::SimpleString(
                            String::from_utf8_lossy(content).into_owned(),
                        )),
                        LineKind::Error => self.complete(RespValue::Error(
                            String::from_utf8_lossy(content).into_owned(),
                        )),
                        LineKind::Integer => {
                            // digits are validated here but the value stays textual
                            parse_length(content)?;
                            self.complete(RespValue::Integer(content.to_vec()))
                        }
                        LineKind::BulkLen => match parse_length(content)? {
                            -1 => self.complete(RespValue::Nil),
                            len if len >= 0 => {
                                self.state = FrameState::BulkBody(len as usize);
                                continue;
                            }
                            len => {
                                return Err(parse_error(format!("Invalid string size: {}", len)));
                            }
                        },
                        LineKind::ArrayLen => match parse_length(content)? {
                            -1 => self.complete(RespValue::Nil),
                            0 => self.complete(RespValue::Array(Vec::new())),
                            len if len > 0 => {
                                self.stack.push(ArrayFrame {
                                    remaining: len as usize,
                                    items: Vec::with_capacity(len as usize),
                                });
                                self.state = FrameState::Type;
                                continue;
                            }
                            len => {
                                return Err(parse_error(format!("Invalid array size: {}", len)));
                            }
                        },
                    }
                }
                FrameState::BulkBody(len) => {
                    if buf.len() < len + 2 {
                        return Ok(None);
                    }
                    let body = buf.split_to(len + 2);
                    if body[len] != b'\r' || body[len + 1] != b'\n' {
                        return Err(parse_error(format!(
                            "Bulk string of size {} not terminated by CRLF",
                            len
                        )));
                    }
                    self.complete(RespValue::BulkString(body[..len].to_vec()))
                }
            };
            if let Some(value) = completed {
                return Ok(Some(value));
            }
        }
    }
}
