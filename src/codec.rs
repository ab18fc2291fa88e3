use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error as ThisError;
use tokio_util::codec::{Decoder, Encoder};

use crate::reply::Reply;
use crate::request::Request;
use crate::Error;

/// Upper bound (exclusive) of the element count of a request array.
pub const MAX_MULTIBULK_LEN: usize = 1024 * 1024;
/// Default upper bound (exclusive) of a single bulk string.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Longest inline request, or array/bulk header, accepted before giving up on finding its end.
pub const MAX_INLINE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ProtocolError {
    #[error("Protocol error: invalid multibulk length")]
    InvalidMultibulkLength,
    #[error("Protocol error: invalid bulk length")]
    InvalidBulkLength,
    #[error("Protocol error: expected '$', got '{0}'")]
    UnexpectedByte(char),
    #[error("Protocol error: bulk length does not match the data")]
    BulkLengthMismatch,
    #[error("Protocol error: too big inline request")]
    TooBigInline,
}

/// Server side RESP codec: decodes [`Request`]s and encodes [`Reply`]s.
///
/// Both request forms are accepted:
///
/// * inline: `PING\r\n`, tokens separated by any number of spaces;
/// * array of bulk strings: `*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n`.
///
/// Decoding is resumable. Complete tokens are taken out of the buffer as soon as they are
/// available and kept in the codec until the whole array is in, so a request split across many
/// reads is never parsed twice.
///
/// Malformed input does not fail the stream. It yields an invalid [`Request`] carrying the
/// [`ProtocolError`] and the buffered remainder of the frame is discarded.
#[derive(Debug)]
pub struct RequestCodec {
    state: State,
    max_bulk_len: usize,
    max_multibulk_len: usize,
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    Multibulk {
        expected: usize,
        tokens: Vec<Bytes>,
        // Length of the bulk string whose header was consumed but whose data is still missing.
        bulk_len: Option<usize>,
    },
}

impl RequestCodec {
    pub fn new() -> RequestCodec {
        RequestCodec::with_limits(MAX_BULK_LEN, MAX_MULTIBULK_LEN)
    }

    pub fn with_limits(max_bulk_len: usize, max_multibulk_len: usize) -> RequestCodec {
        RequestCodec {
            state: State::Idle,
            max_bulk_len,
            max_multibulk_len,
        }
    }

    /// Whether part of a request has been consumed and the rest is still missing.
    pub fn is_partial(&self) -> bool {
        matches!(self.state, State::Multibulk { .. })
    }

    fn decode_tokens(&mut self, src: &mut BytesMut) -> Result<Option<Vec<Bytes>>, ProtocolError> {
        let max_bulk_len = self.max_bulk_len;

        loop {
            match &mut self.state {
                State::Idle => {
                    let Some(&first) = src.first() else {
                        return Ok(None);
                    };

                    if first == b'*' {
                        let Some(line) = take_line(src, ProtocolError::InvalidMultibulkLength)?
                        else {
                            return Ok(None);
                        };

                        let count = parse_integer(&line[1..])
                            .ok_or(ProtocolError::InvalidMultibulkLength)?;
                        if count >= self.max_multibulk_len as i64 {
                            return Err(ProtocolError::InvalidMultibulkLength);
                        }
                        // Empty and null arrays carry no command.
                        if count <= 0 {
                            continue;
                        }

                        let expected = count as usize;
                        self.state = State::Multibulk {
                            expected,
                            tokens: Vec::with_capacity(expected.min(1024)),
                            bulk_len: None,
                        };
                    } else {
                        let Some(line) = take_line(src, ProtocolError::TooBigInline)? else {
                            return Ok(None);
                        };

                        let tokens = split_inline(line.freeze());
                        if !tokens.is_empty() {
                            return Ok(Some(tokens));
                        }
                    }
                }
                State::Multibulk {
                    expected,
                    tokens,
                    bulk_len,
                } => {
                    while tokens.len() < *expected {
                        let len = match bulk_len {
                            Some(len) => *len,
                            None => {
                                let Some(len) = take_bulk_header(src, max_bulk_len)? else {
                                    return Ok(None);
                                };
                                *bulk_len = Some(len);
                                len
                            }
                        };

                        if src.len() < len + 2 {
                            src.reserve(len + 2 - src.len());
                            return Ok(None);
                        }
                        if &src[len..len + 2] != b"\r\n" {
                            return Err(ProtocolError::BulkLengthMismatch);
                        }

                        tokens.push(src.split_to(len).freeze());
                        src.advance(2);
                        *bulk_len = None;
                    }

                    if let State::Multibulk { tokens, .. } = std::mem::take(&mut self.state) {
                        return Ok(Some(tokens));
                    }
                }
            }
        }
    }
}

impl Default for RequestCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RequestCodec {
    type Item = Request;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode_tokens(src) {
            Ok(Some(tokens)) => Ok(Some(Request::new(tokens))),
            Ok(None) => Ok(None),
            Err(err) => {
                // The rest of the frame cannot be located reliably, drop whatever is buffered.
                src.clear();
                self.state = State::Idle;
                Ok(Some(Request::invalid(err)))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(request) => Ok(Some(request)),
            None => {
                // A truncated trailing frame is dropped with the connection.
                src.clear();
                self.state = State::Idle;
                Ok(None)
            }
        }
    }
}

impl Encoder<Reply> for RequestCodec {
    type Error = Error;

    fn encode(&mut self, reply: Reply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        reply.encode(dst);
        Ok(())
    }
}

/// Parses a RESP integer: ASCII digits with an optional leading `-`.
pub fn parse_integer(src: &[u8]) -> Option<i64> {
    let (negative, digits) = match src.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, src),
    };

    if digits.is_empty() {
        return None;
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        let digit = i64::from(b - b'0');
        value = value.checked_mul(10)?;
        value = if negative {
            value.checked_sub(digit)?
        } else {
            value.checked_add(digit)?
        };
    }

    Some(value)
}

// Takes a line ending with `\n` (optionally preceded by `\r`) out of `src`, without the line
// ending.
fn take_line(src: &mut BytesMut, too_long: ProtocolError) -> Result<Option<BytesMut>, ProtocolError> {
    let Some(end) = src.iter().position(|b| *b == b'\n') else {
        if src.len() > MAX_INLINE_LEN {
            return Err(too_long);
        }
        return Ok(None);
    };

    if end > MAX_INLINE_LEN {
        return Err(too_long);
    }

    let mut line = src.split_to(end);
    src.advance(1);
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }

    Ok(Some(line))
}

// Consumes a `$<len>\r\n` header and returns `len`.
fn take_bulk_header(src: &mut BytesMut, max_bulk_len: usize) -> Result<Option<usize>, ProtocolError> {
    let Some(&first) = src.first() else {
        return Ok(None);
    };
    if first != b'$' {
        return Err(ProtocolError::UnexpectedByte(char::from(first)));
    }

    let Some(line) = take_line(src, ProtocolError::InvalidBulkLength)? else {
        return Ok(None);
    };

    match parse_integer(&line[1..]) {
        Some(len) if len >= 0 && (len as u64) < max_bulk_len as u64 => Ok(Some(len as usize)),
        _ => Err(ProtocolError::InvalidBulkLength),
    }
}

fn split_inline(line: Bytes) -> Vec<Bytes> {
    let mut tokens = Vec::new();
    let mut start = None;

    for (i, b) in line.iter().enumerate() {
        match (b, start) {
            (b' ', Some(from)) => {
                tokens.push(line.slice(from..i));
                start = None;
            }
            (b' ', None) => {}
            (_, None) => start = Some(i),
            (_, Some(_)) => {}
        }
    }
    if let Some(from) = start {
        tokens.push(line.slice(from..));
    }

    tokens
}
