// https://redis.io/docs/reference/protocol-spec

use std::io::Cursor;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error as ThisError;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::parse_integer;
use crate::reply::{Reply, CRLF};

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid frame data type: {0}")]
    InvalidDataType(u8),
    /// Invalid message encoding.
    #[error("{0}")]
    Other(crate::Error),
}

/// Parses one RESP reply, as sent by a store, out of `src`.
///
/// Returns [`Error::Incomplete`] when `src` does not hold a whole reply yet; the cursor position is
/// then meaningless and parsing should be retried from the start once more data is available.
pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Reply, Error> {
    // The first byte in an RESP-serialized payload always identifies its type.
    // Subsequent bytes constitute the type's contents.
    let first_byte = get_byte(src)?;
    let data_type = DataType::try_from(first_byte)?;

    match data_type {
        DataType::SimpleString => {
            let bytes = get_line(src)?.to_vec();
            let string = String::from_utf8(bytes)?;
            Ok(Reply::Status(string))
        }
        DataType::SimpleError => {
            let bytes = get_line(src)?.to_vec();
            let string = String::from_utf8(bytes)?;
            Ok(Reply::Error(string))
        }
        DataType::Integer => {
            let integer = get_integer(src)?;
            Ok(Reply::Integer(integer))
        }
        // $<length>\r\n<data>\r\n
        DataType::BulkString => {
            let length = get_integer(src)?;
            if length == -1 {
                return Ok(Reply::Bulk(None));
            }

            let data = get_exact(src, length)?;
            Ok(Reply::Bulk(Some(Bytes::copy_from_slice(data))))
        }
        // *<number-of-elements>\r\n<element-1>...<element-n>
        DataType::Array => {
            let length = get_integer(src)?;
            if length == -1 {
                return Ok(Reply::Array(None));
            }
            if length < 0 {
                return Err("protocol error; invalid array length".into());
            }

            let mut items = Vec::with_capacity((length as usize).min(1024));
            for _ in 0..length {
                items.push(parse(src)?);
            }

            Ok(Reply::Array(Some(items)))
        }
        // Due to historical reasons, RESP2 features two specially crafted values for representing
        // null values of bulk strings and arrays. The null type, introduced in RESP3, is folded
        // into the null bulk string.
        DataType::Null => {
            let _ = get_line(src)?;
            Ok(Reply::Bulk(None))
        }
    }
}

/// Client side RESP codec, used to talk to an upstream store: encodes requests (as arrays of bulk
/// strings) and decodes replies.
#[derive(Debug)]
pub struct ReplyCodec {
    max_frame_size: usize,
}

impl ReplyCodec {
    pub fn new(max_frame_size: usize) -> ReplyCodec {
        ReplyCodec { max_frame_size }
    }
}

impl Default for ReplyCodec {
    fn default() -> Self {
        Self::new(512 * 1024 * 1024)
    }
}

impl Decoder for ReplyCodec {
    type Item = Reply;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&src[..]);
        let reply = match parse(&mut cursor) {
            Ok(reply) => reply,
            Err(Error::Incomplete) => {
                // Check if the frame size exceeds a certain limit to prevent DoS attacks
                if src.len() > self.max_frame_size {
                    return Err("frame size exceeds limit".into());
                }
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let position = cursor.position() as usize;

        // Remove the parsed frame from the buffer.
        src.advance(position);

        Ok(Some(reply))
    }
}

impl Encoder<Reply> for ReplyCodec {
    type Error = crate::Error;

    fn encode(&mut self, reply: Reply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        reply.encode(dst);
        Ok(())
    }
}

fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let buffer: &'a [u8] = *src.get_ref();

    let end = buffer[start..]
        .windows(2)
        .position(|window| window == CRLF)
        .map(|index| start + index)
        .ok_or(Error::Incomplete)?;

    src.set_position((end + CRLF.len()) as u64);

    Ok(&buffer[start..end])
}

fn get_integer(src: &mut Cursor<&[u8]>) -> Result<i64, Error> {
    let line = get_line(src)?;
    parse_integer(line).ok_or_else(|| "protocol error; invalid integer".into())
}

fn get_exact<'a>(src: &mut Cursor<&'a [u8]>, length: i64) -> Result<&'a [u8], Error> {
    if length < 0 {
        return Err("protocol error; invalid bulk length".into());
    }

    let start = src.position() as usize;
    let end = start.saturating_add(length as usize);
    let buffer: &'a [u8] = *src.get_ref();

    if buffer.len() < end.saturating_add(CRLF.len()) {
        return Err(Error::Incomplete);
    }
    if &buffer[end..end + CRLF.len()] != CRLF {
        return Err("protocol error; bulk length does not match the data".into());
    }

    src.set_position((end + CRLF.len()) as u64);

    Ok(&buffer[start..end])
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

#[derive(Debug)]
enum DataType {
    SimpleString, // '+'
    SimpleError,  // '-'
    Integer,      // ':'
    BulkString,   // '$'
    Array,        // '*'
    Null,         // '_'
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'*' => Ok(Self::Array),
            b'_' => Ok(Self::Null),
            _ => Err(Error::InvalidDataType(byte)),
        }
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_src: std::string::FromUtf8Error) -> Error {
        "protocol error; invalid frame format".into()
    }
}

impl From<&str> for Error {
    fn from(src: &str) -> Error {
        src.to_string().into()
    }
}

impl From<String> for Error {
    fn from(src: String) -> Error {
        Error::Other(src.into())
    }
}
