// https://redis.io/docs/reference/protocol-spec

use std::error::Error as StdError;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::backend::{BackendError, BackendFuture};
use crate::deferred::Deferred;

pub(crate) static CRLF: &[u8; 2] = b"\r\n";

/// A value sent back to a client.
///
/// Everything but [`Reply::Deferred`] is terminal and can be written to the wire as is. A deferred
/// reply stands for a value that is computed later, either lazily or by a backend completion, and
/// resolves to exactly one terminal reply.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Status(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Error(String),
    Array(Option<Vec<Reply>>),
    Deferred(Deferred),
}

impl Reply {
    pub fn ok() -> Reply {
        Reply::Status("OK".to_string())
    }

    pub fn status(status: impl Into<String>) -> Reply {
        Reply::Status(status.into())
    }

    pub fn integer(value: i64) -> Reply {
        Reply::Integer(value)
    }

    pub fn bulk(value: impl Into<Bytes>) -> Reply {
        Reply::Bulk(Some(value.into()))
    }

    /// The null bulk string, `$-1`.
    pub fn null() -> Reply {
        Reply::Bulk(None)
    }

    /// The null array, `*-1`.
    pub fn null_array() -> Reply {
        Reply::Array(None)
    }

    pub fn array(items: Vec<Reply>) -> Reply {
        Reply::Array(Some(items))
    }

    /// An array of bulk strings, the shape every request takes on the wire.
    pub fn command<I>(tokens: I) -> Reply
    where
        I: IntoIterator<Item = Bytes>,
    {
        Reply::array(tokens.into_iter().map(Reply::bulk).collect())
    }

    /// Builds an error reply. Messages that do not start with an upper-case error code get the
    /// generic `ERR` prefix.
    pub fn error(message: impl Into<String>) -> Reply {
        let message = message.into();
        if has_error_code(&message) {
            Reply::Error(message)
        } else {
            Reply::Error(format!("ERR {}", message))
        }
    }

    /// Builds an error reply out of the root cause of `err`.
    pub fn from_error(err: &(dyn StdError + 'static)) -> Reply {
        let mut root = err;
        while let Some(source) = root.source() {
            root = source;
        }

        Reply::error(root.to_string())
    }

    /// A reply computed on first access, off the connection task when the lazy pool has room.
    pub fn lazy<F>(compute: F) -> Reply
    where
        F: FnOnce() -> Reply + Send + 'static,
    {
        Reply::Deferred(Deferred::lazy(compute))
    }

    /// A reply completed once the backend call `fut` finishes. Its output is turned into a reply
    /// by `convert`; backend failures become error replies.
    pub fn future<T, F>(fut: BackendFuture<T>, convert: F) -> Reply
    where
        T: Send + 'static,
        F: FnOnce(T) -> Reply + Send + 'static,
    {
        Reply::Deferred(Deferred::spawn(async move {
            match fut.await {
                Ok(value) => convert(value),
                Err(err) => backend_error(err),
            }
        }))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Serializes the reply onto `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Reply::Status(s) => {
                dst.put_u8(b'+');
                put_line(dst, s);
            }
            Reply::Error(s) => {
                dst.put_u8(b'-');
                put_line(dst, s);
            }
            Reply::Integer(i) => {
                dst.put_u8(b':');
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            Reply::Bulk(Some(bytes)) => {
                dst.reserve(1 + 20 + CRLF.len() + bytes.len() + CRLF.len());
                dst.put_u8(b'$');
                dst.extend_from_slice(bytes.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(bytes);
                dst.extend_from_slice(CRLF);
            }
            Reply::Bulk(None) => dst.extend_from_slice(b"$-1\r\n"),
            Reply::Array(Some(items)) => {
                dst.put_u8(b'*');
                dst.extend_from_slice(items.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for item in items {
                    item.encode(dst);
                }
            }
            Reply::Array(None) => dst.extend_from_slice(b"*-1\r\n"),
            Reply::Deferred(deferred) => match deferred.force() {
                Some(reply) => reply.encode(dst),
                None => Reply::error("ERR reply is not ready").encode(dst),
            },
        }
    }

    pub fn serialize(&self) -> Bytes {
        let mut dst = BytesMut::new();
        self.encode(&mut dst);
        dst.freeze()
    }
}

impl From<Reply> for Bytes {
    fn from(reply: Reply) -> Self {
        reply.serialize()
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "+{}", s),
            Reply::Error(s) => write!(f, "-{}", s),
            Reply::Integer(i) => write!(f, ":{}", i),
            Reply::Bulk(Some(bytes)) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Reply::Bulk(None) => write!(f, "$-1"),
            Reply::Array(Some(items)) => {
                write!(f, "*{}", items.len())?;
                for item in items {
                    write!(f, " {}", item)?;
                }
                Ok(())
            }
            Reply::Array(None) => write!(f, "*-1"),
            Reply::Deferred(deferred) => match deferred.peek() {
                Some(reply) => write!(f, "{}", reply),
                None => write!(f, "<deferred>"),
            },
        }
    }
}

fn backend_error(err: BackendError) -> Reply {
    match err {
        // Errors sent by the store are relayed untouched.
        BackendError::Server(message) => Reply::Error(message),
        err => Reply::from_error(&err),
    }
}

fn has_error_code(message: &str) -> bool {
    message
        .split(' ')
        .next()
        .map_or(false, |code| {
            !code.is_empty() && code.bytes().all(|b| b.is_ascii_uppercase())
        })
}

// Status and error lines cannot carry line breaks.
fn put_line(dst: &mut BytesMut, line: &str) {
    dst.extend(
        line.bytes()
            .map(|b| if b == b'\r' || b == b'\n' { b' ' } else { b }),
    );
    dst.extend_from_slice(CRLF);
}
