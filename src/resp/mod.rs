mod parser;

pub use parser::decode;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RespError {
    /// The buffer does not yet hold a complete frame. Read more bytes and retry.
    #[error("incomplete frame")]
    Incomplete,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// A single RESP2 frame. Payloads are raw bytes; keys and values are
/// binary-safe and never forced through UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(Vec<u8>),
    SimpleError(Vec<u8>),
    Integer(i64),
    BulkString(Vec<u8>),
    NullBulkString,
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple(s: &str) -> Self {
        RespValue::SimpleString(s.as_bytes().to_vec())
    }

    pub fn error(s: &str) -> Self {
        RespValue::SimpleError(s.as_bytes().to_vec())
    }

    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        RespValue::BulkString(data.into())
    }

    /// Serialize the frame to its on-wire byte form. Round-trips with
    /// `decode`: `decode(&f.encode()) == Ok((f, f.encode().len()))`.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            RespValue::SimpleString(s) => {
                let mut out = Vec::with_capacity(s.len() + 3);
                out.push(b'+');
                out.extend_from_slice(s);
                out.extend_from_slice(b"\r\n");
                out
            }
            RespValue::SimpleError(e) => {
                let mut out = Vec::with_capacity(e.len() + 3);
                out.push(b'-');
                out.extend_from_slice(e);
                out.extend_from_slice(b"\r\n");
                out
            }
            RespValue::Integer(i) => format!(":{}\r\n", i).into_bytes(),
            RespValue::BulkString(data) => {
                let mut out = format!("${}\r\n", data.len()).into_bytes();
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
                out
            }
            RespValue::NullBulkString => b"$-1\r\n".to_vec(),
            RespValue::Array(items) => {
                let mut out = format!("*{}\r\n", items.len()).into_bytes();
                for item in items {
                    out.extend_from_slice(&item.encode());
                }
                out
            }
        }
    }

    /// Borrow the payload of a bulk or simple string frame.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::SimpleString(s) | RespValue::BulkString(s) => Some(s),
            _ => None,
        }
    }
}

/// Build the RESP array-of-bulk-strings form every command travels as.
pub fn command_array<I, T>(parts: I) -> RespValue
where
    I: IntoIterator<Item = T>,
    T: Into<Vec<u8>>,
{
    RespValue::Array(parts.into_iter().map(|p| RespValue::bulk(p)).collect())
}
