use base64::engine::general_purpose;
use base64::Engine;
use log::{error, info};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::redis::storage::{Storage, StoredValue, ValueEncoding};

/// Canonical empty RDB snapshot (version 0011), served to PSYNC when the
/// server has nothing else to offer.
const EMPTY_RDB_BASE64: &str = "UkVESVMwMDEx+glyZWRpcy12ZXIFNy4yLjD6CnJlZGlzLWJpdHPAQPoFY3RpbWXCbQi8ZfoIdXNlZC1tZW3CsMQQAPoIYW9mLWJhc2XAAP/wbjv+wP9aog==";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RdbError {
    #[error("invalid magic bytes {0:?}")]
    InvalidMagicByte(Vec<u8>),
    #[error("invalid version number {0:?}")]
    InvalidVersionNumber(Vec<u8>),
    #[error("unexpected end of buffer at offset {at}")]
    UnexpectedEof { at: usize },
    #[error("unknown encoding: {0}")]
    UnknownEncoding(String),
    #[error("LZF-compressed strings are not supported")]
    CompressedStringUnsupported,
}

/// The result of parsing one RDB stream. Pure data; installing `db` into a
/// `Storage` is the caller's business.
#[derive(Debug, Default)]
pub struct ParsedRdb {
    pub version: u32,
    pub aux: HashMap<Vec<u8>, Vec<u8>>,
    pub selectdb: Option<u64>,
    pub db_ht_size: Option<u64>,
    pub exp_ht_size: Option<u64>,
    pub db: HashMap<Vec<u8>, StoredValue>,
    pub checksum: Vec<u8>,
}

/// A string read from the stream, tagged with how it was encoded so callers
/// can tell real byte strings from the packed-integer shorthand.
enum RdbString {
    Raw(Vec<u8>),
    Integer(i64),
}

impl RdbString {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            RdbString::Raw(bytes) => bytes,
            RdbString::Integer(value) => value.to_string().into_bytes(),
        }
    }
}

/// Streaming reader over an in-memory RDB image. Every accessor fails with
/// the byte offset where data ran out.
struct RdbReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RdbReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        RdbReader { buf, pos: 0 }
    }

    fn read(&mut self, count: usize) -> Result<&'a [u8], RdbError> {
        if self.pos + count > self.buf.len() {
            return Err(RdbError::UnexpectedEof { at: self.pos });
        }
        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, RdbError> {
        Ok(self.read(1)?[0])
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

pub struct RdbParser;

impl RdbParser {
    /// Parse a complete RDB image. No side effects; errors abort the parse.
    pub fn parse(buf: &[u8]) -> Result<ParsedRdb, RdbError> {
        let mut reader = RdbReader::new(buf);
        let mut parsed = ParsedRdb {
            version: Self::parse_header(&mut reader)?,
            ..ParsedRdb::default()
        };

        loop {
            if reader.is_eof() {
                // stream ended without the 0xFF marker; accept what we have
                break;
            }
            let opcode = reader.read_u8()?;
            match opcode {
                0xFA => {
                    let key = Self::read_string(&mut reader)?.into_bytes();
                    let value = Self::read_string(&mut reader)?.into_bytes();
                    parsed.aux.insert(key, value);
                }
                0xFE => {
                    parsed.selectdb = Some(Self::read_length(&mut reader, None)?);
                }
                0xFB => {
                    parsed.db_ht_size = Some(Self::read_length(&mut reader, None)?);
                    parsed.exp_ht_size = Some(Self::read_length(&mut reader, None)?);
                }
                0xFD => {
                    let seconds = u32::from_le_bytes(
                        reader.read(4)?.try_into().expect("4-byte read"),
                    );
                    let expiry_ms = seconds as u64 * 1000;
                    let (key, value) = Self::read_key_value(&mut reader, Some(expiry_ms))?;
                    parsed.db.insert(key, value);
                }
                0xFC => {
                    let expiry_ms = u64::from_le_bytes(
                        reader.read(8)?.try_into().expect("8-byte read"),
                    );
                    let (key, value) = Self::read_key_value(&mut reader, Some(expiry_ms))?;
                    parsed.db.insert(key, value);
                }
                0xFF => {
                    parsed.checksum = reader.read(8)?.to_vec();
                    break;
                }
                value_type => {
                    // untagged key/value pair; the opcode is the value type
                    let (key, value) =
                        Self::read_tagged_key_value(&mut reader, value_type, None)?;
                    parsed.db.insert(key, value);
                }
            }
        }

        Ok(parsed)
    }

    fn parse_header(reader: &mut RdbReader) -> Result<u32, RdbError> {
        let magic = reader.read(5)?;
        if magic != b"REDIS" {
            return Err(RdbError::InvalidMagicByte(magic.to_vec()));
        }
        let version = reader.read(4)?;
        std::str::from_utf8(version)
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| RdbError::InvalidVersionNumber(version.to_vec()))
    }

    fn read_key_value(
        reader: &mut RdbReader,
        expiry_ms: Option<u64>,
    ) -> Result<(Vec<u8>, StoredValue), RdbError> {
        let value_type = reader.read_u8()?;
        Self::read_tagged_key_value(reader, value_type, expiry_ms)
    }

    fn read_tagged_key_value(
        reader: &mut RdbReader,
        value_type: u8,
        expiry_ms: Option<u64>,
    ) -> Result<(Vec<u8>, StoredValue), RdbError> {
        let encoding = ValueEncoding::try_from(value_type)
            .map_err(|b| RdbError::UnknownEncoding(format!("{} is not a valid value type", b)))?;
        let key = Self::read_string(reader)?.into_bytes();
        let raw = Self::read_string(reader)?.into_bytes();
        Ok((key, StoredValue::with_encoding(raw, expiry_ms, encoding)))
    }

    /// Length encoding: the top two bits of the first byte select the
    /// scheme. The `0b11` prefix marks the special string encodings and is
    /// rejected here; `read_string` handles it.
    fn read_length(reader: &mut RdbReader, first_byte: Option<u8>) -> Result<u64, RdbError> {
        let first = match first_byte {
            Some(byte) => byte,
            None => reader.read_u8()?,
        };
        let prefix = first >> 6;
        let suffix = (first & 0x3F) as u64;

        match prefix {
            0b00 => Ok(suffix),
            0b01 => Ok(suffix << 8 | reader.read_u8()? as u64),
            0b10 => {
                if suffix == 0 {
                    let bytes = reader.read(4)?;
                    Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte read")) as u64)
                } else {
                    let bytes = reader.read(8)?;
                    Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte read")))
                }
            }
            _ => Err(RdbError::UnknownEncoding(
                "special encoding is not a plain length".to_string(),
            )),
        }
    }

    /// String encoding: a length prefix followed by that many bytes, or one
    /// of the packed-integer shorthands under the `0b11` prefix.
    fn read_string(reader: &mut RdbReader) -> Result<RdbString, RdbError> {
        let first = reader.read_u8()?;
        let prefix = first >> 6;
        let suffix = first & 0x3F;

        if prefix == 0b11 {
            return match suffix {
                0 => Ok(RdbString::Integer(reader.read_u8()? as i8 as i64)),
                1 => {
                    let bytes = reader.read(2)?;
                    Ok(RdbString::Integer(
                        i16::from_le_bytes(bytes.try_into().expect("2-byte read")) as i64,
                    ))
                }
                2 => {
                    let bytes = reader.read(4)?;
                    Ok(RdbString::Integer(
                        i32::from_le_bytes(bytes.try_into().expect("4-byte read")) as i64,
                    ))
                }
                3 => Err(RdbError::CompressedStringUnsupported),
                other => Err(RdbError::UnknownEncoding(format!(
                    "string encoding suffix {} is not length encoded",
                    other
                ))),
            };
        }

        let length = Self::read_length(reader, Some(first))? as usize;
        Ok(RdbString::Raw(reader.read(length)?.to_vec()))
    }
}

/// Loads snapshots into storage and produces the snapshot blob served to
/// replicas. RDB writing beyond the canonical empty image is not supported.
pub struct RdbManager;

impl RdbManager {
    /// Restore the keyspace from `<dir>/<dbfilename>`. A missing file means
    /// an empty database; a corrupt file is logged and also leaves the
    /// store empty. Startup continues in both cases.
    pub fn restore_from_file(dir: &str, dbfilename: &str, storage: &Storage) {
        let path = Path::new(dir).join(dbfilename);
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("RDB file {:?} does not exist, starting empty", path);
                return;
            }
            Err(e) => {
                error!("failed to read RDB file {:?}: {}", path, e);
                return;
            }
        };

        Self::restore_from_snapshot(&buf, storage);
    }

    /// Install the keyspace of a snapshot image into storage.
    pub fn restore_from_snapshot(buf: &[u8], storage: &Storage) {
        match RdbParser::parse(buf) {
            Ok(parsed) => {
                info!(
                    "restored {} keys from RDB snapshot (version {})",
                    parsed.db.len(),
                    parsed.version
                );
                storage.restore(parsed.db);
            }
            Err(e) => {
                error!("failed to restore snapshot: {}", e);
            }
        }
    }

    /// The canonical empty snapshot sent in the PSYNC reply when no real
    /// snapshot exists.
    pub fn empty_snapshot() -> Vec<u8> {
        general_purpose::STANDARD
            .decode(EMPTY_RDB_BASE64)
            .expect("embedded snapshot constant decodes")
    }
}
