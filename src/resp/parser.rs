use super::{RespError, RespValue};

/// Decode one frame from the front of `buf`, reporting how many bytes it
/// occupied on the wire. `Incomplete` means the caller should read more
/// bytes and retry with the same buffer; `Malformed` means the peer broke
/// protocol. Callers slide their streaming buffer by exactly the returned
/// count.
pub fn decode(buf: &[u8]) -> Result<(RespValue, usize), RespError> {
    if buf.is_empty() {
        return Err(RespError::Incomplete);
    }

    match buf[0] {
        b'+' => {
            let (line, next) = read_line(buf, 1)?;
            Ok((RespValue::SimpleString(line.to_vec()), next))
        }
        b'-' => {
            let (line, next) = read_line(buf, 1)?;
            Ok((RespValue::SimpleError(line.to_vec()), next))
        }
        b':' => {
            let (line, next) = read_line(buf, 1)?;
            let value = parse_int(line)?;
            Ok((RespValue::Integer(value), next))
        }
        b'$' => decode_bulk_string(buf),
        b'*' => decode_array(buf),
        other => Err(RespError::Malformed(format!(
            "unknown type byte 0x{:02x}",
            other
        ))),
    }
}

fn decode_bulk_string(buf: &[u8]) -> Result<(RespValue, usize), RespError> {
    let (line, data_start) = read_line(buf, 1)?;
    let len = parse_int(line)?;
    if len == -1 {
        return Ok((RespValue::NullBulkString, data_start));
    }
    if len < 0 {
        return Err(RespError::Malformed(format!(
            "invalid bulk string length {}",
            len
        )));
    }

    let len = len as usize;
    let end = data_start + len;
    if buf.len() < end + 2 {
        return Err(RespError::Incomplete);
    }
    if &buf[end..end + 2] != b"\r\n" {
        return Err(RespError::Malformed(
            "bulk string payload not terminated by CRLF".to_string(),
        ));
    }

    Ok((RespValue::BulkString(buf[data_start..end].to_vec()), end + 2))
}

fn decode_array(buf: &[u8]) -> Result<(RespValue, usize), RespError> {
    let (line, mut pos) = read_line(buf, 1)?;
    let count = parse_int(line)?;
    if count < 0 {
        return Err(RespError::Malformed(format!(
            "invalid array length {}",
            count
        )));
    }

    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (item, consumed) = decode(&buf[pos..])?;
        items.push(item);
        pos += consumed;
    }
    Ok((RespValue::Array(items), pos))
}

/// Read a CRLF-terminated line starting at `start`. Returns the line body
/// (without CRLF) and the index just past the terminator.
fn read_line(buf: &[u8], start: usize) -> Result<(&[u8], usize), RespError> {
    let mut i = start;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' {
            if buf[i + 1] != b'\n' {
                return Err(RespError::Malformed("expected LF after CR".to_string()));
            }
            return Ok((&buf[start..i], i + 2));
        }
        i += 1;
    }
    Err(RespError::Incomplete)
}

fn parse_int(line: &[u8]) -> Result<i64, RespError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| RespError::Malformed("non-ascii integer".to_string()))?;
    text.parse::<i64>()
        .map_err(|_| RespError::Malformed(format!("invalid integer '{}'", text)))
}
