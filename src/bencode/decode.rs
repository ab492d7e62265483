//! Bencode decoder
//!
//! Recursive-descent parser over a byte slice with explicit positions.

use anyhow::Result;
use tracing::{trace, warn};

use crate::bencode::value::{BencodeDict, BencodeValue};
use crate::error::TorrentError;

/// Containers nested deeper than this are rejected
pub const MAX_DEPTH: usize = 64;

/// Decode a single value, ignoring any trailing bytes
pub fn decode(data: &[u8]) -> Result<BencodeValue> {
    let (value, end) = decode_at(data, 0)?;

    if end != data.len() {
        warn!("Ignoring {} trailing bytes after bencoded value", data.len() - end);
    }

    Ok(value)
}

/// Decode the value starting at `position`, returning it with the position just past it
pub fn decode_at(data: &[u8], position: usize) -> Result<(BencodeValue, usize)> {
    let mut pos = position;
    let value = decode_value(data, &mut pos, 0)?;
    trace!("Decoded {} from bytes {}..{}", value.type_name(), position, pos);
    Ok((value, pos))
}

fn decode_value(data: &[u8], pos: &mut usize, depth: usize) -> Result<BencodeValue> {
    let tag = *data
        .get(*pos)
        .ok_or(TorrentError::UnexpectedEndOfInput { position: *pos })?;

    match tag {
        b'0'..=b'9' => decode_bytes(data, pos).map(BencodeValue::Bytes),
        b'i' => decode_integer(data, pos),
        b'l' => decode_list(data, pos, depth),
        b'd' => decode_dict(data, pos, depth),
        _ => Err(TorrentError::UnsupportedTag { position: *pos, tag }.into()),
    }
}

fn decode_bytes(data: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let start = *pos;
    let mut len: usize = 0;

    loop {
        match data.get(*pos) {
            Some(b':') => break,
            Some(&b) if b.is_ascii_digit() => {
                len = len
                    .checked_mul(10)
                    .and_then(|l| l.checked_add((b - b'0') as usize))
                    .ok_or_else(|| TorrentError::MalformedLength {
                        position: start,
                        message: "length overflows".to_string(),
                    })?;
                *pos += 1;
            }
            Some(&b) => {
                return Err(TorrentError::MalformedLength {
                    position: *pos,
                    message: format!("unexpected byte 0x{:02x} in length", b),
                }
                .into());
            }
            None => {
                return Err(TorrentError::MalformedLength {
                    position: start,
                    message: "no ':' after length".to_string(),
                }
                .into());
            }
        }
    }

    // skip ':'
    *pos += 1;

    let end = pos
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| TorrentError::MalformedLength {
            position: start,
            message: format!("declared length {} overruns input of {} bytes", len, data.len()),
        })?;

    let bytes = data[*pos..end].to_vec();
    *pos = end;
    Ok(bytes)
}

fn decode_integer(data: &[u8], pos: &mut usize) -> Result<BencodeValue> {
    let start = *pos;
    *pos += 1;

    let body_start = *pos;
    while *pos < data.len() && data[*pos] != b'e' {
        *pos += 1;
    }
    if *pos >= data.len() {
        return Err(TorrentError::UnexpectedEndOfInput { position: *pos }.into());
    }

    let body = &data[body_start..*pos];
    let malformed = |message: &str| TorrentError::MalformedInteger {
        position: start,
        message: message.to_string(),
    };

    let digits = body.strip_prefix(b"-").unwrap_or(body);
    if digits.is_empty() {
        return Err(malformed("empty integer").into());
    }
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(malformed("non-digit content").into());
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(malformed("leading zeros").into());
    }
    if body.starts_with(b"-0") {
        return Err(malformed("negative zero").into());
    }

    // body is ASCII by now
    let text = std::str::from_utf8(body).map_err(|_| malformed("non-digit content"))?;
    let value: i64 = text.parse().map_err(|_| malformed("out of range for i64"))?;

    // skip 'e'
    *pos += 1;
    Ok(BencodeValue::Integer(value))
}

fn enter_container(pos: usize, depth: usize) -> Result<()> {
    if depth >= MAX_DEPTH {
        return Err(TorrentError::NestingTooDeep { position: pos }.into());
    }
    Ok(())
}

fn decode_list(data: &[u8], pos: &mut usize, depth: usize) -> Result<BencodeValue> {
    enter_container(*pos, depth)?;
    *pos += 1;

    let mut items = Vec::new();
    loop {
        match data.get(*pos) {
            None => return Err(TorrentError::UnexpectedEndOfInput { position: *pos }.into()),
            Some(b'e') => break,
            Some(_) => items.push(decode_value(data, pos, depth + 1)?),
        }
    }

    *pos += 1;
    Ok(BencodeValue::List(items))
}

fn decode_dict(data: &[u8], pos: &mut usize, depth: usize) -> Result<BencodeValue> {
    enter_container(*pos, depth)?;
    *pos += 1;

    let mut dict = BencodeDict::new();
    loop {
        match data.get(*pos) {
            None => return Err(TorrentError::UnexpectedEndOfInput { position: *pos }.into()),
            Some(b'e') => break,
            Some(b) if b.is_ascii_digit() => {
                let key = decode_bytes(data, pos)?;
                let value = decode_value(data, pos, depth + 1)?;
                // duplicate keys: the last occurrence wins
                dict.insert(key, value);
            }
            Some(_) => return Err(TorrentError::NonStringKey { position: *pos }.into()),
        }
    }

    *pos += 1;
    Ok(BencodeValue::Dict(dict))
}
