//! Record codec
//!
//! A record payload is a varint header length, a sequence of serial-type
//! varints, then the concatenated column bodies. The decoder yields
//! [`ColumnValue`] views over the payload; text and blob bodies are spans
//! into the input and stay valid only while the producing cursor holds its
//! position.

use crate::error::{Error, Result};
use crate::storage::btree::encoding::{read_varint, write_varint};
use crate::types::{ColumnValue, Value};

// ============================================================================
// Serial Types
// ============================================================================

/// Body length in bytes for a serial type.
pub fn serial_type_len(serial: u64) -> Result<usize> {
    match serial {
        0 | 8 | 9 => Ok(0),
        1 => Ok(1),
        2 => Ok(2),
        3 => Ok(3),
        4 => Ok(4),
        5 => Ok(6),
        6 | 7 => Ok(8),
        10 | 11 => Err(Error::CorruptRecord("reserved serial type")),
        n => Ok((n as usize - 12) / 2),
    }
}

/// Sign-extend a big-endian integer body of 1..=8 bytes.
fn decode_int(body: &[u8]) -> i64 {
    let mut v: i64 = if body[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in body {
        v = (v << 8) | b as i64;
    }
    v
}

/// Decode one column body for `serial`.
fn decode_value(serial: u64, body: &[u8]) -> ColumnValue<'_> {
    match serial {
        0 => ColumnValue::Null,
        1..=6 => ColumnValue::Integer(decode_int(body)),
        7 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(body);
            ColumnValue::Real(f64::from_be_bytes(raw))
        }
        8 => ColumnValue::Integer(0),
        9 => ColumnValue::Integer(1),
        n if n % 2 == 0 => ColumnValue::Blob(body),
        _ => ColumnValue::Text(body),
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Decode a record payload into per-column views.
pub fn decode_record(payload: &[u8]) -> Result<Vec<ColumnValue<'_>>> {
    let (header_len, mut header_pos) = read_varint(payload, 0)?;
    let header_len = header_len as usize;
    if header_len > payload.len() || header_len < header_pos {
        return Err(Error::CorruptRecord("header length out of range"));
    }
    let mut body_pos = header_len;
    let mut values = Vec::new();
    while header_pos < header_len {
        let (serial, n) = read_varint(payload, header_pos)?;
        header_pos += n;
        let len = serial_type_len(serial)?;
        if body_pos + len > payload.len() {
            return Err(Error::CorruptRecord("column body truncated"));
        }
        values.push(decode_value(serial, &payload[body_pos..body_pos + len]));
        body_pos += len;
    }
    Ok(values)
}

/// Number of columns in a record, without decoding bodies.
pub fn record_column_count(payload: &[u8]) -> Result<usize> {
    let (header_len, mut pos) = read_varint(payload, 0)?;
    let header_len = header_len as usize;
    if header_len > payload.len() || header_len < pos {
        return Err(Error::CorruptRecord("header length out of range"));
    }
    let mut count = 0;
    while pos < header_len {
        let (serial, n) = read_varint(payload, pos)?;
        serial_type_len(serial)?;
        pos += n;
        count += 1;
    }
    Ok(count)
}

// ============================================================================
// Encoder
// ============================================================================

/// Smallest serial type representing `v`.
fn int_serial(v: i64) -> (u64, usize) {
    match v {
        0 => (8, 0),
        1 => (9, 0),
        -128..=127 => (1, 1),
        -32768..=32767 => (2, 2),
        -8_388_608..=8_388_607 => (3, 3),
        -2_147_483_648..=2_147_483_647 => (4, 4),
        -140_737_488_355_328..=140_737_488_355_327 => (5, 6),
        _ => (6, 8),
    }
}

/// Encode owned values into record payload form.
pub fn encode_record(values: &[Value]) -> Vec<u8> {
    let mut serials = Vec::with_capacity(values.len());
    let mut body = Vec::new();
    for v in values {
        match v {
            Value::Null => serials.push(0u64),
            Value::Integer(i) => {
                let (serial, width) = int_serial(*i);
                serials.push(serial);
                let raw = i.to_be_bytes();
                body.extend_from_slice(&raw[8 - width..]);
            }
            Value::Real(f) => {
                serials.push(7);
                body.extend_from_slice(&f.to_be_bytes());
            }
            Value::Text(s) => {
                serials.push(13 + 2 * s.len() as u64);
                body.extend_from_slice(s.as_bytes());
            }
            Value::Blob(b) => {
                serials.push(12 + 2 * b.len() as u64);
                body.extend_from_slice(b);
            }
        }
    }
    // Header length varint counts itself; iterate to the fixpoint.
    let serial_bytes: usize = serials
        .iter()
        .map(|&s| crate::storage::btree::encoding::varint_len(s))
        .sum();
    let mut header_len = serial_bytes + 1;
    loop {
        let next = serial_bytes + crate::storage::btree::encoding::varint_len(header_len as u64);
        if next == header_len {
            break;
        }
        header_len = next;
    }
    let mut out = Vec::with_capacity(header_len + body.len());
    write_varint(header_len as u64, &mut out);
    for s in serials {
        write_varint(s, &mut out);
    }
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(values: Vec<Value>) {
        let payload = encode_record(&values);
        let decoded: Vec<Value> = decode_record(&payload)
            .unwrap()
            .iter()
            .map(|c| c.to_value())
            .collect();
        assert_eq!(values, decoded);
    }

    #[test]
    fn test_record_roundtrip() {
        roundtrip(vec![
            Value::Null,
            Value::Integer(0),
            Value::Integer(1),
            Value::Integer(-42),
            Value::Integer(1 << 40),
            Value::Real(2.5),
            Value::Text("hello".into()),
            Value::Blob(vec![0xde, 0xad, 0xbe, 0xef]),
        ]);
    }

    #[test]
    fn test_roundtrip_wide_text() {
        roundtrip(vec![Value::Text("x".repeat(300))]);
    }

    #[test]
    fn test_integer_widths_sign_extend() {
        for v in [-1i64, -129, 127, 128, i64::MIN, i64::MAX] {
            roundtrip(vec![Value::Integer(v)]);
        }
    }

    #[test]
    fn test_reserved_serial_type_rejected() {
        // Header: length 2, serial type 10.
        let payload = [2u8, 10u8];
        assert!(matches!(
            decode_record(&payload),
            Err(Error::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_truncated_body_rejected() {
        // Declares a 4-byte integer with no body.
        let payload = [2u8, 4u8];
        assert!(matches!(
            decode_record(&payload),
            Err(Error::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_column_count_matches_decode() {
        let payload = encode_record(&[Value::Integer(5), Value::Null, Value::Text("a".into())]);
        assert_eq!(record_column_count(&payload).unwrap(), 3);
    }
}
