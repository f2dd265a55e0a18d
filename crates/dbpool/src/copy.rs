//! Encoder for the PostgreSQL binary COPY format.
//!
//! sqlx exposes the raw COPY data channel but not a row encoder, so the
//! pool encodes tuples itself: the 19-byte signature header, a 16-bit
//! field count per tuple, a big-endian 32-bit length (-1 for NULL)
//! followed by the field payload, and a -1 field-count trailer.

use crate::error::DbError;
use crate::value::Value;
use chrono::{DateTime, TimeZone, Utc};

const SIGNATURE: &[u8] = b"PGCOPY\n\xff\r\n\0";

fn pg_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()
}

fn push_field(out: &mut Vec<u8>, v: &Value) -> Result<(), DbError> {
    match v {
        Value::Null(_) => out.extend_from_slice(&(-1i32).to_be_bytes()),
        Value::Int(i) => {
            out.extend_from_slice(&4i32.to_be_bytes());
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::BigInt(i) => {
            out.extend_from_slice(&8i32.to_be_bytes());
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::Bool(b) => {
            out.extend_from_slice(&1i32.to_be_bytes());
            out.push(if *b { 1 } else { 0 });
        }
        Value::Text(s) => {
            out.extend_from_slice(&(s.len() as i32).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            out.extend_from_slice(&(b.len() as i32).to_be_bytes());
            out.extend_from_slice(b);
        }
        Value::Timestamp(t) => {
            let micros = (*t - pg_epoch())
                .num_microseconds()
                .ok_or_else(|| DbError::Decode("timestamp out of range for COPY".to_string()))?;
            out.extend_from_slice(&8i32.to_be_bytes());
            out.extend_from_slice(&micros.to_be_bytes());
        }
        Value::IntArray(_) => {
            return Err(DbError::Decode(
                "array binds are not supported in COPY streams".to_string(),
            ));
        }
    }
    Ok(())
}

pub(crate) fn encode_copy_rows(rows: &[Vec<Value>]) -> Result<Vec<u8>, DbError> {
    let mut out = Vec::with_capacity(32 + rows.len() * 32);
    out.extend_from_slice(SIGNATURE);
    out.extend_from_slice(&0i32.to_be_bytes()); // flags
    out.extend_from_slice(&0i32.to_be_bytes()); // header extension length
    for row in rows {
        out.extend_from_slice(&(row.len() as i16).to_be_bytes());
        for field in row {
            push_field(&mut out, field)?;
        }
    }
    out.extend_from_slice(&(-1i16).to_be_bytes());
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encodes_header_and_trailer() {
        let data = encode_copy_rows(&[]).unwrap();
        assert_eq!(&data[..11], SIGNATURE);
        assert_eq!(&data[11..19], &[0u8; 8]);
        assert_eq!(&data[19..], &(-1i16).to_be_bytes());
    }

    #[test]
    fn encodes_typed_fields() {
        let rows = vec![vec![
            Value::Int(7),
            Value::Text("ab".to_string()),
            Value::Null(crate::value::NullKind::Text),
        ]];
        let data = encode_copy_rows(&rows).unwrap();
        let body = &data[19..data.len() - 2];
        let mut expect = Vec::new();
        expect.extend_from_slice(&3i16.to_be_bytes());
        expect.extend_from_slice(&4i32.to_be_bytes());
        expect.extend_from_slice(&7i32.to_be_bytes());
        expect.extend_from_slice(&2i32.to_be_bytes());
        expect.extend_from_slice(b"ab");
        expect.extend_from_slice(&(-1i32).to_be_bytes());
        assert_eq!(body, expect.as_slice());
    }

    #[test]
    fn rejects_array_binds() {
        let rows = vec![vec![Value::IntArray(vec![1, 2])]];
        assert!(encode_copy_rows(&rows).is_err());
    }
}
