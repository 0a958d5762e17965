// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Binary row codec for the remote cache.
//!
//! Columns are written in schema order with no header; the `cache_key`
//! already changes whenever the column list does. Per column:
//!
//! | kind                          | encoding                              |
//! |-------------------------------|---------------------------------------|
//! | ID, unsigned                  | LEB128 varint                         |
//! | signed                        | zigzag varint                         |
//! | bool                          | one byte                              |
//! | float                         | 8 bytes little endian                 |
//! | string, decimal, enum, set    | varint length + UTF-8                 |
//! | bytes                         | varint length + raw                   |
//! | date, datetime                | varint length + canonical text        |
//! | reference                     | varint, 0 = NULL                      |
//!
//! Other nullable columns carry a leading presence byte. An empty byte
//! string is never a valid row, which leaves it free as the tombstone.

use bytes::{Buf, BufMut};

use crate::error::OrmError;
use crate::schema::{ColumnDef, ColumnKind, EntitySchema, Row};
use crate::value::Value;

fn put_varint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8((v as u8) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

fn get_varint(buf: &mut &[u8]) -> Result<u64, OrmError> {
    let mut result = 0u64;
    for shift in (0..64).step_by(7) {
        if !buf.has_remaining() {
            return Err(OrmError::Codec("truncated varint".into()));
        }
        let byte = buf.get_u8();
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(OrmError::Codec("varint too long".into()))
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    put_varint(buf, data.len() as u64);
    buf.put_slice(data);
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, OrmError> {
    let len = get_varint(buf)?;
    if len > buf.remaining() as u64 {
        return Err(OrmError::Codec(format!("length {len} exceeds row")));
    }
    let mut out = vec![0; len as usize];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_string(buf: &mut &[u8]) -> Result<String, OrmError> {
    String::from_utf8(get_bytes(buf)?).map_err(|e| OrmError::Codec(e.to_string()))
}

fn mismatch(column: &ColumnDef, value: &Value) -> OrmError {
    OrmError::Codec(format!(
        "column {} cannot encode {} value",
        column.name,
        value.kind_name()
    ))
}

fn encode_value(buf: &mut Vec<u8>, column: &ColumnDef, value: &Value) -> Result<(), OrmError> {
    if let ColumnKind::Reference { .. } = column.kind {
        match value {
            Value::Nil => put_varint(buf, 0),
            Value::Uint(id) => put_varint(buf, *id),
            other => return Err(mismatch(column, other)),
        }
        return Ok(());
    }
    if column.nullable {
        if value.is_nil() {
            buf.put_u8(0);
            return Ok(());
        }
        buf.put_u8(1);
    }
    match (&column.kind, value) {
        (ColumnKind::Id | ColumnKind::Uint { .. }, Value::Uint(v)) => put_varint(buf, *v),
        (ColumnKind::Int { .. }, Value::Int(v)) => put_varint(buf, ((v << 1) ^ (v >> 63)) as u64),
        (ColumnKind::Bool, Value::Bool(b)) => buf.put_u8(u8::from(*b)),
        (ColumnKind::Float { .. }, Value::Float(f)) => buf.put_f64_le(*f),
        (
            ColumnKind::Decimal { .. } | ColumnKind::Str { .. } | ColumnKind::Enum(_) | ColumnKind::Set(_),
            Value::Str(s),
        ) => put_bytes(buf, s.as_bytes()),
        (ColumnKind::Bytes { .. }, Value::Bytes(b)) => put_bytes(buf, b),
        (ColumnKind::Date | ColumnKind::DateTime, Value::Time(_)) => {
            let text = column.render(value).unwrap_or_default();
            put_bytes(buf, text.as_bytes());
        }
        (_, other) => return Err(mismatch(column, other)),
    }
    Ok(())
}

fn decode_value(buf: &mut &[u8], column: &ColumnDef) -> Result<Value, OrmError> {
    if let ColumnKind::Reference { .. } = column.kind {
        return Ok(match get_varint(buf)? {
            0 => Value::Nil,
            id => Value::Uint(id),
        });
    }
    if column.nullable {
        if !buf.has_remaining() {
            return Err(OrmError::Codec("truncated row".into()));
        }
        match buf.get_u8() {
            0 => return Ok(Value::Nil),
            1 => {}
            flag => return Err(OrmError::Codec(format!("invalid null flag {flag}"))),
        }
    }
    let value = match &column.kind {
        ColumnKind::Id | ColumnKind::Uint { .. } => Value::Uint(get_varint(buf)?),
        ColumnKind::Int { .. } => {
            let raw = get_varint(buf)?;
            Value::Int(((raw >> 1) as i64) ^ -((raw & 1) as i64))
        }
        ColumnKind::Bool => {
            if !buf.has_remaining() {
                return Err(OrmError::Codec("truncated row".into()));
            }
            Value::Bool(buf.get_u8() != 0)
        }
        ColumnKind::Float { .. } => {
            if buf.remaining() < 8 {
                return Err(OrmError::Codec("truncated row".into()));
            }
            Value::Float(buf.get_f64_le())
        }
        ColumnKind::Decimal { .. } | ColumnKind::Str { .. } | ColumnKind::Enum(_) | ColumnKind::Set(_) => {
            Value::Str(get_string(buf)?)
        }
        ColumnKind::Bytes { .. } => Value::Bytes(get_bytes(buf)?),
        ColumnKind::Date | ColumnKind::DateTime => {
            return column.coerce(Value::Str(get_string(buf)?));
        }
        ColumnKind::Reference { .. } => unreachable!("handled above"),
    };
    Ok(value)
}

/// Encode a normalized row.
pub fn encode_row(schema: &EntitySchema, row: &[Value]) -> Result<Vec<u8>, OrmError> {
    if row.len() != schema.columns.len() {
        return Err(OrmError::Codec(format!(
            "{}: row has {} values for {} columns",
            schema.table_name,
            row.len(),
            schema.columns.len()
        )));
    }
    let mut buf = Vec::with_capacity(16 * row.len());
    for (column, value) in schema.columns.iter().zip(row) {
        encode_value(&mut buf, column, value)?;
    }
    Ok(buf)
}

/// Decode a row written by [`encode_row`] under the same schema.
pub fn decode_row(schema: &EntitySchema, data: &[u8]) -> Result<Row, OrmError> {
    let mut buf = data;
    let mut row = Vec::with_capacity(schema.columns.len());
    for column in &schema.columns {
        row.push(decode_value(&mut buf, column)?);
    }
    if buf.has_remaining() {
        return Err(OrmError::Codec(format!(
            "{}: {} trailing bytes",
            schema.table_name,
            buf.remaining()
        )));
    }
    Ok(row)
}
