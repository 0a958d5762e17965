// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Column setters.
//!
//! [`ColumnDef::normalize`] is the strict bind setter run on every value an
//! entity hands to the engine: it validates the value against the column
//! constraints and returns the one canonical [`Value`] variant for the
//! column kind. [`ColumnDef::coerce`] is its lenient counterpart for values
//! read back from the database, where drivers report types loosely.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Timelike};

use super::{ColumnDef, ColumnKind};
use crate::error::OrmError;
use crate::value::Value;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Round half away from zero to `precision` decimal places.
pub(crate) fn round_to(v: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    let rounded = (v * factor).round() / factor;
    // collapse -0.0 so equal values encode identically
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

fn int_range(bits: u8) -> (i64, i64) {
    match bits {
        8 => (i8::MIN.into(), i8::MAX.into()),
        16 => (i16::MIN.into(), i16::MAX.into()),
        32 => (i32::MIN.into(), i32::MAX.into()),
        _ => (i64::MIN, i64::MAX),
    }
}

fn uint_max(bits: u8) -> u64 {
    match bits {
        8 => u8::MAX.into(),
        16 => u16::MAX.into(),
        32 => u32::MAX.into(),
        _ => u64::MAX,
    }
}

fn parse_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(t) = NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT) {
        return Some(t.and_utc().fixed_offset());
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, DATE_FORMAT) {
        return d.and_hms_opt(0, 0, 0).map(|t| t.and_utc().fixed_offset());
    }
    DateTime::parse_from_rfc3339(raw).ok()
}

impl ColumnDef {
    fn reject(&self, reason: impl Into<String>) -> OrmError {
        OrmError::bind(&self.name, reason)
    }

    fn wrong_type(&self, value: &Value) -> OrmError {
        self.reject(format!("unsupported value type {}", value.kind_name()))
    }

    /// Validate `value` and return its canonical form.
    pub fn normalize(&self, value: Value) -> Result<Value, OrmError> {
        if value.is_nil() {
            return match &self.kind {
                _ if self.nullable => Ok(Value::Nil),
                ColumnKind::Enum(def) if self.required => Ok(Value::Str(def.default.clone())),
                ColumnKind::Str { .. } | ColumnKind::Bytes { .. } | ColumnKind::Set(_) => {
                    Err(self.reject("empty value for required field"))
                }
                _ => Err(self.reject("null value for non-nullable field")),
            };
        }

        match &self.kind {
            ColumnKind::Id => value
                .as_u64()
                .filter(|_| matches!(value, Value::Uint(_) | Value::Int(_)))
                .map(Value::Uint)
                .ok_or_else(|| self.wrong_type(&value)),

            ColumnKind::Int { bits } => {
                let v = match value {
                    Value::Int(v) => v,
                    Value::Uint(v) => {
                        i64::try_from(v).map_err(|_| self.reject(format!("value {v} out of range")))?
                    }
                    other => return Err(self.wrong_type(&other)),
                };
                if self.unsigned && v < 0 {
                    return Err(self.reject("negative value for unsigned field"));
                }
                let (min, max) = int_range(*bits);
                if v < min || v > max {
                    return Err(self.reject(format!("value {v} out of range")));
                }
                Ok(Value::Int(v))
            }

            ColumnKind::Uint { bits } => {
                let v = match value {
                    Value::Uint(v) => v,
                    Value::Int(v) if v < 0 => {
                        return Err(self.reject("negative value for unsigned field"))
                    }
                    Value::Int(v) => v as u64,
                    other => return Err(self.wrong_type(&other)),
                };
                if v > uint_max(*bits) {
                    return Err(self.reject(format!("value {v} out of range")));
                }
                Ok(Value::Uint(v))
            }

            ColumnKind::Bool => match value {
                Value::Bool(b) => Ok(Value::Bool(b)),
                other => Err(self.wrong_type(&other)),
            },

            ColumnKind::Float { precision, .. } => {
                let v = self.float_input(&value)?;
                Ok(Value::Float(round_to(v, *precision)))
            }

            ColumnKind::Decimal { width, scale } => {
                let v = round_to(self.float_input(&value)?, *scale);
                let limit = 10f64.powi((*width - *scale) as i32);
                if v.abs() >= limit {
                    return Err(self.reject(format!("value {v} exceeds decimal({width},{scale})")));
                }
                Ok(Value::Str(format!("{:.*}", *scale as usize, v)))
            }

            ColumnKind::Str { max_len } => {
                let s = match value {
                    Value::Str(s) => s,
                    other => return Err(self.wrong_type(&other)),
                };
                if s.is_empty() {
                    return self.empty();
                }
                if let Some(max) = max_len {
                    if s.chars().count() > *max {
                        return Err(self.reject(format!("text too long, max {max} allowed")));
                    }
                }
                Ok(Value::Str(s))
            }

            ColumnKind::Bytes { max_len } => {
                let b = match value {
                    Value::Bytes(b) => b,
                    Value::Str(s) => s.into_bytes(),
                    other => return Err(self.wrong_type(&other)),
                };
                if b.is_empty() {
                    return self.empty();
                }
                if let Some(max) = max_len {
                    if b.len() > *max {
                        return Err(self.reject(format!("value too long, max {max} bytes allowed")));
                    }
                }
                Ok(Value::Bytes(b))
            }

            ColumnKind::Date | ColumnKind::DateTime => {
                let t = match value {
                    Value::Time(t) => t,
                    other => return Err(self.wrong_type(&other)),
                };
                if t.offset().local_minus_utc() != 0 {
                    return Err(self.reject("time must be in UTC"));
                }
                let truncated = if self.kind == ColumnKind::Date {
                    t.date_naive()
                        .and_hms_opt(0, 0, 0)
                        .map(|d| d.and_utc().fixed_offset())
                } else {
                    t.with_nanosecond(0)
                };
                truncated
                    .map(Value::Time)
                    .ok_or_else(|| self.reject("invalid time"))
            }

            ColumnKind::Enum(def) => {
                let s = match value {
                    Value::Str(s) => s,
                    other => return Err(self.wrong_type(&other)),
                };
                if s.is_empty() {
                    return if self.required {
                        Ok(Value::Str(def.default.clone()))
                    } else {
                        Ok(Value::Nil)
                    };
                }
                if !def.contains(&s) {
                    return Err(self.reject(format!("unknown value '{s}' for enum {}", def.name)));
                }
                Ok(Value::Str(s))
            }

            ColumnKind::Set(def) => {
                let s = match value {
                    Value::Str(s) => s,
                    other => return Err(self.wrong_type(&other)),
                };
                let mut members: Vec<(usize, &str)> = Vec::new();
                for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                    let position = def.position(part).ok_or_else(|| {
                        self.reject(format!("unknown value '{part}' for enum {}", def.name))
                    })?;
                    members.push((position, part));
                }
                members.sort_unstable();
                members.dedup();
                if members.is_empty() {
                    return self.empty();
                }
                let joined: Vec<&str> = members.into_iter().map(|(_, m)| m).collect();
                Ok(Value::Str(joined.join(",")))
            }

            ColumnKind::Reference { .. } => match value.as_u64() {
                Some(0) if !self.required => Ok(Value::Nil),
                Some(0) => Err(self.reject("empty value for required field")),
                Some(id) if matches!(value, Value::Uint(_) | Value::Int(_)) => Ok(Value::Uint(id)),
                _ => Err(self.wrong_type(&value)),
            },
        }
    }

    fn float_input(&self, value: &Value) -> Result<f64, OrmError> {
        let v = match value {
            Value::Float(v) => *v,
            Value::Int(v) => *v as f64,
            Value::Uint(v) => *v as f64,
            // canonical decimal form
            Value::Str(s) if matches!(self.kind, ColumnKind::Decimal { .. }) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| self.reject(format!("invalid decimal '{s}'")))?,
            other => return Err(self.wrong_type(other)),
        };
        if !v.is_finite() {
            return Err(self.reject("value is not a finite number"));
        }
        if self.unsigned && v < 0.0 {
            return Err(self.reject("negative value for unsigned field"));
        }
        Ok(v)
    }

    fn empty(&self) -> Result<Value, OrmError> {
        if self.required {
            Err(self.reject("empty value for required field"))
        } else {
            Ok(Value::Nil)
        }
    }

    /// Convert a value read from the database into the canonical form.
    pub fn coerce(&self, value: Value) -> Result<Value, OrmError> {
        if value.is_nil() {
            return Ok(Value::Nil);
        }
        let bad = |v: &Value| {
            OrmError::Codec(format!(
                "column {}: cannot read {} value",
                self.name,
                v.kind_name()
            ))
        };
        let text = |v: &Value| -> Option<String> {
            match v {
                Value::Str(s) => Some(s.clone()),
                Value::Bytes(b) => String::from_utf8(b.clone()).ok(),
                Value::Int(i) => Some(i.to_string()),
                Value::Uint(u) => Some(u.to_string()),
                Value::Float(f) => Some(f.to_string()),
                _ => None,
            }
        };
        // unsigned BIGINT arrives as i64 from some drivers
        let unsigned = match value {
            Value::Int(v) if v < 0 => Some(v as u64),
            ref other => other.as_u64(),
        };
        let out = match &self.kind {
            ColumnKind::Id | ColumnKind::Uint { bits: 64 } => unsigned.map(Value::Uint),
            ColumnKind::Uint { .. } => value.as_u64().map(Value::Uint),
            ColumnKind::Reference { .. } => match unsigned {
                Some(0) => Some(Value::Nil),
                other => other.map(Value::Uint),
            },
            ColumnKind::Int { .. } => value.as_i64().map(Value::Int),
            ColumnKind::Bool => value.as_bool().map(Value::Bool),
            ColumnKind::Float { precision, .. } => {
                value.as_f64().map(|v| Value::Float(round_to(v, *precision)))
            }
            ColumnKind::Decimal { scale, .. } => value
                .as_f64()
                .map(|v| Value::Str(format!("{:.*}", *scale as usize, round_to(v, *scale)))),
            ColumnKind::Str { .. } | ColumnKind::Enum(_) | ColumnKind::Set(_) => {
                text(&value).map(Value::Str)
            }
            ColumnKind::Bytes { .. } => match &value {
                Value::Bytes(b) => Some(Value::Bytes(b.clone())),
                Value::Str(s) => Some(Value::Bytes(s.clone().into_bytes())),
                _ => None,
            },
            ColumnKind::Date | ColumnKind::DateTime => match &value {
                Value::Time(t) => Some(Value::Time(*t)),
                other => text(other).and_then(|s| parse_time(&s)).map(Value::Time),
            },
        };
        out.ok_or_else(|| bad(&value))
    }

    /// Canonical string of a normalized value, `None` for NULL. This is the
    /// bind-map form used for fingerprints.
    #[must_use]
    pub fn render(&self, value: &Value) -> Option<String> {
        Some(match value {
            Value::Nil => return None,
            Value::Int(v) => v.to_string(),
            Value::Uint(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Str(s) => s.clone(),
            Value::Bytes(b) => hex::encode(b),
            Value::Bool(b) => String::from(if *b { "1" } else { "0" }),
            Value::Time(t) if self.kind == ColumnKind::Date => t.format(DATE_FORMAT).to_string(),
            Value::Time(t) => t.format(DATETIME_FORMAT).to_string(),
        })
    }

    /// SQL parameter form of a normalized value.
    #[must_use]
    pub fn sql_arg(&self, value: &Value) -> Value {
        match value {
            Value::Time(_) => self.render(value).map_or(Value::Nil, Value::Str),
            other => other.clone(),
        }
    }

    #[must_use]
    pub fn to_json(&self, value: &Value) -> serde_json::Value {
        match value {
            Value::Time(_) => self
                .render(value)
                .map_or(serde_json::Value::Null, serde_json::Value::String),
            other => other.to_json(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EnumDef;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn column(kind: ColumnKind) -> ColumnDef {
        ColumnDef {
            name: "F".into(),
            kind,
            nullable: false,
            required: false,
            unsigned: false,
            cached: false,
        }
    }

    fn colors() -> Arc<EnumDef> {
        Arc::new(EnumDef {
            name: "Color".into(),
            values: vec!["Red".into(), "Green".into(), "Blue".into()],
            default: "Red".into(),
        })
    }

    #[test]
    fn test_int_ranges() {
        let c = column(ColumnKind::Int { bits: 8 });
        assert_eq!(c.normalize(Value::Int(127)).unwrap(), Value::Int(127));
        assert!(c.normalize(Value::Int(128)).is_err());
        assert!(c.normalize(Value::Str("1".into())).is_err());

        let mut unsigned = column(ColumnKind::Int { bits: 32 });
        unsigned.unsigned = true;
        assert!(unsigned.normalize(Value::Int(-1)).is_err());

        let u = column(ColumnKind::Uint { bits: 16 });
        assert!(u.normalize(Value::Int(-3)).is_err());
        assert!(u.normalize(Value::Uint(70_000)).is_err());
        assert_eq!(u.normalize(Value::Int(3)).unwrap(), Value::Uint(3));
    }

    #[test]
    fn test_float_rounding_half_away_from_zero() {
        let c = column(ColumnKind::Float { bits: 64, precision: 2 });
        assert_eq!(c.normalize(Value::Float(1.125)).unwrap(), Value::Float(1.13));
        assert_eq!(c.normalize(Value::Float(-1.125)).unwrap(), Value::Float(-1.13));
        assert_eq!(c.normalize(Value::Float(-0.001)).unwrap(), Value::Float(0.0));
    }

    #[test]
    fn test_decimal() {
        let c = column(ColumnKind::Decimal { width: 5, scale: 2 });
        assert_eq!(c.normalize(Value::Float(12.5)).unwrap(), Value::Str("12.50".into()));
        assert!(c.normalize(Value::Float(1000.0)).is_err());
        assert_eq!(c.coerce(Value::Float(3.1)).unwrap(), Value::Str("3.10".into()));
    }

    #[test]
    fn test_decimal_accepts_its_canonical_form() {
        let c = column(ColumnKind::Decimal { width: 5, scale: 2 });
        let canonical = c.normalize(Value::Float(12.346)).unwrap();
        assert_eq!(canonical, Value::Str("12.35".into()));
        assert_eq!(c.normalize(canonical).unwrap(), Value::Str("12.35".into()));
        assert_eq!(c.normalize(Value::Str(" 7.1 ".into())).unwrap(), Value::Str("7.10".into()));
        assert!(c.normalize(Value::Str("twelve".into())).is_err());

        let plain = column(ColumnKind::Float { bits: 64, precision: 2 });
        assert!(plain.normalize(Value::Str("1.5".into())).is_err());
    }

    #[test]
    fn test_strings() {
        let mut c = column(ColumnKind::Str { max_len: Some(3) });
        c.nullable = true;
        assert_eq!(c.normalize(Value::Str(String::new())).unwrap(), Value::Nil);
        assert_eq!(c.normalize(Value::Nil).unwrap(), Value::Nil);
        assert!(c.normalize(Value::Str("abcd".into())).is_err());
        assert_eq!(c.normalize(Value::Str("äbc".into())).unwrap(), Value::Str("äbc".into()));

        let mut required = column(ColumnKind::Str { max_len: None });
        required.required = true;
        assert!(required.normalize(Value::Str(String::new())).is_err());
    }

    #[test]
    fn test_time_must_be_utc() {
        let c = column(ColumnKind::DateTime);
        let local = FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 1, 10, 0, 0)
            .unwrap();
        assert!(c.normalize(Value::Time(local)).is_err());

        let d = column(ColumnKind::Date);
        let utc = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let normalized = d.normalize(Value::from(utc)).unwrap();
        assert_eq!(d.render(&normalized).unwrap(), "2024-01-01");
        assert_eq!(
            d.coerce(Value::Str("2024-01-01".into())).unwrap(),
            normalized
        );
    }

    #[test]
    fn test_enum_defaults() {
        let mut required = column(ColumnKind::Enum(colors()));
        required.required = true;
        assert_eq!(required.normalize(Value::Str(String::new())).unwrap(), Value::Str("Red".into()));
        assert!(required.normalize(Value::Str("Pink".into())).is_err());

        let mut optional = column(ColumnKind::Enum(colors()));
        optional.nullable = true;
        assert_eq!(optional.normalize(Value::Str(String::new())).unwrap(), Value::Nil);
    }

    #[test]
    fn test_set_sorted_by_declaration() {
        let mut c = column(ColumnKind::Set(colors()));
        c.nullable = true;
        assert_eq!(
            c.normalize(Value::Str("Blue,Red,Blue".into())).unwrap(),
            Value::Str("Red,Blue".into())
        );
        assert_eq!(c.normalize(Value::Str(String::new())).unwrap(), Value::Nil);
    }

    #[test]
    fn test_reference_zero_is_null() {
        let mut c = column(ColumnKind::Reference { target: "t".into() });
        c.nullable = true;
        assert_eq!(c.normalize(Value::Uint(0)).unwrap(), Value::Nil);
        assert_eq!(c.normalize(Value::Uint(7)).unwrap(), Value::Uint(7));
    }

    #[test]
    fn test_render() {
        let c = column(ColumnKind::Bool);
        assert_eq!(c.render(&Value::Bool(true)).as_deref(), Some("1"));
        assert_eq!(c.render(&Value::Nil), None);
    }
}
