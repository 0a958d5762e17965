// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The capability interface entity types implement.
//!
//! Entities describe their persisted shape once through [`Entity::definition`]
//! and convert to and from column values in schema column order. There is
//! no runtime reflection: the registry builds the [`EntitySchema`] from the
//! definition and every engine path works on `Vec<Value>` rows.
//!
//! ```
//! use tierdb::{Entity, EntityDef, FieldDef, FieldKind, OrmError, Value, ValueReader};
//!
//! #[derive(Clone, Debug, Default)]
//! struct User {
//!     id: u64,
//!     name: String,
//!     age: u8,
//! }
//!
//! impl Entity for User {
//!     fn definition() -> EntityDef {
//!         EntityDef::new("users")
//!             .tags("localCache;redisCache")
//!             .field(FieldDef::new("ID", FieldKind::Id))
//!             .field(FieldDef::new("Name", FieldKind::String).tags("unique=Name"))
//!             .field(FieldDef::new("Age", FieldKind::U8))
//!     }
//!     fn id(&self) -> u64 { self.id }
//!     fn set_id(&mut self, id: u64) { self.id = id }
//!     fn to_values(&self) -> Vec<Value> {
//!         vec![self.id.into(), self.name.as_str().into(), self.age.into()]
//!     }
//!     fn from_values(values: Vec<Value>) -> Result<Self, OrmError> {
//!         let mut r = ValueReader::new(values);
//!         Ok(Self { id: r.read()?, name: r.read()?, age: r.read()? })
//!     }
//! }
//! ```
//!
//! [`EntitySchema`]: crate::schema::EntitySchema

use chrono::{DateTime, Utc};

use crate::error::OrmError;
use crate::schema::EntityDef;
use crate::value::Value;

pub trait Entity: Clone + Send + Sync + 'static {
    /// Table, entity tags and fields. Called once at registration.
    fn definition() -> EntityDef;

    fn id(&self) -> u64;

    fn set_id(&mut self, id: u64);

    /// One value per persisted column, in column order (`ID` first).
    fn to_values(&self) -> Vec<Value>;

    /// Inverse of [`Entity::to_values`] over normalized values.
    fn from_values(values: Vec<Value>) -> Result<Self, OrmError>;
}

/// Conversion from a normalized column value into a field type.
///
/// NULL reads as the type's zero value unless the field is an `Option`.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, String>;
}

macro_rules! from_value_int {
    ($($t:ty),+) => {
        $(
            impl FromValue for $t {
                fn from_value(value: Value) -> Result<Self, String> {
                    match value {
                        Value::Nil => Ok(0),
                        Value::Int(v) => <$t>::try_from(v).map_err(|e| e.to_string()),
                        Value::Uint(v) => <$t>::try_from(v).map_err(|e| e.to_string()),
                        other => Err(format!("cannot read {} as {}", other.kind_name(), stringify!($t))),
                    }
                }
            }
        )+
    };
}

from_value_int!(i8, i16, i32, i64, u8, u16, u32, u64);

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Nil => Ok(0.0),
            other => other
                .as_f64()
                .ok_or_else(|| format!("cannot read {} as f64", other.kind_name())),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: Value) -> Result<Self, String> {
        f64::from_value(value).map(|v| v as f32)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Nil => Ok(false),
            Value::Bool(b) => Ok(b),
            other => Err(format!("cannot read {} as bool", other.kind_name())),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Nil => Ok(String::new()),
            Value::Str(s) => Ok(s),
            other => Err(format!("cannot read {} as string", other.kind_name())),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Nil => Ok(Vec::new()),
            Value::Bytes(b) => Ok(b),
            other => Err(format!("cannot read {} as bytes", other.kind_name())),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Time(t) => Ok(t.with_timezone(&Utc)),
            other => Err(format!("cannot read {} as time", other.kind_name())),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Nil => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Sequential reader over a row, for implementing [`Entity::from_values`].
pub struct ValueReader {
    values: std::vec::IntoIter<Value>,
    position: usize,
}

impl ValueReader {
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values: values.into_iter(),
            position: 0,
        }
    }

    pub fn read<T: FromValue>(&mut self) -> Result<T, OrmError> {
        let position = self.position;
        self.position += 1;
        let value = self
            .values
            .next()
            .ok_or_else(|| OrmError::Codec(format!("row has no column {position}")))?;
        T::from_value(value).map_err(|e| OrmError::Codec(format!("column {position}: {e}")))
    }

    /// Read a `Set` column as its members.
    pub fn read_set(&mut self) -> Result<Vec<String>, OrmError> {
        let joined: String = self.read()?;
        Ok(joined
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Value for a `Set` column from its members.
#[must_use]
pub fn set_value<S: AsRef<str>>(members: &[S]) -> Value {
    let joined: Vec<&str> = members.iter().map(AsRef::as_ref).collect();
    Value::Str(joined.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_nil_defaults() {
        let mut r = ValueReader::new(vec![Value::Nil, Value::Nil, Value::Uint(3), Value::Str("a,b".into())]);
        assert_eq!(r.read::<String>().unwrap(), "");
        assert_eq!(r.read::<Option<u32>>().unwrap(), None);
        assert_eq!(r.read::<Option<u32>>().unwrap(), Some(3));
        assert_eq!(r.read_set().unwrap(), vec!["a", "b"]);
        assert!(matches!(r.read::<u8>(), Err(OrmError::Codec(_))));
    }

    #[test]
    fn test_reader_range() {
        let mut r = ValueReader::new(vec![Value::Uint(300)]);
        assert!(r.read::<u8>().is_err());
    }
}
