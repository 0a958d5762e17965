// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity and field descriptors.
//!
//! Entity types describe themselves with an [`EntityDef`]: a table name, an
//! entity tag string and an ordered list of [`FieldDef`]s. The registry
//! flattens nested records and arrays into columns and turns the tag
//! strings into typed column metadata.
//!
//! ```
//! use tierdb::schema::{EntityDef, FieldDef, FieldKind};
//!
//! let def = EntityDef::new("users")
//!     .tags("localCache=1000;redisCache")
//!     .field(FieldDef::new("ID", FieldKind::Id))
//!     .field(FieldDef::new("Name", FieldKind::String).tags("unique=Name;length=100;required"))
//!     .field(FieldDef::new("Age", FieldKind::U8));
//! assert_eq!(def.fields.len(), 3);
//! ```

use std::collections::BTreeMap;

use crate::error::OrmError;

/// Declared Rust-side type of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// Primary key, 64-bit unsigned. Must be the first field.
    Id,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Bool,
    F32,
    F64,
    String,
    Bytes,
    /// Date, or datetime with the `time` tag. Must be UTC.
    Time,
    /// One value out of a registered enum.
    Enum(String),
    /// Subset of a registered enum.
    Set(String),
    /// Nullable ID of another registered entity (by table name).
    Reference(String),
    /// Nested record flattened into `<prefix><field>` columns.
    Struct(Vec<FieldDef>),
    /// Fixed-length array flattened into `<field>_1..<field>_N` columns.
    Array(usize, Box<FieldKind>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub tags: String,
    /// Nullable variant (`Option<T>` on the Rust side).
    pub optional: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            tags: String::new(),
            optional: false,
        }
    }

    #[must_use]
    pub fn tags(mut self, tags: impl Into<String>) -> Self {
        self.tags = tags.into();
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Descriptor of one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDef {
    pub table: String,
    pub tags: String,
    pub fields: Vec<FieldDef>,
}

impl EntityDef {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            tags: String::new(),
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn tags(mut self, tags: impl Into<String>) -> Self {
        self.tags = tags.into();
        self
    }

    #[must_use]
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }
}

/// A registered enumeration: ordered values plus the default used when a
/// required field receives an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDef {
    pub name: String,
    pub values: Vec<String>,
    pub default: String,
}

impl EnumDef {
    #[must_use]
    pub fn contains(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }

    #[must_use]
    pub fn position(&self, value: &str) -> Option<usize> {
        self.values.iter().position(|v| v == value)
    }
}

pub(crate) const FIELD_TAGS: &[&str] = &[
    "unique", "index", "cached", "required", "length", "precision", "decimal",
    "unsigned", "time", "ignore",
];

pub(crate) const ENTITY_TAGS: &[&str] = &[
    "mysql", "redisCache", "localCache", "cacheAll", "archived",
    "split_async_flush", "log", "dirty",
];

/// Parse a `key=value;flag;key=value` tag string.
///
/// Bare flags map to an empty value. Unknown keys are rejected.
pub(crate) fn parse_tags(
    raw: &str,
    allowed: &[&str],
    owner: &str,
) -> Result<BTreeMap<String, String>, OrmError> {
    let mut tags = BTreeMap::new();
    for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = match part.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (part, ""),
        };
        if !allowed.contains(&key) {
            return Err(OrmError::schema(format!("unknown tag '{key}' on {owner}")));
        }
        if tags.insert(key.to_string(), value.to_string()).is_some() {
            return Err(OrmError::schema(format!("tag '{key}' repeated on {owner}")));
        }
    }
    Ok(tags)
}

/// Parse `NAME[:POS]` from a `unique=`/`index=` tag. Several indexes may be
/// listed separated by commas.
pub(crate) fn parse_index_refs(raw: &str, owner: &str) -> Result<Vec<(String, usize)>, OrmError> {
    let mut refs = Vec::new();
    for item in raw.split(',').map(str::trim) {
        if item.is_empty() {
            return Err(OrmError::schema(format!("empty index name on {owner}")));
        }
        let (name, pos) = match item.split_once(':') {
            Some((n, p)) => {
                let pos: usize = p.parse().map_err(|_| {
                    OrmError::schema(format!("invalid index position '{p}' on {owner}"))
                })?;
                if pos == 0 {
                    return Err(OrmError::schema(format!("index position must start at 1 on {owner}")));
                }
                (n.to_string(), pos)
            }
            None => (item.to_string(), 1),
        };
        refs.push((name, pos));
    }
    Ok(refs)
}
