// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity schemas.
//!
//! An [`EntitySchema`] is the immutable descriptor of one entity type,
//! built once by the [`Registry`] from the type's [`EntityDef`]. It owns
//! the flattened column list (column 0 is always `ID`), the unique and
//! non-unique index definitions, cached references, the cache policy and
//! the namespace (`cache_key`) every cache key of the entity lives under.
//!
//! # Cache key layout
//!
//! ```text
//! <cache_key>                      hash   field <id> → encoded row ("" = tombstone)
//! <cache_key>:<index>              hash   field <fingerprint> → ID ("" = absent)
//! <cache_key>:<ref_col>:<ref_id>   set    member IDs (absent = unknown)
//! <cache_key>:i:<index>:<fp>       string JSON ID list
//! <cache_key>:all                  string JSON ID list (cacheAll)
//! ```

mod bind;
mod ddl;
mod field;
mod id_generator;
mod registry;

pub use field::{EntityDef, EnumDef, FieldDef, FieldKind};
pub use id_generator::IdGenerator;
pub use registry::{Registry, SchemaSet};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::error::OrmError;
use crate::value::Value;
use field::{parse_index_refs, parse_tags, ENTITY_TAGS, FIELD_TAGS};

/// Column values of one entity in column order.
pub type Row = Vec<Value>;

/// Normalized storage kind of a single column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnKind {
    Id,
    Int { bits: u8 },
    Uint { bits: u8 },
    Bool,
    Float { bits: u8, precision: u32 },
    Decimal { width: u32, scale: u32 },
    /// `None` = large (`length=max`).
    Str { max_len: Option<usize> },
    Bytes { max_len: Option<usize> },
    Date,
    DateTime,
    Enum(Arc<EnumDef>),
    Set(Arc<EnumDef>),
    Reference { target: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
    pub required: bool,
    pub unsigned: bool,
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    /// Positions of `columns` in the schema column list.
    pub positions: Vec<usize>,
    /// Results of lookups on this index are cached (non-unique indexes only).
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDef {
    pub column: String,
    pub position: usize,
    pub target: String,
    pub cached: bool,
}

#[derive(Debug)]
pub struct EntitySchema {
    pub type_name: &'static str,
    pub table_name: String,
    pub db_pool: String,
    pub cache_key: String,
    pub columns: Vec<ColumnDef>,
    pub unique_indices: BTreeMap<String, IndexDef>,
    pub indices: BTreeMap<String, IndexDef>,
    pub references: BTreeMap<String, ReferenceDef>,
    /// `None` disables the local cache, `Some(0)` is unbounded.
    pub local_cache_limit: Option<usize>,
    pub remote_pool: Option<String>,
    pub cache_all: bool,
    pub archived: bool,
    pub async_cache_key: String,
    pub log_pool: Option<String>,
    pub dirty_streams: Vec<String>,
    column_positions: HashMap<String, usize>,
    id_generator: IdGenerator,
}

/// Stable fingerprint of canonical values; used as hash field and cache key
/// suffix for unique and non-unique index lookups.
#[must_use]
pub fn fingerprint(parts: &[String]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(&hasher.finalize()[..12])
}

impl EntitySchema {
    #[must_use]
    pub fn has_local_cache(&self) -> bool {
        self.local_cache_limit.is_some()
    }

    #[must_use]
    pub fn has_remote_cache(&self) -> bool {
        self.remote_pool.is_some()
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<(usize, &ColumnDef)> {
        self.column_positions.get(name).map(|&i| (i, &self.columns[i]))
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Comma separated, quoted column list for SELECT/INSERT.
    #[must_use]
    pub fn sql_columns(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("`{}`", c.name))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Next client-side ID.
    pub fn next_id(&self) -> u64 {
        self.id_generator.next()
    }

    // ── cache keys ────────────────────────────────────────────────────────

    /// Remote hash holding encoded rows by ID.
    #[must_use]
    pub fn rows_key(&self) -> &str {
        &self.cache_key
    }

    #[must_use]
    pub fn unique_hash_key(&self, index: &str) -> String {
        format!("{}:{}", self.cache_key, index)
    }

    /// Local query-cache key for a unique fingerprint.
    #[must_use]
    pub fn unique_local_key(&self, index: &str, fp: &str) -> String {
        format!("{}:u:{}:{}", self.cache_key, index, fp)
    }

    #[must_use]
    pub fn reference_key(&self, column: &str, ref_id: u64) -> String {
        format!("{}:{}:{}", self.cache_key, column, ref_id)
    }

    #[must_use]
    pub fn index_query_key(&self, index: &str, fp: &str) -> String {
        format!("{}:i:{}:{}", self.cache_key, index, fp)
    }

    #[must_use]
    pub fn all_key(&self) -> String {
        format!("{}:all", self.cache_key)
    }

    #[must_use]
    pub fn log_stream(&self) -> String {
        format!("log:{}", self.table_name)
    }

    #[must_use]
    pub fn log_table(&self) -> String {
        format!("_log_{}", self.table_name)
    }

    // ── rows ──────────────────────────────────────────────────────────────

    /// Run every column setter over raw entity values.
    pub fn normalize_row(&self, raw: Vec<Value>) -> Result<Row, OrmError> {
        if raw.len() != self.columns.len() {
            return Err(OrmError::bind(
                &self.table_name,
                format!("expected {} values, got {}", self.columns.len(), raw.len()),
            ));
        }
        raw.into_iter()
            .zip(&self.columns)
            .map(|(value, column)| column.normalize(value))
            .collect()
    }

    /// Materialize a database row (same column order as [`Self::sql_columns`]).
    pub fn row_from_db(&self, raw: Vec<Value>) -> Result<Row, OrmError> {
        if raw.len() != self.columns.len() {
            return Err(OrmError::Codec(format!(
                "{}: expected {} columns from database, got {}",
                self.table_name,
                self.columns.len(),
                raw.len()
            )));
        }
        raw.into_iter()
            .zip(&self.columns)
            .map(|(value, column)| column.coerce(value))
            .collect()
    }

    /// Canonical string parts of an index over `row`, `None` when any part
    /// is NULL (NULLs never collide in SQL unique indexes).
    #[must_use]
    pub fn index_parts(&self, index: &IndexDef, row: &[Value]) -> Option<Vec<String>> {
        index
            .positions
            .iter()
            .map(|&pos| self.columns[pos].render(&row[pos]))
            .collect()
    }

    #[must_use]
    pub fn index_fingerprint(&self, index: &IndexDef, row: &[Value]) -> Option<String> {
        self.index_parts(index, row).map(|parts| fingerprint(&parts))
    }

    /// Parts for a non-unique index query fingerprint. NULL renders as a
    /// NUL byte so it cannot collide with any textual value.
    #[must_use]
    pub fn query_parts(&self, index: &IndexDef, row: &[Value]) -> Vec<String> {
        index
            .positions
            .iter()
            .map(|&pos| {
                self.columns[pos]
                    .render(&row[pos])
                    .unwrap_or_else(|| "\u{0}".to_string())
            })
            .collect()
    }

    /// SQL argument form of a row value.
    #[must_use]
    pub fn sql_arg(&self, position: usize, value: &Value) -> Value {
        self.columns[position].sql_arg(value)
    }

    /// JSON object of a row, keyed by column name.
    #[must_use]
    pub fn row_to_json(&self, row: &[Value]) -> serde_json::Map<String, serde_json::Value> {
        self.columns
            .iter()
            .zip(row)
            .map(|(c, v)| (c.name.clone(), c.to_json(v)))
            .collect()
    }

    pub fn unique_index(&self, name: &str) -> Result<&IndexDef, OrmError> {
        self.unique_indices.get(name).ok_or_else(|| {
            OrmError::schema(format!("unknown unique index '{}' on {}", name, self.table_name))
        })
    }

    pub fn index(&self, name: &str) -> Result<&IndexDef, OrmError> {
        self.indices.get(name).ok_or_else(|| {
            OrmError::schema(format!("unknown index '{}' on {}", name, self.table_name))
        })
    }

    /// Build a schema from a definition. Cross-entity checks (reference
    /// targets, pool codes, duplicate tables) happen in the registry.
    pub(crate) fn build(
        type_name: &'static str,
        def: &EntityDef,
        enums: &HashMap<String, Arc<EnumDef>>,
        config: &EngineConfig,
    ) -> Result<Self, OrmError> {
        let table = def.table.as_str();
        if table.is_empty() {
            return Err(OrmError::schema(format!("{type_name}: empty table name")));
        }

        let mut leaves = Vec::new();
        for field in &def.fields {
            flatten(field, "", &mut leaves)?;
        }

        let mut columns = Vec::with_capacity(leaves.len());
        let mut column_positions = HashMap::new();
        let mut unique_parts: BTreeMap<String, Vec<(usize, usize)>> = BTreeMap::new();
        let mut index_parts: BTreeMap<String, Vec<(usize, usize)>> = BTreeMap::new();

        for (position, leaf) in leaves.iter().enumerate() {
            let owner = format!("{}.{}", table, leaf.name);
            let tags = parse_tags(&leaf.tags, FIELD_TAGS, &owner)?;
            let column = build_column(position, leaf, &tags, enums, &owner)?;
            if column_positions.insert(column.name.clone(), position).is_some() {
                return Err(OrmError::schema(format!("{owner}: duplicated column name")));
            }
            if let Some(raw) = tags.get("unique") {
                for (name, pos) in parse_index_refs(raw, &owner)? {
                    unique_parts.entry(name).or_default().push((pos, position));
                }
            }
            if let Some(raw) = tags.get("index") {
                for (name, pos) in parse_index_refs(raw, &owner)? {
                    index_parts.entry(name).or_default().push((pos, position));
                }
            }
            columns.push(column);
        }

        let unique_indices = build_indices(table, unique_parts, &columns, false)?;
        let indices = build_indices(table, index_parts, &columns, true)?;

        let mut seen: HashMap<Vec<usize>, &str> = HashMap::new();
        for index in unique_indices.values().chain(indices.values()) {
            if unique_indices.contains_key(&index.name) && indices.contains_key(&index.name) {
                return Err(OrmError::schema(format!(
                    "{table}: index '{}' declared both unique and non-unique",
                    index.name
                )));
            }
            if let Some(other) = seen.insert(index.positions.clone(), &index.name) {
                return Err(OrmError::schema(format!(
                    "{table}: indexes '{other}' and '{}' cover the same columns",
                    index.name
                )));
            }
        }

        let references = columns
            .iter()
            .enumerate()
            .filter_map(|(position, c)| match &c.kind {
                ColumnKind::Reference { target } => Some((
                    c.name.clone(),
                    ReferenceDef {
                        column: c.name.clone(),
                        position,
                        target: target.clone(),
                        cached: c.cached,
                    },
                )),
                _ => None,
            })
            .collect();

        let entity_tags = parse_tags(&def.tags, ENTITY_TAGS, table)?;
        let pool_or_default = |key: &str| -> Option<String> {
            entity_tags.get(key).map(|v| {
                if v.is_empty() {
                    "default".to_string()
                } else {
                    v.clone()
                }
            })
        };
        let local_cache_limit = match entity_tags.get("localCache") {
            None => None,
            Some(v) if v.is_empty() => Some(0),
            Some(v) => Some(v.parse::<usize>().map_err(|_| {
                OrmError::schema(format!("{table}: invalid localCache limit '{v}'"))
            })?),
        };
        let remote_pool = pool_or_default("redisCache");
        let log_pool = pool_or_default("log");
        let archived = match entity_tags.get("archived").map(String::as_str) {
            None | Some("false") => false,
            Some("" | "true") => true,
            Some(other) => {
                return Err(OrmError::schema(format!("{table}: invalid archived value '{other}'")))
            }
        };
        let dirty_streams = entity_tags
            .get("dirty")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| format!("dirty:{s}"))
                    .collect()
            })
            .unwrap_or_default();
        let async_cache_key = entity_tags
            .get("split_async_flush")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| config.async_default_queue.clone());

        let cache_key = {
            let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
            let digest = Sha256::digest(format!("{}:{}", table, names.join(",")).as_bytes());
            hex::encode(digest)[..5].to_string()
        };

        Ok(Self {
            type_name,
            table_name: table.to_string(),
            db_pool: entity_tags
                .get("mysql")
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| "default".to_string()),
            cache_key,
            columns,
            unique_indices,
            indices,
            references,
            local_cache_limit,
            remote_pool,
            cache_all: entity_tags.contains_key("cacheAll"),
            archived,
            async_cache_key,
            log_pool,
            dirty_streams,
            column_positions,
            id_generator: IdGenerator::new(config.server_id),
        })
    }
}

/// A flattened field before tag interpretation.
struct Leaf {
    name: String,
    kind: FieldKind,
    tags: String,
    optional: bool,
}

fn flatten(field: &FieldDef, prefix: &str, out: &mut Vec<Leaf>) -> Result<(), OrmError> {
    if field.tags.split(';').any(|t| t.trim() == "ignore") {
        return Ok(());
    }
    let name = format!("{prefix}{}", field.name);
    match &field.kind {
        FieldKind::Struct(fields) => {
            for sub in fields {
                flatten(sub, &name, out)?;
            }
        }
        FieldKind::Array(len, item) => {
            if *len == 0 {
                return Err(OrmError::schema(format!("{name}: zero-length array")));
            }
            for i in 1..=*len {
                let element = FieldDef {
                    name: format!("{name}_{i}"),
                    kind: (**item).clone(),
                    tags: field.tags.clone(),
                    optional: field.optional,
                };
                flatten(&element, "", out)?;
            }
        }
        kind => out.push(Leaf {
            name,
            kind: kind.clone(),
            tags: field.tags.clone(),
            optional: field.optional,
        }),
    }
    Ok(())
}

fn build_column(
    position: usize,
    leaf: &Leaf,
    tags: &BTreeMap<String, String>,
    enums: &HashMap<String, Arc<EnumDef>>,
    owner: &str,
) -> Result<ColumnDef, OrmError> {
    let required = tags.contains_key("required");
    let unsigned = tags.contains_key("unsigned");
    let is_float = matches!(leaf.kind, FieldKind::F32 | FieldKind::F64);
    let is_text = matches!(leaf.kind, FieldKind::String | FieldKind::Bytes);

    if position == 0 {
        let is_id = leaf.name == "ID"
            && !leaf.optional
            && matches!(leaf.kind, FieldKind::Id | FieldKind::U64);
        if !is_id {
            return Err(OrmError::schema(format!(
                "{owner}: first field must be a non-null 64-bit unsigned ID"
            )));
        }
    } else if leaf.kind == FieldKind::Id {
        return Err(OrmError::schema(format!("{owner}: only the first field can be the ID")));
    }
    if tags.contains_key("length") && !is_text {
        return Err(OrmError::schema(format!("{owner}: length is only valid on string or bytes fields")));
    }
    if (tags.contains_key("precision") || tags.contains_key("decimal")) && !is_float {
        return Err(OrmError::schema(format!("{owner}: precision/decimal require a float field")));
    }
    if tags.contains_key("time") && leaf.kind != FieldKind::Time {
        return Err(OrmError::schema(format!("{owner}: time is only valid on time fields")));
    }
    let numeric = is_float || matches!(leaf.kind, FieldKind::I8 | FieldKind::I16 | FieldKind::I32 | FieldKind::I64);
    if unsigned && !numeric {
        return Err(OrmError::schema(format!("{owner}: unsigned requires a signed numeric field")));
    }

    let length = |default: Option<usize>| -> Result<Option<usize>, OrmError> {
        match tags.get("length").map(String::as_str) {
            None => Ok(default),
            Some("max") => Ok(None),
            Some(n) => n
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .map(Some)
                .ok_or_else(|| OrmError::schema(format!("{owner}: invalid length '{n}'"))),
        }
    };
    let lookup_enum = |name: &str| -> Result<Arc<EnumDef>, OrmError> {
        enums
            .get(name)
            .cloned()
            .ok_or_else(|| OrmError::schema(format!("{owner}: unknown enum '{name}'")))
    };

    let kind = match &leaf.kind {
        FieldKind::Id => ColumnKind::Id,
        FieldKind::U64 if position == 0 => ColumnKind::Id,
        FieldKind::I8 => ColumnKind::Int { bits: 8 },
        FieldKind::I16 => ColumnKind::Int { bits: 16 },
        FieldKind::I32 => ColumnKind::Int { bits: 32 },
        FieldKind::I64 => ColumnKind::Int { bits: 64 },
        FieldKind::U8 => ColumnKind::Uint { bits: 8 },
        FieldKind::U16 => ColumnKind::Uint { bits: 16 },
        FieldKind::U32 => ColumnKind::Uint { bits: 32 },
        FieldKind::U64 => ColumnKind::Uint { bits: 64 },
        FieldKind::Bool => ColumnKind::Bool,
        FieldKind::F32 | FieldKind::F64 => {
            let bits = if leaf.kind == FieldKind::F32 { 32 } else { 64 };
            if let Some(raw) = tags.get("decimal") {
                let parsed = raw
                    .split_once(',')
                    .and_then(|(w, s)| Some((w.trim().parse::<u32>().ok()?, s.trim().parse::<u32>().ok()?)));
                match parsed {
                    Some((width, scale)) if width > 0 && scale <= width && width <= 65 => {
                        ColumnKind::Decimal { width, scale }
                    }
                    _ => return Err(OrmError::schema(format!("{owner}: invalid decimal '{raw}'"))),
                }
            } else {
                let precision = match tags.get("precision") {
                    Some(p) => p
                        .parse::<u32>()
                        .ok()
                        .filter(|p| *p <= 15)
                        .ok_or_else(|| OrmError::schema(format!("{owner}: invalid precision '{p}'")))?,
                    None if bits == 32 => 4,
                    None => 8,
                };
                ColumnKind::Float { bits, precision }
            }
        }
        FieldKind::String => ColumnKind::Str { max_len: length(Some(255))? },
        FieldKind::Bytes => ColumnKind::Bytes { max_len: length(None)? },
        FieldKind::Time if tags.contains_key("time") => ColumnKind::DateTime,
        FieldKind::Time => ColumnKind::Date,
        FieldKind::Enum(name) => ColumnKind::Enum(lookup_enum(name)?),
        FieldKind::Set(name) => ColumnKind::Set(lookup_enum(name)?),
        FieldKind::Reference(target) => ColumnKind::Reference { target: target.clone() },
        FieldKind::Struct(_) | FieldKind::Array(..) => {
            return Err(OrmError::schema(format!("{owner}: nested kinds must be flattened")))
        }
    };

    let nullable = match &kind {
        ColumnKind::Id => false,
        ColumnKind::Str { .. }
        | ColumnKind::Bytes { .. }
        | ColumnKind::Enum(_)
        | ColumnKind::Set(_)
        | ColumnKind::Reference { .. } => !required,
        _ => leaf.optional,
    };

    Ok(ColumnDef {
        name: leaf.name.clone(),
        kind,
        nullable,
        required,
        unsigned,
        cached: tags.contains_key("cached"),
    })
}

fn build_indices(
    table: &str,
    parts: BTreeMap<String, Vec<(usize, usize)>>,
    columns: &[ColumnDef],
    cacheable: bool,
) -> Result<BTreeMap<String, IndexDef>, OrmError> {
    let mut out = BTreeMap::new();
    for (name, mut members) in parts {
        members.sort_unstable();
        for pair in members.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(OrmError::schema(format!(
                    "{table}: index '{name}' has two columns at position {}",
                    pair[0].0
                )));
            }
        }
        let positions: Vec<usize> = members.iter().map(|(_, col)| *col).collect();
        let cached = cacheable && columns[positions[0]].cached;
        out.insert(
            name.clone(),
            IndexDef {
                name,
                columns: positions.iter().map(|&p| columns[p].name.clone()).collect(),
                positions,
                cached,
            },
        );
    }
    Ok(out)
}
