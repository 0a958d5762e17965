// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity registration and validation.

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::{ColumnKind, EntityDef, EntitySchema, EnumDef};
use crate::config::EngineConfig;
use crate::coordinator::Engine;
use crate::entity::Entity;
use crate::error::OrmError;
use crate::storage::traits::{Database, RemoteCache};

/// Mutable builder collecting entity types, enums and pools.
///
/// Nothing is checked until [`Registry::validate`], which either returns a
/// ready [`Engine`] or the first schema problem found.
pub struct Registry {
    config: EngineConfig,
    entities: Vec<(TypeId, &'static str, EntityDef)>,
    enums: HashMap<String, Arc<EnumDef>>,
    databases: HashMap<String, Arc<dyn Database>>,
    caches: HashMap<String, Arc<dyn RemoteCache>>,
    problems: Vec<String>,
}

impl Registry {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            entities: Vec::new(),
            enums: HashMap::new(),
            databases: HashMap::new(),
            caches: HashMap::new(),
            problems: Vec::new(),
        }
    }

    pub fn register_entity<E: Entity>(&mut self) -> &mut Self {
        self.entities
            .push((TypeId::of::<E>(), type_name::<E>(), E::definition()));
        self
    }

    /// Declare an enumeration. An empty `default` means the first value.
    pub fn register_enum(&mut self, name: &str, values: &[&str], default: &str) -> &mut Self {
        let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        let default = if default.is_empty() {
            values.first().cloned().unwrap_or_default()
        } else {
            default.to_string()
        };
        if values.is_empty() {
            self.problems.push(format!("enum {name} has no values"));
        } else if !values.contains(&default) {
            self.problems
                .push(format!("enum {name}: default '{default}' is not a member"));
        }
        if values.iter().any(|v| v.contains(',')) {
            self.problems.push(format!("enum {name}: values must not contain ','"));
        }
        let def = EnumDef {
            name: name.to_string(),
            values,
            default,
        };
        if self.enums.insert(name.to_string(), Arc::new(def)).is_some() {
            self.problems.push(format!("enum {name} registered twice"));
        }
        self
    }

    pub fn register_mysql_pool(&mut self, code: &str, db: Arc<dyn Database>) -> &mut Self {
        self.databases.insert(code.to_string(), db);
        self
    }

    pub fn register_redis_pool(&mut self, code: &str, cache: Arc<dyn RemoteCache>) -> &mut Self {
        self.caches.insert(code.to_string(), cache);
        self
    }

    /// Freeze the registry into an [`Engine`].
    pub fn validate(self) -> Result<Engine, OrmError> {
        if let Some(problem) = self.problems.first() {
            return Err(OrmError::schema(problem.clone()));
        }

        let mut schemas = SchemaSet::default();
        for (type_id, name, def) in &self.entities {
            let schema = EntitySchema::build(name, def, &self.enums, &self.config)?;
            if schemas.by_type.contains_key(type_id) {
                return Err(OrmError::schema(format!("{name} registered twice")));
            }
            if schemas.by_table.contains_key(&schema.table_name) {
                return Err(OrmError::schema(format!(
                    "table {} is used by two entities",
                    schema.table_name
                )));
            }
            debug!(entity = name, table = %schema.table_name, cache_key = %schema.cache_key, "Entity schema built");
            let schema = Arc::new(schema);
            schemas.by_table.insert(schema.table_name.clone(), schema.clone());
            schemas.by_type.insert(*type_id, schema);
        }

        let mut cache_keys: HashMap<&str, &str> = HashMap::new();
        for schema in schemas.by_table.values() {
            let table = &schema.table_name;
            if let Some(other) = cache_keys.insert(&schema.cache_key, table) {
                return Err(OrmError::schema(format!(
                    "tables {other} and {table} hash to the same cache key {}",
                    schema.cache_key
                )));
            }
            if !self.databases.contains_key(&schema.db_pool) {
                return Err(OrmError::schema(format!(
                    "{table}: unknown mysql pool '{}'",
                    schema.db_pool
                )));
            }
            for pool in schema.remote_pool.iter().chain(schema.log_pool.iter()) {
                if !self.caches.contains_key(pool) {
                    return Err(OrmError::schema(format!("{table}: unknown redis pool '{pool}'")));
                }
            }
            if !schema.dirty_streams.is_empty() && !self.caches.contains_key("default") {
                return Err(OrmError::schema(format!(
                    "{table}: dirty streams need the default redis pool"
                )));
            }
            for column in &schema.columns {
                if let ColumnKind::Reference { target } = &column.kind {
                    if !schemas.by_table.contains_key(target) {
                        return Err(OrmError::schema(format!(
                            "{table}.{}: reference to unregistered entity '{target}'",
                            column.name
                        )));
                    }
                }
            }
        }

        info!(
            entities = schemas.by_table.len(),
            mysql_pools = self.databases.len(),
            redis_pools = self.caches.len(),
            "Registry validated"
        );
        Ok(Engine::new(schemas, self.databases, self.caches, self.config))
    }
}

/// Frozen schema lookup, shared by every engine handle.
#[derive(Debug, Default)]
pub struct SchemaSet {
    by_type: HashMap<TypeId, Arc<EntitySchema>>,
    by_table: HashMap<String, Arc<EntitySchema>>,
}

impl SchemaSet {
    pub fn of<E: Entity>(&self) -> Result<&Arc<EntitySchema>, OrmError> {
        self.by_type
            .get(&TypeId::of::<E>())
            .ok_or_else(|| OrmError::NotRegistered(type_name::<E>().to_string()))
    }

    pub fn by_table(&self, table: &str) -> Result<&Arc<EntitySchema>, OrmError> {
        self.by_table
            .get(table)
            .ok_or_else(|| OrmError::NotRegistered(table.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.by_table.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_table.is_empty()
    }
}
