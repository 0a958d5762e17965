// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-through lookup paths.
//!
//! Every path resolves IDs first (unique hash, reference set, query cache
//! or SQL) and then materializes rows through [`Engine::rows_by_ids`], which
//! walks local → remote → SQL and back-fills the tiers it missed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use super::{Engine, Pager};
use crate::cache::Cached;
use crate::codec::{decode_row, encode_row};
use crate::context::Context;
use crate::entity::Entity;
use crate::error::OrmError;
use crate::metrics;
use crate::schema::{fingerprint, EntitySchema, IndexDef, Row};
use crate::storage::traits::RemoteCommand;
use crate::value::Value;

/// Max IDs per `IN (...)` list.
const IN_CHUNK: usize = 500;

pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

impl Engine {
    // ═══════════════════════════════════════════════════════════════════════
    // Typed API
    // ═══════════════════════════════════════════════════════════════════════

    /// Load one entity by primary key.
    #[instrument(skip(self, ctx), fields(entity = std::any::type_name::<E>()))]
    pub async fn load_by_id<E: Entity>(&self, ctx: &Context, id: u64) -> Result<Option<E>, OrmError> {
        let schema = self.schema::<E>()?.clone();
        let row = self.rows_by_ids(ctx, &schema, &[id]).await?.pop().flatten();
        row.map(|row| E::from_values(row.to_vec())).transpose()
    }

    /// Load several entities by primary key. The result lines up with `ids`
    /// (order and duplicates preserved); missing rows are `None`.
    #[instrument(skip(self, ctx, ids), fields(entity = std::any::type_name::<E>(), count = ids.len()))]
    pub async fn load_by_ids<E: Entity>(&self, ctx: &Context, ids: &[u64]) -> Result<Vec<Option<E>>, OrmError> {
        let schema = self.schema::<E>()?.clone();
        self.rows_by_ids(ctx, &schema, ids)
            .await?
            .into_iter()
            .map(|row| row.map(|row| E::from_values(row.to_vec())).transpose())
            .collect()
    }

    /// Load the entity owning `values` in unique index `index`.
    ///
    /// `values` must match the index width; NULL values are rejected since
    /// they never identify a row.
    #[instrument(skip(self, ctx, values), fields(entity = std::any::type_name::<E>()))]
    pub async fn load_by_unique_key<E: Entity>(
        &self,
        ctx: &Context,
        index: &str,
        values: &[Value],
    ) -> Result<Option<E>, OrmError> {
        let schema = self.schema::<E>()?.clone();
        let index = schema.unique_index(index)?;
        let args = bind_index_args(&schema, index, values, false)?;
        let probe = sparse_row(&schema, index, &args);
        let Some(fp) = schema.index_fingerprint(index, &probe) else {
            return Ok(None);
        };

        let Some(id) = self.unique_owner(ctx, &schema, index, &fp, &args).await? else {
            return Ok(None);
        };
        let Some(id) = self.confirm_unique_owner(ctx, &schema, index, &fp, &args, id).await? else {
            return Ok(None);
        };
        let row = self.rows_by_ids(ctx, &schema, &[id]).await?.pop().flatten();
        row.map(|row| E::from_values(row.to_vec())).transpose()
    }

    /// Entities whose reference `column` points at `ref_id`, ordered by ID.
    #[instrument(skip(self, ctx), fields(entity = std::any::type_name::<E>()))]
    pub async fn load_by_reference<E: Entity>(
        &self,
        ctx: &Context,
        column: &str,
        ref_id: u64,
    ) -> Result<Vec<E>, OrmError> {
        let schema = self.schema::<E>()?.clone();
        let ids = self.reference_ids(ctx, &schema, column, ref_id).await?;
        self.entities_by_ids(ctx, &schema, &ids).await
    }

    /// Entities matching `values` in non-unique index `index`, ordered by ID.
    /// NULL values match `IS NULL`.
    #[instrument(skip(self, ctx, values), fields(entity = std::any::type_name::<E>()))]
    pub async fn load_by_index<E: Entity>(
        &self,
        ctx: &Context,
        index: &str,
        values: &[Value],
        pager: Option<Pager>,
    ) -> Result<Vec<E>, OrmError> {
        let schema = self.schema::<E>()?.clone();
        let ids = self.index_ids(ctx, &schema, index, values, pager).await?;
        self.entities_by_ids(ctx, &schema, &ids).await
    }

    /// Every row of the table, ordered by ID. Cached for `cacheAll` schemas.
    #[instrument(skip(self, ctx), fields(entity = std::any::type_name::<E>()))]
    pub async fn load_all<E: Entity>(&self, ctx: &Context, pager: Option<Pager>) -> Result<Vec<E>, OrmError> {
        let schema = self.schema::<E>()?.clone();
        let ids = if schema.cache_all {
            let ids = self.cached_id_list(ctx, &schema, &schema.all_key(), None, &[]).await?;
            match pager {
                Some(pager) => pager.apply(&ids),
                None => ids,
            }
        } else {
            self.select_ids(ctx, &schema, None, &[], pager).await?
        };
        self.entities_by_ids(ctx, &schema, &ids).await
    }

    /// Uncached `SELECT ID ... WHERE <where_sql> ORDER BY ID`.
    pub async fn search_ids<E: Entity>(
        &self,
        ctx: &Context,
        where_sql: &str,
        args: &[Value],
        pager: Option<Pager>,
    ) -> Result<Vec<u64>, OrmError> {
        let schema = self.schema::<E>()?.clone();
        let filter = (!where_sql.trim().is_empty()).then_some(where_sql);
        self.select_ids(ctx, &schema, filter, args, pager).await
    }

    /// [`Self::search_ids`] followed by a cached by-IDs load.
    pub async fn search<E: Entity>(
        &self,
        ctx: &Context,
        where_sql: &str,
        args: &[Value],
        pager: Option<Pager>,
    ) -> Result<Vec<E>, OrmError> {
        let ids = self.search_ids::<E>(ctx, where_sql, args, pager).await?;
        let schema = self.schema::<E>()?.clone();
        self.entities_by_ids(ctx, &schema, &ids).await
    }

    /// Pull the rows referenced by `entities` into the caches of their
    /// target schemas. An empty `columns` list means every reference
    /// column. Returns the number of referenced rows found.
    pub async fn warm_references<E: Entity>(
        &self,
        ctx: &Context,
        entities: &[E],
        columns: &[&str],
    ) -> Result<usize, OrmError> {
        let schema = self.schema::<E>()?.clone();
        let references = if columns.is_empty() {
            schema.references.values().collect::<Vec<_>>()
        } else {
            columns
                .iter()
                .map(|c| {
                    schema.references.get(*c).ok_or_else(|| {
                        OrmError::schema(format!("{}: '{c}' is not a reference column", schema.table_name))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut targets: BTreeMap<&str, Vec<u64>> = BTreeMap::new();
        for entity in entities {
            let values = entity.to_values();
            for reference in &references {
                if let Some(id) = values.get(reference.position).and_then(Value::as_u64).filter(|&id| id != 0) {
                    targets.entry(reference.target.as_str()).or_default().push(id);
                }
            }
        }

        let mut found = 0;
        for (table, mut ids) in targets {
            ids.sort_unstable();
            ids.dedup();
            let target = self.schemas.by_table(table)?.clone();
            found += self
                .rows_by_ids(ctx, &target, &ids)
                .await?
                .iter()
                .filter(|row| row.is_some())
                .count();
        }
        debug!(table = %schema.table_name, found, "References warmed");
        Ok(found)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Row level
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) async fn entities_by_ids<E: Entity>(
        &self,
        ctx: &Context,
        schema: &EntitySchema,
        ids: &[u64],
    ) -> Result<Vec<E>, OrmError> {
        self.rows_by_ids(ctx, schema, ids)
            .await?
            .into_iter()
            .flatten()
            .map(|row| E::from_values(row.to_vec()))
            .collect()
    }

    /// Resolve rows tier by tier. Misses found in SQL are written back to
    /// both caches; IDs missing everywhere are cached as tombstones.
    pub(crate) async fn rows_by_ids(
        &self,
        ctx: &Context,
        schema: &EntitySchema,
        ids: &[u64],
    ) -> Result<Vec<Option<Arc<Row>>>, OrmError> {
        ctx.check()?;
        let table = schema.table_name.as_str();
        let mut found: HashMap<u64, Option<Arc<Row>>> = HashMap::with_capacity(ids.len());
        let mut seen = HashSet::with_capacity(ids.len());
        let mut pending: Vec<u64> = ids.iter().copied().filter(|&id| id != 0 && seen.insert(id)).collect();

        let local = self.local_of(schema);
        if let Some(local) = local {
            pending.retain(|&id| match local.get(id) {
                Some(Cached::Row(row)) => {
                    found.insert(id, Some(row));
                    false
                }
                Some(Cached::Tombstone) => {
                    found.insert(id, None);
                    false
                }
                None => true,
            });
        }

        let remote = self.remote_of(schema);
        if let (Some(remote), false) = (remote, pending.is_empty()) {
            ctx.check()?;
            let fields: Vec<String> = pending.iter().map(u64::to_string).collect();
            let start = Instant::now();
            let values = remote.hmget(schema.rows_key(), &fields).await?;
            metrics::record_latency("remote", "hmget", start.elapsed());
            let mut misses = Vec::new();
            for (&id, value) in pending.iter().zip(values) {
                match value {
                    Some(bytes) if bytes.is_empty() => {
                        metrics::record_cache_lookup("remote", table, "tombstone");
                        if let Some(local) = local {
                            local.set_tombstone(id);
                        }
                        found.insert(id, None);
                    }
                    Some(bytes) => match decode_row(schema, &bytes) {
                        Ok(row) => {
                            metrics::record_cache_lookup("remote", table, "hit");
                            let row = Arc::new(row);
                            if let Some(local) = local {
                                local.set(id, Cached::Row(row.clone()));
                            }
                            found.insert(id, Some(row));
                        }
                        Err(e) => {
                            warn!(table, id, error = %e, "Undecodable remote row, reloading");
                            metrics::record_error("remote", "decode", "codec");
                            misses.push(id);
                        }
                    },
                    None => {
                        metrics::record_cache_lookup("remote", table, "miss");
                        misses.push(id);
                    }
                }
            }
            pending = misses;
        }

        if !pending.is_empty() {
            let mut rows = self.select_rows(ctx, schema, &pending).await?;
            let mut commands = Vec::with_capacity(pending.len());
            for id in pending {
                match rows.remove(&id) {
                    Some(row) => {
                        if remote.is_some() {
                            commands.push(RemoteCommand::HSet {
                                key: schema.rows_key().to_string(),
                                field: id.to_string(),
                                value: encode_row(schema, &row)?,
                            });
                        }
                        let row = Arc::new(row);
                        if let Some(local) = local {
                            local.set(id, Cached::Row(row.clone()));
                        }
                        found.insert(id, Some(row));
                    }
                    None => {
                        if remote.is_some() {
                            commands.push(RemoteCommand::HSet {
                                key: schema.rows_key().to_string(),
                                field: id.to_string(),
                                value: Vec::new(),
                            });
                        }
                        if let Some(local) = local {
                            local.set_tombstone(id);
                        }
                        found.insert(id, None);
                    }
                }
            }
            if let (Some(remote), false) = (remote, commands.is_empty()) {
                remote.pipeline(commands).await?;
            }
        }

        Ok(ids.iter().map(|id| found.get(id).cloned().flatten()).collect())
    }

    /// `SELECT <columns> ... WHERE ID IN (...)`, keyed by ID.
    pub(crate) async fn select_rows(
        &self,
        ctx: &Context,
        schema: &EntitySchema,
        ids: &[u64],
    ) -> Result<HashMap<u64, Row>, OrmError> {
        let db = self.db_of(schema)?;
        let select = schema.select_list(db.dialect());
        let mut out = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(IN_CHUNK) {
            ctx.check()?;
            let sql = format!(
                "SELECT {select} FROM `{}` WHERE `ID` IN ({})",
                schema.table_name,
                placeholders(chunk.len())
            );
            let args: Vec<Value> = chunk.iter().map(|&id| Value::Uint(id)).collect();
            for raw in db.query(&sql, &args).await? {
                let row = schema.row_from_db(raw)?;
                if let Some(id) = row[0].as_u64() {
                    out.insert(id, row);
                }
            }
        }
        metrics::record_cache_lookup("sql", &schema.table_name, if out.is_empty() { "miss" } else { "hit" });
        Ok(out)
    }

    /// `SELECT ID FROM <table> [WHERE ...] ORDER BY ID [LIMIT/OFFSET]`.
    pub(crate) async fn select_ids(
        &self,
        ctx: &Context,
        schema: &EntitySchema,
        where_sql: Option<&str>,
        args: &[Value],
        pager: Option<Pager>,
    ) -> Result<Vec<u64>, OrmError> {
        ctx.check()?;
        let db = self.db_of(schema)?;
        let mut sql = format!("SELECT `ID` FROM `{}`", schema.table_name);
        if let Some(filter) = where_sql {
            sql.push_str(" WHERE ");
            sql.push_str(filter);
        }
        sql.push_str(" ORDER BY `ID`");
        if let Some(pager) = pager {
            sql.push_str(&format!(" LIMIT {} OFFSET {}", pager.size, pager.offset()));
        }
        let rows = db.query(&sql, args).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().and_then(|v| v.as_u64()))
            .collect())
    }

    // ── unique index ──────────────────────────────────────────────────────

    /// Current owner of a unique fingerprint: local → remote hash → SQL.
    pub(crate) async fn unique_owner(
        &self,
        ctx: &Context,
        schema: &EntitySchema,
        index: &IndexDef,
        fp: &str,
        args: &[Value],
    ) -> Result<Option<u64>, OrmError> {
        let local_key = schema.unique_local_key(&index.name, fp);
        let local = self.local_of(schema);
        if let Some(ids) = local.and_then(|l| l.get_query(&local_key)) {
            return Ok(ids.first().copied());
        }
        if let Some(remote) = self.remote_of(schema) {
            match remote.hget(&schema.unique_hash_key(&index.name), fp).await? {
                Some(raw) if raw.is_empty() => {
                    metrics::record_cache_lookup("remote", &schema.table_name, "tombstone");
                    if let Some(local) = local {
                        local.set_query(&local_key, Vec::new());
                    }
                    return Ok(None);
                }
                Some(raw) => match std::str::from_utf8(&raw).ok().and_then(|s| s.parse::<u64>().ok()) {
                    Some(id) => {
                        metrics::record_cache_lookup("remote", &schema.table_name, "hit");
                        if let Some(local) = local {
                            local.set_query(&local_key, vec![id]);
                        }
                        return Ok(Some(id));
                    }
                    None => warn!(table = %schema.table_name, index = %index.name, "Malformed unique mapping"),
                },
                None => metrics::record_cache_lookup("remote", &schema.table_name, "miss"),
            }
        }
        self.unique_owner_from_db(ctx, schema, index, fp, args).await
    }

    /// SQL lookup of a unique fingerprint; the answer (or "absent") is
    /// written back to both tiers.
    pub(crate) async fn unique_owner_from_db(
        &self,
        ctx: &Context,
        schema: &EntitySchema,
        index: &IndexDef,
        fp: &str,
        args: &[Value],
    ) -> Result<Option<u64>, OrmError> {
        ctx.check()?;
        let db = self.db_of(schema)?;
        let (filter, sql_args) = index_filter(schema, index, args);
        let sql = format!("SELECT `ID` FROM `{}` WHERE {filter} LIMIT 1", schema.table_name);
        let id = db
            .query_row(&sql, &sql_args)
            .await?
            .and_then(|row| row.into_iter().next())
            .and_then(|v| v.as_u64());

        if let Some(remote) = self.remote_of(schema) {
            let value = id.map(|id| id.to_string().into_bytes()).unwrap_or_default();
            remote.hset(&schema.unique_hash_key(&index.name), fp, &value).await?;
        }
        if let Some(local) = self.local_of(schema) {
            local.set_query(&schema.unique_local_key(&index.name, fp), id.into_iter().collect());
        }
        Ok(id)
    }

    /// Check a cached owner against its current row. A mapping whose row is
    /// gone or no longer carries `fp` is dropped and answered from SQL once.
    pub(crate) async fn confirm_unique_owner(
        &self,
        ctx: &Context,
        schema: &EntitySchema,
        index: &IndexDef,
        fp: &str,
        args: &[Value],
        id: u64,
    ) -> Result<Option<u64>, OrmError> {
        let row = self.rows_by_ids(ctx, schema, &[id]).await?.pop().flatten();
        if row.is_some_and(|row| schema.index_fingerprint(index, &row).as_deref() == Some(fp)) {
            return Ok(Some(id));
        }
        debug!(table = %schema.table_name, index = %index.name, id, "Stale unique mapping");
        self.forget_unique(schema, index, fp).await?;
        self.unique_owner_from_db(ctx, schema, index, fp, args).await
    }

    async fn forget_unique(&self, schema: &EntitySchema, index: &IndexDef, fp: &str) -> Result<(), OrmError> {
        if let Some(local) = self.local_of(schema) {
            local.remove_query(&schema.unique_local_key(&index.name, fp));
        }
        if let Some(remote) = self.remote_of(schema) {
            remote.hdel(&schema.unique_hash_key(&index.name), &[fp.to_string()]).await?;
        }
        Ok(())
    }

    // ── references and query caches ───────────────────────────────────────

    /// IDs referencing `ref_id` through `column`. Cached references keep a
    /// remote set; an absent set is unknown and reloaded from SQL.
    pub(crate) async fn reference_ids(
        &self,
        ctx: &Context,
        schema: &EntitySchema,
        column: &str,
        ref_id: u64,
    ) -> Result<Vec<u64>, OrmError> {
        let reference = schema.references.get(column).ok_or_else(|| {
            OrmError::schema(format!("{}: '{column}' is not a reference column", schema.table_name))
        })?;
        let filter = format!("`{}` = ?", reference.column);
        let args = [Value::Uint(ref_id)];
        if !reference.cached {
            return self.select_ids(ctx, schema, Some(&filter), &args, None).await;
        }

        let key = schema.reference_key(column, ref_id);
        let local = self.local_of(schema);
        if let Some(ids) = local.and_then(|l| l.get_query(&key)) {
            return Ok(ids.to_vec());
        }
        let remote = self.remote_of(schema);
        if let Some(remote) = remote {
            let members = remote.smembers(&key).await?;
            if !members.is_empty() {
                metrics::record_cache_lookup("remote", &schema.table_name, "hit");
                let mut ids: Vec<u64> = members.iter().filter_map(|m| m.parse().ok()).collect();
                ids.sort_unstable();
                if let Some(local) = local {
                    local.set_query(&key, ids.clone());
                }
                return Ok(ids);
            }
            metrics::record_cache_lookup("remote", &schema.table_name, "miss");
        }

        let ids = self.select_ids(ctx, schema, Some(&filter), &args, None).await?;
        if let (Some(remote), false) = (remote, ids.is_empty()) {
            remote
                .pipeline(vec![
                    RemoteCommand::Del { keys: vec![key.clone()] },
                    RemoteCommand::SAdd {
                        key: key.clone(),
                        members: ids.iter().map(u64::to_string).collect(),
                    },
                ])
                .await?;
        }
        if let Some(local) = local {
            local.set_query(&key, ids.clone());
        }
        Ok(ids)
    }

    pub(crate) async fn index_ids(
        &self,
        ctx: &Context,
        schema: &EntitySchema,
        index: &str,
        values: &[Value],
        pager: Option<Pager>,
    ) -> Result<Vec<u64>, OrmError> {
        let index = schema.index(index)?;
        let args = bind_index_args(schema, index, values, true)?;
        let (filter, sql_args) = index_filter(schema, index, &args);
        if !index.cached {
            return self.select_ids(ctx, schema, Some(&filter), &sql_args, pager).await;
        }
        let probe = sparse_row(schema, index, &args);
        let key = schema.index_query_key(&index.name, &fingerprint(&schema.query_parts(index, &probe)));
        let ids = self
            .cached_id_list(ctx, schema, &key, Some(&filter), &sql_args)
            .await?;
        Ok(match pager {
            Some(pager) => pager.apply(&ids),
            None => ids,
        })
    }

    /// Full ordered ID list under a query-cache key: local → remote JSON
    /// string (with TTL) → SQL.
    async fn cached_id_list(
        &self,
        ctx: &Context,
        schema: &EntitySchema,
        key: &str,
        filter: Option<&str>,
        args: &[Value],
    ) -> Result<Vec<u64>, OrmError> {
        let local = self.local_of(schema);
        if let Some(ids) = local.and_then(|l| l.get_query(key)) {
            return Ok(ids.to_vec());
        }
        let remote = self.remote_of(schema);
        if let Some(remote) = remote {
            if let Some(raw) = remote.get(key).await? {
                match serde_json::from_slice::<Vec<u64>>(&raw) {
                    Ok(ids) => {
                        metrics::record_cache_lookup("remote", &schema.table_name, "hit");
                        if let Some(local) = local {
                            local.set_query(key, ids.clone());
                        }
                        return Ok(ids);
                    }
                    Err(e) => warn!(key, error = %e, "Malformed cached ID list"),
                }
            } else {
                metrics::record_cache_lookup("remote", &schema.table_name, "miss");
            }
        }

        let ids = self.select_ids(ctx, schema, filter, args, None).await?;
        if let Some(remote) = remote {
            let encoded = serde_json::to_vec(&ids).map_err(|e| OrmError::Codec(e.to_string()))?;
            let ttl = (self.config.query_cache_ttl_secs > 0)
                .then(|| Duration::from_secs(self.config.query_cache_ttl_secs));
            remote.set(key, &encoded, ttl).await?;
        }
        if let Some(local) = local {
            local.set_query(key, ids.clone());
        }
        Ok(ids)
    }
}

/// Normalize lookup arguments through their column setters.
fn bind_index_args(
    schema: &EntitySchema,
    index: &IndexDef,
    values: &[Value],
    allow_nil: bool,
) -> Result<Vec<Value>, OrmError> {
    if values.len() != index.positions.len() {
        return Err(OrmError::bind(
            &index.name,
            format!("index needs {} values, got {}", index.positions.len(), values.len()),
        ));
    }
    index
        .positions
        .iter()
        .zip(values)
        .map(|(&pos, value)| {
            let column = &schema.columns[pos];
            let bound = if value.is_nil() {
                Value::Nil
            } else {
                column.normalize(value.clone())?
            };
            if bound.is_nil() && !allow_nil {
                return Err(OrmError::bind(&column.name, "nil value in unique key lookup"));
            }
            Ok(bound)
        })
        .collect()
}

/// Full-width row with only the index columns set, for fingerprinting.
fn sparse_row(schema: &EntitySchema, index: &IndexDef, args: &[Value]) -> Row {
    let mut row = vec![Value::Nil; schema.columns.len()];
    for (&pos, value) in index.positions.iter().zip(args) {
        row[pos] = value.clone();
    }
    row
}

/// `a = ? AND b IS NULL ...` plus its arguments.
pub(crate) fn index_filter(schema: &EntitySchema, index: &IndexDef, args: &[Value]) -> (String, Vec<Value>) {
    let mut clauses = Vec::with_capacity(args.len());
    let mut sql_args = Vec::with_capacity(args.len());
    for (&pos, value) in index.positions.iter().zip(args) {
        let name = &schema.columns[pos].name;
        if value.is_nil() {
            clauses.push(format!("`{name}` IS NULL"));
        } else {
            clauses.push(format!("`{name}` = ?"));
            sql_args.push(schema.sql_arg(pos, value));
        }
    }
    (clauses.join(" AND "), sql_args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?,?,?");
    }
}
