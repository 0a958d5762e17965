// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change events: phase 6 of a flush, plus the writer that drains a log
//! stream into its `_log_<table>` table.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, warn};

use super::flush::Bound;
use super::{ChangeAction, ChangeEvent, Engine, DEFAULT_POOL};
use crate::context::Context;
use crate::entity::Entity;
use crate::error::OrmError;
use crate::metrics;
use crate::storage::traits::RemoteCommand;
use crate::value::Value;

/// Stream field holding the JSON encoded [`ChangeEvent`].
pub(crate) const EVENT_FIELD: &str = "event";

impl ChangeEvent {
    fn from_bound(b: &Bound) -> Self {
        let schema = &b.schema;
        let (before, after) = match b.action {
            ChangeAction::Insert => (None, b.after.as_ref().map(|r| schema.row_to_json(r))),
            ChangeAction::Delete => (b.before.as_ref().map(|r| schema.row_to_json(r)), None),
            ChangeAction::Update => {
                let changed = b.changed_positions();
                let project = |row: &Option<Vec<Value>>| {
                    row.as_ref().map(|row| {
                        changed
                            .iter()
                            .map(|&pos| {
                                let column = &schema.columns[pos];
                                (column.name.clone(), column.to_json(&row[pos]))
                            })
                            .collect::<serde_json::Map<_, _>>()
                    })
                };
                (project(&b.before), project(&b.after))
            }
        };
        Self {
            action: b.action,
            table: schema.table_name.clone(),
            id: b.id,
            before,
            after,
            meta: (!b.meta.is_empty()).then(|| b.meta.clone()),
            timestamp: Utc::now(),
        }
    }
}

impl Engine {
    /// Notify listeners, then publish to log and dirty streams.
    pub(super) async fn emit_events(&self, applied: &[&Bound]) -> Result<(), OrmError> {
        let mut streams: HashMap<&str, Vec<RemoteCommand>> = HashMap::new();
        for b in applied {
            let event = ChangeEvent::from_bound(b);
            self.notify_listeners(&event);

            let schema = &b.schema;
            if schema.log_pool.is_none() && schema.dirty_streams.is_empty() {
                continue;
            }
            let payload = serde_json::to_vec(&event).map_err(|e| OrmError::Codec(e.to_string()))?;
            if let Some(pool) = schema.log_pool.as_deref() {
                streams.entry(pool).or_default().push(RemoteCommand::XAdd {
                    stream: schema.log_stream(),
                    fields: vec![(EVENT_FIELD.to_string(), payload.clone())],
                });
            }
            for stream in &schema.dirty_streams {
                streams.entry(DEFAULT_POOL).or_default().push(RemoteCommand::XAdd {
                    stream: stream.clone(),
                    fields: vec![(EVENT_FIELD.to_string(), payload.clone())],
                });
            }
        }

        for (pool, commands) in streams {
            let count = commands.len();
            self.remote_pool(pool)?.pipeline(commands).await?;
            metrics::record_events(pool, count);
        }
        Ok(())
    }

    /// Pending change events of a log or dirty stream, oldest first,
    /// without removing them.
    pub async fn read_events(
        &self,
        pool: &str,
        stream: &str,
        count: usize,
    ) -> Result<Vec<(String, ChangeEvent)>, OrmError> {
        let entries = self.remote_pool(pool)?.xrange(stream, count).await?;
        entries
            .into_iter()
            .map(|(id, fields)| decode_event(&fields).map(|event| (id, event)))
            .collect()
    }
}

fn decode_event(fields: &[(String, Vec<u8>)]) -> Result<ChangeEvent, OrmError> {
    let payload = fields
        .iter()
        .find(|(name, _)| name == EVENT_FIELD)
        .map(|(_, value)| value.as_slice())
        .ok_or_else(|| OrmError::Codec("stream entry without event field".to_string()))?;
    serde_json::from_slice(payload).map_err(|e| OrmError::Codec(e.to_string()))
}

/// Moves the log stream of one entity into its `_log_<table>` table.
pub struct LogTableWriter {
    engine: Engine,
    batch_size: usize,
}

impl LogTableWriter {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        let batch_size = engine.config().async_batch_size.max(1);
        Self { engine, batch_size }
    }

    /// Drain the log stream of `E` until it is empty. Returns the number of
    /// rows written. Entries are deleted from the stream only after their
    /// INSERT succeeded; undecodable entries are dropped with a warning.
    pub async fn drain<E: Entity>(&self, ctx: &Context) -> Result<usize, OrmError> {
        let schema = self.engine.schema::<E>()?.clone();
        let pool = schema.log_pool.as_deref().ok_or_else(|| {
            OrmError::schema(format!("{} has no log pool", schema.table_name))
        })?;
        let cache = self.engine.remote_pool(pool)?.clone();
        let db = self.engine.db_of(&schema)?.clone();
        let stream = schema.log_stream();
        let sql = format!(
            "INSERT INTO `{}` (`EntityID`,`Date`,`Meta`,`Before`,`After`) VALUES (?,?,?,?,?)",
            schema.log_table()
        );

        let mut written = 0;
        loop {
            ctx.check()?;
            let entries = cache.xrange(&stream, self.batch_size).await?;
            if entries.is_empty() {
                break;
            }
            let mut done = Vec::with_capacity(entries.len());
            for (id, fields) in entries {
                match decode_event(&fields) {
                    Ok(event) => {
                        let json = |map: Option<serde_json::Map<String, serde_json::Value>>| {
                            map.map_or(Value::Nil, |m| Value::Str(serde_json::Value::Object(m).to_string()))
                        };
                        let args = [
                            Value::Uint(event.id),
                            Value::Str(event.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()),
                            json(event.meta),
                            json(event.before),
                            json(event.after),
                        ];
                        if let Err(e) = db.exec(&sql, &args).await {
                            // Keep the failed entry at the head of the stream.
                            if !done.is_empty() {
                                cache.xdel(&stream, &done).await?;
                            }
                            return Err(e.into());
                        }
                        written += 1;
                    }
                    Err(e) => warn!(stream = %stream, entry = %id, error = %e, "Dropping undecodable log entry"),
                }
                done.push(id);
            }
            cache.xdel(&stream, &done).await?;
        }
        debug!(table = %schema.table_name, written, "Log stream drained");
        Ok(written)
    }
}
