// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL pool backed by the `sqlx` `Any` driver (MySQL or SQLite).
//!
//! ## sqlx Any Driver Quirks
//!
//! - There is no unsigned 64-bit type. IDs up to `i64::MAX` bind as
//!   integers, anything larger binds as a decimal string.
//! - MySQL `BIGINT UNSIGNED` comes back as `i64`; the schema layer
//!   reinterprets negative values for unsigned columns.
//! - TEXT columns may come back as BLOB, so rows are decoded leniently
//!   (integer, float, text, bytes, bool) and the column setter does the
//!   final conversion.
//! - DECIMAL / DATE / DATETIME are not mapped at all, which is why entity
//!   SELECTs cast those columns to text on MySQL.

use std::sync::Once;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::error::ErrorKind;
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row, ValueRef};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::traits::{Database, DbRow, Dialect, ExecResult, StorageError, Transaction};
use crate::config::SqlPoolConfig;
use crate::metrics;
use crate::resilience::retry::{retry, RetryConfig};
use crate::value::Value;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlxDatabase {
    name: String,
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlxDatabase {
    /// Connect with startup-mode retry (fails fast if the URL is wrong).
    pub async fn connect(name: &str, config: &SqlPoolConfig) -> Result<Self, StorageError> {
        install_drivers();
        let started = Instant::now();
        let dialect = if config.url.starts_with("sqlite:") {
            Dialect::Sqlite
        } else {
            Dialect::MySql
        };

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(config.max_open)
                .min_connections(config.max_idle.min(config.max_open))
                .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
                .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
                .connect(&config.url)
                .await
                .map_err(|e| {
                    metrics::record_connection_error("sql");
                    StorageError::Backend(e.to_string())
                })
        })
        .await?;

        let db = Self {
            name: name.to_string(),
            pool,
            dialect,
        };
        if dialect == Dialect::Sqlite {
            // readers don't block the writer
            db.exec("PRAGMA journal_mode = WAL", &[]).await?;
        }
        metrics::record_startup_phase("sql_connect", started.elapsed());
        info!(pool = name, dialect = ?dialect, max_open = config.max_open, "SQL pool connected");
        Ok(db)
    }

    #[must_use]
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    args: &'q [Value],
    dialect: Dialect,
) -> Query<'q, Any, AnyArguments<'q>> {
    for arg in args {
        query = match arg {
            Value::Nil => query.bind(None::<i64>),
            Value::Int(v) => query.bind(*v),
            Value::Uint(v) => match (i64::try_from(*v), dialect) {
                (Ok(v), _) => query.bind(v),
                // SQLite integers are signed; column coercion maps negatives back.
                (Err(_), Dialect::Sqlite) => query.bind(*v as i64),
                (Err(_), Dialect::MySql) => query.bind(v.to_string()),
            },
            Value::Float(v) => query.bind(*v),
            Value::Str(s) => query.bind(s.as_str()),
            Value::Bytes(b) => query.bind(b.as_slice()),
            Value::Bool(b) => query.bind(*b),
            Value::Time(t) => query.bind(t.format("%Y-%m-%d %H:%M:%S").to_string()),
        };
    }
    query
}

fn decode_column(row: &AnyRow, i: usize) -> Result<Value, StorageError> {
    let raw = row
        .try_get_raw(i)
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    if raw.is_null() {
        return Ok(Value::Nil);
    }
    if let Ok(v) = row.try_get::<i64, _>(i) {
        return Ok(Value::Int(v));
    }
    if let Ok(v) = row.try_get::<f64, _>(i) {
        return Ok(Value::Float(v));
    }
    if let Ok(v) = row.try_get::<String, _>(i) {
        return Ok(Value::Str(v));
    }
    if let Ok(v) = row.try_get::<Vec<u8>, _>(i) {
        return Ok(Value::Bytes(v));
    }
    if let Ok(v) = row.try_get::<bool, _>(i) {
        return Ok(Value::Bool(v));
    }
    Err(StorageError::Backend(format!("cannot decode column {i}")))
}

fn decode_row(row: &AnyRow) -> Result<DbRow, StorageError> {
    (0..row.len()).map(|i| decode_column(row, i)).collect()
}

fn between<'a>(message: &'a str, start: &str, end: char) -> Option<&'a str> {
    let from = message.find(start)? + start.len();
    let rest = &message[from..];
    Some(rest.find(end).map_or(rest, |to| &rest[..to]))
}

/// Map driver errors onto [`StorageError`], recognising constraint failures.
///
/// `Duplicate::key` is the index name on MySQL (`PRIMARY` for the ID) and
/// the comma separated column list on SQLite.
pub(crate) fn classify(err: sqlx::Error) -> StorageError {
    let sqlx::Error::Database(db_err) = &err else {
        return StorageError::Backend(err.to_string());
    };
    let message = db_err.message().to_string();
    match db_err.kind() {
        ErrorKind::UniqueViolation => {
            let key = if let Some(key) = between(&message, "for key '", '\'') {
                // MySQL 8 qualifies the key with the table name
                key.rsplit('.').next().unwrap_or(key).to_string()
            } else if let Some(cols) = between(&message, "UNIQUE constraint failed: ", '\n') {
                cols.split(',')
                    .map(|c| c.trim().rsplit('.').next().unwrap_or(c).to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            } else {
                String::new()
            };
            StorageError::Duplicate { key, detail: message }
        }
        ErrorKind::ForeignKeyViolation => StorageError::ForeignKey { detail: message },
        _ => StorageError::Backend(message),
    }
}

fn statement_kind(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase()
}

#[async_trait]
impl Database for SqlxDatabase {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult, StorageError> {
        let started = Instant::now();
        debug!(pool = %self.name, sql, args = args.len(), "SQL exec");
        let result = bind_all(sqlx::query(sql), args, self.dialect)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        metrics::record_sql(&self.name, &statement_kind(sql), started.elapsed());
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id().and_then(|id| u64::try_from(id).ok()),
        })
    }

    async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<DbRow>, StorageError> {
        let started = Instant::now();
        debug!(pool = %self.name, sql, args = args.len(), "SQL query");
        let rows = bind_all(sqlx::query(sql), args, self.dialect)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        metrics::record_sql(&self.name, "select", started.elapsed());
        rows.iter().map(decode_row).collect()
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        let tx = self.pool.begin().await.map_err(classify)?;
        debug!(pool = %self.name, "SQL transaction started");
        Ok(Box::new(SqlxTransaction {
            name: self.name.clone(),
            dialect: self.dialect,
            tx: Mutex::new(tx),
        }))
    }
}

struct SqlxTransaction {
    name: String,
    dialect: Dialect,
    tx: Mutex<sqlx::Transaction<'static, Any>>,
}

#[async_trait]
impl Transaction for SqlxTransaction {
    async fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult, StorageError> {
        let started = Instant::now();
        debug!(pool = %self.name, sql, args = args.len(), "SQL exec (tx)");
        let mut tx = self.tx.lock().await;
        let result = bind_all(sqlx::query(sql), args, self.dialect)
            .execute(&mut **tx)
            .await
            .map_err(classify)?;
        metrics::record_sql(&self.name, &statement_kind(sql), started.elapsed());
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id().and_then(|id| u64::try_from(id).ok()),
        })
    }

    async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<DbRow>, StorageError> {
        let mut tx = self.tx.lock().await;
        let rows = bind_all(sqlx::query(sql), args, self.dialect)
            .fetch_all(&mut **tx)
            .await
            .map_err(classify)?;
        rows.iter().map(decode_row).collect()
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.into_inner().commit().await.map_err(classify)?;
        debug!(pool = %self.name, "SQL transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.into_inner().rollback().await.map_err(classify)?;
        debug!(pool = %self.name, "SQL transaction rolled back");
        Ok(())
    }
}
