// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Table management: create and truncate.

use tracing::{info, instrument};

use super::Engine;
use crate::context::Context;
use crate::entity::Entity;
use crate::error::OrmError;
use crate::schema::EntitySchema;
use crate::storage::traits::Dialect;

impl Engine {
    /// Create the table (and log table) of every registered schema.
    /// Existing tables are an error; there is no migration diffing.
    #[instrument(skip_all)]
    pub async fn create_tables(&self, ctx: &Context) -> Result<(), OrmError> {
        for schema in self.schemas.iter() {
            ctx.check()?;
            self.create_table(schema).await?;
        }
        Ok(())
    }

    async fn create_table(&self, schema: &EntitySchema) -> Result<(), OrmError> {
        let db = self.db_of(schema)?;
        for statement in schema.create_table_sql(db.dialect()) {
            db.exec(&statement, &[]).await?;
        }
        if schema.log_pool.is_some() {
            db.exec(&schema.create_log_table_sql(db.dialect()), &[]).await?;
        }
        info!(table = %schema.table_name, "Table created");
        Ok(())
    }

    /// Remove every row of `E` and clear its caches in both tiers.
    ///
    /// Archived tables are dropped and recreated; others use `TRUNCATE`
    /// (`DELETE` on SQLite).
    #[instrument(skip_all, fields(entity = std::any::type_name::<E>()))]
    pub async fn truncate<E: Entity>(&self, ctx: &Context) -> Result<(), OrmError> {
        ctx.check()?;
        let schema = self.schema::<E>()?.clone();
        let db = self.db_of(&schema)?;
        if schema.archived {
            db.exec(&format!("DROP TABLE `{}`", schema.table_name), &[]).await?;
            for statement in schema.create_table_sql(db.dialect()) {
                db.exec(&statement, &[]).await?;
            }
        } else {
            let sql = match db.dialect() {
                Dialect::MySql => format!("TRUNCATE TABLE `{}`", schema.table_name),
                Dialect::Sqlite => format!("DELETE FROM `{}`", schema.table_name),
            };
            db.exec(&sql, &[]).await?;
        }

        if let Some(local) = self.local_of(&schema) {
            local.clear();
        }
        if let Some(remote) = self.remote_of(&schema) {
            remote.del(&[schema.rows_key().to_string()]).await?;
            remote.delete_prefix(&format!("{}:", schema.cache_key)).await?;
        }
        info!(table = %schema.table_name, archived = schema.archived, "Table truncated");
        Ok(())
    }
}
