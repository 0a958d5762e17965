// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! CREATE TABLE rendering. No diffing: tables are created or dropped whole.

use super::{ColumnDef, ColumnKind, EntitySchema, IndexDef};
use crate::storage::traits::Dialect;

fn quote_list(values: &[String]) -> String {
    values
        .iter()
        .map(|v| format!("'{}'", v.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(",")
}

fn mysql_type(column: &ColumnDef) -> String {
    let unsigned = if column.unsigned { " unsigned" } else { "" };
    match &column.kind {
        ColumnKind::Id | ColumnKind::Reference { .. } => "bigint unsigned".to_string(),
        ColumnKind::Int { bits } => {
            let base = match bits {
                8 => "tinyint",
                16 => "smallint",
                32 => "int",
                _ => "bigint",
            };
            format!("{base}{unsigned}")
        }
        ColumnKind::Uint { bits } => match bits {
            8 => "tinyint unsigned".to_string(),
            16 => "smallint unsigned".to_string(),
            32 => "int unsigned".to_string(),
            _ => "bigint unsigned".to_string(),
        },
        ColumnKind::Bool => "tinyint(1)".to_string(),
        ColumnKind::Float { bits: 32, .. } => format!("float{unsigned}"),
        ColumnKind::Float { .. } => format!("double{unsigned}"),
        ColumnKind::Decimal { width, scale } => format!("decimal({width},{scale}){unsigned}"),
        ColumnKind::Str { max_len: Some(n) } => format!("varchar({n})"),
        ColumnKind::Str { max_len: None } => "mediumtext".to_string(),
        ColumnKind::Bytes { max_len: Some(n) } if *n <= 65_535 => "blob".to_string(),
        ColumnKind::Bytes { .. } => "mediumblob".to_string(),
        ColumnKind::Date => "date".to_string(),
        ColumnKind::DateTime => "datetime".to_string(),
        ColumnKind::Enum(def) => format!("enum({})", quote_list(&def.values)),
        ColumnKind::Set(def) => format!("set({})", quote_list(&def.values)),
    }
}

fn sqlite_type(column: &ColumnDef) -> String {
    match &column.kind {
        ColumnKind::Id
        | ColumnKind::Reference { .. }
        | ColumnKind::Int { .. }
        | ColumnKind::Uint { .. }
        | ColumnKind::Bool => "INTEGER".to_string(),
        ColumnKind::Float { .. } => "REAL".to_string(),
        ColumnKind::Decimal { width, scale } => format!("DECIMAL({width},{scale})"),
        ColumnKind::Bytes { .. } => "BLOB".to_string(),
        ColumnKind::Str { .. }
        | ColumnKind::Enum(_)
        | ColumnKind::Set(_)
        | ColumnKind::Date
        | ColumnKind::DateTime => "TEXT".to_string(),
    }
}

impl EntitySchema {
    fn index_sql(&self, dialect: Dialect, index: &IndexDef, unique: bool) -> String {
        let name = match dialect {
            Dialect::MySql => index.name.clone(),
            // sqlite index names are database-wide
            Dialect::Sqlite => format!("{}_{}", self.table_name, index.name),
        };
        let columns: Vec<String> = index.columns.iter().map(|c| format!("`{c}`")).collect();
        format!(
            "CREATE {}INDEX `{}` ON `{}` ({})",
            if unique { "UNIQUE " } else { "" },
            name,
            self.table_name,
            columns.join(",")
        )
    }

    /// CREATE TABLE followed by one CREATE INDEX per index.
    #[must_use]
    pub fn create_table_sql(&self, dialect: Dialect) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.columns.len() + 1);
        for column in &self.columns {
            let line = match (dialect, &column.kind) {
                (Dialect::Sqlite, ColumnKind::Id) => "`ID` INTEGER NOT NULL PRIMARY KEY".to_string(),
                (Dialect::MySql, _) => format!(
                    "`{}` {} {}",
                    column.name,
                    mysql_type(column),
                    if column.nullable { "DEFAULT NULL" } else { "NOT NULL" }
                ),
                (Dialect::Sqlite, _) => format!(
                    "`{}` {}{}",
                    column.name,
                    sqlite_type(column),
                    if column.nullable { "" } else { " NOT NULL" }
                ),
            };
            lines.push(line);
        }
        let table = match dialect {
            Dialect::MySql => {
                lines.push("PRIMARY KEY (`ID`)".to_string());
                format!(
                    "CREATE TABLE `{}` (\n  {}\n) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
                    self.table_name,
                    lines.join(",\n  ")
                )
            }
            Dialect::Sqlite => format!(
                "CREATE TABLE `{}` (\n  {}\n)",
                self.table_name,
                lines.join(",\n  ")
            ),
        };

        let mut statements = vec![table];
        statements.extend(
            self.unique_indices
                .values()
                .map(|index| self.index_sql(dialect, index, true)),
        );
        statements.extend(
            self.indices
                .values()
                .map(|index| self.index_sql(dialect, index, false)),
        );
        statements
    }

    /// Column list for entity SELECTs. MySQL DECIMAL and temporal columns
    /// are read as text.
    #[must_use]
    pub fn select_list(&self, dialect: Dialect) -> String {
        self.columns
            .iter()
            .map(|c| match (dialect, &c.kind) {
                (
                    Dialect::MySql,
                    ColumnKind::Decimal { .. } | ColumnKind::Date | ColumnKind::DateTime,
                ) => format!("CAST(`{0}` AS CHAR) AS `{0}`", c.name),
                _ => format!("`{}`", c.name),
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// `_log_<table>` for schemas with a log pool.
    #[must_use]
    pub fn create_log_table_sql(&self, dialect: Dialect) -> String {
        match dialect {
            Dialect::MySql => format!(
                "CREATE TABLE `{}` (\n  `ID` bigint unsigned NOT NULL AUTO_INCREMENT,\n  \
                 `EntityID` bigint unsigned NOT NULL,\n  `Date` datetime NOT NULL,\n  \
                 `Meta` json DEFAULT NULL,\n  `Before` json DEFAULT NULL,\n  \
                 `After` json DEFAULT NULL,\n  PRIMARY KEY (`ID`),\n  KEY `EntityID` (`EntityID`)\n\
                 ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
                self.log_table()
            ),
            Dialect::Sqlite => format!(
                "CREATE TABLE `{}` (\n  `ID` INTEGER PRIMARY KEY AUTOINCREMENT,\n  \
                 `EntityID` INTEGER NOT NULL,\n  `Date` TEXT NOT NULL,\n  `Meta` TEXT,\n  \
                 `Before` TEXT,\n  `After` TEXT\n)",
                self.log_table()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::config::EngineConfig;
    use crate::schema::{EntityDef, EntitySchema, FieldDef, FieldKind};
    use crate::storage::traits::Dialect;

    fn schema() -> EntitySchema {
        let def = EntityDef::new("users")
            .field(FieldDef::new("ID", FieldKind::Id))
            .field(FieldDef::new("Name", FieldKind::String).tags("required;unique=Name"))
            .field(FieldDef::new("Age", FieldKind::U8).tags("index=Age"))
            .field(FieldDef::new("Bio", FieldKind::String).tags("length=max"));
        EntitySchema::build("User", &def, &HashMap::new(), &EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_mysql_table() {
        let sql = schema().create_table_sql(Dialect::MySql);
        assert_eq!(sql.len(), 3);
        assert!(sql[0].contains("`ID` bigint unsigned NOT NULL"));
        assert!(sql[0].contains("`Name` varchar(255) NOT NULL"));
        assert!(sql[0].contains("`Bio` mediumtext DEFAULT NULL"));
        assert_eq!(sql[1], "CREATE UNIQUE INDEX `Name` ON `users` (`Name`)");
        assert_eq!(sql[2], "CREATE INDEX `Age` ON `users` (`Age`)");
    }

    #[test]
    fn test_sqlite_table() {
        let sql = schema().create_table_sql(Dialect::Sqlite);
        assert!(sql[0].contains("`ID` INTEGER NOT NULL PRIMARY KEY"));
        assert!(sql[0].contains("`Age` INTEGER NOT NULL"));
        assert_eq!(sql[1], "CREATE UNIQUE INDEX `users_Name` ON `users` (`Name`)");
        assert_eq!(schema().select_list(Dialect::Sqlite), "`ID`,`Name`,`Age`,`Bio`");
    }
}
