// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine-level errors.

use thiserror::Error;

use crate::storage::traits::StorageError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrmError {
    /// A value does not satisfy the column constraints.
    #[error("invalid value for field '{field}': {reason}")]
    Bind { field: String, reason: String },

    /// Another live row already owns the unique key.
    #[error("duplicated key in index '{index}' (existing ID {existing_id}, columns {columns:?})")]
    DuplicatedKey {
        index: String,
        existing_id: u64,
        columns: Vec<String>,
    },

    #[error("foreign key violation on column '{column}'")]
    ForeignKey { column: String },

    /// Registry validation failure, raised at startup only.
    #[error("schema error: {0}")]
    Schema(String),

    #[error("entity '{0}' is not registered")]
    NotRegistered(String),

    #[error("{table} row with ID {id} does not exist")]
    Missing { table: String, id: u64 },

    /// Malformed cache row or queue payload.
    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] StorageError),

    #[error("operation cancelled")]
    Cancelled,
}

impl OrmError {
    pub(crate) fn bind(field: &str, reason: impl Into<String>) -> Self {
        OrmError::Bind {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn schema(detail: impl Into<String>) -> Self {
        OrmError::Schema(detail.into())
    }

    /// True for the error kinds that abort a flush because of caller input
    /// (as opposed to infrastructure failures).
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            OrmError::Bind { .. }
                | OrmError::DuplicatedKey { .. }
                | OrmError::ForeignKey { .. }
                | OrmError::NotRegistered(_)
                | OrmError::Missing { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = OrmError::DuplicatedKey {
            index: "Name".into(),
            existing_id: 1,
            columns: vec!["Name".into()],
        };
        assert_eq!(
            err.to_string(),
            "duplicated key in index 'Name' (existing ID 1, columns [\"Name\"])"
        );
        assert!(err.is_validation());
    }

    #[test]
    fn test_storage_error_is_io() {
        let err: OrmError = StorageError::Backend("gone".into()).into();
        assert!(matches!(err, OrmError::Io(_)));
        assert!(!err.is_validation());
    }
}
