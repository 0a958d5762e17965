// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Async flush pipeline.
//!
//! `flush_async` applies cache changes immediately and hands the SQL to
//! this pipeline:
//!
//! ```text
//! flush_async ──try_send──▶ per-schema buffer ──worker──▶ RPUSH <async_cache_key>
//!                                                              │
//!                        AsyncConsumer ◀──LRANGE / LTRIM───────┘
//!                              │
//!                              └──▶ SQL (resolvers on error)
//! ```
//!
//! Operations are JSON; the list is processed head first so per-row order
//! is kept.

mod consumer;
mod publisher;

pub use consumer::AsyncConsumer;
pub use publisher::AsyncPublisher;

use serde::{Deserialize, Serialize};

use crate::coordinator::ChangeAction;
use crate::error::OrmError;
use crate::value::Value;

/// One deferred SQL statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncOperation {
    pub table: String,
    /// SQL pool code.
    pub pool: String,
    pub kind: ChangeAction,
    pub id: u64,
    pub sql: String,
    pub args: Vec<Value>,
}

impl AsyncOperation {
    pub fn encode(&self) -> Result<Vec<u8>, OrmError> {
        serde_json::to_vec(self).map_err(|e| OrmError::Codec(e.to_string()))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, OrmError> {
        serde_json::from_slice(raw).map_err(|e| OrmError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_json_keeps_typed_args() {
        let op = AsyncOperation {
            table: "users".into(),
            pool: "default".into(),
            kind: ChangeAction::Update,
            id: 9,
            sql: "UPDATE `users` SET `Age`=? WHERE `ID`=?".into(),
            args: vec![Value::Uint(u64::MAX), Value::Nil, Value::Str("x".into())],
        };
        let raw = op.encode().unwrap();
        assert!(std::str::from_utf8(&raw).unwrap().contains("\"kind\":\"update\""));
        assert_eq!(AsyncOperation::decode(&raw).unwrap(), op);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(AsyncOperation::decode(b"{nope"), Err(OrmError::Codec(_))));
    }
}
