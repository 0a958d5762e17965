// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public value types of the engine API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::async_flush::AsyncOperation;
use crate::schema::EntitySchema;
use crate::storage::traits::StorageError;

/// One page of an ID-ordered result list. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pager {
    pub page: usize,
    pub size: usize,
}

impl Pager {
    #[must_use]
    pub fn new(page: usize, size: usize) -> Self {
        Self {
            page: page.max(1),
            size,
        }
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        (self.page.max(1) - 1) * self.size
    }

    /// Slice `ids` down to this page.
    #[must_use]
    pub fn apply(&self, ids: &[u64]) -> Vec<u64> {
        ids.iter().skip(self.offset()).take(self.size).copied().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl ChangeAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Insert => "insert",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }
}

/// Emitted once per applied mutation, to the log/dirty streams and to
/// in-process listeners.
///
/// Inserts carry the full `after` image, deletes the full `before` image,
/// updates only the columns that changed on both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    pub table: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Map<String, serde_json::Value>>,
    pub timestamp: DateTime<Utc>,
}

/// What a flush did, per table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub inserted: Vec<(String, u64)>,
    pub updated: Vec<(String, u64)>,
    pub deleted: Vec<(String, u64)>,
    /// Inserts that hit an existing row and were turned into updates of it
    /// (`insert_on_duplicate`): `(table, tracked_id, existing_id)`.
    pub redirected: Vec<(String, u64, u64)>,
}

impl FlushSummary {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// In-process observer of applied mutations.
pub type ChangeListener = dyn Fn(&ChangeEvent) + Send + Sync;

/// Decides whether a failed async SQL operation may be dropped.
/// Returning `true` marks the operation handled.
pub type QueryErrorResolver = dyn Fn(&EntitySchema, &AsyncOperation, &StorageError) -> bool + Send + Sync;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pager_slices_pages() {
        let ids: Vec<u64> = (1..=10).collect();
        assert_eq!(Pager::new(1, 3).apply(&ids), vec![1, 2, 3]);
        assert_eq!(Pager::new(4, 3).apply(&ids), vec![10]);
        assert!(Pager::new(5, 3).apply(&ids).is_empty());
        // page 0 is treated as the first page
        assert_eq!(Pager::new(0, 2).apply(&ids), vec![1, 2]);
    }

    #[test]
    fn test_change_event_json_skips_empty_images() {
        let event = ChangeEvent {
            action: ChangeAction::Delete,
            table: "users".into(),
            id: 7,
            before: None,
            after: None,
            meta: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["action"], "delete");
        assert!(json.get("before").is_none());
        let back: ChangeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
