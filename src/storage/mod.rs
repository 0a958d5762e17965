// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage drivers: the SQL tier and the remote cache tier.

pub mod lock;
pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;
