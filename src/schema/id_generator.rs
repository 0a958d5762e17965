// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client-side ID generation.
//!
//! IDs are `server_id:8 | start_time_seconds:32 | counter:24`. The counter
//! overflows into the seconds part, so a generator stays monotonic for as
//! long as it does not issue more than 2^24 IDs per second on average.

use std::sync::atomic::{AtomicU64, Ordering};

const LOW_BITS: u64 = (1 << 56) - 1;

#[derive(Debug)]
pub struct IdGenerator {
    server_id: u8,
    state: AtomicU64,
}

impl IdGenerator {
    #[must_use]
    pub fn new(server_id: u8) -> Self {
        let start = chrono::Utc::now().timestamp().max(0) as u64 & 0xFFFF_FFFF;
        Self::with_start(server_id, start)
    }

    #[must_use]
    pub fn with_start(server_id: u8, start_secs: u64) -> Self {
        Self {
            server_id,
            state: AtomicU64::new((start_secs & 0xFFFF_FFFF) << 24),
        }
    }

    pub fn next(&self) -> u64 {
        let v = self.state.fetch_add(1, Ordering::Relaxed) + 1;
        (u64::from(self.server_id) << 56) | (v & LOW_BITS)
    }
}
