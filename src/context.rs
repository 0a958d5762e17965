// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ambient call context: cancellation plus an optional deadline.
//!
//! Every public engine call takes a `&Context`. Blocking loops (flush
//! phases, lock spins, async queue polling) call [`Context::check`] at each
//! iteration boundary and bail out with [`OrmError::Cancelled`].

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::OrmError;

#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that never expires on its own.
    #[must_use]
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Child context that also expires after `timeout`.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    /// Child context cancelled together with this one.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn check(&self) -> Result<(), OrmError> {
        if self.is_cancelled() {
            Err(OrmError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the token is cancelled or the deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline.into()) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Sleep for `duration`, returning `Cancelled` early if the context ends.
    pub async fn sleep(&self, duration: Duration) -> Result<(), OrmError> {
        tokio::select! {
            _ = self.done() => Err(OrmError::Cancelled),
            _ = tokio::time::sleep(duration) => self.check(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_is_live() {
        assert!(Context::background().check().is_ok());
    }

    #[test]
    fn test_cancel_propagates_to_children() {
        let parent = Context::background();
        let child = parent.child();
        parent.cancel();
        assert_eq!(child.check(), Err(OrmError::Cancelled));
    }

    #[tokio::test]
    async fn test_timeout_expires() {
        let ctx = Context::background().with_timeout(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_sleep_interrupted() {
        let ctx = Context::background();
        let c2 = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            c2.cancel();
        });
        assert_eq!(ctx.sleep(Duration::from_secs(30)).await, Err(OrmError::Cancelled));
    }
}
