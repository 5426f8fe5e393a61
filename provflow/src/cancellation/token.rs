//! Cancellation token shared between a stage and its upstream source.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct TokenState {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
}

/// A cloneable token for cooperative cancellation.
///
/// All clones observe the same state. Cancellation is idempotent: only the
/// first reason is kept.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Creates a new, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation with a reason.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut slot = self.state.reason.write();
        if slot.is_none() {
            let reason = reason.into();
            debug!(reason = %reason, "Cancellation requested");
            *slot = Some(reason);
            self.state.cancelled.store(true, Ordering::SeqCst);
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.state.reason.read().clone()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        assert!(observer.reason().is_none());
        token.cancel("upstream closed");

        assert!(observer.is_cancelled());
        assert_eq!(observer.reason(), Some("upstream closed".to_string()));
    }

    #[test]
    fn test_first_reason_is_kept() {
        let token = CancellationToken::new();
        token.cancel("disk full");
        token.cancel("operator abort");

        assert_eq!(token.reason(), Some("disk full".to_string()));
    }

    #[test]
    fn test_cancellation_crosses_threads() {
        let token = CancellationToken::new();
        let worker = {
            let token = token.clone();
            std::thread::spawn(move || {
                while !token.is_cancelled() {
                    std::thread::yield_now();
                }
                token.reason()
            })
        };
        token.cancel("shutdown");
        assert_eq!(worker.join().unwrap().as_deref(), Some("shutdown"));
    }
}
