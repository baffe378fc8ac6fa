//! Cooperative cancellation primitive (§5): every long-running call accepts
//! a cancellation token and a deadline, surfacing `Cancelled` or
//! `DeadlineExceeded` at its suspension points.
//!
//! Built on `tokio::sync::watch` rather than a dedicated crate, mirroring how
//! the rest of this crate reuses `watch` for single-writer broadcast signals
//! (see the recoverer's internal stream-cancellation channel).

use tokio::sync::watch;
use tokio::time::Instant;

/// Which of the two cancellation sources fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Cancelled,
    DeadlineExceeded,
}

/// A cloneable, cancel-once signal. Cloning shares the same underlying flag;
/// any clone's `cancel()` is observed by every other clone and by `cancelled()`.
#[derive(Clone)]
pub struct CancellationToken {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        CancellationToken { tx, rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel()` has been called on this token or any clone.
    /// Resolves immediately if already cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Pairs a [`CancellationToken`] with an optional absolute deadline. Passed
/// by reference through the recoverer, correlator and ingest processor so a
/// caller can cancel or bound an in-flight call from outside it.
#[derive(Clone)]
pub struct Deadline {
    token: CancellationToken,
    at: Option<Instant>,
}

impl Deadline {
    /// No cancellation, no deadline: the call runs to natural completion.
    pub fn none() -> Self {
        Deadline {
            token: CancellationToken::new(),
            at: None,
        }
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Deadline { token, at: None }
    }

    pub fn with_timeout(duration: std::time::Duration) -> Self {
        Deadline {
            token: CancellationToken::new(),
            at: Some(Instant::now() + duration),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Resolves once the token is cancelled or the deadline passes, whichever
    /// comes first. Never resolves if neither is set (matches [`Deadline::none`]).
    pub async fn triggered(&self) -> Trigger {
        match self.at {
            Some(at) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Trigger::Cancelled,
                    _ = tokio::time::sleep_until(at) => Trigger::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Trigger::Cancelled
            }
        }
    }

    fn already_fired(&self) -> Option<Trigger> {
        if self.token.is_cancelled() {
            return Some(Trigger::Cancelled);
        }
        if let Some(at) = self.at {
            if Instant::now() >= at {
                return Some(Trigger::DeadlineExceeded);
            }
        }
        None
    }

    /// `Some(Trigger)` if already cancelled or past deadline, else `None`.
    /// Cheap, non-blocking check for suspension points that poll rather than
    /// await (e.g. before each loop iteration).
    pub fn check(&self) -> Option<Trigger> {
        self.already_fired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_token_resolves_triggered_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let deadline = Deadline::with_token(token);
        assert_eq!(deadline.triggered().await, Trigger::Cancelled);
    }

    #[tokio::test]
    async fn none_deadline_check_never_fires() {
        let deadline = Deadline::none();
        assert_eq!(deadline.check(), None);
    }

    #[tokio::test]
    async fn timeout_deadline_eventually_triggers() {
        let deadline = Deadline::with_timeout(std::time::Duration::from_millis(1));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(deadline.triggered().await, Trigger::DeadlineExceeded);
    }

    #[tokio::test]
    async fn clone_observes_cancel_from_original() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
