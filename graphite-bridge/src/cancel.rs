//! Cooperative cancellation for write and read calls.
//!
//! A [`CancelToken`] combines a shared cancelled flag with an optional
//! deadline. The write path checks it once, before touching the carbon
//! socket; the read path hands the remaining time to every HTTP fetch as its
//! request timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// A cloneable cancellation handle.
///
/// Clones share the cancelled flag, so cancelling any clone cancels them
/// all. Child tokens created with [`CancelToken::child_with_timeout`] also
/// share it but may carry a tighter deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that is never cancelled unless [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().child_with_timeout(timeout)
    }

    /// A token sharing this one's flag, expiring at the earlier of this
    /// token's deadline and `now + timeout`.
    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now().checked_add(timeout);
        let deadline = match (self.deadline, candidate) {
            (Some(ours), Some(theirs)) => Some(ours.min(theirs)),
            (ours, theirs) => ours.or(theirs),
        };
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline,
        }
    }

    /// Cancels this token and every token sharing its flag.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once cancelled or past the deadline.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline.
    ///
    /// `None` means no deadline; `Some(Duration::ZERO)` means the token is
    /// done, either expired or cancelled.
    pub fn remaining(&self) -> Option<Duration> {
        if self.cancelled.load(Ordering::Acquire) {
            return Some(Duration::ZERO);
        }
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}
