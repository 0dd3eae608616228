/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Single-threaded cooperative task loop support.
//!
//! The agent itself never spawns threads or blocks; all state transitions, HTTP callbacks, and
//! timers are posted as closures to an embedding-supplied [`TaskRunner`]. Suspension points are the
//! completion callbacks of external providers and timer fires, and ordering is FIFO among
//! same-deadline tasks — properties the `TaskRunner` implementation is responsible for, not this
//! crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A task the embedder can cancel. Returned by [`TaskRunner::post_delayed`].
pub trait TaskHandle: Send {
    fn cancel(&self);
}

/// The task-runner collaborator: posts a closure to run on the cooperative task loop, either
/// immediately or after a delay.
pub trait TaskRunner: Send + Sync {
    fn post(&self, task: Box<dyn FnOnce() + Send>);
    fn post_delayed(&self, task: Box<dyn FnOnce() + Send>, delay: Duration) -> Box<dyn TaskHandle>;
}

/// The weak-callback idiom, implemented as a cheap cancellation flag every long-lived
/// component owns and clones into closures it hands to a [`TaskRunner`]. A closure should check
/// [`CancelToken::is_cancelled`] as its first action and return immediately if cancelled, rather
/// than touching state that may have been torn down.
///
/// Implements `interrupt_support::Interruptee` directly rather than reinventing the check, but
/// scoped per-component (dropping the owner invalidates only its own token) instead of the
/// process-wide generation counter `InterruptScope` uses — this agent tears down and recreates
/// components (a pairing session, a command's upload queue) far more often than a sync engine
/// tears down its single global scope.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl interrupt_support::Interruptable for CancelToken {
    fn interrupt(&self) {
        self.cancel();
    }
}

impl interrupt_support::Interruptee for CancelToken {
    fn was_interrupted(&self) -> bool {
        self.is_cancelled()
    }
}

/// Drop guard: cancels the token when the owning component is torn down.
pub struct CancelOnDrop(pub CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Exponential backoff with jitter: initial 1s, factor 2, cap 5 min, ±20% jitter.
/// Shared by token refresh, state upload, and command upload retry loops.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    attempt: u32,
    initial: Duration,
    factor: u32,
    cap: Duration,
}

impl Backoff {
    pub const DEFAULT_INITIAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_FACTOR: u32 = 2;
    pub const DEFAULT_CAP: Duration = Duration::from_secs(5 * 60);

    pub fn new() -> Self {
        Self {
            attempt: 0,
            initial: Self::DEFAULT_INITIAL,
            factor: Self::DEFAULT_FACTOR,
            cap: Self::DEFAULT_CAP,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Base delay for the *next* call to `next_delay`, before jitter — exposed for tests that want
    /// a deterministic expectation.
    pub fn base_delay(&self) -> Duration {
        let factor = self.factor.saturating_pow(self.attempt);
        self.initial.saturating_mul(factor).min(self.cap)
    }

    /// Consume one attempt and return the (jittered) delay to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);
        jitter(base)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply ±20% jitter to `base`, using the thread-local RNG.
fn jitter(base: Duration) -> Duration {
    use rand::Rng;
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut b = Backoff::new();
        assert_eq!(b.base_delay(), Duration::from_secs(1));
        b.next_delay();
        assert_eq!(b.base_delay(), Duration::from_secs(2));
        b.next_delay();
        assert_eq!(b.base_delay(), Duration::from_secs(4));
        for _ in 0..20 {
            b.next_delay();
        }
        assert_eq!(b.base_delay(), Backoff::DEFAULT_CAP);
    }

    #[test]
    fn test_backoff_jitter_within_twenty_percent() {
        let b = Backoff::new();
        for _ in 0..200 {
            let delay = jitter(Duration::from_secs(10));
            assert!(delay >= Duration::from_secs_f64(8.0));
            assert!(delay <= Duration::from_secs_f64(12.0));
        }
        let _ = b;
    }

    #[test]
    fn test_backoff_reset() {
        let mut b = Backoff::new();
        b.next_delay();
        b.next_delay();
        assert_ne!(b.base_delay(), Duration::from_secs(1));
        b.reset();
        assert_eq!(b.base_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_cancel_on_drop() {
        let token = CancelToken::new();
        {
            let _guard = CancelOnDrop(token.clone());
            assert!(!token.is_cancelled());
        }
        assert!(token.is_cancelled());
    }
}
