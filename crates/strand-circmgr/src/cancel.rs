//! The cancellation fabric threaded through every asynchronous
//! operation.
//!
//! A [`CancelToken`] is shared by everything belonging to one client.
//! Calling [`abort`](CancelToken::abort) does not preempt anything: it
//! bumps a generation counter and wakes every listener, and each
//! operation checks the token at its next suspension point.  An
//! operation that began before the abort observes the newer generation
//! and fails with [`Error::Cancelled`]; operations started afterwards
//! capture the new generation and run normally.
//!
//! [`close`](CancelToken::close) is stronger: it marks the token closed
//! permanently, so every generation — past and future — observes
//! cancellation.

use crate::{Error, Result};

use event_listener::Event;
use futures::future::{select, Either};
use futures::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A point in the token's abort history, captured when an operation
/// begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

/// A client-scoped cancellation flag with a monotonically increasing
/// generation.
///
/// Cloning a token yields another handle to the same shared state.
#[derive(Clone)]
pub struct CancelToken {
    /// State shared between every clone of this token.
    inner: Arc<Inner>,
}

/// Shared state for a [`CancelToken`].
struct Inner {
    /// Incremented by every `abort()`; operations compare their
    /// captured generation against this.
    generation: AtomicU64,
    /// Set (and never cleared) by the first `abort()`.  Informational:
    /// `is_aborted()` reads this.
    aborted: AtomicBool,
    /// Set by `close()`.  Once set, every check fails.
    closed: AtomicBool,
    /// Wakes every pending `cancelled()` future on abort or close.
    event: Event,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create a new token with no aborts recorded.
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                generation: AtomicU64::new(0),
                aborted: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                event: Event::new(),
            }),
        }
    }

    /// Capture the current generation.
    ///
    /// Do this once when an operation begins, and pass the result to
    /// [`check`](CancelToken::check) at every suspension point.
    pub fn generation(&self) -> Generation {
        Generation(self.inner.generation.load(Ordering::SeqCst))
    }

    /// Cancel every operation currently in flight.
    ///
    /// Never errors; a no-op after [`close`](CancelToken::close).
    pub fn abort(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.event.notify(usize::MAX);
    }

    /// Return true if [`abort`](CancelToken::abort) has ever been
    /// called.  Pure read; no side effects.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Close the token permanently.  Every in-flight and future check
    /// fails after this.  Idempotent; never errors.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.event.notify(usize::MAX);
    }

    /// Return true if the token has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Cancelled`] if an abort has superseded the
    /// operation that captured `gen`, or if the token is closed.
    pub fn check(&self, gen: Generation) -> Result<()> {
        if self.is_closed() || self.inner.generation.load(Ordering::SeqCst) > gen.0 {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Wait until [`check`](CancelToken::check) would fail for `gen`.
    pub async fn cancelled(&self, gen: Generation) {
        loop {
            if self.check(gen).is_err() {
                return;
            }
            let listener = self.inner.event.listen();
            // Re-check after registering, in case we raced an abort.
            if self.check(gen).is_err() {
                return;
            }
            listener.await;
        }
    }

    /// Run `fut` until it completes or the token cancels `gen`,
    /// whichever happens first.
    ///
    /// Cancellation wins races: it is checked before the inner result
    /// is delivered, so an operation never completes after observing a
    /// set flag — even if the underlying work succeeded.
    pub async fn with_cancel<T, E, F>(&self, gen: Generation, fut: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        futures::pin_mut!(fut);
        let cancelled = self.cancelled(gen);
        futures::pin_mut!(cancelled);

        match select(cancelled, fut).await {
            Either::Left(((), _)) => Err(Error::Cancelled.into()),
            Either::Right((output, _)) => {
                self.check(gen).map_err(E::from)?;
                output
            }
        }
    }
}
