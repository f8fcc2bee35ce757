//! Declarations for the traits that make up a [`Runtime`].

use futures::task::Spawn;
use futures::Future;
use std::time::{Duration, Instant};

/// A runtime that we can use to run the Strand client.
///
/// Anything that can sleep, spawn tasks, and block on a future can host
/// the circuit lifecycle code.  We deliberately do not require a
/// networking provider here: reaching the bridge is the job of the
/// pluggable transport, which is consumed as a capability elsewhere.
pub trait Runtime: Send + Sync + Spawn + SpawnBlocking + Clone + SleepProvider + 'static {}

impl<T> Runtime for T where T: Send + Sync + Spawn + SpawnBlocking + Clone + SleepProvider + 'static {}

/// Trait for a runtime that can wait until a timer has expired.
///
/// Every timer and timeout in Strand goes through this trait, so that
/// tests can substitute a simulated clock.
pub trait SleepProvider {
    /// A future returned by [`SleepProvider::sleep()`].
    type SleepFuture: Future<Output = ()> + Send + 'static;

    /// Return a future that will be ready after `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> Self::SleepFuture;

    /// Return this provider's view of the current monotonic instant.
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Trait for a runtime that can block on a future until it completes.
pub trait SpawnBlocking {
    /// Run `f` until it is ready, and return its output.
    fn block_on<F: Future>(&self, f: F) -> F::Output;
}
