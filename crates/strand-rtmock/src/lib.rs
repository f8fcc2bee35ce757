//! Support for simulating the passage of time in unit tests.
//!
//! We use this code to test long-running behaviors (circuit rotation,
//! timeouts, health checks) without actually waiting for the real
//! clock to advance.

#![deny(missing_docs)]
#![deny(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![warn(clippy::clone_on_ref_ptr)]

mod sleep_runtime;
mod time;

pub use sleep_runtime::{MockSleepRuntime, WaitFor};
pub use time::{MockSleepProvider, Sleeping};
