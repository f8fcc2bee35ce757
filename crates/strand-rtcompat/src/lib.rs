//! Compatibility between different async runtimes for Strand.
//!
//! We try to isolate runtime dependencies in a single place, so that
//! the rest of Strand depends only on the minimal set of features its
//! scheduling actually needs: sleeping, spawning, and timeouts.
//!
//! The circuit lifecycle code is written against the [`Runtime`] trait
//! and never against a concrete executor, so the same code runs on a
//! multi-threaded host, a single-threaded cooperative scheduler, or the
//! simulated clock in `strand-rtmock`.

#![deny(missing_docs)]
#![deny(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![warn(clippy::clone_on_ref_ptr)]
#![deny(clippy::missing_docs_in_private_items)]

pub mod task;
mod timer;
mod traits;

#[cfg(feature = "tokio")]
pub mod tokio;

pub use timer::{SleepProviderExt, Timeout, TimeoutError};
pub use traits::{Runtime, SleepProvider, SpawnBlocking};

pub use futures::task::Spawn;

#[cfg(feature = "tokio")]
pub use crate::tokio::{create_runtime, test_with_runtime};
