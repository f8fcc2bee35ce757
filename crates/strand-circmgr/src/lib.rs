//! Manage the lifecycle of anonymizing circuits for the Strand client.
//!
//! This crate is the core of Strand: it decides when circuits are
//! created, which circuit serves which request, when circuits are
//! rotated or retired, and how in-flight work is cancelled without
//! corrupting pool state.  It deliberately knows nothing about the
//! onion-routing protocol or the pluggable-transport wire formats;
//! both are consumed through capability traits.
//!
//! The pieces:
//!
//!  * [`IsolationPolicy`] and [`IsolationKey`] partition requests
//!    across circuits so that unrelated destinations cannot be
//!    correlated.
//!  * [`CircuitPool`] owns every circuit record, coalesces concurrent
//!    builds for the same key, and defers teardown until the last
//!    borrower is done.
//!  * [`Rotator`] replaces circuits ahead of their nominal expiry and
//!    serves explicit update requests under a deadline.
//!  * [`CancelToken`] threads cancellation through every suspension
//!    point.

#![deny(missing_docs)]
#![deny(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::option_option)]
#![deny(clippy::ref_option_ref)]

mod cancel;
mod err;
mod isolation;
mod mgr;
mod rotation;
mod transport;

pub use cancel::{CancelToken, Generation};
pub use err::{Error, Result};
pub use isolation::{IsolationKey, IsolationPolicy};
pub use mgr::{
    AbstractCircuit, CircuitBuilder, CircuitEvent, CircuitHandle, CircuitPool, CircuitStatus,
    PoolConfig, RelayHop, StatusObserver,
};
pub use rotation::Rotator;
pub use transport::{BridgeTarget, Transport, TransportKind};
