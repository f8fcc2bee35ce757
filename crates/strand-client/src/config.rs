//! Configuration options for the Strand client.
//!
//! Options are assembled through a builder and validated before the
//! client is constructed; the finished [`ClientConfig`] is immutable.

use derive_builder::Builder;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use strand_circmgr::{
    BridgeTarget, CircuitEvent, IsolationPolicy, PoolConfig, TransportKind,
};

/// An observer invoked on circuit state transitions.
///
/// The callback fires after each transition has been applied, outside
/// the pool lock; it must not call back into the client.
#[derive(Clone)]
pub struct StatusCallback(pub Arc<dyn Fn(&CircuitEvent) + Send + Sync>);

impl fmt::Debug for StatusCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusCallback")
    }
}

/// Configuration for a [`StrandClient`](crate::StrandClient).
///
/// This type is immutable once constructed.  To create one, use
/// [`ClientConfig::builder`].
#[derive(Debug, Clone, Builder, Deserialize)]
#[builder(setter(prefix = "set"), build_fn(validate = "ClientConfigBuilder::validate"))]
pub struct ClientConfig {
    /// The bridge endpoint URL handed to the pluggable transport.
    pub(crate) bridge_url: String,

    /// The bridge's identity fingerprint, when one is pinned.
    #[builder(default)]
    #[serde(default)]
    pub(crate) bridge_fingerprint: Option<String>,

    /// Which pluggable transport reaches the bridge.
    #[builder(default = "TransportKind::WebSocket")]
    #[serde(default = "defaults::transport")]
    pub(crate) transport: TransportKind,

    /// Timeout for establishing the transport connection.
    #[builder(default = "Duration::from_millis(15_000)")]
    #[serde(with = "humantime_serde", default = "defaults::connection_timeout")]
    pub(crate) connection_timeout: Duration,

    /// Timeout for circuit creation and readiness.
    #[builder(default = "Duration::from_millis(90_000)")]
    #[serde(with = "humantime_serde", default = "defaults::circuit_timeout")]
    pub(crate) circuit_timeout: Duration,

    /// Default bound on a full request round trip, used when a request
    /// does not supply its own timeout.
    #[builder(default = "Duration::from_millis(60_000)")]
    #[serde(with = "humantime_serde", default = "defaults::request_timeout")]
    pub(crate) request_timeout: Duration,

    /// Interval between automatic circuit rotations; `None` disables
    /// periodic rotation.
    #[builder(default = "Some(Duration::from_millis(600_000))")]
    #[serde(with = "humantime_serde", default = "defaults::update_interval")]
    pub(crate) circuit_update_interval: Option<Duration>,

    /// How much of the interval's tail is reserved for building the
    /// replacement before the old circuit's nominal expiry.
    #[builder(default = "Duration::from_millis(60_000)")]
    #[serde(with = "humantime_serde", default = "defaults::update_advance")]
    pub(crate) circuit_update_advance: Duration,

    /// Whether to build the first circuit eagerly at construction.
    #[builder(default = "true")]
    #[serde(default = "defaults::create_circuit_early")]
    pub(crate) create_circuit_early: bool,

    /// How requests are partitioned across circuits.
    #[builder(default)]
    #[serde(default)]
    pub(crate) isolation: IsolationPolicy,

    /// How many consecutive circuit-build failures flip the health bit
    /// to false.  One-shot (isolated) circuits never count.
    #[builder(default = "3")]
    #[serde(default = "defaults::max_consecutive_failures")]
    pub(crate) max_consecutive_failures: u32,

    /// Observer for circuit state transitions.
    #[builder(default)]
    #[serde(skip)]
    pub(crate) on_status: Option<StatusCallback>,
}

/// Serde defaults, kept in one place so they can't drift from the
/// builder defaults.
mod defaults {
    use super::*;

    /// Default transport kind.
    pub(super) fn transport() -> TransportKind {
        TransportKind::WebSocket
    }
    /// Default connection timeout.
    pub(super) fn connection_timeout() -> Duration {
        Duration::from_millis(15_000)
    }
    /// Default circuit timeout.
    pub(super) fn circuit_timeout() -> Duration {
        Duration::from_millis(90_000)
    }
    /// Default request timeout.
    pub(super) fn request_timeout() -> Duration {
        Duration::from_millis(60_000)
    }
    /// Default rotation interval.
    pub(super) fn update_interval() -> Option<Duration> {
        Some(Duration::from_millis(600_000))
    }
    /// Default rotation advance.
    pub(super) fn update_advance() -> Duration {
        Duration::from_millis(60_000)
    }
    /// Default eager-build flag.
    pub(super) fn create_circuit_early() -> bool {
        true
    }
    /// Default consecutive-failure threshold.
    pub(super) fn max_consecutive_failures() -> u32 {
        3
    }
}

impl ClientConfigBuilder {
    /// Reject configurations that could never work.
    fn validate(&self) -> Result<(), String> {
        if let Some(url) = &self.bridge_url {
            if url.is_empty() {
                return Err("bridge URL may not be empty".into());
            }
        }
        for (name, d) in [
            ("connection timeout", &self.connection_timeout),
            ("circuit timeout", &self.circuit_timeout),
            ("request timeout", &self.request_timeout),
        ] {
            if let Some(d) = d {
                if d.as_millis() == 0 {
                    return Err(format!("{} may not be zero", name));
                }
            }
        }
        if let Some(Some(interval)) = self.circuit_update_interval {
            let advance = self
                .circuit_update_advance
                .unwrap_or_else(defaults::update_advance);
            if advance >= interval {
                return Err(
                    "circuit update advance must be smaller than the update interval".into(),
                );
            }
        }
        Ok(())
    }
}

impl ClientConfig {
    /// Return a new builder with every option at its default.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// The bridge connection parameters handed to every build.
    pub(crate) fn bridge_target(&self) -> BridgeTarget {
        BridgeTarget {
            kind: self.transport,
            endpoint: self.bridge_url.clone(),
            fingerprint: self.bridge_fingerprint.clone(),
            connection_timeout: self.connection_timeout,
        }
    }

    /// The pool-level slice of this configuration.
    pub(crate) fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            circuit_timeout: self.circuit_timeout,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ClientConfig::builder()
            .set_bridge_url("wss://bridge.example/".to_string())
            .build()
            .unwrap();
        assert_eq!(config.connection_timeout, Duration::from_millis(15_000));
        assert_eq!(config.circuit_timeout, Duration::from_millis(90_000));
        assert_eq!(
            config.circuit_update_interval,
            Some(Duration::from_millis(600_000))
        );
        assert_eq!(config.circuit_update_advance, Duration::from_millis(60_000));
        assert!(config.create_circuit_early);
        assert_eq!(config.isolation, IsolationPolicy::PerDomain);
        assert_eq!(config.max_consecutive_failures, 3);
    }

    #[test]
    fn empty_bridge_url_is_rejected() {
        let out = ClientConfig::builder()
            .set_bridge_url(String::new())
            .build();
        assert!(out.is_err());
    }

    #[test]
    fn advance_must_fit_inside_interval() {
        let out = ClientConfig::builder()
            .set_bridge_url("wss://bridge.example/".to_string())
            .set_circuit_update_interval(Some(Duration::from_millis(30_000)))
            .set_circuit_update_advance(Duration::from_millis(60_000))
            .build();
        assert!(out.is_err());

        // Disabling rotation makes the advance irrelevant.
        let out = ClientConfig::builder()
            .set_bridge_url("wss://bridge.example/".to_string())
            .set_circuit_update_interval(None)
            .set_circuit_update_advance(Duration::from_millis(60_000))
            .build();
        assert!(out.is_ok());
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let out = ClientConfig::builder()
            .set_bridge_url("wss://bridge.example/".to_string())
            .set_connection_timeout(Duration::from_millis(0))
            .build();
        assert!(out.is_err());
    }
}
