//! Capability traits for reaching the bridge.
//!
//! Strand does not implement any wire protocol itself.  A pluggable
//! transport (WebSocket relay, WebRTC data channel, domain-fronted
//! tunnel, ...) is supplied by the embedder as a [`Transport`]
//! implementation, selected at client-construction time through the
//! validated options — never by runtime type inspection.

use crate::Result;

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use serde::{Deserialize, Serialize};

/// Which kind of pluggable transport should carry the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// A WebSocket connection to a relay bridge.
    WebSocket,
    /// A WebRTC data channel through a volunteer proxy.
    WebRtc,
    /// A WebTunnel (HTTPS-camouflaged) bridge.
    WebTunnel,
}

/// Connection parameters for one bridge, handed to the transport and
/// the circuit builder on every build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeTarget {
    /// Which transport should be used to reach the bridge.
    pub kind: TransportKind,
    /// The bridge endpoint (e.g. a `wss://` URL).
    pub endpoint: String,
    /// The bridge's identity fingerprint, when one is pinned.
    pub fingerprint: Option<String>,
    /// Bound on the transport handshake.
    pub connection_timeout: std::time::Duration,
}

/// A Transport knows how to open a raw byte stream to a bridge
/// endpoint.
///
/// Implementations own their retry behavior below the level of a
/// single `connect` call, but must bound the handshake with the
/// configured connection timeout and surface
/// [`Error::ConnectionTimeout`](crate::Error::ConnectionTimeout) when
/// it elapses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The byte stream this transport yields.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open a stream to `target`.
    async fn connect(&self, target: &BridgeTarget) -> Result<Self::Stream>;
}
