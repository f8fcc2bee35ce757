//! Deriving isolation keys from request targets.
//!
//! An isolation key partitions which circuits may serve a request, so
//! that traffic to unrelated sites cannot be correlated at an exit.
//! Key derivation is a pure function of the request's destination
//! authority: the same authority always maps to the same key, and two
//! different authorities never collide except under
//! [`IsolationPolicy::ShareAll`].

use serde::{Deserialize, Serialize};
use url::Url;

/// How requests are partitioned across circuits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "lowercase")]
pub enum IsolationPolicy {
    /// One circuit per registrable domain (the default).
    ///
    /// `a.example.com` and `b.example.com` share a circuit;
    /// `example.com` and `example.net` do not.
    PerDomain,
    /// One circuit per fully-qualified host.
    PerSubdomain,
    /// One circuit per scheme + host + port.
    PerOrigin,
    /// Every request shares one circuit.
    ///
    /// This defeats isolation entirely; it exists for benchmarking and
    /// debugging only.
    ShareAll,
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        IsolationPolicy::PerDomain
    }
}

/// A key that determines which pooled circuits a request may use.
///
/// Keys are cheap to clone, hash, and compare; the pool uses them as
/// its map index.  The [`shared`](IsolationKey::shared) key names the
/// unkeyed default lineage: the circuit built eagerly at startup and
/// rotated by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IsolationKey(KeyInner);

/// The actual representation of an isolation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyInner {
    /// The single shared key: the default lineage, also used by
    /// [`IsolationPolicy::ShareAll`].
    Shared,
    /// Keyed by registrable domain.
    Domain(String),
    /// Keyed by full host name.
    Host(String),
    /// Keyed by scheme, host, and effective port.
    Origin {
        /// URL scheme, lowercased.
        scheme: String,
        /// Host, lowercased.
        host: String,
        /// Effective port (the scheme default when absent).
        port: u16,
    },
}

impl IsolationKey {
    /// Return the key for the unkeyed default lineage.
    pub fn shared() -> Self {
        IsolationKey(KeyInner::Shared)
    }

    /// Return true if this is the default-lineage key.
    pub fn is_shared(&self) -> bool {
        self.0 == KeyInner::Shared
    }

    /// Derive the isolation key for a request to `url` under `policy`.
    ///
    /// This function is deterministic and performs no I/O.  URLs
    /// without a host (e.g. `data:` URLs) key on the empty host, which
    /// keeps them apart from every real authority.
    pub fn from_url(url: &Url, policy: IsolationPolicy) -> Self {
        let host = url.host_str().unwrap_or("");
        let inner = match policy {
            IsolationPolicy::ShareAll => KeyInner::Shared,
            IsolationPolicy::PerSubdomain => KeyInner::Host(host.to_ascii_lowercase()),
            IsolationPolicy::PerOrigin => KeyInner::Origin {
                scheme: url.scheme().to_ascii_lowercase(),
                host: host.to_ascii_lowercase(),
                port: url.port_or_known_default().unwrap_or(0),
            },
            IsolationPolicy::PerDomain => KeyInner::Domain(registrable_domain(host)),
        };
        IsolationKey(inner)
    }
}

/// Approximate the registrable domain of `host` as its last two DNS
/// labels.
///
/// IP addresses and single-label hosts key on the whole host.  This is
/// a deliberate simplification: a public-suffix list would be more
/// precise, but the approximation errs toward *more* isolation only
/// for multi-part public suffixes, never less for ordinary domains.
fn registrable_domain(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host;
    }
    let trimmed = host.strip_suffix('.').unwrap_or(&host);
    let labels: Vec<&str> = trimmed.rsplitn(3, '.').collect();
    match labels.as_slice() {
        [tld, sld, _] | [tld, sld] => format!("{}.{}", sld, tld),
        _ => trimmed.to_string(),
    }
}
