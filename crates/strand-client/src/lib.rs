//! High-level client API for Strand.
//!
//! A [`StrandClient`] binds outbound HTTP requests to anonymizing
//! circuits managed by `strand-circmgr`: it resolves each request's
//! isolation key, borrows (or builds) a matching circuit, runs the
//! request over a logical stream, and releases the circuit on every
//! exit path.  It also exposes the status surface, explicit circuit
//! updates, and the abort/close lifecycle.
//!
//! The onion-routing protocol and the pluggable transport are supplied
//! by the embedder as [`CircuitBuilder`] / [`Transport`]
//! implementations; this crate never touches a socket itself.

#![deny(missing_docs)]
#![deny(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![warn(clippy::clone_on_ref_ptr)]
#![deny(clippy::missing_docs_in_private_items)]

mod codec;
mod config;
mod err;

pub use codec::HttpResponse;
pub use config::{ClientConfig, ClientConfigBuilder, StatusCallback};
pub use err::{Error, Result};

// Re-export the pieces of the lifecycle layer that appear in our API.
pub use strand_circmgr::{
    AbstractCircuit, CircuitBuilder, CircuitEvent, CircuitStatus, IsolationPolicy, RelayHop,
    Transport, TransportKind,
};

use strand_circmgr::{
    CancelToken, CircuitPool, Generation, IsolationKey, Rotator,
};

use futures::io::AsyncWriteExt;
use futures::task::SpawnExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use strand_rtcompat::{Runtime, SleepProviderExt};

/// Whether a request may share pooled circuits or demands its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationMode {
    /// Use the pooled circuit for the request's isolation key.
    Shared,
    /// Build a dedicated one-shot circuit, never placed in the pool,
    /// and tear it down after the response.
    Isolated,
}

/// A client for making requests through anonymizing circuits.
///
/// Cheap to share behind an [`Arc`]; all methods take `&self`.
pub struct StrandClient<R: Runtime, B: CircuitBuilder> {
    /// The async runtime used for timers and background tasks.
    runtime: R,
    /// The validated, immutable configuration.
    config: ClientConfig,
    /// Bridge parameters handed to every circuit build.
    target: strand_circmgr::BridgeTarget,
    /// The client-wide cancellation token.
    token: CancelToken,
    /// The circuit pool.
    pool: Arc<CircuitPool<B, R>>,
    /// The rotation scheduler (also serves explicit updates).
    rotator: Arc<Rotator<B, R>>,
}

/// Tears an unpooled circuit down when the request ends, however it
/// ends.
struct OneShot<C: AbstractCircuit>(Arc<C>);

impl<C: AbstractCircuit> Drop for OneShot<C> {
    fn drop(&mut self) {
        self.0.terminate();
    }
}

impl<R: Runtime, B: CircuitBuilder> StrandClient<R, B> {
    /// Construct a client from a validated configuration.
    ///
    /// When `create_circuit_early` is set, the first circuit starts
    /// building immediately in the background; when an update interval
    /// is configured, the rotation scheduler is spawned.
    pub fn launch(runtime: R, builder: B, config: ClientConfig) -> Result<Self> {
        let token = CancelToken::new();
        let observer = config.on_status.clone().map(|cb| cb.0);
        let pool = Arc::new(CircuitPool::new(
            builder,
            runtime.clone(),
            token.clone(),
            config.pool_config(),
            observer,
        ));
        let target = config.bridge_target();
        let rotator = Arc::new(Rotator::new(
            Arc::clone(&pool),
            target.clone(),
            config.circuit_update_interval,
            config.circuit_update_advance,
        ));

        if config.circuit_update_interval.is_some() {
            let nudge = rotator.nudge_channel();
            runtime
                .spawn(Arc::clone(&rotator).run(nudge))
                .map_err(strand_circmgr::Error::from)?;
        }

        if config.create_circuit_early {
            let pool = Arc::clone(&pool);
            let target = target.clone();
            let token = token.clone();
            runtime
                .spawn(async move {
                    let gen = token.generation();
                    if let Err(e) = pool.ensure(&IsolationKey::shared(), &target, gen).await {
                        warn!("eager circuit build failed: {}", e);
                    }
                })
                .map_err(strand_circmgr::Error::from)?;
        }

        info!("strand client ready (bridge: {})", config.bridge_url);
        Ok(StrandClient {
            runtime,
            config,
            target,
            token,
            pool,
            rotator,
        })
    }

    /// Make a GET request.
    pub async fn fetch(&self, url: &str) -> Result<HttpResponse> {
        self.request("GET", url, &[], None, None).await
    }

    /// Make a GET request over a dedicated one-shot circuit.
    pub async fn fetch_isolated(&self, url: &str) -> Result<HttpResponse> {
        self.request_with_isolation("GET", url, &[], None, None, IsolationMode::Isolated)
            .await
    }

    /// Make a POST request.
    pub async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse> {
        self.request("POST", url, &[], Some(body), None).await
    }

    /// Make a POST request with a JSON body and matching Content-Type.
    pub async fn post_json(&self, url: &str, json_body: &str) -> Result<HttpResponse> {
        let headers = [("Content-Type".to_string(), "application/json".to_string())];
        self.request("POST", url, &headers, Some(json_body.as_bytes().to_vec()), None)
            .await
    }

    /// Make a request with full control over method, headers, body,
    /// and timeout, using pooled circuits.
    pub async fn request(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse> {
        self.request_with_isolation(method, url, headers, body, timeout, IsolationMode::Shared)
            .await
    }

    /// Make a request under an explicit isolation mode.
    ///
    /// The per-request timeout (or the configured default) bounds the
    /// whole round trip: circuit acquisition, stream open, write, and
    /// read.  Whichever of the connection, circuit, and request
    /// timeouts elapses first wins, each surfacing its own error kind.
    pub async fn request_with_isolation(
        &self,
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
        timeout: Option<Duration>,
        mode: IsolationMode,
    ) -> Result<HttpResponse> {
        let gen = self.token.generation();
        self.token.check(gen)?;

        let parsed =
            Url::parse(url).map_err(|e| Error::InvalidRequest(format!("bad url: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidRequest(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }

        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let op = self.perform(method, &parsed, headers, body, mode, gen);
        let guarded = self.token.with_cancel(gen, op);
        match self.runtime.timeout(timeout, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => Err(strand_circmgr::Error::RequestTimeout.into()),
        }
    }

    /// Helper: bind the request to a circuit and run it.
    async fn perform(
        &self,
        method: &str,
        url: &Url,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
        mode: IsolationMode,
        gen: Generation,
    ) -> Result<HttpResponse> {
        match mode {
            IsolationMode::Shared => {
                let key = IsolationKey::from_url(url, self.config.isolation);
                let handle = self.pool.acquire(&key, &self.target, gen).await?;
                // The handle releases the circuit when this scope ends,
                // on success, error, timeout, and cancellation alike.
                self.do_http(handle.circuit(), method, url, headers, body)
                    .await
            }
            IsolationMode::Isolated => {
                let circ = self.pool.build_detached(&self.target, gen).await?;
                let oneshot = OneShot(circ);
                self.do_http(&oneshot.0, method, url, headers, body).await
            }
        }
    }

    /// Helper: run one HTTP exchange over a stream opened on `circ`.
    async fn do_http<C: AbstractCircuit>(
        &self,
        circ: &Arc<C>,
        method: &str,
        url: &Url,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse> {
        let request = build_request(method, url, headers, body)?;
        let encoded = codec::encode_request(&request);

        let mut stream = circ.open_stream().await?;
        stream.write_all(&encoded).await?;
        stream.flush().await?;

        let response = codec::read_response(&mut stream, url.as_str()).await?;
        debug!("{} {} -> {}", method, url, response.status);
        Ok(response)
    }

    /// Return counts of circuits per state plus health bits.
    pub fn circuit_status(&self) -> CircuitStatus {
        self.pool.status()
    }

    /// Render the circuit status as a short human-readable line.
    pub fn circuit_status_string(&self) -> String {
        let s = self.pool.status();
        format!(
            "{} ready, {} creating, {} failed ({})",
            s.ready,
            s.creating,
            s.failed,
            if s.is_healthy { "healthy" } else { "unhealthy" }
        )
    }

    /// Return the relay hops of every ready circuit.
    pub fn circuit_relays(&self) -> Vec<Vec<RelayHop>> {
        self.pool.relay_summary()
    }

    /// Wait until the default circuit is ready, building it if needed.
    pub async fn wait_for_circuit(&self) -> Result<()> {
        let gen = self.token.generation();
        self.pool
            .ensure(&IsolationKey::shared(), &self.target, gen)
            .await?;
        Ok(())
    }

    /// Rotate the default circuit now (or confirm it is fresh),
    /// completing within `deadline`.
    pub async fn update_circuit(&self, deadline: Duration) -> Result<()> {
        self.rotator.rotate_now(deadline).await?;
        Ok(())
    }

    /// Cancel every in-flight operation.
    ///
    /// Operations reject with a cancellation error at their next
    /// suspension point.  Unlike [`close`](StrandClient::close), no
    /// resources are released and the client remains usable.
    pub fn abort(&self) {
        self.token.abort();
    }

    /// Return true if [`abort`](StrandClient::abort) has been called.
    pub fn is_aborted(&self) -> bool {
        self.token.is_aborted()
    }

    /// Shut the client down.
    ///
    /// Behaves like `abort()` for anything still in flight, then
    /// releases every circuit record and the transport.  Idempotent;
    /// afterwards every operation fails with a cancellation error.
    pub async fn close(&self) {
        self.token.close();
        // Give in-flight tasks one turn to observe the closed token
        // before their records disappear underneath them.
        strand_rtcompat::task::yield_now().await;
        self.pool.close();
        info!("strand client closed");
    }

    /// Build a throwaway client, make one isolated GET request, and
    /// close it.
    pub async fn fetch_one_time(
        runtime: R,
        builder: B,
        config: ClientConfig,
        url: &str,
    ) -> Result<HttpResponse> {
        let config = ClientConfig {
            create_circuit_early: false,
            circuit_update_interval: None,
            ..config
        };
        let client = StrandClient::launch(runtime, builder, config)?;
        let response = client
            .request_with_isolation("GET", url, &[], None, None, IsolationMode::Isolated)
            .await;
        client.close().await;
        response
    }
}

/// Encode the caller's request as an `http::Request` with the headers
/// HTTP/1.0 requires.
fn build_request(
    method: &str,
    url: &Url,
    headers: &[(String, String)],
    body: Option<Vec<u8>>,
) -> Result<http::Request<Vec<u8>>> {
    let method = http::Method::from_bytes(method.as_bytes())
        .map_err(|_| Error::InvalidRequest(format!("bad method: {}", method)))?;

    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let host = url.host_str().unwrap_or_default();
    let host_value = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let mut builder = http::Request::builder()
        .method(method)
        .uri(target)
        .header("Host", host_value);

    let body_present = body.is_some();
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let body = body.unwrap_or_default();
    if body_present {
        builder = builder.header("Content-Length", body.len());
    }

    Ok(builder.body(body)?)
}
