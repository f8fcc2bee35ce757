//! The circuit pool: the state machine that creates, health-checks,
//! isolates, and retires circuits.
//!
//! For testing and abstraction purposes, this module _does not_ know
//! anything about the onion-routing protocol.  Everything is handled
//! through a pair of capability traits:
//!
//!  * [`AbstractCircuit`] is a view of an established circuit.
//!  * [`CircuitBuilder`] knows how to build one over a bridge.
//!
//! Using these traits, the [`CircuitPool`] object owns the set of
//! circuits in each lifecycle state, keyed by isolation key, and
//! guarantees that at most one build per key is in flight at any time:
//! concurrent requesters fan in on a single shared build and observe
//! the same outcome.

use crate::cancel::{CancelToken, Generation};
use crate::isolation::IsolationKey;
use crate::transport::BridgeTarget;
use crate::{Error, Result};

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use strand_rtcompat::{Runtime, SleepProvider, SleepProviderExt};

mod map;

/// One hop of a circuit's path, as reported for status displays.
///
/// Opaque to this crate beyond its display fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayHop {
    /// The relay's self-chosen nickname.
    pub nickname: String,
    /// The relay's identity fingerprint.
    pub fingerprint: String,
}

/// Minimal view of an established circuit.
///
/// From this crate's point of view, circuits are objects with unique
/// identities, a usability bit, a relay list for status reporting, and
/// the ability to open a logical byte stream.
#[async_trait]
pub trait AbstractCircuit: Send + Sync + 'static {
    /// Type for a unique identifier for circuits.
    ///
    /// The values returned by [`AbstractCircuit::id`] must be unique
    /// for distinct circuits for the lifetime of the process.
    type Id: Clone + Debug + Hash + Eq + Send + Sync;

    /// The logical byte stream this circuit can open.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Return the unique identifier for this circuit.
    fn id(&self) -> Self::Id;

    /// Return true if this circuit can still carry new streams.
    ///
    /// Reasons a circuit might be unusable include being closed or
    /// having lost its underlying transport.
    fn is_usable(&self) -> bool;

    /// Return a snapshot of this circuit's relay hops, for status
    /// reporting only.
    fn relays(&self) -> Vec<RelayHop>;

    /// Release this circuit's resources (streams and transport).
    ///
    /// The pool calls this exactly once per circuit, only after every
    /// borrower has released it.
    fn terminate(&self);

    /// Open a new logical stream on this circuit.
    async fn open_stream(&self) -> Result<Self::Stream>;
}

/// An object that knows how to build circuits over a bridge.
///
/// Implementations must bound the transport handshake with the
/// configured connection timeout, surfacing
/// [`Error::ConnectionTimeout`] when it elapses; the pool separately
/// bounds overall circuit readiness with the circuit timeout.
#[async_trait]
pub trait CircuitBuilder: Send + Sync + 'static {
    /// The circuit type that this builder knows how to build.
    type Circ: AbstractCircuit;

    /// Construct a circuit through the bridge described by `target`.
    async fn build_circuit(&self, target: &BridgeTarget) -> Result<Arc<Self::Circ>>;
}

/// A shared future yielding the outcome of one in-flight build.
///
/// Every concurrent `acquire` for the same key clones one of these, so
/// a single underlying build serves them all.
type Pending<C> = futures::future::Shared<futures::channel::oneshot::Receiver<Result<Arc<C>>>>;
/// The sending end matching [`Pending`].
type Sending<C> = futures::channel::oneshot::Sender<Result<Arc<C>>>;

/// A state-transition event, delivered to the registered observer.
///
/// Observers are invoked strictly outside the pool lock, after the
/// transition has been applied; they must not re-enter pool mutation.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CircuitEvent {
    /// A build was launched for `key`.
    BuildStarted {
        /// The isolation key the build belongs to.
        key: IsolationKey,
    },
    /// A build for `key` completed and the circuit is ready.
    BuildSucceeded {
        /// The isolation key the build belongs to.
        key: IsolationKey,
    },
    /// A build for `key` failed; the record was removed.
    BuildFailed {
        /// The isolation key the build belongs to.
        key: IsolationKey,
    },
    /// The circuit under `key` stopped being handed out.
    Retired {
        /// The isolation key the circuit was filed under.
        key: IsolationKey,
    },
    /// A circuit's resources were fully released.
    TornDown,
    /// The pool was closed and every record released.
    Closed,
}

/// A callback registered to hear [`CircuitEvent`]s.
pub type StatusObserver = Arc<dyn Fn(&CircuitEvent) + Send + Sync>;

/// Counts of circuits per lifecycle state, plus derived health bits.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct CircuitStatus {
    /// Circuits currently being built (pooled and detached).
    pub creating: usize,
    /// Circuits ready to carry streams.
    pub ready: usize,
    /// Consecutive build failures since the last success.
    pub failed: usize,
    /// All tracked circuits: building, ready, and retiring.
    pub total_circuits: usize,
    /// True if at least one usable circuit is ready.
    pub has_ready_circuits: bool,
    /// True if a circuit is ready and consecutive failures have not
    /// reached the configured threshold.
    pub is_healthy: bool,
}

/// Configuration for a [`CircuitPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How long a circuit build may take before it fails with
    /// [`Error::CircuitTimeout`].
    pub circuit_timeout: Duration,
    /// How many consecutive build failures flip
    /// [`CircuitStatus::is_healthy`] to false and nudge the rotation
    /// scheduler.
    pub max_consecutive_failures: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            circuit_timeout: Duration::from_millis(90_000),
            max_consecutive_failures: 3,
        }
    }
}

/// A borrowed reference to a pooled circuit.
///
/// Holding a handle keeps the circuit's borrow count above zero, which
/// blocks physical teardown.  The count is released when the handle is
/// dropped — on success, error, timeout, and cancellation alike.
pub struct CircuitHandle<C: AbstractCircuit> {
    /// The borrowed circuit.
    circ: Arc<C>,
    /// The key the circuit is filed under.
    key: IsolationKey,
    /// The map that tracks the borrow count.
    map: Arc<map::CircuitMap<C>>,
}

impl<C: AbstractCircuit> CircuitHandle<C> {
    /// Return the circuit this handle borrows.
    pub fn circuit(&self) -> &Arc<C> {
        &self.circ
    }
}

impl<C: AbstractCircuit> Drop for CircuitHandle<C> {
    fn drop(&mut self) {
        self.map.release(&self.key, &self.circ.id());
    }
}

/// A pool of circuits, keyed by isolation key.
///
/// The pool hands out [`CircuitHandle`]s, launching builds as needed.
/// All of its mutable state sits behind one mutex with short critical
/// sections that are never held across an `.await`, so the same code
/// is correct on a single-threaded cooperative scheduler and on a
/// multi-threaded host.
pub struct CircuitPool<B: CircuitBuilder, R: Runtime> {
    /// The builder used to construct circuits.
    pub(crate) builder: B,
    /// Runtime used for timeouts and the monotonic clock.
    runtime: R,
    /// The client-wide cancellation token.
    token: CancelToken,
    /// Immutable pool configuration.
    config: PoolConfig,
    /// The keyed map of circuit records.
    map: Arc<map::CircuitMap<B::Circ>>,
}

impl<B: CircuitBuilder, R: Runtime> CircuitPool<B, R> {
    /// Construct a new, empty pool.
    pub fn new(
        builder: B,
        runtime: R,
        token: CancelToken,
        config: PoolConfig,
        observer: Option<StatusObserver>,
    ) -> Self {
        let map = Arc::new(map::CircuitMap::new(
            config.max_consecutive_failures,
            observer,
        ));
        CircuitPool {
            builder,
            runtime,
            token,
            config,
            map,
        }
    }

    /// Return the runtime this pool was built with.
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Return the cancellation token this pool observes.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }

    /// Register the channel used to nudge the rotation scheduler after
    /// repeated default-lineage build failures.
    pub fn set_rotation_nudge(&self, sender: futures::channel::mpsc::UnboundedSender<()>) {
        self.map.set_nudge(sender);
    }

    /// Return a ready circuit for `key`, building one if necessary.
    ///
    /// If a build for `key` is already in flight, wait for it instead
    /// of launching a second one; every waiter observes the same
    /// outcome.  A failed build is removed and *not* retried here: the
    /// next `acquire` starts fresh.
    pub async fn acquire(
        &self,
        key: &IsolationKey,
        target: &BridgeTarget,
        gen: Generation,
    ) -> Result<CircuitHandle<B::Circ>> {
        self.token.check(gen)?;

        match self.map.plan_acquire(key)? {
            map::AcquireAction::Use(circ) => {
                debug!("reusing ready circuit for {:?}", key);
                Ok(self.wrap_handle(key, circ))
            }
            map::AcquireAction::Join(pending) => {
                debug!("joining in-flight circuit build for {:?}", key);
                let outcome: Result<Arc<B::Circ>> = self
                    .token
                    .with_cancel(gen, async {
                        match self
                            .runtime
                            .timeout(self.config.circuit_timeout, pending)
                            .await
                        {
                            // The build's own outcome, identical for
                            // every waiter.
                            Ok(Ok(result)) => result,
                            // The building task disappeared.
                            Ok(Err(_)) => Err(Error::PendingFailed),
                            Err(_) => Err(Error::CircuitTimeout),
                        }
                    })
                    .await;
                let circ = outcome?;
                self.map.checkout(key, &circ.id())?;
                Ok(self.wrap_handle(key, circ))
            }
            map::AcquireAction::Launch(sender) => {
                info!("launching circuit for {:?}", key);
                // If this future is dropped mid-build, the guard
                // removes the Building record so the key can't wedge.
                let cleanup = map::BuildCleanupGuard::new(Arc::clone(&self.map), key.clone());
                let started_at = self.runtime.now();
                let outcome: Result<Arc<B::Circ>> = self
                    .token
                    .with_cancel(gen, async {
                        match self
                            .runtime
                            .timeout(self.config.circuit_timeout, self.builder.build_circuit(target))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(Error::CircuitTimeout),
                        }
                    })
                    .await;

                match &outcome {
                    Ok(circ) => {
                        self.map
                            .complete_build(key, circ, started_at, self.runtime.now());
                    }
                    Err(e) => {
                        warn!("circuit build for {:?} failed: {}", key, e);
                        // Cancellation is not a health signal.
                        let count_failure = !matches!(e, Error::Cancelled);
                        self.map.fail_build(key, count_failure);
                    }
                }
                cleanup.disarm();

                // It's okay if all the receivers went away: that means
                // nobody was waiting for this build.
                let _ignore_err = sender.send(outcome.clone());

                let circ = outcome?;
                self.map.checkout(key, &circ.id())?;
                Ok(self.wrap_handle(key, circ))
            }
        }
    }

    /// Make sure a ready circuit exists for `key`, without holding on
    /// to it.
    pub async fn ensure(
        &self,
        key: &IsolationKey,
        target: &BridgeTarget,
        gen: Generation,
    ) -> Result<()> {
        let _handle = self.acquire(key, target, gen).await?;
        Ok(())
    }

    /// Build a circuit that bypasses the pool entirely.
    ///
    /// Used for one-shot isolated requests and for rotation
    /// replacements.  Detached builds never touch the
    /// consecutive-failure counter, but they do show up in
    /// [`CircuitStatus::creating`] while in flight.
    pub async fn build_detached(
        &self,
        target: &BridgeTarget,
        gen: Generation,
    ) -> Result<Arc<B::Circ>> {
        self.token.check(gen)?;
        debug!("launching detached circuit");
        let _guard = self.map.detached_build_guard();
        self.token
            .with_cancel(gen, async {
                match self
                    .runtime
                    .timeout(self.config.circuit_timeout, self.builder.build_circuit(target))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::CircuitTimeout),
                }
            })
            .await
    }

    /// Atomically replace the circuit under `key` with `circ`.
    ///
    /// The old record keeps serving `acquire` calls right up to this
    /// moment; afterwards new acquires route to the replacement and
    /// the old record is retired (torn down once its borrow count
    /// drains).
    pub fn cutover(&self, key: &IsolationKey, circ: Arc<B::Circ>) {
        info!("cutting over circuit for {:?}", key);
        self.map.cutover(key, circ, self.runtime.now());
    }

    /// Stop handing out the circuit filed under `key`.
    ///
    /// Teardown is deferred until every borrower has released it.
    pub fn retire(&self, key: &IsolationKey) {
        self.map.retire(key);
    }

    /// Stop handing out the circuit with identity `id`, wherever it is
    /// filed.
    pub fn retire_circuit(&self, id: &<B::Circ as AbstractCircuit>::Id) {
        self.map.retire_id(id);
    }

    /// Return counts per lifecycle state plus derived health bits.
    pub fn status(&self) -> CircuitStatus {
        self.map.status()
    }

    /// Return the relay hops of every ready circuit.
    pub fn relay_summary(&self) -> Vec<Vec<RelayHop>> {
        self.map.relays()
    }

    /// Return the next instant at which some pooled circuit is due for
    /// rotation, given the configured interval and advance.
    pub fn next_rotation_due(&self, interval: Duration, advance: Duration) -> Option<Instant> {
        self.map.next_rotation_due(interval, advance)
    }

    /// Return the keys whose circuits are due for rotation now.
    pub fn rotation_due_keys(&self, interval: Duration, advance: Duration) -> Vec<IsolationKey> {
        self.map
            .rotation_due_keys(interval, advance, self.runtime.now())
    }

    /// Return true if the circuit under `key` is usable and younger
    /// than `advance`.
    pub fn lineage_fresh(&self, key: &IsolationKey, advance: Duration) -> bool {
        self.map.lineage_fresh(key, advance, self.runtime.now())
    }

    /// Release every circuit record.  After this the pool is unusable;
    /// `acquire` fails with [`Error::Cancelled`].
    pub fn close(&self) {
        self.map.close();
    }

    /// Helper: wrap an already-checked-out circuit in a handle.
    fn wrap_handle(&self, key: &IsolationKey, circ: Arc<B::Circ>) -> CircuitHandle<B::Circ> {
        CircuitHandle {
            circ,
            key: key.clone(),
            map: Arc::clone(&self.map),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::transport::TransportKind;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use futures::future::{join, join3};
    use strand_rtcompat::{test_with_runtime, SleepProvider};
    use strand_rtmock::MockSleepRuntime;

    pub(crate) struct FakeCircuit {
        id: usize,
        usable: AtomicBool,
        terminated: AtomicBool,
    }

    static NEXT_FAKE_ID: AtomicUsize = AtomicUsize::new(0);

    impl FakeCircuit {
        pub(crate) fn new() -> Self {
            FakeCircuit {
                id: NEXT_FAKE_ID.fetch_add(1, Ordering::SeqCst),
                usable: AtomicBool::new(true),
                terminated: AtomicBool::new(false),
            }
        }
        pub(crate) fn terminated(&self) -> bool {
            self.terminated.load(Ordering::SeqCst)
        }
        pub(crate) fn mark_unusable(&self) {
            self.usable.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AbstractCircuit for FakeCircuit {
        type Id = usize;
        type Stream = futures::io::Cursor<Vec<u8>>;

        fn id(&self) -> usize {
            self.id
        }
        fn is_usable(&self) -> bool {
            self.usable.load(Ordering::SeqCst)
        }
        fn relays(&self) -> Vec<RelayHop> {
            vec![
                RelayHop {
                    nickname: "guard".into(),
                    fingerprint: format!("G{:04}", self.id),
                },
                RelayHop {
                    nickname: "middle".into(),
                    fingerprint: format!("M{:04}", self.id),
                },
                RelayHop {
                    nickname: "exit".into(),
                    fingerprint: format!("E{:04}", self.id),
                },
            ]
        }
        fn terminate(&self) {
            self.usable.store(false, Ordering::SeqCst);
            self.terminated.store(true, Ordering::SeqCst);
        }
        async fn open_stream(&self) -> Result<Self::Stream> {
            if !self.is_usable() {
                return Err(Error::Protocol("circuit is closed".into()));
            }
            Ok(futures::io::Cursor::new(Vec::new()))
        }
    }

    #[derive(Debug, Clone)]
    pub(crate) enum FakeOp {
        Succeed,
        Fail,
        /// Sleep on the mock clock, then succeed.
        Delay(Duration),
        /// Sleep on the mock clock, then fail.
        DelayFail(Duration),
        /// Never finish.
        Stall,
    }

    pub(crate) struct FakeBuilder<R: Runtime> {
        runtime: R,
        script: Mutex<VecDeque<FakeOp>>,
        builds: AtomicUsize,
    }

    impl<R: Runtime> FakeBuilder<R> {
        pub(crate) fn new(rt: &R) -> Self {
            FakeBuilder {
                runtime: rt.clone(),
                script: Mutex::new(VecDeque::new()),
                builds: AtomicUsize::new(0),
            }
        }

        /// Queue up outcomes for the next builds, in order.  When the
        /// script runs dry, builds succeed.
        pub(crate) fn set<I>(&self, ops: I)
        where
            I: IntoIterator<Item = FakeOp>,
        {
            let mut script = self.script.lock().unwrap();
            script.extend(ops);
        }

        pub(crate) fn builds(&self) -> usize {
            self.builds.load(Ordering::SeqCst)
        }

        fn next_op(&self) -> FakeOp {
            let mut script = self.script.lock().unwrap();
            script.pop_front().unwrap_or(FakeOp::Succeed)
        }
    }

    #[async_trait]
    impl<R: Runtime> CircuitBuilder for FakeBuilder<R> {
        type Circ = FakeCircuit;

        async fn build_circuit(&self, _target: &BridgeTarget) -> Result<Arc<FakeCircuit>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            strand_rtcompat::task::yield_now().await;
            match self.next_op() {
                FakeOp::Succeed => Ok(Arc::new(FakeCircuit::new())),
                FakeOp::Fail => Err(Error::CircuitBuildFailed("scripted failure".into())),
                FakeOp::Delay(d) => {
                    self.runtime.sleep(d).await;
                    Ok(Arc::new(FakeCircuit::new()))
                }
                FakeOp::DelayFail(d) => {
                    self.runtime.sleep(d).await;
                    Err(Error::CircuitBuildFailed("scripted failure".into()))
                }
                FakeOp::Stall => {
                    let () = futures::future::pending().await;
                    unreachable!()
                }
            }
        }
    }

    pub(crate) fn fake_target() -> BridgeTarget {
        BridgeTarget {
            kind: TransportKind::WebSocket,
            endpoint: "wss://bridge.invalid/".into(),
            fingerprint: None,
            connection_timeout: Duration::from_millis(15_000),
        }
    }

    pub(crate) fn test_pool<R: Runtime>(
        rt: &MockSleepRuntime<R>,
    ) -> CircuitPool<FakeBuilder<MockSleepRuntime<R>>, MockSleepRuntime<R>> {
        let builder = FakeBuilder::new(rt);
        CircuitPool::new(
            builder,
            rt.clone(),
            CancelToken::new(),
            PoolConfig::default(),
            None,
        )
    }

    fn key(s: &str) -> IsolationKey {
        let url = url::Url::parse(&format!("https://{}/", s)).unwrap();
        IsolationKey::from_url(&url, crate::IsolationPolicy::PerDomain)
    }

    #[test]
    fn coalesced_builds() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = test_pool(&rt);
            pool.builder.set(vec![FakeOp::Delay(Duration::from_millis(30))]);

            let gen = pool.cancel_token().generation();
            let k = key("example.com");
            let (a, b) = rt
                .wait_for(join(
                    pool.acquire(&k, &fake_target(), gen),
                    pool.acquire(&k, &fake_target(), gen),
                ))
                .await;
            let a = a.unwrap();
            let b = b.unwrap();

            assert!(Arc::ptr_eq(a.circuit(), b.circuit()));
            assert_eq!(pool.builder.builds(), 1);
        });
    }

    #[test]
    fn distinct_keys_distinct_circuits() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = test_pool(&rt);
            let gen = pool.cancel_token().generation();

            let (a, b) = rt
                .wait_for(join(
                    pool.acquire(&key("a.example"), &fake_target(), gen),
                    pool.acquire(&key("b.example"), &fake_target(), gen),
                ))
                .await;
            let a = a.unwrap();
            let b = b.unwrap();

            assert!(!Arc::ptr_eq(a.circuit(), b.circuit()));
            assert_eq!(pool.builder.builds(), 2);

            let status = pool.status();
            assert_eq!(status.ready, 2);
            assert_eq!(status.total_circuits, 2);
            assert!(status.has_ready_circuits);
            assert!(status.is_healthy);
        });
    }

    #[test]
    fn failure_shared_by_waiters_retried_by_next_caller() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = test_pool(&rt);
            pool.builder
                .set(vec![FakeOp::DelayFail(Duration::from_millis(30))]);

            let gen = pool.cancel_token().generation();
            let k = key("example.com");
            let (a, b) = rt
                .wait_for(join(
                    pool.acquire(&k, &fake_target(), gen),
                    pool.acquire(&k, &fake_target(), gen),
                ))
                .await;

            // One build, and the same failure observed by both callers.
            assert_eq!(pool.builder.builds(), 1);
            assert!(matches!(a, Err(Error::CircuitBuildFailed(_))));
            assert!(matches!(
                b,
                Err(Error::CircuitBuildFailed(_)) | Err(Error::PendingFailed)
            ));

            // The record is gone; the next acquire starts fresh.
            let c = rt.wait_for(pool.acquire(&k, &fake_target(), gen)).await;
            assert!(c.is_ok());
            assert_eq!(pool.builder.builds(), 2);
        });
    }

    #[test]
    fn idle_circuits_are_reused() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = test_pool(&rt);
            let gen = pool.cancel_token().generation();
            let k = key("example.com");

            let first = rt
                .wait_for(pool.acquire(&k, &fake_target(), gen))
                .await
                .unwrap();
            let id1 = first.circuit().id();
            drop(first);

            // Releasing does not close the circuit; it stays pooled.
            let second = rt
                .wait_for(pool.acquire(&k, &fake_target(), gen))
                .await
                .unwrap();
            assert_eq!(second.circuit().id(), id1);
            assert_eq!(pool.builder.builds(), 1);
        });
    }

    #[test]
    fn retire_waits_for_borrowers() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = test_pool(&rt);
            let gen = pool.cancel_token().generation();
            let k = key("example.com");

            let handle = rt
                .wait_for(pool.acquire(&k, &fake_target(), gen))
                .await
                .unwrap();
            let circ = Arc::clone(handle.circuit());

            pool.retire(&k);

            // Still borrowed: not torn down, but no longer handed out.
            assert!(!circ.terminated());
            let replacement = rt
                .wait_for(pool.acquire(&k, &fake_target(), gen))
                .await
                .unwrap();
            assert!(!Arc::ptr_eq(replacement.circuit(), &circ));
            assert_eq!(pool.builder.builds(), 2);

            // Releasing the last borrow finishes the teardown.
            drop(handle);
            assert!(circ.terminated());
        });
    }

    #[test]
    fn retire_by_id() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = test_pool(&rt);
            let gen = pool.cancel_token().generation();
            let k = key("example.com");

            let handle = rt
                .wait_for(pool.acquire(&k, &fake_target(), gen))
                .await
                .unwrap();
            let id = handle.circuit().id();
            let circ = Arc::clone(handle.circuit());
            drop(handle);

            pool.retire_circuit(&id);
            assert!(circ.terminated());
            assert_eq!(pool.status().ready, 0);
        });
    }

    #[test]
    fn unusable_circuit_is_replaced() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = test_pool(&rt);
            let gen = pool.cancel_token().generation();
            let k = key("example.com");

            let first = rt
                .wait_for(pool.acquire(&k, &fake_target(), gen))
                .await
                .unwrap();
            let circ1 = Arc::clone(first.circuit());
            drop(first);

            circ1.mark_unusable();

            let second = rt
                .wait_for(pool.acquire(&k, &fake_target(), gen))
                .await
                .unwrap();
            assert!(!Arc::ptr_eq(second.circuit(), &circ1));
            assert_eq!(pool.builder.builds(), 2);
        });
    }

    #[test]
    fn health_flips_after_consecutive_failures() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = test_pool(&rt);
            pool.builder
                .set(vec![FakeOp::Fail, FakeOp::Fail, FakeOp::Fail]);

            let gen = pool.cancel_token().generation();
            let k = key("example.com");

            for _ in 0..3 {
                let r = rt.wait_for(pool.acquire(&k, &fake_target(), gen)).await;
                assert!(r.is_err());
            }

            let status = pool.status();
            assert_eq!(status.failed, 3);
            assert!(!status.is_healthy);

            // A success resets the counter.
            let ok = rt.wait_for(pool.acquire(&k, &fake_target(), gen)).await;
            assert!(ok.is_ok());
            let status = pool.status();
            assert_eq!(status.failed, 0);
            assert!(status.is_healthy);
        });
    }

    #[test]
    fn abort_cancels_all_waiters() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = test_pool(&rt);
            pool.builder.set(vec![FakeOp::Stall]);

            let token = pool.cancel_token().clone();
            let gen = token.generation();
            let k = key("example.com");

            let (a, b, ()) = rt
                .wait_for(join3(
                    pool.acquire(&k, &fake_target(), gen),
                    pool.acquire(&k, &fake_target(), gen),
                    async {
                        strand_rtcompat::task::yield_now().await;
                        token.abort();
                    },
                ))
                .await;

            assert!(matches!(a, Err(Error::Cancelled)));
            assert!(matches!(
                b,
                Err(Error::Cancelled) | Err(Error::PendingFailed)
            ));

            // The failed record is gone; a new operation can rebuild.
            let gen2 = token.generation();
            let c = rt.wait_for(pool.acquire(&k, &fake_target(), gen2)).await;
            assert!(c.is_ok());
        });
    }

    #[test]
    fn status_counts_in_flight_builds() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = test_pool(&rt);
            pool.builder.set(vec![FakeOp::Delay(Duration::from_millis(50))]);

            let gen = pool.cancel_token().generation();
            let k = key("example.com");

            rt.wait_for(async {
                let target = fake_target();
                let acquire = pool.acquire(&k, &target, gen);
                futures::pin_mut!(acquire);

                // Poll the acquire once so the build launches, then
                // look at the status while it's still in flight.
                futures::future::select(
                    &mut acquire,
                    Box::pin(strand_rtcompat::task::yield_now()),
                )
                .await;
                let status = pool.status();
                assert_eq!(status.creating, 1);
                assert!(!status.has_ready_circuits);

                let handle = acquire.await.unwrap();
                let status = pool.status();
                assert_eq!(status.creating, 0);
                assert_eq!(status.ready, 1);
                drop(handle);
            })
            .await;
        });
    }

    #[test]
    fn close_releases_everything() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = test_pool(&rt);
            let gen = pool.cancel_token().generation();
            let k = key("example.com");

            let handle = rt
                .wait_for(pool.acquire(&k, &fake_target(), gen))
                .await
                .unwrap();
            let circ = Arc::clone(handle.circuit());
            drop(handle);

            pool.close();
            assert!(circ.terminated());

            let r = rt.wait_for(pool.acquire(&k, &fake_target(), gen)).await;
            assert!(matches!(r, Err(Error::Cancelled)));
        });
    }

    #[test]
    fn relay_summary_reports_hops() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = test_pool(&rt);
            let gen = pool.cancel_token().generation();

            rt.wait_for(pool.ensure(&key("example.com"), &fake_target(), gen))
                .await
                .unwrap();

            let relays = pool.relay_summary();
            assert_eq!(relays.len(), 1);
            assert_eq!(relays[0].len(), 3);
            assert_eq!(relays[0][0].nickname, "guard");
        });
    }
}
