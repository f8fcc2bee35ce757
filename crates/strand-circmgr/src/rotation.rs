//! The rotation scheduler: replacing circuits before they grow stale.
//!
//! Each tracked lineage moves through `Idle -> ScheduledRebuild ->
//! Building -> Cutover -> Idle`.  A replacement is launched `advance`
//! ahead of the configured interval, so it is ready before the old
//! circuit's nominal expiry and rotation never introduces a latency
//! cliff.  The old record keeps serving `acquire` calls until the
//! replacement is ready; cutover is atomic from the callers'
//! perspective.
//!
//! This is the only component allowed to rebuild circuits without an
//! explicit caller: `acquire` failures are retried by the next caller,
//! never by a background loop.

use crate::isolation::IsolationKey;
use crate::mgr::{CircuitBuilder, CircuitPool};
use crate::transport::BridgeTarget;
use crate::{Error, Result};

use futures::channel::mpsc;
use futures::stream::StreamExt;
use futures::FutureExt;
use retry_error::RetryError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use strand_rtcompat::{Runtime, SleepProvider, SleepProviderExt};

/// How many times an explicit `rotate_now` retries a failed
/// replacement build before giving up (within its deadline).
const MAX_ROTATE_ATTEMPTS: usize = 3;

/// Drives scheduled and on-demand circuit rotation for a pool.
pub struct Rotator<B: CircuitBuilder, R: Runtime> {
    /// The pool whose circuits we rotate.
    pool: Arc<CircuitPool<B, R>>,
    /// Connection parameters for replacement builds.
    target: BridgeTarget,
    /// Time between rotations of a lineage; `None` disables the
    /// periodic task.
    interval: Option<Duration>,
    /// How far ahead of the interval the replacement build starts.
    advance: Duration,
}

impl<B: CircuitBuilder, R: Runtime> Rotator<B, R> {
    /// Make a new rotator for `pool`.
    pub fn new(
        pool: Arc<CircuitPool<B, R>>,
        target: BridgeTarget,
        interval: Option<Duration>,
        advance: Duration,
    ) -> Self {
        Rotator {
            pool,
            target,
            interval,
            advance,
        }
    }

    /// Create the nudge channel: the pool signals the sending side
    /// when the default lineage keeps failing to build.
    pub fn nudge_channel(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded();
        self.pool.set_rotation_nudge(tx);
        rx
    }

    /// Run the periodic scheduler until the client closes.
    ///
    /// Panics if no update interval was configured; don't spawn this
    /// task in that case.
    pub async fn run(self: Arc<Self>, mut nudge: mpsc::UnboundedReceiver<()>) {
        let interval = self
            .interval
            .expect("rotation task spawned without an interval");
        let runtime = self.pool.runtime().clone();
        let token = self.pool.cancel_token().clone();
        info!(
            "rotation scheduler running: interval {:?}, advance {:?}",
            interval, self.advance
        );

        loop {
            if token.is_closed() {
                break;
            }
            let now = runtime.now();
            let wait = match self.pool.next_rotation_due(interval, self.advance) {
                Some(due) => due.saturating_duration_since(now),
                // Nothing to rotate yet; re-check after a while.
                None => interval,
            };

            let gen = token.generation();
            let cancelled = token.cancelled(gen).fuse();
            let tick = runtime.sleep(wait).fuse();
            futures::pin_mut!(cancelled, tick);

            futures::select_biased! {
                _ = cancelled => {
                    // An abort wakes us spuriously; only close stops us.
                    continue;
                }
                _ = nudge.next() => {
                    debug!("rotation nudged after repeated default-circuit failures");
                    if let Err(e) = self.rebuild_lineage(&IsolationKey::shared()).await {
                        warn!("nudged rebuild failed: {}", e);
                    }
                }
                _ = tick => {
                    for key in self.pool.rotation_due_keys(interval, self.advance) {
                        debug!("scheduled rebuild for {:?}", key);
                        if let Err(e) = self.rebuild_lineage(&key).await {
                            warn!("scheduled rotation for {:?} failed: {}", key, e);
                        }
                    }
                }
            }
        }
        debug!("rotation scheduler exiting");
    }

    /// Build a replacement for `key` and cut over to it.
    ///
    /// The old circuit stays acquirable while the replacement builds.
    async fn rebuild_lineage(&self, key: &IsolationKey) -> Result<()> {
        let token = self.pool.cancel_token();
        let gen = token.generation();
        let circ = self.pool.build_detached(&self.target, gen).await?;
        self.pool.cutover(key, circ);
        Ok(())
    }

    /// Rotate the default lineage now, or confirm it is still fresh,
    /// finishing within `deadline`.
    ///
    /// Fails with [`Error::RequestTimeout`] if the pool cannot satisfy
    /// the deadline; never hangs.
    pub async fn rotate_now(&self, deadline: Duration) -> Result<()> {
        let runtime = self.pool.runtime().clone();
        let token = self.pool.cancel_token();
        token.check(token.generation())?;

        let key = IsolationKey::shared();
        let op = async {
            if self.pool.lineage_fresh(&key, self.advance) {
                debug!("default circuit is fresh; explicit update is a no-op");
                return Ok(());
            }
            let mut err = RetryError::in_attempt_to("rotate the default circuit");
            for _ in 0..MAX_ROTATE_ATTEMPTS {
                match self.rebuild_lineage(&key).await {
                    Ok(()) => return Ok(()),
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => err.push(e),
                }
            }
            Err(Error::RequestFailed(err))
        };

        match runtime.timeout(deadline, op).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::RequestTimeout),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::mgr::test::{fake_target, FakeBuilder, FakeOp};
    use crate::mgr::PoolConfig;

    use futures::task::SpawnExt;
    use std::sync::Arc;
    use strand_rtcompat::test_with_runtime;
    use strand_rtmock::MockSleepRuntime;

    fn pool_with_threshold<R: Runtime>(
        rt: &MockSleepRuntime<R>,
        max_consecutive_failures: u32,
    ) -> Arc<CircuitPool<FakeBuilder<MockSleepRuntime<R>>, MockSleepRuntime<R>>> {
        let builder = FakeBuilder::new(rt);
        Arc::new(CircuitPool::new(
            builder,
            rt.clone(),
            CancelToken::new(),
            PoolConfig {
                circuit_timeout: Duration::from_millis(90_000),
                max_consecutive_failures,
            },
            None,
        ))
    }

    /// Spin (advancing mock time) until `cond` holds.
    async fn until<F: Fn() -> bool>(cond: F) {
        while !cond() {
            strand_rtcompat::task::yield_now().await;
        }
    }

    #[test]
    fn scheduled_rotation_with_advance() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = pool_with_threshold(&rt, 3);
            let interval = Duration::from_millis(600_000);
            let advance = Duration::from_millis(60_000);

            let rotator = Arc::new(Rotator::new(
                Arc::clone(&pool),
                fake_target(),
                Some(interval),
                advance,
            ));
            let nudge = rotator.nudge_channel();

            // Build the initial default circuit at t=0.
            let gen = pool.cancel_token().generation();
            let key = IsolationKey::shared();
            let first = rt
                .wait_for(pool.acquire(&key, &fake_target(), gen))
                .await
                .unwrap();
            let circ1 = Arc::clone(first.circuit());
            drop(first);
            assert_eq!(pool.builder.builds(), 1);

            // The replacement build takes a while, so we can observe
            // the Building phase.
            pool.builder.set(vec![FakeOp::Delay(Duration::from_millis(30))]);

            rt.spawn(Arc::clone(&rotator).run(nudge)).unwrap();

            // Just before interval - advance: nothing has happened.
            rt.advance(Duration::from_millis(539_000)).await;
            assert_eq!(pool.builder.builds(), 1);
            assert_eq!(pool.status().creating, 0);

            // Crossing t=540_000 starts the replacement.
            rt.advance(Duration::from_millis(2_000)).await;
            rt.wait_for(until(|| pool.builder.builds() == 2)).await;

            // Original circuit remains acquirable until cutover.
            let during = rt
                .wait_for(pool.acquire(&key, &fake_target(), gen))
                .await
                .unwrap();
            assert!(Arc::ptr_eq(during.circuit(), &circ1));
            drop(during);

            // Once the replacement is ready, cutover retires the old
            // circuit and new acquires route to the replacement.
            rt.wait_for(until(|| circ1.terminated())).await;
            let after = rt
                .wait_for(pool.acquire(&key, &fake_target(), gen))
                .await
                .unwrap();
            assert!(!Arc::ptr_eq(after.circuit(), &circ1));
            assert_eq!(pool.status().creating, 0);

            pool.cancel_token().close();
        });
    }

    #[test]
    fn rotate_now_is_noop_when_fresh() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = pool_with_threshold(&rt, 3);
            let rotator = Rotator::new(
                Arc::clone(&pool),
                fake_target(),
                None,
                Duration::from_millis(60_000),
            );

            let gen = pool.cancel_token().generation();
            rt.wait_for(pool.ensure(&IsolationKey::shared(), &fake_target(), gen))
                .await
                .unwrap();
            assert_eq!(pool.builder.builds(), 1);

            // Young circuit: update validates health and does nothing.
            rt.wait_for(rotator.rotate_now(Duration::from_millis(10_000)))
                .await
                .unwrap();
            assert_eq!(pool.builder.builds(), 1);
        });
    }

    #[test]
    fn rotate_now_rebuilds_stale_lineage() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = pool_with_threshold(&rt, 3);
            let advance = Duration::from_millis(60_000);
            let rotator = Rotator::new(Arc::clone(&pool), fake_target(), None, advance);

            let gen = pool.cancel_token().generation();
            let key = IsolationKey::shared();
            let first = rt
                .wait_for(pool.acquire(&key, &fake_target(), gen))
                .await
                .unwrap();
            let circ1 = Arc::clone(first.circuit());
            drop(first);

            // Age the circuit past the freshness window.
            rt.advance(advance * 2).await;

            rt.wait_for(rotator.rotate_now(Duration::from_millis(10_000)))
                .await
                .unwrap();
            assert_eq!(pool.builder.builds(), 2);

            let after = rt
                .wait_for(pool.acquire(&key, &fake_target(), gen))
                .await
                .unwrap();
            assert!(!Arc::ptr_eq(after.circuit(), &circ1));
        });
    }

    #[test]
    fn rotate_now_respects_deadline() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = pool_with_threshold(&rt, 3);
            pool.builder.set(vec![FakeOp::Stall]);
            let rotator = Rotator::new(
                Arc::clone(&pool),
                fake_target(),
                None,
                Duration::from_millis(60_000),
            );

            // No circuit exists, so the update must build one; the
            // build never finishes, so the deadline fires.
            let out = rt
                .wait_for(rotator.rotate_now(Duration::from_millis(50)))
                .await;
            assert!(matches!(out, Err(Error::RequestTimeout)));
        });
    }

    #[test]
    fn repeated_failures_nudge_a_rebuild() {
        test_with_runtime(|rt| async move {
            let rt = MockSleepRuntime::new(rt);
            let pool = pool_with_threshold(&rt, 1);
            let rotator = Arc::new(Rotator::new(
                Arc::clone(&pool),
                fake_target(),
                Some(Duration::from_millis(600_000)),
                Duration::from_millis(60_000),
            ));
            let nudge = rotator.nudge_channel();
            rt.spawn(Arc::clone(&rotator).run(nudge)).unwrap();

            // One failed acquire crosses the threshold of 1 and nudges
            // the scheduler, which rebuilds ahead of the next request.
            pool.builder.set(vec![FakeOp::Fail]);
            let gen = pool.cancel_token().generation();
            let r = rt
                .wait_for(pool.acquire(&IsolationKey::shared(), &fake_target(), gen))
                .await;
            assert!(r.is_err());

            rt.wait_for(until(|| pool.status().has_ready_circuits)).await;
            assert_eq!(pool.builder.builds(), 2);

            pool.cancel_token().close();
        });
    }
}
