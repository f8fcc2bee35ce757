//! The keyed map of circuit records behind the pool.
//!
//! All mutations happen inside one standard-library mutex.  (Danger:
//! this is a blocking mutex close to async code.  It must never be
//! held while an await is happening.)  Teardown of circuit resources
//! and observer callbacks always run *after* the lock is released, so
//! observers can never re-enter pool mutation.

use super::{
    AbstractCircuit, CircuitEvent, CircuitStatus, Pending, RelayHop, Sending, StatusObserver,
};
use crate::isolation::IsolationKey;
use crate::{Error, Result};

use futures::channel::mpsc::UnboundedSender;
use futures::channel::oneshot;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// The lifecycle state of one keyed circuit record.
pub(super) enum CircState<C: AbstractCircuit> {
    /// Some task is building the circuit; every interested party
    /// shares the same receiver.
    Building(Pending<C>),
    /// The circuit is established and may be handed out.
    Open(OpenEntry<C>),
}

/// An entry for an established circuit.
pub(super) struct OpenEntry<C: AbstractCircuit> {
    /// The circuit itself.
    pub(super) circ: Arc<C>,
    /// When the build that produced this circuit was launched.
    pub(super) created_at: Instant,
    /// When the circuit became ready.
    pub(super) ready_at: Instant,
    /// Number of current borrowers.  The circuit must not be torn
    /// down while this is nonzero.
    pub(super) in_use: usize,
}

/// A record that is no longer handed out, draining toward teardown.
struct RetiringEntry<C: AbstractCircuit> {
    /// The circuit being drained.
    circ: Arc<C>,
    /// Borrowers still holding it.
    in_use: usize,
}

/// Everything the mutex protects.
struct MapState<C: AbstractCircuit> {
    /// Map from isolation key to record.
    circuits: HashMap<IsolationKey, CircState<C>>,
    /// Retired records waiting for their borrowers to finish.
    retiring: Vec<RetiringEntry<C>>,
    /// Builds running outside the map (one-shots and rotation
    /// replacements), counted for the status surface.
    detached_building: usize,
    /// Consecutive pooled-build failures since the last success.
    consecutive_failures: u32,
    /// Set once the pool is closed; everything fails afterwards.
    closed: bool,
}

/// What an `acquire` call should do next, as decided under the lock.
pub(super) enum AcquireAction<C: AbstractCircuit> {
    /// A usable circuit exists; its borrow count is already
    /// incremented.
    Use(Arc<C>),
    /// A build is in flight; wait for this shared outcome.
    Join(Pending<C>),
    /// No record existed; the caller must build, then report through
    /// this sender.
    Launch(Sending<C>),
}

/// The map of circuit records, shared between the pool and every
/// outstanding handle.
pub(super) struct CircuitMap<C: AbstractCircuit> {
    /// The guarded state.
    state: Mutex<MapState<C>>,
    /// Failure threshold for the health bit and the rotation nudge.
    max_consecutive_failures: u32,
    /// Observer for state-transition events, if one was registered.
    observer: Option<StatusObserver>,
    /// Channel for nudging the rotation scheduler, once registered.
    nudge: Mutex<Option<UnboundedSender<()>>>,
}

/// Decrements the detached-build counter when a detached build ends,
/// however it ends.
pub(super) struct DetachedBuildGuard<C: AbstractCircuit> {
    /// The map whose counter we bump back down.
    map: Arc<CircuitMap<C>>,
}

impl<C: AbstractCircuit> Drop for DetachedBuildGuard<C> {
    fn drop(&mut self) {
        let mut state = self.map.state.lock().expect("poisoned lock");
        state.detached_building = state.detached_building.saturating_sub(1);
    }
}

/// Removes a `Building` record if the task that owns it is dropped
/// before recording an outcome.
///
/// Without this, an `acquire` future dropped mid-build (a request
/// timeout, say) would leave a stale `Building` entry that every later
/// acquire joins and none can complete.  The guard must drop before
/// the build's sender does, so joiners never observe a dangling record.
pub(super) struct BuildCleanupGuard<C: AbstractCircuit> {
    /// The map holding the record; `None` once disarmed.
    map: Option<Arc<CircuitMap<C>>>,
    /// The key the record is filed under.
    key: IsolationKey,
}

impl<C: AbstractCircuit> BuildCleanupGuard<C> {
    /// Arm a guard for the build under `key`.
    pub(super) fn new(map: Arc<CircuitMap<C>>, key: IsolationKey) -> Self {
        BuildCleanupGuard {
            map: Some(map),
            key,
        }
    }

    /// The build's outcome was recorded; the guard has nothing to do.
    pub(super) fn disarm(mut self) {
        self.map = None;
    }
}

impl<C: AbstractCircuit> Drop for BuildCleanupGuard<C> {
    fn drop(&mut self) {
        if let Some(map) = self.map.take() {
            map.fail_build(&self.key, false);
        }
    }
}

impl<C: AbstractCircuit> CircuitMap<C> {
    /// Make a new empty map.
    pub(super) fn new(max_consecutive_failures: u32, observer: Option<StatusObserver>) -> Self {
        CircuitMap {
            state: Mutex::new(MapState {
                circuits: HashMap::new(),
                retiring: Vec::new(),
                detached_building: 0,
                consecutive_failures: 0,
                closed: false,
            }),
            max_consecutive_failures,
            observer,
            nudge: Mutex::new(None),
        }
    }

    /// Register the rotation-nudge channel.
    pub(super) fn set_nudge(&self, sender: UnboundedSender<()>) {
        *self.nudge.lock().expect("poisoned lock") = Some(sender);
    }

    /// Deliver an event to the observer, if any.  Call only with the
    /// state lock released.
    fn emit(&self, event: CircuitEvent) {
        if let Some(observer) = &self.observer {
            observer(&event);
        }
    }

    /// Helper: a fresh Building state and its sender.
    fn building_state() -> (CircState<C>, Sending<C>) {
        let (snd, rcv) = oneshot::channel();
        (CircState::Building(rcv.shared()), snd)
    }

    /// Decide what an `acquire` for `key` should do, updating the map
    /// accordingly.
    pub(super) fn plan_acquire(&self, key: &IsolationKey) -> Result<AcquireAction<C>> {
        let mut teardown = None;
        let mut started = false;
        let action;
        {
            let mut state = self.state.lock().expect("poisoned lock");
            if state.closed {
                return Err(Error::Cancelled);
            }

            if let Some(CircState::Building(pending)) = state.circuits.get(key) {
                action = AcquireAction::Join(pending.clone());
            } else if matches!(state.circuits.get(key),
                               Some(CircState::Open(ent)) if ent.circ.is_usable())
            {
                match state.circuits.get_mut(key) {
                    Some(CircState::Open(ent)) => {
                        ent.in_use += 1;
                        action = AcquireAction::Use(Arc::clone(&ent.circ));
                    }
                    _ => unreachable!(),
                }
            } else {
                // Either no record, or an open record that stopped
                // being usable: launch a fresh build.
                let (building, sender) = Self::building_state();
                if let Some(CircState::Open(old)) = state.circuits.insert(key.clone(), building) {
                    if old.in_use > 0 {
                        state.retiring.push(RetiringEntry {
                            circ: old.circ,
                            in_use: old.in_use,
                        });
                    } else {
                        teardown = Some(old.circ);
                    }
                }
                started = true;
                action = AcquireAction::Launch(sender);
            }
        }
        if let Some(circ) = teardown {
            circ.terminate();
            self.emit(CircuitEvent::TornDown);
        }
        if started {
            self.emit(CircuitEvent::BuildStarted { key: key.clone() });
        }
        Ok(action)
    }

    /// Record a successful build for `key`.
    pub(super) fn complete_build(
        &self,
        key: &IsolationKey,
        circ: &Arc<C>,
        created_at: Instant,
        ready_at: Instant,
    ) {
        let closed = {
            let mut state = self.state.lock().expect("poisoned lock");
            if state.closed {
                true
            } else {
                state.consecutive_failures = 0;
                state.circuits.insert(
                    key.clone(),
                    CircState::Open(OpenEntry {
                        circ: Arc::clone(circ),
                        created_at,
                        ready_at,
                        in_use: 0,
                    }),
                );
                false
            }
        };
        if closed {
            circ.terminate();
            self.emit(CircuitEvent::TornDown);
        } else {
            self.emit(CircuitEvent::BuildSucceeded { key: key.clone() });
        }
    }

    /// Record a failed build for `key`: the record is removed so the
    /// next `acquire` starts fresh.
    ///
    /// When `count_failure` is false (cancellation), the health
    /// counter is left alone.
    pub(super) fn fail_build(&self, key: &IsolationKey, count_failure: bool) {
        let mut nudge = false;
        {
            let mut state = self.state.lock().expect("poisoned lock");
            if matches!(state.circuits.get(key), Some(CircState::Building(_))) {
                state.circuits.remove(key);
            }
            if count_failure {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if key.is_shared() && state.consecutive_failures >= self.max_consecutive_failures {
                    nudge = true;
                }
            }
        }
        self.emit(CircuitEvent::BuildFailed { key: key.clone() });
        if nudge {
            debug!("default circuit failing repeatedly; nudging rotation");
            if let Some(sender) = &*self.nudge.lock().expect("poisoned lock") {
                let _ignore_err = sender.unbounded_send(());
            }
        }
    }

    /// Take a borrow on the open circuit for `key`, verifying its
    /// identity.
    ///
    /// Used by acquirers that waited for a build: the record may have
    /// been retired or replaced while they were waking up.
    pub(super) fn checkout(&self, key: &IsolationKey, id: &C::Id) -> Result<()> {
        let mut state = self.state.lock().expect("poisoned lock");
        if state.closed {
            return Err(Error::Cancelled);
        }
        match state.circuits.get_mut(key) {
            Some(CircState::Open(ent)) if ent.circ.id() == *id && ent.circ.is_usable() => {
                ent.in_use += 1;
                Ok(())
            }
            _ => Err(Error::PendingFailed),
        }
    }

    /// Release one borrow of the circuit `id` filed under `key`.
    ///
    /// Never closes a pooled circuit merely because its count reached
    /// zero; retiring circuits are torn down once drained.
    pub(super) fn release(&self, key: &IsolationKey, id: &C::Id) {
        let mut teardown = None;
        {
            let mut state = self.state.lock().expect("poisoned lock");
            let mut found = false;
            if let Some(CircState::Open(ent)) = state.circuits.get_mut(key) {
                if ent.circ.id() == *id {
                    ent.in_use = ent.in_use.saturating_sub(1);
                    found = true;
                }
            }
            if !found {
                if let Some(pos) = state.retiring.iter().position(|e| e.circ.id() == *id) {
                    let ent = &mut state.retiring[pos];
                    ent.in_use = ent.in_use.saturating_sub(1);
                    if ent.in_use == 0 {
                        teardown = Some(state.retiring.swap_remove(pos).circ);
                    }
                }
            }
        }
        if let Some(circ) = teardown {
            circ.terminate();
            self.emit(CircuitEvent::TornDown);
        }
    }

    /// Stop handing out the circuit under `key`.
    pub(super) fn retire(&self, key: &IsolationKey) {
        let mut teardown = None;
        let mut retired = false;
        {
            let mut state = self.state.lock().expect("poisoned lock");
            if matches!(state.circuits.get(key), Some(CircState::Open(_))) {
                if let Some(CircState::Open(old)) = state.circuits.remove(key) {
                    retired = true;
                    if old.in_use > 0 {
                        state.retiring.push(RetiringEntry {
                            circ: old.circ,
                            in_use: old.in_use,
                        });
                    } else {
                        teardown = Some(old.circ);
                    }
                }
            }
        }
        if retired {
            self.emit(CircuitEvent::Retired { key: key.clone() });
        }
        if let Some(circ) = teardown {
            circ.terminate();
            self.emit(CircuitEvent::TornDown);
        }
    }

    /// Retire whichever record holds the circuit with identity `id`.
    pub(super) fn retire_id(&self, id: &C::Id) {
        let key = {
            let state = self.state.lock().expect("poisoned lock");
            state
                .circuits
                .iter()
                .find_map(|(key, st)| match st {
                    CircState::Open(ent) if ent.circ.id() == *id => Some(key.clone()),
                    _ => None,
                })
        };
        if let Some(key) = key {
            self.retire(&key);
        }
    }

    /// Replace the record under `key` with a freshly built circuit.
    pub(super) fn cutover(&self, key: &IsolationKey, circ: Arc<C>, now: Instant) {
        let mut teardown = Vec::new();
        let mut retired = false;
        let mut installed = false;
        {
            let mut state = self.state.lock().expect("poisoned lock");
            let acquire_owns_key =
                matches!(state.circuits.get(key), Some(CircState::Building(_)));
            if state.closed || acquire_owns_key {
                // Someone else is responsible for this key right now;
                // don't fight them over it.
                teardown.push(circ);
            } else {
                let old = state.circuits.insert(
                    key.clone(),
                    CircState::Open(OpenEntry {
                        circ,
                        created_at: now,
                        ready_at: now,
                        in_use: 0,
                    }),
                );
                installed = true;
                if let Some(CircState::Open(old)) = old {
                    retired = true;
                    if old.in_use > 0 {
                        state.retiring.push(RetiringEntry {
                            circ: old.circ,
                            in_use: old.in_use,
                        });
                    } else {
                        teardown.push(old.circ);
                    }
                }
            }
        }
        if retired {
            self.emit(CircuitEvent::Retired { key: key.clone() });
        }
        if installed {
            self.emit(CircuitEvent::BuildSucceeded { key: key.clone() });
        }
        for circ in teardown {
            circ.terminate();
            self.emit(CircuitEvent::TornDown);
        }
    }

    /// Count a detached build for the status surface; the guard undoes
    /// it.
    pub(super) fn detached_build_guard(self: &Arc<Self>) -> DetachedBuildGuard<C> {
        {
            let mut state = self.state.lock().expect("poisoned lock");
            state.detached_building += 1;
        }
        DetachedBuildGuard {
            map: Arc::clone(self),
        }
    }

    /// Counts per state plus the derived health bits.
    pub(super) fn status(&self) -> CircuitStatus {
        let state = self.state.lock().expect("poisoned lock");
        let mut creating = state.detached_building;
        let mut ready = 0;
        let mut has_ready = false;
        for st in state.circuits.values() {
            match st {
                CircState::Building(_) => creating += 1,
                CircState::Open(ent) => {
                    ready += 1;
                    if ent.circ.is_usable() {
                        has_ready = true;
                    }
                }
            }
        }
        let failures = state.consecutive_failures;
        CircuitStatus {
            creating,
            ready,
            failed: failures as usize,
            total_circuits: creating + ready + state.retiring.len(),
            has_ready_circuits: has_ready,
            is_healthy: has_ready && failures < self.max_consecutive_failures,
        }
    }

    /// Relay hops of every open circuit.
    pub(super) fn relays(&self) -> Vec<Vec<RelayHop>> {
        let state = self.state.lock().expect("poisoned lock");
        state
            .circuits
            .values()
            .filter_map(|st| match st {
                CircState::Open(ent) => Some(ent.circ.relays()),
                _ => None,
            })
            .collect()
    }

    /// Earliest instant at which any open circuit wants its
    /// replacement to start building.
    pub(super) fn next_rotation_due(
        &self,
        interval: Duration,
        advance: Duration,
    ) -> Option<Instant> {
        let state = self.state.lock().expect("poisoned lock");
        state
            .circuits
            .values()
            .filter_map(|st| match st {
                CircState::Open(ent) => {
                    Some(ent.created_at + interval.saturating_sub(advance))
                }
                _ => None,
            })
            .min()
    }

    /// Keys whose open circuits are due for a replacement build.
    pub(super) fn rotation_due_keys(
        &self,
        interval: Duration,
        advance: Duration,
        now: Instant,
    ) -> Vec<IsolationKey> {
        let state = self.state.lock().expect("poisoned lock");
        state
            .circuits
            .iter()
            .filter_map(|(key, st)| match st {
                CircState::Open(ent)
                    if ent.created_at + interval.saturating_sub(advance) <= now =>
                {
                    Some(key.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// True if `key` holds a usable circuit that became ready less
    /// than `advance` ago.
    pub(super) fn lineage_fresh(&self, key: &IsolationKey, advance: Duration, now: Instant) -> bool {
        let state = self.state.lock().expect("poisoned lock");
        match state.circuits.get(key) {
            Some(CircState::Open(ent)) => {
                ent.circ.is_usable() && now.saturating_duration_since(ent.ready_at) < advance
            }
            _ => false,
        }
    }

    /// Release every record and mark the map closed.
    pub(super) fn close(&self) {
        let teardown = {
            let mut state = self.state.lock().expect("poisoned lock");
            if state.closed {
                return;
            }
            state.closed = true;
            let mut teardown = Vec::new();
            for (_key, st) in state.circuits.drain() {
                if let CircState::Open(ent) = st {
                    teardown.push(ent.circ);
                }
            }
            for ent in state.retiring.drain(..) {
                teardown.push(ent.circ);
            }
            teardown
        };
        for circ in teardown {
            circ.terminate();
        }
        self.emit(CircuitEvent::Closed);
    }
}
