//! Shared state system and its writer.
//!
//! ```
//! use statehist::state::{StateSystemBuilder, StateValue};
//!
//! let mut builder = StateSystemBuilder::default();
//! let ss = builder.state_system();
//!
//! let status = builder.quark_absolute_and_add(&["Threads", "42", "Status"]).unwrap();
//!
//! builder.start(0).unwrap();
//! builder.modify_attribute(10, "RUNNING".into(), status).unwrap();
//! builder.modify_attribute(20, "BLOCKED".into(), status).unwrap();
//! builder.close_at_time(30).unwrap();
//!
//! let at_15 = ss.query_single_state(15, status).unwrap();
//! assert_eq!(at_15.value, StateValue::from("RUNNING"));
//! assert_eq!((at_15.start, at_15.end), (10, Some(20)));
//! ```

use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::{Duration, Instant};

use log::debug;
use serde::{Deserialize, Serialize};

use super::attribute::{AttributeTree, Quark};
use super::stack;
use super::store::{IntervalStore, StateInterval};
use super::value::{CustomValueRegistry, StateValue};
use super::StateSystemError;

/// Lifecycle of a state system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// Created, waiting for its first event.
    Idle,
    Building,
    /// Fully built, read-only.
    Closed,
    /// The build was aborted, the recorded states were discarded.
    Failed,
}

/// Behavior of non-blocking point queries past what the writer produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum BuildingQueryPolicy {
    /// Answer with an interval holding `StateValue::Unknown`.
    #[default]
    Sentinel,
    /// Fail with `StateSystemError::NotYetAvailable`.
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct StateSystemConfig {
    pub query_policy: BuildingQueryPolicy,
}

struct Inner {
    tree: AttributeTree,
    store: IntervalStore,
}

struct Progress {
    phase: Phase,
    /// States at times strictly lower than the watermark are final.
    watermark: u64,
    failure: Option<String>,
}

impl Progress {
    fn check_failed(&self) -> Result<(), StateSystemError> {
        match self.phase {
            Phase::Failed => Err(StateSystemError::Failed(
                self.failure.clone().unwrap_or_default(),
            )),
            _ => Ok(()),
        }
    }

    fn is_final(&self, t: u64) -> bool {
        match self.phase {
            Phase::Closed | Phase::Failed => true,
            Phase::Idle | Phase::Building => t < self.watermark,
        }
    }
}

/// Reader handle of a state system.
pub struct StateSystem {
    inner: RwLock<Inner>,
    progress: Mutex<Progress>,
    progressed: Condvar,
    config: StateSystemConfig,
    registry: Arc<CustomValueRegistry>,
}

impl StateSystem {
    fn new(
        tree: AttributeTree,
        store: IntervalStore,
        phase: Phase,
        config: StateSystemConfig,
        registry: Arc<CustomValueRegistry>,
    ) -> Self {
        let watermark = store.end_time();

        Self {
            inner: RwLock::new(Inner { tree, store }),
            progress: Mutex::new(Progress {
                phase,
                watermark,
                failure: None,
            }),
            progressed: Condvar::new(),
            config,
            registry,
        }
    }

    /// Builds a closed state system from a tree and its finalized intervals.
    pub(crate) fn from_parts(
        tree: AttributeTree,
        store: IntervalStore,
        config: StateSystemConfig,
        registry: Arc<CustomValueRegistry>,
    ) -> Self {
        Self::new(tree, store, Phase::Closed, config, registry)
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: Phase, failure: Option<String>) {
        let mut progress = self.progress();
        progress.phase = phase;
        progress.failure = failure;
        self.progressed.notify_all();
    }

    pub fn phase(&self) -> Phase {
        self.progress().phase
    }

    pub fn config(&self) -> &StateSystemConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CustomValueRegistry> {
        &self.registry
    }

    pub fn start_time(&self) -> u64 {
        self.read().store.start_time()
    }

    /// Latest time at which a state was written.
    pub fn current_end_time(&self) -> u64 {
        self.read().store.end_time()
    }

    pub fn attribute_count(&self) -> usize {
        self.read().tree.len()
    }

    pub fn opt_quark(&self, parent: Option<Quark>, name: &str) -> Option<Quark> {
        self.read().tree.opt_quark(parent, name)
    }

    pub fn opt_quark_absolute<S: AsRef<str>>(&self, path: &[S]) -> Option<Quark> {
        self.read().tree.opt_quark_absolute(path)
    }

    pub fn opt_quark_relative<S: AsRef<str>>(&self, parent: Quark, path: &[S]) -> Option<Quark> {
        self.read().tree.opt_quark_relative(parent, path)
    }

    pub fn sub_attributes(&self, quark: Option<Quark>, recursive: bool) -> Vec<Quark> {
        self.read().tree.sub_attributes(quark, recursive)
    }

    pub fn full_path(&self, quark: Quark) -> Vec<String> {
        self.read().tree.full_path(quark)
    }

    pub fn full_path_string(&self, quark: Quark) -> String {
        self.read().tree.full_path_string(quark)
    }

    pub fn attribute_name(&self, quark: Quark) -> Option<String> {
        self.read().tree.name(quark).map(str::to_string)
    }

    pub fn parent_attribute(&self, quark: Quark) -> Option<Quark> {
        self.read().tree.parent(quark)
    }

    /// Runs `f` on the attribute tree.
    pub fn with_tree<R, F: FnOnce(&AttributeTree) -> R>(&self, f: F) -> R {
        f(&self.read().tree)
    }

    /// Value of the ongoing state of `quark`, `Null` once the system is closed.
    pub fn query_ongoing(&self, quark: Quark) -> Result<StateValue, StateSystemError> {
        let inner = self.read();
        self.progress().check_failed()?;

        inner.store.ongoing(quark)
    }

    /// The phase is checked again under the read lock: a failing writer
    /// discards the store and sets the phase under the write lock.
    fn answer(&self, time: u64, quark: Quark) -> Result<StateInterval, StateSystemError> {
        let inner = self.read();
        self.progress().check_failed()?;

        Ok(inner
            .store
            .query(time, quark)?
            .unwrap_or_else(|| StateInterval::empty(quark, time)))
    }

    fn not_yet_available(&self, time: u64, quark: Quark) -> Result<StateInterval, StateSystemError> {
        match self.config.query_policy {
            BuildingQueryPolicy::Sentinel => Ok(StateInterval::unknown(quark, time)),
            BuildingQueryPolicy::Error => Err(StateSystemError::NotYetAvailable(time)),
        }
    }

    /// Returns the state of `quark` at `time`.
    ///
    /// While the system is being built, states at or after the latest
    /// dispatched timestamp may still change; querying them follows the
    /// configured `BuildingQueryPolicy`. A time with no recorded state
    /// yields an empty `Null` interval.
    pub fn query_single_state(
        &self,
        time: u64,
        quark: Quark,
    ) -> Result<StateInterval, StateSystemError> {
        {
            let progress = self.progress();
            progress.check_failed()?;

            if !progress.is_final(time) {
                return self.not_yet_available(time, quark);
            }
        }

        self.answer(time, quark)
    }

    /// Same as `query_single_state`, but waits for the writer to go past
    /// `time` or to finish.
    pub fn query_single_state_blocking(
        &self,
        time: u64,
        quark: Quark,
    ) -> Result<StateInterval, StateSystemError> {
        {
            let progress = self
                .progressed
                .wait_while(self.progress(), |p| !p.is_final(time))
                .unwrap_or_else(PoisonError::into_inner);

            progress.check_failed()?;
        }

        self.answer(time, quark)
    }

    /// Same as `query_single_state_blocking`, giving up after `timeout` with
    /// `StateSystemError::NotYetAvailable`.
    pub fn query_single_state_timeout(
        &self,
        time: u64,
        quark: Quark,
        timeout: Duration,
    ) -> Result<StateInterval, StateSystemError> {
        let deadline = Instant::now() + timeout;

        {
            let mut progress = self.progress();

            while !progress.is_final(time) {
                let now = Instant::now();
                if now >= deadline {
                    return Err(StateSystemError::NotYetAvailable(time));
                }

                progress = self
                    .progressed
                    .wait_timeout(progress, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }

            progress.check_failed()?;
        }

        self.answer(time, quark)
    }

    /// Returns the state of every attribute at `time`, in quark order.
    pub fn query_full_state(&self, time: u64) -> Result<Vec<StateInterval>, StateSystemError> {
        let is_final = {
            let progress = self.progress();
            progress.check_failed()?;
            progress.is_final(time)
        };

        let inner = self.read();
        self.progress().check_failed()?;

        (0..inner.tree.len())
            .map(Quark::new)
            .map(|q| {
                if !is_final {
                    return self.not_yet_available(time, q);
                }

                Ok(inner
                    .store
                    .query(time, q)?
                    .unwrap_or_else(|| StateInterval::empty(q, time)))
            })
            .collect()
    }

    /// Returns the states of `quark` meeting the closed range `[start, end]`,
    /// in start order. During the build, the ongoing state is reported with
    /// no end.
    pub fn query_range(
        &self,
        quark: Quark,
        start: u64,
        end: u64,
    ) -> Result<Vec<StateInterval>, StateSystemError> {
        let inner = self.read();
        self.progress().check_failed()?;

        inner.store.range(quark, start, end)
    }

    /// Blocks until the build is over and returns the final phase.
    pub fn wait_until_built(&self) -> Phase {
        self.progressed
            .wait_while(self.progress(), |p| {
                matches!(p.phase, Phase::Idle | Phase::Building)
            })
            .unwrap_or_else(PoisonError::into_inner)
            .phase
    }

    /// Iterates over the finalized content of a closed system.
    pub(crate) fn with_parts<R, F>(&self, f: F) -> Result<R, StateSystemError>
    where
        F: FnOnce(&AttributeTree, &IntervalStore) -> R,
    {
        match self.phase() {
            Phase::Closed => {
                let inner = self.read();
                Ok(f(&inner.tree, &inner.store))
            }
            Phase::Failed => Err(StateSystemError::Failed(
                self.progress().failure.clone().unwrap_or_default(),
            )),
            Phase::Idle | Phase::Building => Err(StateSystemError::NotYetAvailable(
                self.current_end_time(),
            )),
        }
    }
}

/// The single writer of a state system.
///
/// Dropping a builder that did not close its state system marks the system
/// as failed, so that blocked readers are released.
pub struct StateSystemBuilder {
    ss: Arc<StateSystem>,
    phase: Phase,
}

impl StateSystemBuilder {
    pub fn new(config: StateSystemConfig, registry: Arc<CustomValueRegistry>) -> Self {
        let ss = StateSystem::new(
            AttributeTree::new(),
            IntervalStore::new(0),
            Phase::Idle,
            config,
            registry,
        );

        Self {
            ss: Arc::new(ss),
            phase: Phase::Idle,
        }
    }

    /// Returns a reader handle on the state system being built.
    pub fn state_system(&self) -> Arc<StateSystem> {
        self.ss.clone()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn check_building(&self) -> Result<(), StateSystemError> {
        match self.phase {
            Phase::Building => Ok(()),
            Phase::Idle => Err(StateSystemError::NotStarted),
            Phase::Closed => Err(StateSystemError::Closed),
            Phase::Failed => Err(StateSystemError::Failed(String::from("build aborted"))),
        }
    }

    fn check_value(&self, value: &StateValue) -> Result<(), StateSystemError> {
        match value {
            StateValue::Unknown => Err(StateSystemError::UnknownValue),
            StateValue::Custom(v) if !self.ss.registry.is_registered(v.custom_type_id()) => Err(
                StateSystemError::UnregisteredCustomValue(v.custom_type_id()),
            ),
            _ => Ok(()),
        }
    }

    /// Starts the build: every attribute holds a `Null` state from `start`.
    pub fn start(&mut self, start: u64) -> Result<(), StateSystemError> {
        match self.phase {
            Phase::Idle => {}
            Phase::Building => return Ok(()),
            _ => return self.check_building(),
        }

        self.ss.write().store.set_start(start);
        self.phase = Phase::Building;

        let mut progress = self.ss.progress();
        progress.phase = Phase::Building;
        progress.watermark = start;
        self.ss.progressed.notify_all();

        Ok(())
    }

    fn with_tree_mut<R, F: FnOnce(&mut AttributeTree) -> R>(&mut self, f: F) -> R {
        let mut inner = self.ss.write();
        let ret = f(&mut inner.tree);
        let len = inner.tree.len();
        inner.store.ensure_attributes(len);
        ret
    }

    pub fn get_or_create_quark(
        &mut self,
        parent: Option<Quark>,
        name: &str,
    ) -> Result<Quark, StateSystemError> {
        self.with_tree_mut(|t| t.get_or_create_quark(parent, name))
    }

    /// See `AttributeTree::quark_absolute_and_add`.
    pub fn quark_absolute_and_add<S: AsRef<str>>(
        &mut self,
        path: &[S],
    ) -> Result<Quark, StateSystemError> {
        self.with_tree_mut(|t| t.quark_absolute_and_add(path))
    }

    pub fn quark_relative_and_add<S: AsRef<str>>(
        &mut self,
        parent: Quark,
        path: &[S],
    ) -> Result<Quark, StateSystemError> {
        self.with_tree_mut(|t| t.quark_relative_and_add(parent, path))
    }

    pub fn opt_quark_absolute<S: AsRef<str>>(&self, path: &[S]) -> Option<Quark> {
        self.ss.opt_quark_absolute(path)
    }

    /// Sets `quark` to `value` from `time` on, closing its previous state.
    pub fn modify_attribute(
        &mut self,
        time: u64,
        value: StateValue,
        quark: Quark,
    ) -> Result<(), StateSystemError> {
        self.check_building()?;
        self.check_value(&value)?;

        self.ss.write().store.modify(time, value, quark).map(|_| ())
    }

    /// Replaces the value of the ongoing state of `quark`, keeping its start.
    pub fn update_ongoing_state(
        &mut self,
        value: StateValue,
        quark: Quark,
    ) -> Result<(), StateSystemError> {
        self.check_building()?;
        self.check_value(&value)?;

        self.ss.write().store.update_ongoing(value, quark)
    }

    pub fn query_ongoing(&self, quark: Quark) -> Result<StateValue, StateSystemError> {
        self.ss.read().store.ongoing(quark)
    }

    /// Start of the ongoing state of `quark`.
    pub fn ongoing_start_time(&self, quark: Quark) -> Result<Option<u64>, StateSystemError> {
        self.ss.read().store.ongoing_start(quark)
    }

    /// Pushes `value` on the stack held by `quark`. Returns the new depth.
    pub fn push_attribute(
        &mut self,
        time: u64,
        value: StateValue,
        quark: Quark,
    ) -> Result<usize, StateSystemError> {
        self.check_building()?;
        self.check_value(&value)?;

        let mut inner = self.ss.write();
        let Inner { tree, store } = &mut *inner;

        stack::push(tree, store, time, value, quark)
    }

    /// Pops the stack held by `quark`. Returns `None` if it was empty.
    pub fn pop_attribute(
        &mut self,
        time: u64,
        quark: Quark,
    ) -> Result<Option<StateValue>, StateSystemError> {
        self.check_building()?;

        let mut inner = self.ss.write();
        let Inner { tree, store } = &mut *inner;

        stack::pop(tree, store, time, quark)
    }

    /// Value on top of the stack held by `quark`.
    pub fn peek_stack(&self, quark: Quark) -> Result<Option<StateValue>, StateSystemError> {
        let inner = self.ss.read();

        stack::peek(&inner.tree, &inner.store, quark)
    }

    pub fn stack_depth(&self, quark: Quark) -> Result<usize, StateSystemError> {
        stack::depth(&self.ss.read().store, quark)
    }

    /// Declares that no state before `time` will be modified anymore.
    /// Wakes up the readers waiting for those states.
    pub fn advance(&mut self, time: u64) {
        let mut progress = self.ss.progress();

        if time > progress.watermark {
            progress.watermark = time;
            self.ss.progressed.notify_all();
        }
    }

    /// Closes every ongoing state at `end`. The state system becomes
    /// read-only.
    pub fn close_at_time(&mut self, end: u64) -> Result<(), StateSystemError> {
        self.check_building()?;

        self.ss.write().store.close(end)?;

        self.phase = Phase::Closed;
        {
            let mut progress = self.ss.progress();
            progress.watermark = progress.watermark.max(end);
        }
        self.ss.set_phase(Phase::Closed, None);

        debug!("State system closed at {}", end);

        Ok(())
    }

    /// Aborts the build. Recorded states are discarded and readers get a
    /// `Failed` error from now on.
    pub fn fail(&mut self, reason: &str) {
        if matches!(self.phase, Phase::Closed | Phase::Failed) {
            return;
        }

        let mut inner = self.ss.write();
        let start = inner.store.start_time();
        inner.store = IntervalStore::new(start);
        let len = inner.tree.len();
        inner.store.ensure_attributes(len);

        self.phase = Phase::Failed;
        self.ss.set_phase(Phase::Failed, Some(reason.to_string()));
        drop(inner);

        debug!("State system build failed: {}", reason);
    }

    pub fn current_end_time(&self) -> u64 {
        self.ss.current_end_time()
    }
}

impl Default for StateSystemBuilder {
    fn default() -> Self {
        Self::new(StateSystemConfig::default(), Arc::default())
    }
}

impl Drop for StateSystemBuilder {
    fn drop(&mut self) {
        if matches!(self.phase, Phase::Idle | Phase::Building) {
            self.fail("builder dropped before the state system was closed");
        }
    }
}
