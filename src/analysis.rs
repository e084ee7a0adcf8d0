//! Analysis modules.
//!
//! An analysis module owns the state system of one analysis on one trace.
//! Scheduling it loads the state system from its history file when a
//! usable one exists, and builds it from the trace otherwise. Completed
//! builds are saved for the next runs.

use std::{path::PathBuf, sync::Arc, thread::JoinHandle};

use log::{debug, info, warn};
use thiserror::Error;

use crate::context::BuildContext;
use crate::history::{HistoryDirectory, HistoryError, HistoryKey};
use crate::provider::dispatcher::{BuildOutcome, EventDispatcher};
use crate::provider::{ProviderDefinition, TraceInfo};
use crate::state::{CustomValueRegistry, StateSystem, StateSystemBuilder};
use crate::utils::CancelToken;
use crate::{EventProcessor, EventSource};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis '{analysis}' does not apply to trace '{trace}'")]
    NotApplicable { analysis: String, trace: String },
    #[error("build of '{analysis}' failed: {reason}")]
    Build { analysis: String, reason: String },
    #[error("analysis '{analysis}' is unavailable: {source}")]
    Unavailable {
        analysis: String,
        #[source]
        source: HistoryError,
    },
}

/// How a scheduled analysis got its state system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Loaded from the history file at the given path.
    Loaded(PathBuf),
    /// Built from the trace. Only completed builds are saved.
    Built {
        outcome: BuildOutcome,
        saved: Option<PathBuf>,
    },
}

/// Where, and under which name, a build is saved.
#[derive(Debug, Clone)]
struct HistoryTarget {
    histories: HistoryDirectory,
    trace: String,
    key: HistoryKey,
}

impl HistoryTarget {
    fn unavailable(&self, source: HistoryError) -> AnalysisError {
        AnalysisError::Unavailable {
            analysis: self.key.analysis_id.clone(),
            source,
        }
    }

    fn load(
        &self,
        ctx: &BuildContext,
        registry: &Arc<CustomValueRegistry>,
    ) -> Result<Option<(StateSystem, PathBuf)>, AnalysisError> {
        let path = match self.histories.file_path(&self.trace, &self.key.analysis_id) {
            Ok(path) => path,
            Err(e) => {
                debug!("No history for '{}': {}", self.trace, e);
                return Ok(None);
            }
        };

        if ctx.force_rebuild || !path.exists() {
            return Ok(None);
        }

        let res = self.histories.load(
            &self.trace,
            &self.key,
            ctx.state_config.clone(),
            registry.clone(),
        );

        match res {
            Ok(ss) => Ok(Some((ss, path))),
            Err(e) if e.is_stale() => {
                warn!("Discarding history file {}: {}", path.display(), e);
                self.histories
                    .remove(&self.trace, &self.key.analysis_id)
                    .map_err(|e| self.unavailable(e))?;
                Ok(None)
            }
            Err(e) => Err(self.unavailable(e)),
        }
    }

    fn build<S: EventSource>(
        &self,
        mut source: S,
        mut dispatcher: EventDispatcher,
        ctx: &BuildContext,
    ) -> Result<ScheduleOutcome, AnalysisError> {
        let ss = dispatcher.state_system();

        let outcome = dispatcher
            .pre_load_init(ctx)
            .and_then(|_| source.process_events(dispatcher, ctx))
            .map_err(|e| AnalysisError::Build {
                analysis: self.key.analysis_id.clone(),
                reason: format!("{:#}", e),
            })?;

        if !outcome.is_completed() {
            info!(
                "State system of '{}' on '{}' is partial, not saving it",
                self.key.analysis_id, self.trace
            );
            return Ok(ScheduleOutcome::Built {
                outcome,
                saved: None,
            });
        }

        let saved = match self.histories.save(&self.trace, &self.key, &ss) {
            Ok(path) => Some(path),
            Err(e @ HistoryError::InvalidName(_)) => {
                warn!("State system of '{}' not saved: {}", self.key.analysis_id, e);
                None
            }
            Err(e) => return Err(self.unavailable(e)),
        };

        Ok(ScheduleOutcome::Built { outcome, saved })
    }
}

pub struct AnalysisModule {
    definition: Arc<dyn ProviderDefinition>,
    target: HistoryTarget,
    ctx: BuildContext,
    registry: Arc<CustomValueRegistry>,
    cancel: CancelToken,
    ss: Option<Arc<StateSystem>>,
    worker: Option<JoinHandle<Result<ScheduleOutcome, AnalysisError>>>,
}

impl AnalysisModule {
    /// Creates the analysis `definition` on a trace. Fails with
    /// `NotApplicable` if the definition cannot handle the trace.
    pub fn new(
        definition: Arc<dyn ProviderDefinition>,
        trace: &TraceInfo,
        ctx: &BuildContext,
    ) -> Result<Self, AnalysisError> {
        if !definition.can_handle(trace) {
            return Err(AnalysisError::NotApplicable {
                analysis: definition.id().to_string(),
                trace: trace.name.clone(),
            });
        }

        let target = HistoryTarget {
            histories: HistoryDirectory::new(&ctx.history_dir),
            trace: trace.name.clone(),
            key: HistoryKey::new(definition.id(), definition.version())
                .with_config(&definition.fingerprint()),
        };

        Ok(Self {
            definition,
            target,
            ctx: ctx.clone(),
            registry: Arc::default(),
            cancel: CancelToken::new(),
            ss: None,
            worker: None,
        })
    }

    pub fn try_new(
        definition: Arc<dyn ProviderDefinition>,
        trace: &TraceInfo,
        ctx: &BuildContext,
    ) -> Option<Self> {
        Self::new(definition, trace, ctx).ok()
    }

    /// Custom state value types used by the analysis.
    pub fn with_registry(mut self, registry: Arc<CustomValueRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Builds with the given cancellation token, e.g. one shared with a
    /// signal handler.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn id(&self) -> &str {
        &self.target.key.analysis_id
    }

    pub fn trace_name(&self) -> &str {
        &self.target.trace
    }

    /// Path of the history file of the analysis, if the trace name allows
    /// one.
    pub fn history_path(&self) -> Option<PathBuf> {
        self.target
            .histories
            .file_path(&self.target.trace, &self.target.key.analysis_id)
            .ok()
    }

    /// The state system, once scheduled.
    pub fn state_system(&self) -> Option<Arc<StateSystem>> {
        self.ss.clone()
    }

    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn dispatcher(&self) -> EventDispatcher {
        let builder = StateSystemBuilder::new(self.ctx.state_config.clone(), self.registry.clone());

        EventDispatcher::new(
            self.definition.build(),
            builder,
            self.ctx.flush_policy,
            self.cancel.clone(),
        )
    }

    fn try_load(&mut self) -> Result<Option<ScheduleOutcome>, AnalysisError> {
        match self.target.load(&self.ctx, &self.registry)? {
            Some((ss, path)) => {
                info!(
                    "Loaded state system of '{}' from {}",
                    self.target.key.analysis_id,
                    path.display()
                );
                self.ss = Some(Arc::new(ss));
                Ok(Some(ScheduleOutcome::Loaded(path)))
            }
            None => Ok(None),
        }
    }

    /// Loads the state system, or builds it from `source` on the calling
    /// thread.
    pub fn schedule<S: EventSource>(&mut self, source: S) -> Result<ScheduleOutcome, AnalysisError> {
        if let Some(outcome) = self.try_load()? {
            return Ok(outcome);
        }

        let dispatcher = self.dispatcher();
        self.ss = Some(dispatcher.state_system());

        self.target.build(source, dispatcher, &self.ctx)
    }

    /// Loads the state system, or starts building it from `source` on a
    /// worker thread. The returned state system can be queried while it is
    /// built; `join` waits for the end of the build.
    pub fn spawn<S>(&mut self, source: S) -> Result<Arc<StateSystem>, AnalysisError>
    where
        S: EventSource + Send + 'static,
    {
        if self.try_load()?.is_none() {
            let dispatcher = self.dispatcher();
            let ss = dispatcher.state_system();
            let target = self.target.clone();
            let ctx = self.ctx.clone();

            self.ss = Some(ss);
            self.worker = Some(std::thread::spawn(move || {
                target.build(source, dispatcher, &ctx)
            }));
        }

        self.ss.clone().ok_or_else(|| AnalysisError::Build {
            analysis: self.target.key.analysis_id.clone(),
            reason: String::from("no state system"),
        })
    }

    /// Waits for a build started by `spawn`. Returns `None` if no build is
    /// running.
    pub fn join(&mut self) -> Option<Result<ScheduleOutcome, AnalysisError>> {
        let handle = self.worker.take()?;

        Some(handle.join().unwrap_or_else(|_| {
            Err(AnalysisError::Build {
                analysis: self.target.key.analysis_id.clone(),
                reason: String::from("build thread panicked"),
            })
        }))
    }

    /// Cancels any running build and releases the state system.
    pub fn dispose(&mut self) {
        if self.worker.is_some() {
            self.cancel.cancel();

            if let Some(Err(e)) = self.join() {
                debug!("Disposed build of '{}': {}", self.target.key.analysis_id, e);
            }
        }

        self.ss = None;
    }
}

impl Drop for AnalysisModule {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;

    use super::{AnalysisError, AnalysisModule, ScheduleOutcome};
    use crate::context::BuildContext;
    use crate::history::HistoryDirectory;
    use crate::provider::callstack::{CallStackConfig, CallStackDefinition};
    use crate::provider::dispatcher::BuildOutcome;
    use crate::provider::{ProviderDefinition, StateProvider, TraceInfo};
    use crate::state::{CustomValueRegistry, Phase, StateValue};
    use crate::trace::MemoryTrace;
    use crate::utils::CancelToken;
    use crate::{EventProcessor, EventSource};

    const TRACE: &str = r#"[
    {"ts":0,"event":"entry","pid":1,"tid":1,"name":"main"},
    {"ts":5,"event":"entry","pid":1,"tid":1,"name":"work"},
    {"ts":8,"event":"exit","pid":1,"tid":1,"name":"work"},
    {"ts":10,"event":"entry","pid":1,"tid":1,"name":"work"},
    {"ts":11,"event":"exit","pid":1,"tid":1,"name":"work"},
    {"ts":12,"event":"exit","pid":1,"tid":1,"name":"main"}
    ]"#;

    fn trace() -> MemoryTrace {
        MemoryTrace::from_json("app", TRACE).unwrap()
    }

    /// Counts the events of a trace, with a configurable version.
    struct Counter(u32);

    impl ProviderDefinition for Counter {
        fn id(&self) -> &str {
            "counter"
        }

        fn version(&self) -> u32 {
            self.0
        }

        fn build(&self) -> StateProvider {
            let mut count = 0;
            StateProvider::new("counter", self.0).on("entry", move |event, ctx| {
                count += 1;
                let q = ctx.ss.quark_absolute_and_add(&["entries"])?;
                ctx.ss.modify_attribute(event.ts, StateValue::Int(count), q)?;
                Ok(())
            })
        }
    }

    /// Cancels the build after a number of events.
    struct Interrupted {
        trace: MemoryTrace,
        cancel: CancelToken,
        after: usize,
    }

    impl EventSource for Interrupted {
        fn event_loop<P: EventProcessor>(&mut self, processor: &mut P, ctx: &BuildContext) -> Result<()> {
            for (i, event) in self.trace.events().iter().enumerate() {
                if i == self.after {
                    self.cancel.cancel();
                }

                if processor.consume_event(event.clone(), ctx)?.is_break() {
                    break;
                }
            }

            Ok(())
        }

        fn trace_info(&self) -> TraceInfo {
            self.trace.trace_info()
        }
    }

    #[test]
    fn test_build_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new(dir.path());
        let def: Arc<dyn ProviderDefinition> = Arc::new(CallStackDefinition::default());

        let mut module = AnalysisModule::new(def.clone(), &trace().trace_info(), &ctx)
            .unwrap()
            .with_registry(Arc::new(CustomValueRegistry::new()));
        assert_eq!(module.id(), "callstack");
        assert_eq!(module.trace_name(), "app");

        let outcome = module.schedule(trace()).unwrap();
        assert!(matches!(outcome, ScheduleOutcome::Built { saved: Some(_), .. }));

        let built = module.state_system().unwrap();
        let cs = built
            .opt_quark_absolute(&["Processes", "1", "1", "CallStack"])
            .unwrap();

        let mut module = AnalysisModule::new(def, &trace().trace_info(), &ctx).unwrap();
        let outcome = module.schedule(trace()).unwrap();
        assert!(matches!(outcome, ScheduleOutcome::Loaded(_)));

        let loaded = module.state_system().unwrap();
        assert_eq!(loaded.phase(), Phase::Closed);
        assert_eq!(
            loaded.query_range(cs, 0, 12).unwrap(),
            built.query_range(cs, 0, 12).unwrap()
        );

        module.dispose();
        assert!(module.state_system().is_none());
    }

    #[test]
    fn test_not_applicable() {
        let ctx = BuildContext::default();
        let info = TraceInfo::new("sched").with_event_types(["sched_switch"]);

        let res = AnalysisModule::new(Arc::new(CallStackDefinition::default()), &info, &ctx);
        assert!(matches!(res, Err(AnalysisError::NotApplicable { .. })));

        assert!(AnalysisModule::try_new(Arc::new(Counter(1)), &info, &ctx).is_some());
    }

    #[test]
    fn test_version_mismatch_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new(dir.path());
        let info = trace().trace_info();

        let mut module = AnalysisModule::new(Arc::new(Counter(1)), &info, &ctx).unwrap();
        module.schedule(trace()).unwrap();

        let mut module = AnalysisModule::new(Arc::new(Counter(2)), &info, &ctx).unwrap();
        let outcome = module.schedule(trace()).unwrap();
        assert!(matches!(outcome, ScheduleOutcome::Built { saved: Some(_), .. }));

        let header = HistoryDirectory::header(module.history_path().unwrap()).unwrap();
        assert_eq!(header.provider_version, 2);

        let ss = module.state_system().unwrap();
        let q = ss.opt_quark_absolute(&["entries"]).unwrap();
        assert_eq!(ss.query_single_state(11, q).unwrap().value, StateValue::Int(3));
    }

    #[test]
    fn test_config_change_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new(dir.path());
        let named = || {
            MemoryTrace::from_json(
                "app",
                r#"[
                {"ts":0,"event":"entry","pid":1,"tid":1,"comm":"worker","name":"main"},
                {"ts":12,"event":"exit","pid":1,"tid":1,"comm":"worker","name":"main"}
                ]"#,
            )
            .unwrap()
        };
        let info = named().trace_info();

        let mut module =
            AnalysisModule::new(Arc::new(CallStackDefinition::default()), &info, &ctx).unwrap();
        module.schedule(named()).unwrap();

        let def: Arc<dyn ProviderDefinition> = Arc::new(CallStackDefinition::new(CallStackConfig {
            thread_name_field: Some("comm".into()),
            ..Default::default()
        }));

        let mut module = AnalysisModule::new(def.clone(), &info, &ctx).unwrap();
        let outcome = module.schedule(named()).unwrap();
        assert!(matches!(outcome, ScheduleOutcome::Built { saved: Some(_), .. }));

        let ss = module.state_system().unwrap();
        assert!(ss
            .opt_quark_absolute(&["Processes", "1", "worker", "CallStack", "0"])
            .is_some());

        let header = HistoryDirectory::header(module.history_path().unwrap()).unwrap();
        assert_eq!(header.provider_config, def.fingerprint());

        let mut module = AnalysisModule::new(def, &info, &ctx).unwrap();
        let outcome = module.schedule(named()).unwrap();
        assert!(matches!(outcome, ScheduleOutcome::Loaded(_)));
    }

    #[test]
    fn test_unnamed_history_is_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new(dir.path());
        let info = TraceInfo::new("run@host");

        let mut module = AnalysisModule::new(Arc::new(Counter(1)), &info, &ctx).unwrap();
        assert!(module.history_path().is_none());

        let outcome = module.schedule(trace()).unwrap();
        assert!(matches!(
            outcome,
            ScheduleOutcome::Built {
                outcome: BuildOutcome::Completed(_),
                saved: None
            }
        ));
        assert!(HistoryDirectory::new(dir.path()).histories().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_history_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new(dir.path());
        let info = trace().trace_info();

        let mut module = AnalysisModule::new(Arc::new(Counter(1)), &info, &ctx).unwrap();
        std::fs::write(module.history_path().unwrap(), b"garbage").unwrap();

        let outcome = module.schedule(trace()).unwrap();
        assert!(matches!(outcome, ScheduleOutcome::Built { saved: Some(_), .. }));
        assert!(HistoryDirectory::header(module.history_path().unwrap()).is_ok());
    }

    #[test]
    fn test_cancelled_build_is_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new(dir.path());
        let mut module =
            AnalysisModule::new(Arc::new(Counter(1)), &trace().trace_info(), &ctx).unwrap();
        let source = Interrupted {
            trace: trace(),
            cancel: module.cancel_handle(),
            after: 3,
        };

        let outcome = module.schedule(source).unwrap();
        match outcome {
            ScheduleOutcome::Built {
                outcome: BuildOutcome::Cancelled(stats),
                saved: None,
            } => assert_eq!(stats.events, 3),
            o => panic!("unexpected outcome {:?}", o),
        }

        assert!(!module.history_path().unwrap().exists());

        let ss = module.state_system().unwrap();
        assert_eq!(ss.phase(), Phase::Closed);
        assert_eq!(ss.current_end_time(), 8);

        let q = ss.opt_quark_absolute(&["entries"]).unwrap();
        assert_eq!(ss.query_single_state(7, q).unwrap().value, StateValue::Int(2));
    }

    #[test]
    fn test_spawned_build() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new(dir.path());
        let info = trace().trace_info();

        let mut module =
            AnalysisModule::new(Arc::new(CallStackDefinition::default()), &info, &ctx).unwrap();
        let ss = module.spawn(trace()).unwrap();

        assert_eq!(ss.wait_until_built(), Phase::Closed);

        let frame = ss
            .opt_quark_absolute(&["Processes", "1", "1", "CallStack", "1"])
            .unwrap();
        let interval = ss.query_single_state_blocking(6, frame).unwrap();
        assert_eq!(interval.value, StateValue::from("work"));
        assert_eq!((interval.start, interval.end), (5, Some(8)));

        let outcome = module.join().unwrap().unwrap();
        assert!(matches!(outcome, ScheduleOutcome::Built { saved: Some(_), .. }));
        assert!(module.join().is_none());
    }

    #[test]
    fn test_unavailable_storage() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"").unwrap();

        let ctx = BuildContext::new(&file);
        let mut module =
            AnalysisModule::new(Arc::new(Counter(1)), &trace().trace_info(), &ctx).unwrap();

        let res = module.schedule(trace());
        assert!(matches!(res, Err(AnalysisError::Unavailable { .. })));
    }
}
