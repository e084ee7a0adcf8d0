//! Event dispatcher.
//!
//! Drives a state system build: checks the ordering of incoming events,
//! fires the future events they make due, and hands each event to the
//! handler registered for its type.

use std::ops::ControlFlow;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use log::{debug, info, warn};
use serde::Serialize;

use crate::context::BuildContext;
use crate::events::TraceEvent;
use crate::state::{Phase, StateSystem, StateSystemBuilder, StateSystemError};
use crate::utils::{CancelToken, UpperBoundTracker};
use crate::{EventProcessor, EventSource};

use super::future::{FutureEvent, FutureEventKind, FutureEventQueue, FutureFlushPolicy};
use super::{HandlerContext, StateProvider};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildStats {
    /// Events received.
    pub events: u64,
    /// Events handled without error.
    pub handled: u64,
    /// Events with no handler.
    pub skipped: u64,
    /// Events whose handler failed.
    pub handler_errors: u64,
    pub futures_fired: u64,
    pub futures_dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Completed(BuildStats),
    /// The build was interrupted. The state system holds the states up to
    /// the last processed event.
    Cancelled(BuildStats),
}

impl BuildOutcome {
    pub fn stats(&self) -> &BuildStats {
        match self {
            BuildOutcome::Completed(s) | BuildOutcome::Cancelled(s) => s,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, BuildOutcome::Completed(_))
    }
}

pub struct EventDispatcher {
    provider: StateProvider,
    builder: StateSystemBuilder,
    futures: FutureEventQueue,
    flush_policy: FutureFlushPolicy,
    cancel: CancelToken,
    last_ts: UpperBoundTracker<u64>,
    last_fired: UpperBoundTracker<u64>,
    stats: BuildStats,
    cancelled: bool,
}

impl EventDispatcher {
    pub fn new(
        provider: StateProvider,
        builder: StateSystemBuilder,
        flush_policy: FutureFlushPolicy,
        cancel: CancelToken,
    ) -> Self {
        Self {
            provider,
            builder,
            futures: FutureEventQueue::new(),
            flush_policy,
            cancel,
            last_ts: UpperBoundTracker::default(),
            last_fired: UpperBoundTracker::default(),
            stats: BuildStats::default(),
            cancelled: false,
        }
    }

    /// A dispatcher building a fresh state system with the default settings.
    pub fn with_defaults(provider: StateProvider) -> Self {
        Self::new(
            provider,
            StateSystemBuilder::default(),
            FutureFlushPolicy::default(),
            CancelToken::new(),
        )
    }

    pub fn state_system(&self) -> Arc<StateSystem> {
        self.builder.state_system()
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    /// Number of future events waiting to be fired.
    pub fn pending_futures(&self) -> usize {
        self.futures.len()
    }

    fn abort(&mut self, error: anyhow::Error) -> anyhow::Error {
        self.builder.fail(&error.to_string());
        self.futures.clear();
        error
    }

    fn fire(&mut self, event: FutureEvent) -> Result<()> {
        let res = match event.kind {
            FutureEventKind::Pop => self
                .builder
                .pop_attribute(event.time, event.quark)
                .map(|_| ()),
            FutureEventKind::Modify(value) => {
                self.builder.modify_attribute(event.time, value, event.quark)
            }
        };

        match res {
            Ok(()) => {
                self.stats.futures_fired += 1;
                self.last_fired.update(event.time);
            }
            Err(e) if e.is_fatal() => {
                let err = anyhow!(e).context(format!(
                    "Future event scheduled at {} by the event at {}",
                    event.time, event.source_ts
                ));
                return Err(self.abort(err));
            }
            Err(e) => warn!(
                "Future event scheduled at {} by the event at {} failed: {}",
                event.time, event.source_ts, e
            ),
        }

        Ok(())
    }

    fn fire_before(&mut self, time: u64) -> Result<()> {
        let due = self.futures.pop_before(time).collect::<Vec<FutureEvent>>();

        for event in due {
            self.fire(event)?;
        }

        Ok(())
    }

    /// Feeds one event to the state system.
    pub fn dispatch(&mut self, event: TraceEvent) -> Result<ControlFlow<()>> {
        if self.cancel.is_cancelled() {
            self.cancelled = true;
            return Ok(ControlFlow::Break(()));
        }

        if self.builder.phase() == Phase::Idle {
            self.builder.start(event.ts)?;
        }

        if let Some(last) = self.last_ts.get() {
            if event.ts < last {
                let err = anyhow!(
                    "Event '{}' at {} comes after an event at {}, the trace is not sorted",
                    event.name,
                    event.ts,
                    last
                );
                return Err(self.abort(err));
            }
        }

        self.last_ts.update(event.ts);
        self.stats.events += 1;

        self.fire_before(event.ts)?;
        self.builder.advance(event.ts);

        let handler = match self.provider.handler_mut(&event.name) {
            Some(h) => h,
            None => {
                self.stats.skipped += 1;
                return Ok(ControlFlow::Continue(()));
            }
        };

        let mut ctx = HandlerContext::new(&mut self.builder, &mut self.futures, event.ts);

        match handler(&event, &mut ctx) {
            Ok(()) => self.stats.handled += 1,
            Err(e) if e.is_fatal() => {
                let err = anyhow!(e).context(format!(
                    "Handling event '{}' at {}",
                    event.name, event.ts
                ));
                return Err(self.abort(err));
            }
            Err(e) => {
                warn!("Skipping event '{}' at {}: {}", event.name, event.ts, e);
                self.stats.handler_errors += 1;
            }
        }

        Ok(ControlFlow::Continue(()))
    }

    /// Ends the build: flushes the pending future events and closes the
    /// state system. A cancelled build discards them and closes at the last
    /// processed event.
    pub fn done(&mut self) -> Result<BuildOutcome> {
        if self.builder.phase() == Phase::Idle {
            self.builder.start(0)?;
        }

        let last_ts = self.last_ts.get().unwrap_or_else(|| self.builder.current_end_time());

        if self.cancelled {
            self.stats.futures_dropped += self.futures.len() as u64;
            debug!("Discarding {} pending future events", self.futures.len());
            self.futures.clear();

            self.close(last_ts)?;

            info!(
                "Build of '{}' cancelled after {} events",
                self.provider.id(),
                self.stats.events
            );

            return Ok(BuildOutcome::Cancelled(self.stats));
        }

        let pending = self.futures.drain().collect::<Vec<FutureEvent>>();

        for event in pending {
            if self.flush_policy.should_fire(&event, last_ts) {
                self.fire(event)?;
            } else {
                warn!(
                    "Dropping {} scheduled at {} past the end of the trace at {}",
                    event.kind.name(),
                    event.time,
                    last_ts
                );
                self.stats.futures_dropped += 1;
            }
        }

        let end = self.last_fired.get().map_or(last_ts, |t| t.max(last_ts));
        self.close(end)?;

        debug!("Build of '{}' done: {:?}", self.provider.id(), self.stats);

        Ok(BuildOutcome::Completed(self.stats))
    }

    fn close(&mut self, end: u64) -> Result<()> {
        match self.builder.close_at_time(end) {
            Ok(()) => Ok(()),
            Err(StateSystemError::Closed) => bail!("State system already closed"),
            Err(e) => Err(self.abort(e.into())),
        }
    }
}

impl EventProcessor for EventDispatcher {
    type Output = BuildOutcome;

    fn pre_load_init(&mut self, _ctx: &BuildContext) -> Result<()> {
        if self.provider.is_empty() {
            bail!("State provider '{}' handles no events", self.provider.id());
        }

        if self.builder.phase() != Phase::Idle {
            bail!("State system of '{}' already started", self.provider.id());
        }

        Ok(())
    }

    fn post_load_init(&mut self, _ctx: &BuildContext) -> Result<()> {
        debug!(
            "Building state system '{}' (version {})",
            self.provider.id(),
            self.provider.version()
        );

        Ok(())
    }

    fn consume_event(&mut self, event: TraceEvent, _ctx: &BuildContext) -> Result<ControlFlow<()>> {
        self.dispatch(event)
    }

    fn finalize<S: EventSource>(&mut self, _src: &S, _ctx: &BuildContext) -> Result<BuildOutcome> {
        self.done()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{BuildOutcome, EventDispatcher};
    use crate::events::TraceEvent;
    use crate::provider::future::{FutureEventKind, FutureFlushPolicy};
    use crate::provider::{HandlerContext, HandlerError, StateProvider};
    use crate::state::{Phase, StateSystem, StateSystemBuilder, StateValue};
    use crate::utils::CancelToken;
    use crate::EventProcessor;

    /// "begin" pushes `label` on `stack` and schedules a pop after `dur`;
    /// "set" writes `value` to `attr`, optionally again after `delay`.
    fn test_provider() -> StateProvider {
        StateProvider::new("test", 1)
            .on("begin", |e: &TraceEvent, ctx: &mut HandlerContext| {
                let q = ctx.ss.quark_absolute_and_add(&[e.field_str("stack")?])?;
                ctx.ss.push_attribute(e.ts, e.field("label")?.into(), q)?;

                if let Some(dur) = e.opt_field_u64("dur")? {
                    ctx.add_future_event(e.ts + dur, q, FutureEventKind::Pop)?;
                }

                Ok(())
            })
            .on("set", |e: &TraceEvent, ctx: &mut HandlerContext| {
                let q = ctx.ss.quark_absolute_and_add(&[e.field_str("attr")?])?;
                let value = StateValue::from(e.field("value")?);

                match e.opt_field_u64("delay")? {
                    Some(d) => ctx.add_future_event(e.ts + d, q, FutureEventKind::Modify(value)),
                    None => ctx
                        .ss
                        .modify_attribute(e.ts, value, q)
                        .map_err(HandlerError::from),
                }
            })
    }

    fn run(trace: &str, dispatcher: &mut EventDispatcher) -> anyhow::Result<BuildOutcome> {
        let events: Vec<TraceEvent> = serde_json::from_str(trace).unwrap();

        for e in events {
            if dispatcher.dispatch(e)?.is_break() {
                break;
            }
        }

        dispatcher.done()
    }

    fn build(trace: &str) -> (Arc<StateSystem>, BuildOutcome) {
        let mut dispatcher = EventDispatcher::with_defaults(test_provider());
        let ss = dispatcher.state_system();
        let outcome = run(trace, &mut dispatcher).unwrap();

        (ss, outcome)
    }

    const FUTURE_POP: &str = r#"[
    {"ts":0,"event":"begin","stack":"cs","label":"f","dur":10},
    {"ts":5,"event":"set","attr":"other","value":1}
    ]
    "#;

    #[test]
    fn test_pre_load_checks() {
        let ctx = crate::context::BuildContext::default();

        let mut dispatcher = EventDispatcher::with_defaults(StateProvider::new("empty", 1));
        assert!(dispatcher.pre_load_init(&ctx).is_err());

        let mut dispatcher = EventDispatcher::with_defaults(test_provider());
        assert!(dispatcher.pre_load_init(&ctx).is_ok());

        run(FUTURE_POP, &mut dispatcher).unwrap();
        assert!(dispatcher.pre_load_init(&ctx).is_err());
    }

    #[test]
    fn test_future_pop_is_ordered() {
        let (ss, outcome) = build(FUTURE_POP);
        let frame = ss.opt_quark_absolute(&["cs", "0"]).unwrap();

        let at_5 = ss.query_single_state(5, frame).unwrap();
        assert_eq!(at_5.value, StateValue::from("f"));
        assert_eq!(at_5.start, 0);

        let at_10 = ss.query_single_state(10, frame).unwrap();
        assert!(at_10.value.is_null());

        let closed = ss.query_single_state(9, frame).unwrap();
        assert_eq!(closed.end, Some(10));

        assert_eq!(outcome.stats().futures_fired, 1);
        assert_eq!(ss.current_end_time(), 10);
    }

    const SAME_TICK: &str = r#"[
    {"ts":0,"event":"set","attr":"a","value":1,"delay":4},
    {"ts":4,"event":"set","attr":"a","value":2},
    {"ts":6,"event":"set","attr":"b","value":0}
    ]
    "#;

    #[test]
    fn test_future_fires_after_same_tick_events() {
        let (ss, _) = build(SAME_TICK);
        let a = ss.opt_quark_absolute(&["a"]).unwrap();

        let r = ss.query_range(a, 0, 6).unwrap();
        let values = r.iter().map(|i| i.value.clone()).collect::<Vec<_>>();

        assert_eq!(
            values,
            vec![StateValue::Null, StateValue::Int(2), StateValue::Int(1)]
        );
        assert_eq!(ss.query_single_state(5, a).unwrap().value, StateValue::Int(1));
    }

    const PENDING_AT_END: &str = r#"[
    {"ts":0,"event":"begin","stack":"cs","label":"f","dur":100},
    {"ts":1,"event":"set","attr":"a","value":1,"delay":50},
    {"ts":2,"event":"set","attr":"b","value":1,"delay":1},
    {"ts":20,"event":"set","attr":"c","value":1}
    ]
    "#;

    #[test]
    fn test_flush_policy() {
        let (ss, outcome) = build(PENDING_AT_END);

        assert_eq!(outcome.stats().futures_fired, 2);
        assert_eq!(outcome.stats().futures_dropped, 1);
        assert_eq!(ss.current_end_time(), 100);

        let a = ss.opt_quark_absolute(&["a"]).unwrap();
        assert!(ss.query_single_state(60, a).unwrap().value.is_null());

        let frame = ss.opt_quark_absolute(&["cs", "0"]).unwrap();
        let f = ss.query_single_state(99, frame).unwrap();
        assert_eq!((f.start, f.end), (0, Some(100)));
    }

    const MALFORMED: &str = r#"[
    {"ts":0,"event":"set","attr":"a","value":1},
    {"ts":1,"event":"set","attr":"a"},
    {"ts":2,"event":"unknown","attr":"a","value":3},
    {"ts":3,"event":"set","attr":"a","value":4}
    ]
    "#;

    #[test]
    fn test_malformed_and_unknown_events() {
        let (ss, outcome) = build(MALFORMED);
        let stats = outcome.stats();

        assert!(outcome.is_completed());
        assert_eq!(stats.events, 4);
        assert_eq!(stats.handled, 2);
        assert_eq!(stats.handler_errors, 1);
        assert_eq!(stats.skipped, 1);

        let a = ss.opt_quark_absolute(&["a"]).unwrap();
        assert_eq!(ss.query_single_state(2, a).unwrap().value, StateValue::Int(1));
        assert_eq!(ss.phase(), Phase::Closed);
    }

    const UNSORTED: &str = r#"[
    {"ts":5,"event":"set","attr":"a","value":1},
    {"ts":3,"event":"set","attr":"a","value":2}
    ]
    "#;

    #[test]
    fn test_unsorted_trace_fails() {
        let mut dispatcher = EventDispatcher::with_defaults(test_provider());
        let ss = dispatcher.state_system();

        assert!(run(UNSORTED, &mut dispatcher).is_err());
        assert_eq!(ss.phase(), Phase::Failed);
    }

    const LONG: &str = r#"[
    {"ts":0,"event":"begin","stack":"cs","label":"f","dur":100},
    {"ts":1,"event":"begin","stack":"cs","label":"g","dur":2},
    {"ts":4,"event":"set","attr":"a","value":1},
    {"ts":6,"event":"set","attr":"a","value":2},
    {"ts":8,"event":"set","attr":"a","value":3}
    ]
    "#;

    #[test]
    fn test_cancellation() {
        let events: Vec<TraceEvent> = serde_json::from_str(LONG).unwrap();
        let cancel = CancelToken::new();

        let mut dispatcher = EventDispatcher::new(
            test_provider(),
            StateSystemBuilder::default(),
            FutureFlushPolicy::default(),
            cancel.clone(),
        );
        let ss = dispatcher.state_system();

        for (i, e) in events.into_iter().enumerate() {
            if i == 3 {
                cancel.cancel();
            }

            if dispatcher.dispatch(e).unwrap().is_break() {
                break;
            }
        }

        let outcome = dispatcher.done().unwrap();

        assert!(matches!(outcome, BuildOutcome::Cancelled(_)));
        assert_eq!(outcome.stats().events, 3);
        assert_eq!(outcome.stats().futures_dropped, 1);
        assert_eq!(ss.phase(), Phase::Closed);
        assert_eq!(ss.current_end_time(), 4);

        for q in ss.sub_attributes(None, true) {
            let intervals = ss.query_range(q, 0, 4).unwrap();

            for pair in intervals.windows(2) {
                assert!(pair[0].end.unwrap() <= pair[1].start);
            }
        }

        let a = ss.opt_quark_absolute(&["a"]).unwrap();
        assert_eq!(ss.query_single_state(3, a).unwrap().value, StateValue::Null);
    }
}
