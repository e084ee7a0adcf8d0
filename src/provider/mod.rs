//! State providers.
//!
//! A state provider turns trace events into state changes. It is a fixed set
//! of handlers, one per event type, registered once when the provider is
//! built. Unknown event types are ignored.
//!
//! ```
//! use statehist::events::TraceEvent;
//! use statehist::provider::{HandlerContext, StateProvider};
//!
//! let provider = StateProvider::new("cpu-usage", 1).on(
//!     "sched_switch",
//!     |event: &TraceEvent, ctx: &mut HandlerContext| {
//!         let cpu = event.field_u64("cpu")?;
//!         let q = ctx.ss.quark_absolute_and_add(&["CPUs", cpu.to_string().as_str()])?;
//!
//!         ctx.ss.modify_attribute(event.ts, event.field("next_tid")?.into(), q)?;
//!
//!         Ok(())
//!     },
//! );
//!
//! assert!(provider.handles("sched_switch"));
//! assert!(!provider.handles("sched_wakeup"));
//! ```

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::events::TraceEvent;
use crate::state::{Quark, StateSystemBuilder, StateSystemError};

pub mod callstack;
pub mod dispatcher;
pub mod future;

use future::{FutureEventKind, FutureEventQueue};

/// Error raised by an event handler.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HandlerError {
    #[error("missing field '{0}'")]
    MissingField(String),
    #[error("field '{field}' is a {found}, expected a {expected}")]
    FieldType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("cannot schedule a state change at {time}, before the current event at {now}")]
    PastFutureEvent { time: u64, now: u64 },
    #[error(transparent)]
    StateSystem(#[from] StateSystemError),
}

impl HandlerError {
    /// Returns true if the build cannot go on after this error. Other errors
    /// only invalidate the event being handled.
    pub fn is_fatal(&self) -> bool {
        match self {
            HandlerError::StateSystem(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// What a handler gets to work with besides the event.
pub struct HandlerContext<'a> {
    pub ss: &'a mut StateSystemBuilder,
    futures: &'a mut FutureEventQueue,
    now: u64,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        ss: &'a mut StateSystemBuilder,
        futures: &'a mut FutureEventQueue,
        now: u64,
    ) -> Self {
        Self { ss, futures, now }
    }

    /// Timestamp of the event being handled.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Schedules a state change on `quark` at `time`. It fires before the
    /// first event after `time`, or at the end of the trace.
    pub fn add_future_event(
        &mut self,
        time: u64,
        quark: Quark,
        kind: FutureEventKind,
    ) -> Result<(), HandlerError> {
        if time < self.now {
            return Err(HandlerError::PastFutureEvent {
                time,
                now: self.now,
            });
        }

        self.futures.add(time, self.now, quark, kind);

        Ok(())
    }
}

pub type Handler =
    Box<dyn FnMut(&TraceEvent, &mut HandlerContext) -> Result<(), HandlerError> + Send>;

/// Identification of a trace, used by providers to decide whether they can
/// analyse it.
#[derive(Debug, Clone, Default)]
pub struct TraceInfo {
    pub name: String,
    /// Event types found in the trace, if known.
    pub event_types: Option<BTreeSet<String>>,
}

impl TraceInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            event_types: None,
        }
    }

    pub fn with_event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Returns true if the trace may contain `event_type`. Traces with an
    /// unknown set of event types may contain anything.
    pub fn may_contain(&self, event_type: &str) -> bool {
        self.event_types
            .as_ref()
            .map_or(true, |types| types.contains(event_type))
    }
}

/// A set of event handlers building one kind of state system.
pub struct StateProvider {
    id: String,
    version: u32,
    handlers: HashMap<String, Handler>,
}

impl StateProvider {
    pub fn new(id: &str, version: u32) -> Self {
        Self {
            id: id.to_string(),
            version,
            handlers: HashMap::new(),
        }
    }

    /// Registers the handler of `event_type`, replacing any previous one.
    pub fn on<F>(mut self, event_type: &str, handler: F) -> Self
    where
        F: FnMut(&TraceEvent, &mut HandlerContext) -> Result<(), HandlerError> + Send + 'static,
    {
        self.handlers
            .insert(event_type.to_string(), Box::new(handler));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Version of the state system layout produced by the provider.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn handler_mut(&mut self, event_type: &str) -> Option<&mut Handler> {
        self.handlers.get_mut(event_type)
    }
}

/// Describes an analysis: which traces it applies to and how to build its
/// state provider.
pub trait ProviderDefinition: Send + Sync {
    fn id(&self) -> &str;

    fn version(&self) -> u32;

    /// Describes the configuration of the provider. Histories saved under a
    /// different configuration are rebuilt.
    fn fingerprint(&self) -> String {
        String::new()
    }

    /// Checked before an analysis is created for a trace.
    fn can_handle(&self, _trace: &TraceInfo) -> bool {
        true
    }

    fn build(&self) -> StateProvider;
}

#[cfg(test)]
mod tests {
    use super::future::FutureEventQueue;
    use super::{HandlerContext, HandlerError, TraceInfo};
    use crate::state::{StateSystemBuilder, StateSystemError};

    #[test]
    fn test_fatal_errors() {
        assert!(!HandlerError::MissingField("tid".into()).is_fatal());
        assert!(!HandlerError::from(StateSystemError::NotAStack(
            crate::state::Quark::new(0)
        ))
        .is_fatal());
        assert!(HandlerError::from(StateSystemError::Closed).is_fatal());
    }

    #[test]
    fn test_past_future_event() {
        let mut ss = StateSystemBuilder::default();
        let mut futures = FutureEventQueue::new();
        let q = ss.quark_absolute_and_add(&["a"]).unwrap();

        let mut ctx = HandlerContext::new(&mut ss, &mut futures, 10);

        assert!(ctx
            .add_future_event(10, q, super::future::FutureEventKind::Pop)
            .is_ok());
        assert_eq!(
            ctx.add_future_event(9, q, super::future::FutureEventKind::Pop),
            Err(HandlerError::PastFutureEvent { time: 9, now: 10 })
        );
        assert_eq!(futures.len(), 1);
    }

    #[test]
    fn test_trace_info() {
        let any = TraceInfo::new("t");
        let known = TraceInfo::new("t").with_event_types(["entry", "exit"]);

        assert!(any.may_contain("entry"));
        assert!(known.may_contain("exit"));
        assert!(!known.may_contain("sched_switch"));
    }
}
