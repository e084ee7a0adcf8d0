//! An incremental state-history builder.
//!
//! statehist consumes a time-ordered stream of trace events and builds a
//! state system: a temporal key-value store recording, for every attribute
//! of a hierarchical attribute tree, the value it had over time ("thread 42
//! was RUNNING from t0 to t1"). State systems can be queried while they are
//! built, and are saved to history files so that later runs skip the build.
//!
//! Like the rest of the pipeline, the builder is organized around __event
//! sources__ and __event processors__:
//! - An event source produces a stream of events. It implements the `EventSource` trait.
//!   Currently, event sources are JSON trace files and in-memory traces.
//! - An event processor consumes a stream of events. It implements the `EventProcessor`
//!   trait. The main processor is the `EventDispatcher`, which feeds events
//!   to the handlers of a state provider.

pub mod cli;
pub mod utils;

pub mod events;
pub mod trace;

pub mod interval;
pub mod state;

pub mod provider;

pub mod context;

pub mod analysis;
pub mod history;

use std::ops::ControlFlow;

use anyhow::Result;

use crate::{context::BuildContext, events::TraceEvent, provider::TraceInfo};

/// Feeds an `EventProcessor` with a stream of events.
pub trait EventSource: Sized {
    /// Consume and feed all events to the supplied processor, until the
    /// stream ends or the processor asks to stop.
    fn event_loop<P: EventProcessor>(&mut self, processor: &mut P, ctx: &BuildContext)
        -> Result<()>;

    /// Process the events with the supplied `EventProcessor`.
    fn process_events<P: EventProcessor>(
        &mut self,
        mut processor: P,
        ctx: &BuildContext,
    ) -> Result<P::Output> {
        processor.post_load_init(ctx)?;

        self.event_loop(&mut processor, ctx)?;

        processor.finalize(self, ctx)
    }

    fn trace_info(&self) -> TraceInfo;
}

/// Consumes a stream of events.
pub trait EventProcessor {
    type Output;

    /// Initialize the processor before supplying it to an event source.
    fn pre_load_init(&mut self, ctx: &BuildContext) -> Result<()>;

    /// Initialize the processor after it has been supplied to an event source.
    fn post_load_init(&mut self, ctx: &BuildContext) -> Result<()>;

    /// Process an event. Returning `ControlFlow::Break` stops the stream.
    fn consume_event(&mut self, event: TraceEvent, ctx: &BuildContext)
        -> Result<ControlFlow<()>>;

    /// Destructor function
    fn finalize<S: EventSource>(&mut self, src: &S, ctx: &BuildContext) -> Result<Self::Output>;
}
