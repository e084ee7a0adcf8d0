//! Event sources.

use anyhow::Result;

use crate::{
    context::BuildContext, events::TraceEvent, provider::TraceInfo, EventProcessor, EventSource,
};

pub mod reader;

/// A trace held in memory.
pub struct MemoryTrace {
    info: TraceInfo,
    events: Vec<TraceEvent>,
}

impl MemoryTrace {
    pub fn new(name: &str, events: Vec<TraceEvent>) -> Self {
        let info = TraceInfo::new(name).with_event_types(events.iter().map(|e| e.name.clone()));

        Self { info, events }
    }

    /// Parses a JSON array of events.
    pub fn from_json(name: &str, json: &str) -> Result<Self> {
        let events: Vec<TraceEvent> = serde_json::from_str(json)?;

        Ok(Self::new(name, events))
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }
}

impl EventSource for MemoryTrace {
    fn event_loop<P: EventProcessor>(&mut self, processor: &mut P, ctx: &BuildContext) -> Result<()> {
        for event in self.events.iter() {
            if processor.consume_event(event.clone(), ctx)?.is_break() {
                break;
            }
        }

        Ok(())
    }

    fn trace_info(&self) -> TraceInfo {
        self.info.clone()
    }
}
