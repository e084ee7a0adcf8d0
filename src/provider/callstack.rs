//! Call-stack state provider.
//!
//! Builds one call stack per thread from function entry and exit events:
//!
//! ```text
//! Processes/<pid>/<tid>/CallStack      stack depth
//! Processes/<pid>/<tid>/CallStack/0    outermost function
//! Processes/<pid>/<tid>/CallStack/1    ...
//! ```
//!
//! The process attribute holds the pid and the thread attribute the tid.
//! When process or thread name fields are configured and present in an
//! event, the names are used as attribute names instead of the ids.
//!
//! Entry events carrying a duration field describe a complete call: the
//! matching pop is scheduled as a future event at `ts + duration`.

use std::sync::Arc;

use log::warn;
use serde::Serialize;

use crate::events::TraceEvent;
use crate::state::{Quark, StateValue};

use super::future::FutureEventKind;
use super::{HandlerContext, HandlerError, ProviderDefinition, StateProvider, TraceInfo};

pub const CALLSTACK_ID: &str = "callstack";
/// Bumped whenever the attribute layout changes.
pub const CALLSTACK_VERSION: u32 = 1;

pub const PROCESSES: &str = "Processes";
pub const CALL_STACK: &str = "CallStack";

/// Event and field names used by the call-stack provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallStackConfig {
    pub entry_event: String,
    pub exit_event: String,
    pub pid_field: String,
    pub tid_field: String,
    pub name_field: String,
    pub duration_field: String,
    pub process_name_field: Option<String>,
    pub thread_name_field: Option<String>,
}

impl Default for CallStackConfig {
    fn default() -> Self {
        Self {
            entry_event: String::from("entry"),
            exit_event: String::from("exit"),
            pid_field: String::from("pid"),
            tid_field: String::from("tid"),
            name_field: String::from("name"),
            duration_field: String::from("duration"),
            process_name_field: None,
            thread_name_field: None,
        }
    }
}

fn id_value(id: i64) -> StateValue {
    i32::try_from(id).map_or(StateValue::Long(id), StateValue::Int)
}

fn attribute_name(event: &TraceEvent, name_field: Option<&String>, id: i64) -> String {
    name_field
        .and_then(|f| event.opt_field(f))
        .and_then(|v| v.as_str())
        .map_or_else(|| id.to_string(), str::to_string)
}

/// Returns the call-stack attribute of the thread of `event`.
fn thread_stack(
    cfg: &CallStackConfig,
    event: &TraceEvent,
    ctx: &mut HandlerContext,
) -> Result<Quark, HandlerError> {
    let pid = event.field_i64(&cfg.pid_field)?;
    let tid = event.field_i64(&cfg.tid_field)?;

    let process_name = attribute_name(event, cfg.process_name_field.as_ref(), pid);
    let thread_name = attribute_name(event, cfg.thread_name_field.as_ref(), tid);

    let process = ctx.ss.quark_absolute_and_add(&[PROCESSES, process_name.as_str()])?;
    let thread = ctx.ss.quark_relative_and_add(process, &[thread_name.as_str()])?;
    let stack = ctx.ss.quark_relative_and_add(thread, &[CALL_STACK])?;

    ctx.ss.update_ongoing_state(id_value(pid), process)?;
    ctx.ss.update_ongoing_state(StateValue::Long(tid), thread)?;

    Ok(stack)
}

fn handle_entry(
    cfg: &CallStackConfig,
    event: &TraceEvent,
    ctx: &mut HandlerContext,
) -> Result<(), HandlerError> {
    let function = StateValue::from(event.field(&cfg.name_field)?);
    let duration = event.opt_field_u64(&cfg.duration_field)?;

    let stack = thread_stack(cfg, event, ctx)?;

    ctx.ss.push_attribute(event.ts, function, stack)?;

    if let Some(d) = duration {
        ctx.add_future_event(event.ts.saturating_add(d), stack, FutureEventKind::Pop)?;
    }

    Ok(())
}

fn handle_exit(
    cfg: &CallStackConfig,
    mismatch_reported: &mut bool,
    event: &TraceEvent,
    ctx: &mut HandlerContext,
) -> Result<(), HandlerError> {
    let stack = thread_stack(cfg, event, ctx)?;

    let popped = ctx.ss.pop_attribute(event.ts, stack)?;

    if let (Some(popped), Some(name)) = (popped, event.opt_field(&cfg.name_field)) {
        let expected = StateValue::from(name);

        if popped != expected && !*mismatch_reported {
            warn!(
                "Exit from '{}' at {} does not match the entry of '{}', call stacks may be wrong",
                expected, event.ts, popped
            );
            *mismatch_reported = true;
        }
    }

    Ok(())
}

/// The call-stack analysis.
#[derive(Debug, Clone, Default)]
pub struct CallStackDefinition {
    config: Arc<CallStackConfig>,
}

impl CallStackDefinition {
    pub fn new(config: CallStackConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &CallStackConfig {
        &self.config
    }
}

impl ProviderDefinition for CallStackDefinition {
    fn id(&self) -> &str {
        CALLSTACK_ID
    }

    fn version(&self) -> u32 {
        CALLSTACK_VERSION
    }

    fn fingerprint(&self) -> String {
        serde_json::to_string(&*self.config).unwrap_or_default()
    }

    fn can_handle(&self, trace: &TraceInfo) -> bool {
        trace.may_contain(&self.config.entry_event)
    }

    fn build(&self) -> StateProvider {
        let entry_cfg = self.config.clone();
        let exit_cfg = self.config.clone();
        let mut mismatch_reported = false;

        StateProvider::new(CALLSTACK_ID, CALLSTACK_VERSION)
            .on(&self.config.entry_event, move |event, ctx| {
                handle_entry(&entry_cfg, event, ctx)
            })
            .on(&self.config.exit_event, move |event, ctx| {
                handle_exit(&exit_cfg, &mut mismatch_reported, event, ctx)
            })
    }
}
