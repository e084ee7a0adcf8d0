//! JSON trace file reader.
//!
//! Trace files are JSON arrays with one event per line:
//!
//! ```text
//! [
//! {"ts":0,"event":"entry","pid":1,"tid":1,"name":"main"},
//! {"ts":12,"event":"exit","pid":1,"tid":1,"name":"main"}
//! ]
//! ```
//!
//! Events are parsed on a dedicated thread and sent to the processor through
//! a bounded channel. Lines that are not valid events are logged and skipped;
//! only I/O errors stop the reader.

use std::{
    fs::File,
    io::{BufRead, BufReader, Lines},
    path::{Path, PathBuf},
    sync::mpsc::Receiver,
};

use anyhow::{anyhow, Context, Result};
use log::warn;

use crate::{
    context::{BuildContext, DEFAULT_CHANNEL_CAPACITY},
    events::TraceEvent, provider::TraceInfo, EventProcessor, EventSource,
};

struct TraceEvents<R> {
    lines: Lines<R>,
    line_no: usize,
    skipped: usize,
}

impl<R: BufRead> TraceEvents<R> {
    fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            skipped: 0,
        }
    }

    #[inline]
    fn is_start_line(line: &str) -> bool {
        line.trim() == "["
    }

    #[inline]
    fn is_end_line(line: &str) -> bool {
        line.trim() == "]"
    }

    fn parse_line(line: &str) -> Result<TraceEvent> {
        let start = line
            .find('{')
            .ok_or_else(|| anyhow!("Record start ('{{') not found in line: {}", line))?;
        let end = line
            .rfind('}')
            .ok_or_else(|| anyhow!("Record end ('}}') not found in line: {}", line))?
            + 1;
        let event: TraceEvent = serde_json::from_str(&line[start..end])?;
        Ok(event)
    }

    fn next_line(&mut self) -> Option<Result<String>> {
        loop {
            let res_line = self.lines.next()?;
            self.line_no += 1;

            match res_line {
                Ok(ref line) if Self::is_start_line(line) || line.trim().is_empty() => continue,
                Ok(ref line) if Self::is_end_line(line) => return None,
                _ => return Some(res_line.map_err(anyhow::Error::from)),
            }
        }
    }
}

impl<R: BufRead> Iterator for TraceEvents<R> {
    type Item = Result<TraceEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.next_line()? {
                Ok(line) => line,
                Err(e) => {
                    return Some(Err(e.context(format!("Failed to read line {}", self.line_no))))
                }
            };

            match Self::parse_line(&line) {
                Ok(event) => return Some(Ok(event)),
                Err(e) => {
                    self.skipped += 1;
                    warn!("Skipping invalid event at line {}: {:#}", self.line_no, e);
                }
            }
        }
    }
}

pub struct TraceReader {
    path: PathBuf,
    capacity: usize,
    rx: Option<Receiver<TraceEvent>>,
    event_reader: Option<std::thread::JoinHandle<Result<()>>>,
}

impl TraceReader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
            rx: None,
            event_reader: None,
        }
    }

    /// At most `capacity` parsed events are buffered.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Name of the trace: the file name without its extension.
    pub fn trace_name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| String::from("trace"))
    }

    /// Starts reading the trace on a separate thread. `event_loop` starts
    /// the reader thread itself if needed.
    pub fn start(mut self) -> Self {
        self.spawn_reader();
        self
    }

    fn spawn_reader(&mut self) {
        let (tx, rx) = std::sync::mpsc::sync_channel::<TraceEvent>(self.capacity);

        let path = self.path.clone();

        self.rx = Some(rx);

        self.event_reader = Some(std::thread::spawn(move || -> Result<()> {
            let file = File::open(&path)
                .with_context(|| format!("Failed to open trace {}", path.display()))?;

            let mut events = TraceEvents::new(BufReader::new(file));

            for event in events.by_ref() {
                if tx.send(event?).is_err() {
                    // The processor stopped early.
                    return Ok(());
                }
            }

            if events.skipped > 0 {
                warn!(
                    "Skipped {} invalid events in {}",
                    events.skipped,
                    path.display()
                );
            }

            Ok(())
        }));
    }
}

impl EventSource for TraceReader {
    fn event_loop<E: EventProcessor>(
        &mut self,
        processor: &mut E,
        ctx: &BuildContext,
    ) -> Result<()> {
        if self.rx.is_none() && self.event_reader.is_none() {
            self.spawn_reader();
        }

        let rx = self
            .rx
            .take()
            .ok_or_else(|| anyhow!("Trace reader already consumed"))?;

        let mut interrupted = false;

        for event in rx.iter() {
            if processor.consume_event(event, ctx)?.is_break() {
                interrupted = true;
                break;
            }
        }

        // Unblocks the reader thread if the processor stopped early.
        drop(rx);

        let handle = self
            .event_reader
            .take()
            .ok_or_else(|| anyhow!("Trace reader not started"))?;
        let res = handle
            .join()
            .map_err(|_| anyhow!("Trace reader thread panicked"))?;

        match interrupted {
            true => Ok(()),
            false => res,
        }
    }

    fn trace_info(&self) -> TraceInfo {
        TraceInfo::new(&self.trace_name())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{TraceEvents, TraceReader};
    use crate::context::BuildContext;
    use crate::provider::callstack::CallStackDefinition;
    use crate::provider::dispatcher::{BuildOutcome, EventDispatcher};
    use crate::provider::ProviderDefinition;
    use crate::state::StateValue;
    use crate::EventSource;

    const TRACE: &str = r#"[
    {"ts":0,"event":"entry","pid":1,"tid":1,"name":"main"},

    {"ts":5,"event":"entry","pid":1,"tid":1,"name":"work"},
    {"ts":8,"event":"exit","pid":1,"tid":1,"name":"work"},
    {"ts":12,"event":"exit","pid":1,"tid":1,"name":"main"}
    ]
    "#;

    #[test]
    fn test_parse_lines() {
        let events = TraceEvents::new(TRACE.as_bytes())
            .collect::<anyhow::Result<Vec<_>>>()
            .unwrap();

        assert_eq!(events.len(), 4);
        assert_eq!(events[3].ts, 12);

        let broken = "[\n{\"ts\":0,\"event\":\"entry\"}\n{\"ts\":\"x\"}\nnot json\n{\"ts\":4,\"event\":\"exit\"}\n]\n";
        let mut events = TraceEvents::new(broken.as_bytes());
        let parsed = events.by_ref().collect::<anyhow::Result<Vec<_>>>().unwrap();

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].ts, 4);
        assert_eq!(events.skipped, 2);
    }

    #[test]
    fn test_invalid_lines_do_not_abort_build() {
        let trace = r#"[
    {"ts":0,"event":"entry","pid":1,"tid":1,"name":"main"},
    {"ts":3,"event":"marker","args":null},
    {"ts":4,"event":"marker","ts":
    {"ts":12,"event":"exit","pid":1,"tid":1,"name":"main"}
    ]
    "#;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(trace.as_bytes())
            .unwrap();

        let ctx = BuildContext::new(dir.path());
        let dispatcher = EventDispatcher::with_defaults(CallStackDefinition::default().build());
        let ss = dispatcher.state_system();

        let mut reader = TraceReader::new(&path);
        let outcome = reader.process_events(dispatcher, &ctx).unwrap();

        assert!(matches!(outcome, BuildOutcome::Completed(s) if s.events == 3));
        assert_eq!(ss.current_end_time(), 12);

        let frame = ss
            .opt_quark_absolute(&["Processes", "1", "1", "CallStack", "0"])
            .unwrap();
        let main = ss.query_single_state(5, frame).unwrap();
        assert_eq!(main.value, StateValue::from("main"));
    }

    #[test]
    fn test_reader_feeds_dispatcher() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.json");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(TRACE.as_bytes())
            .unwrap();

        let ctx = BuildContext::new(dir.path());
        let dispatcher = EventDispatcher::with_defaults(CallStackDefinition::default().build());
        let ss = dispatcher.state_system();

        let mut reader = TraceReader::new(&path).with_capacity(2).start();
        assert_eq!(reader.trace_info().name, "app");

        let outcome = reader.process_events(dispatcher, &ctx).unwrap();

        assert!(matches!(outcome, BuildOutcome::Completed(s) if s.events == 4));
        assert_eq!(ss.current_end_time(), 12);
    }

    #[test]
    fn test_missing_trace() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new(dir.path());
        let dispatcher = EventDispatcher::with_defaults(CallStackDefinition::default().build());

        let mut reader = TraceReader::new(dir.path().join("missing.json"));

        assert!(reader.process_events(dispatcher, &ctx).is_err());
    }
}
