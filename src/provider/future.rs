//! Deferred state changes.
//!
//! Some events describe a state change that happens later than the event
//! itself, e.g. an API call event carrying its own duration. Handlers
//! schedule such changes as future events, which the dispatcher fires once
//! the trace reaches their time.

use std::cmp::Ordering;

use clap::ValueEnum;
use min_max_heap::MinMaxHeap;
use serde::{Deserialize, Serialize};

use crate::state::{Quark, StateValue};

#[derive(Debug, Clone, PartialEq)]
pub enum FutureEventKind {
    /// Pops the stack held by the target attribute.
    Pop,
    /// Sets the target attribute to a value.
    Modify(StateValue),
}

impl FutureEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            FutureEventKind::Pop => "pop",
            FutureEventKind::Modify(_) => "modify",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FutureEvent {
    pub time: u64,
    /// Timestamp of the event that scheduled this one.
    pub source_ts: u64,
    pub quark: Quark,
    pub kind: FutureEventKind,
    seq: u64,
}

impl PartialEq for FutureEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for FutureEvent {}

impl Ord for FutureEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.time.cmp(&other.time) {
            Ordering::Equal => self.seq.cmp(&other.seq),
            ord => ord,
        }
    }
}

impl PartialOrd for FutureEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending future events, ordered by time. Events scheduled at the same time
/// come out in insertion order.
///
/// ```
/// use statehist::provider::future::{FutureEventKind, FutureEventQueue};
/// use statehist::state::AttributeTree;
///
/// let mut tree = AttributeTree::new();
/// let q = tree.get_or_create_quark(None, "CallStack").unwrap();
///
/// let mut queue = FutureEventQueue::new();
/// queue.add(20, 0, q, FutureEventKind::Pop);
/// queue.add(10, 0, q, FutureEventKind::Modify(1.into()));
/// queue.add(10, 1, q, FutureEventKind::Modify(2.into()));
///
/// let due = queue.pop_before(20).map(|e| e.source_ts).collect::<Vec<u64>>();
/// assert_eq!(due, vec![0, 1]);
/// assert_eq!(queue.len(), 1);
/// ```
#[derive(Default)]
pub struct FutureEventQueue {
    heap: MinMaxHeap<FutureEvent>,
    next_seq: u64,
}

impl FutureEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, time: u64, source_ts: u64, quark: Quark, kind: FutureEventKind) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(FutureEvent {
            time,
            source_ts,
            quark,
            kind,
            seq,
        });
    }

    pub fn peek(&self) -> Option<&FutureEvent> {
        self.heap.peek_min()
    }

    /// Removes and yields, in order, every event scheduled strictly before
    /// `time`.
    pub fn pop_before(&mut self, time: u64) -> impl Iterator<Item = FutureEvent> + '_ {
        std::iter::from_fn(move || match self.heap.peek_min() {
            Some(e) if e.time < time => self.heap.pop_min(),
            _ => None,
        })
    }

    /// Removes and yields every pending event, in order.
    pub fn drain(&mut self) -> impl Iterator<Item = FutureEvent> + '_ {
        std::iter::from_fn(move || self.heap.pop_min())
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// What to do with a future event still pending at the end of the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum FlushAction {
    /// Fire at its scheduled time, extending the state system if needed.
    Fire,
    /// Fire only if scheduled at or before the last event of the trace.
    FireWithinTrace,
    Drop,
}

/// End-of-trace handling of pending future events, per event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FutureFlushPolicy {
    pub pop: FlushAction,
    pub modify: FlushAction,
}

impl Default for FutureFlushPolicy {
    fn default() -> Self {
        Self {
            pop: FlushAction::Fire,
            modify: FlushAction::FireWithinTrace,
        }
    }
}

impl FutureFlushPolicy {
    /// Returns true if `event` must be fired when the trace ends at
    /// `last_ts`.
    pub fn should_fire(&self, event: &FutureEvent, last_ts: u64) -> bool {
        let action = match event.kind {
            FutureEventKind::Pop => self.pop,
            FutureEventKind::Modify(_) => self.modify,
        };

        match action {
            FlushAction::Fire => true,
            FlushAction::FireWithinTrace => event.time <= last_ts,
            FlushAction::Drop => false,
        }
    }
}
