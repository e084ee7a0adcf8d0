//! Interval store.
//!
//! Each attribute has a sequence of finalized intervals and, while the state
//! system is being built, one ongoing state: a value with a known start and
//! no end yet. Modifying an attribute closes its ongoing state and opens a new
//! one. Null intervals are stored as well, so a point query always returns
//! the exact bounds of the state covering the queried time.

use serde::Serialize;

use crate::interval::{IntervalSeq, TimeInterval};

use super::attribute::Quark;
use super::value::StateValue;
use super::StateSystemError;

/// The value of an attribute over a time range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateInterval {
    pub quark: Quark,
    pub start: u64,
    /// Exclusive end, `None` while the state is ongoing.
    pub end: Option<u64>,
    pub value: StateValue,
}

impl StateInterval {
    pub(crate) fn new(quark: Quark, range: TimeInterval, value: StateValue) -> Self {
        Self {
            quark,
            start: range.start(),
            end: range.end(),
            value,
        }
    }

    /// A no-data interval reported when nothing covers `time`.
    pub(crate) fn empty(quark: Quark, time: u64) -> Self {
        Self::new(quark, TimeInterval::range(time, time), StateValue::Null)
    }

    /// An interval whose value is not available yet.
    pub(crate) fn unknown(quark: Quark, time: u64) -> Self {
        Self::new(quark, TimeInterval::infinite_right(time), StateValue::Unknown)
    }

    pub fn range(&self) -> TimeInterval {
        match self.end {
            Some(end) => TimeInterval::range(self.start, end),
            None => TimeInterval::infinite_right(self.start),
        }
    }

    pub fn contains(&self, t: u64) -> bool {
        self.range().contains(&t)
    }

    pub fn is_ongoing(&self) -> bool {
        self.end.is_none()
    }
}

#[derive(Debug, Clone)]
struct Ongoing {
    start: u64,
    value: StateValue,
}

#[derive(Debug, Clone, Default)]
struct AttributeHistory {
    intervals: IntervalSeq<StateValue>,
    ongoing: Option<Ongoing>,
}

/// Intervals of every attribute of a state system.
#[derive(Debug, Clone)]
pub(crate) struct IntervalStore {
    start: u64,
    end: u64,
    histories: Vec<AttributeHistory>,
    closed: bool,
}

impl IntervalStore {
    pub fn new(start: u64) -> Self {
        Self {
            start,
            end: start,
            histories: Vec::new(),
            closed: false,
        }
    }

    /// Sets the time at which every attribute starts with a null state.
    /// Only meaningful before the first modification.
    pub fn set_start(&mut self, start: u64) {
        self.start = start;
        self.end = self.end.max(start);

        for ongoing in self.histories.iter_mut().filter_map(|h| h.ongoing.as_mut()) {
            ongoing.start = start;
        }
    }

    pub fn start_time(&self) -> u64 {
        self.start
    }

    /// Latest time written to the store.
    pub fn end_time(&self) -> u64 {
        self.end
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Makes room for attributes up to `len` quarks. New attributes start
    /// with an ongoing null state, unless the store is already closed.
    pub fn ensure_attributes(&mut self, len: usize) {
        let start = self.start;
        let closed = self.closed;

        self.histories.resize_with(len.max(self.histories.len()), || {
            AttributeHistory {
                intervals: IntervalSeq::new(),
                ongoing: (!closed).then(|| Ongoing {
                    start,
                    value: StateValue::Null,
                }),
            }
        });
    }

    fn history(&self, quark: Quark) -> Result<&AttributeHistory, StateSystemError> {
        self.histories
            .get(quark.index())
            .ok_or(StateSystemError::InvalidAttribute(quark))
    }

    fn history_mut(&mut self, quark: Quark) -> Result<&mut AttributeHistory, StateSystemError> {
        self.histories
            .get_mut(quark.index())
            .ok_or(StateSystemError::InvalidAttribute(quark))
    }

    /// Closes the ongoing state of `quark` at `time` and starts a new one
    /// with `value`. Returns the value of the closed state.
    pub fn modify(
        &mut self,
        time: u64,
        value: StateValue,
        quark: Quark,
    ) -> Result<StateValue, StateSystemError> {
        if self.closed {
            return Err(StateSystemError::Closed);
        }

        let h = self.history_mut(quark)?;

        let ongoing = h.ongoing.as_mut().ok_or(StateSystemError::Closed)?;

        if time < ongoing.start {
            return Err(StateSystemError::OutOfOrder {
                quark,
                time,
                last: ongoing.start,
            });
        }

        let prev = std::mem::replace(ongoing, Ongoing { start: time, value });

        if !(prev.value.is_null() && prev.start == time) {
            h.intervals
                .push(TimeInterval::range(prev.start, time), prev.value.clone());
        }

        self.end = self.end.max(time);

        Ok(prev.value)
    }

    /// Replaces the value of the ongoing state of `quark` without closing it.
    pub fn update_ongoing(&mut self, value: StateValue, quark: Quark) -> Result<(), StateSystemError> {
        if self.closed {
            return Err(StateSystemError::Closed);
        }

        let ongoing = self
            .history_mut(quark)?
            .ongoing
            .as_mut()
            .ok_or(StateSystemError::Closed)?;

        ongoing.value = value;

        Ok(())
    }

    /// Value of the ongoing state of `quark`, `Null` if there is none.
    pub fn ongoing(&self, quark: Quark) -> Result<StateValue, StateSystemError> {
        Ok(self
            .history(quark)?
            .ongoing
            .as_ref()
            .map(|o| o.value.clone())
            .unwrap_or_default())
    }

    /// Start time of the ongoing state of `quark`.
    pub fn ongoing_start(&self, quark: Quark) -> Result<Option<u64>, StateSystemError> {
        Ok(self.history(quark)?.ongoing.as_ref().map(|o| o.start))
    }

    /// Returns the state of `quark` at `time`, if any is recorded.
    pub fn query(&self, time: u64, quark: Quark) -> Result<Option<StateInterval>, StateSystemError> {
        let h = self.history(quark)?;

        if let Some((range, value)) = h.intervals.find(time) {
            return Ok(Some(StateInterval::new(quark, *range, value.clone())));
        }

        Ok(h.ongoing
            .as_ref()
            .filter(|o| o.start <= time)
            .map(|o| StateInterval::new(quark, TimeInterval::infinite_right(o.start), o.value.clone())))
    }

    /// Returns the states of `quark` meeting `[start, end]`, in start order.
    pub fn range(
        &self,
        quark: Quark,
        start: u64,
        end: u64,
    ) -> Result<Vec<StateInterval>, StateSystemError> {
        let h = self.history(quark)?;

        let mut ret = h
            .intervals
            .overlapping(start, end)
            .iter()
            .map(|(range, value)| StateInterval::new(quark, *range, value.clone()))
            .collect::<Vec<StateInterval>>();

        if let Some(o) = h.ongoing.as_ref() {
            let range = TimeInterval::infinite_right(o.start);

            if range.meets(start, end) {
                ret.push(StateInterval::new(quark, range, o.value.clone()));
            }
        }

        Ok(ret)
    }

    /// Closes every ongoing state at `end`. The store is read-only afterwards.
    pub fn close(&mut self, end: u64) -> Result<(), StateSystemError> {
        if self.closed {
            return Err(StateSystemError::Closed);
        }

        for (i, h) in self.histories.iter().enumerate() {
            if let Some(o) = h.ongoing.as_ref() {
                if end < o.start {
                    return Err(StateSystemError::OutOfOrder {
                        quark: Quark::new(i),
                        time: end,
                        last: o.start,
                    });
                }
            }
        }

        for h in self.histories.iter_mut() {
            if let Some(o) = h.ongoing.take() {
                if !(o.value.is_null() && o.start == end) {
                    h.intervals.push(TimeInterval::range(o.start, end), o.value);
                }
            }
        }

        self.end = self.end.max(end);
        self.closed = true;

        Ok(())
    }

    /// Iterates over every finalized interval, attribute by attribute.
    pub fn intervals(&self) -> impl Iterator<Item = StateInterval> + '_ {
        self.histories.iter().enumerate().flat_map(|(i, h)| {
            h.intervals
                .iter()
                .map(move |(range, value)| StateInterval::new(Quark::new(i), *range, value.clone()))
        })
    }

    /// Number of finalized intervals.
    pub fn interval_count(&self) -> usize {
        self.histories.iter().map(|h| h.intervals.len()).sum()
    }

    /// Rebuilds a closed store from finalized intervals. Intervals of a given
    /// attribute must come in start order and must not overlap.
    pub fn from_intervals<I>(
        start: u64,
        end: u64,
        attributes: usize,
        intervals: I,
    ) -> Result<Self, StateSystemError>
    where
        I: IntoIterator<Item = StateInterval>,
    {
        let mut store = IntervalStore::new(start);
        store.closed = true;
        store.end = end;
        store.ensure_attributes(attributes);

        for interval in intervals {
            let quark = interval.quark;
            let interval_end = interval.end.ok_or(StateSystemError::Closed)?;
            let h = store.history_mut(quark)?;

            let last_end = h.intervals.last().and_then(|(r, _)| r.end()).unwrap_or(start);

            if interval.start < last_end || interval_end < interval.start {
                return Err(StateSystemError::OutOfOrder {
                    quark,
                    time: interval.start,
                    last: last_end,
                });
            }

            h.intervals
                .push(TimeInterval::range(interval.start, interval_end), interval.value);
            store.end = store.end.max(interval_end);
        }

        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{IntervalStore, StateInterval};
    use crate::interval::TimeInterval;
    use crate::state::attribute::Quark;
    use crate::state::value::StateValue;
    use crate::state::StateSystemError;

    fn store_with(attributes: usize) -> IntervalStore {
        let mut store = IntervalStore::new(0);
        store.ensure_attributes(attributes);
        store
    }

    #[test]
    fn test_modify_and_query() {
        let mut store = store_with(1);
        let q = Quark::new(0);

        store.modify(10, StateValue::from("RUNNING"), q).unwrap();
        store.modify(20, StateValue::from("BLOCKED"), q).unwrap();

        let at_5 = store.query(5, q).unwrap().unwrap();
        assert_eq!((at_5.start, at_5.end), (0, Some(10)));
        assert!(at_5.value.is_null());

        let at_15 = store.query(15, q).unwrap().unwrap();
        assert_eq!((at_15.start, at_15.end), (10, Some(20)));
        assert_eq!(at_15.value, StateValue::from("RUNNING"));

        let at_25 = store.query(25, q).unwrap().unwrap();
        assert!(at_25.is_ongoing());
        assert_eq!(store.ongoing(q).unwrap(), StateValue::from("BLOCKED"));
    }

    #[test]
    fn test_out_of_order() {
        let mut store = store_with(1);
        let q = Quark::new(0);

        store.modify(10, StateValue::Int(1), q).unwrap();
        store.modify(10, StateValue::Int(2), q).unwrap();

        assert_eq!(
            store.modify(9, StateValue::Int(3), q),
            Err(StateSystemError::OutOfOrder {
                quark: q,
                time: 9,
                last: 10
            })
        );
    }

    #[test]
    fn test_close() {
        let mut store = store_with(2);

        store.modify(3, StateValue::Int(1), Quark::new(0)).unwrap();
        store.close(8).unwrap();

        let r = store.range(Quark::new(0), 0, 100).unwrap();
        assert_eq!(
            r,
            vec![
                StateInterval::new(Quark::new(0), TimeInterval::range(0, 3), StateValue::Null),
                StateInterval::new(Quark::new(0), TimeInterval::range(3, 8), StateValue::Int(1)),
            ]
        );

        assert_eq!(store.range(Quark::new(1), 0, 100).unwrap().len(), 1);
        assert_eq!(store.end_time(), 8);
        assert_eq!(
            store.modify(9, StateValue::Int(2), Quark::new(0)),
            Err(StateSystemError::Closed)
        );
    }

    proptest! {
        #[test]
        fn prop_intervals_are_sorted_and_disjoint(
            steps in proptest::collection::vec((0u64..5, 0usize..3, proptest::option::of(0i32..4)), 1..64)
        ) {
            let mut store = store_with(3);
            let mut t = 0;

            for (dt, q, v) in steps {
                t += dt;
                store.modify(t, StateValue::from(v), Quark::new(q)).unwrap();
            }

            store.close(t + 1).unwrap();

            for q in 0..3 {
                let intervals = store.range(Quark::new(q), 0, t + 1).unwrap();

                for pair in intervals.windows(2) {
                    let end = pair[0].end.unwrap();
                    prop_assert!(pair[0].start <= end);
                    prop_assert!(end <= pair[1].start);
                }
            }
        }
    }
}
