//! Time intervals.
//!
//! State intervals are half-open: a value set at `t0` and replaced at `t1`
//! covers `[t0, t1)`. An ongoing state has no known end yet and is
//! represented with an infinite upper bound.
//!
//! ```
//! use statehist::interval::{Bound, Interval};
//!
//! let a = Bound::Value(1);
//! let b = Bound::Value(5);
//!
//! let i1 = Interval::new(a, b); // constructs [a, b).
//! let i2 = Interval::new(a, Bound::Infinity); // constructs [a, inf).
//!
//! // The use of the `Bound` type can be precluded by using these constructors.
//! let i3 = Interval::range(1, 5); // constructs [a, b).
//! let i4 = Interval::infinite_right(1); // constructs [a, inf).
//!
//! assert_eq!(i1, i3);
//! assert_eq!(i2, i4);
//! ```

/// An interval bound. Only upper bounds are infinite, for ongoing states.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub enum Bound<T> {
    Value(T),
    Infinity,
}

impl<T: Copy> Bound<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            Value(value) => Some(*value),
            Infinity => None,
        }
    }
}

use Bound::*;

/// An half-open interval.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Interval<T> {
    a: Bound<T>,
    b: Bound<T>,
}

impl<T: Ord + Copy> Interval<T> {
    pub fn new(a: Bound<T>, b: Bound<T>) -> Self {
        Self { a, b }
    }

    pub fn lower_bound(&self) -> Bound<T> {
        self.a
    }

    pub fn upper_bound(&self) -> Bound<T> {
        self.b
    }

    /// Returns true if the interval contains no point, e.g. `[3, 3)`.
    ///
    /// ```
    /// use statehist::interval::Interval;
    ///
    /// assert!(Interval::range(3, 3).is_empty());
    /// assert!(!Interval::range(3, 4).is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.a >= self.b
    }

    /// Returns true if `self` ends before `value`.
    ///
    /// ```
    /// use statehist::interval::Interval;
    ///
    /// let a = Interval::range(0, 2);
    ///
    /// assert_eq!(a.is_left_of(&2), true);
    /// assert_eq!(a.is_left_of(&3), true);
    /// assert_eq!(a.is_left_of(&1), false);
    /// ```
    pub fn is_left_of(&self, value: &T) -> bool {
        match self.b {
            Value(v) => &v <= value,
            Infinity => false,
        }
    }

    /// Returns true if `value` is contained in `self`.
    ///
    /// ```
    /// use statehist::interval::Interval;
    ///
    /// let a = Interval::range(0, 2);
    ///
    /// assert_eq!(a.contains(&0), true);
    /// assert_eq!(a.contains(&1), true);
    /// assert_eq!(a.contains(&2), false);
    /// ```
    pub fn contains(&self, value: &T) -> bool {
        let v = Bound::Value(*value);

        (self.lower_bound() <= v) && (v < self.upper_bound())
    }

    /// Returns true if `self` has at least one point in the closed range
    /// `[start, end]`. Empty intervals match when their position lies in the
    /// range.
    ///
    /// ```
    /// use statehist::interval::Interval;
    ///
    /// let a = Interval::range(0, 5);
    ///
    /// assert!(a.meets(4, 10));
    /// assert!(!a.meets(5, 10));
    /// assert!(Interval::range(5, 5).meets(5, 10));
    /// assert!(Interval::infinite_right(7).meets(0, 7));
    /// ```
    pub fn meets(&self, start: T, end: T) -> bool {
        let s = Bound::Value(start);
        let e = Bound::Value(end);

        if self.is_empty() {
            return s <= self.a && self.a <= e;
        }

        self.a <= e && self.b > s
    }

    /// Builds the `[lower, inf)` interval.
    pub fn infinite_right(lower: T) -> Self {
        Self::new(Value(lower), Infinity)
    }

    /// Builds the `[a, b)` half-open interval.
    pub fn range(a: T, b: T) -> Self {
        Self {
            a: Value(a),
            b: Value(b),
        }
    }

}

pub type TimeInterval = Interval<u64>;

impl TimeInterval {
    /// Start time of a bounded-below interval.
    pub fn start(&self) -> u64 {
        self.lower_bound().value().unwrap_or(0)
    }

    /// End time, or `None` while the interval is still open.
    pub fn end(&self) -> Option<u64> {
        self.upper_bound().value()
    }
}

/// A time-ordered sequence of non-overlapping intervals, each carrying a
/// value.
///
/// Intervals are appended in non-decreasing start order. Point and range
/// lookups are binary searches over the sequence.
#[derive(Debug, Clone)]
pub struct IntervalSeq<V> {
    buff: Vec<(TimeInterval, V)>,
}

impl<V> IntervalSeq<V> {
    pub fn new() -> Self {
        Self { buff: Vec::new() }
    }

    /// Returns a reference on the last interval in the sequence.
    pub fn last(&self) -> Option<&(TimeInterval, V)> {
        self.buff.last()
    }

    /// Adds an interval at the end of the sequence.
    /// ```
    /// use statehist::interval::{Interval, IntervalSeq};
    ///
    /// let mut s = IntervalSeq::new();
    /// s.push(Interval::range(1, 2), 'a');
    /// s.push(Interval::range(2, 2), 'b');
    /// s.push(Interval::range(2, 6), 'c');
    ///
    /// let values = s.iter().map(|(_, v)| *v).collect::<String>();
    /// assert_eq!(values, "abc");
    /// ```
    ///
    /// # Panics
    ///
    /// This method panics if `interval` starts before the end of `self.last()`.
    ///
    /// ```should_panic
    /// use statehist::interval::{Interval, IntervalSeq};
    ///
    /// let mut s = IntervalSeq::new();
    /// s.push(Interval::range(1, 2), ());
    /// s.push(Interval::range(3, 4), ());
    /// // should panic
    /// s.push(Interval::range(2, 3), ());
    /// ```
    pub fn push(&mut self, interval: TimeInterval, value: V) {
        if let Some((last, _)) = self.last() {
            match last.upper_bound() {
                Infinity => panic!("Cannot insert an interval after an ongoing one"),
                Value(v) => assert!(interval.lower_bound() >= Value(v)),
            }
        }

        self.buff.push((interval, value));
    }

    /// Returns the interval containing `t`, if any.
    ///
    /// ```
    /// use statehist::interval::{Interval, IntervalSeq};
    ///
    /// let mut s = IntervalSeq::new();
    /// s.push(Interval::range(1, 4), 'a');
    /// s.push(Interval::range(4, 4), 'b');
    /// s.push(Interval::range(6, 9), 'c');
    ///
    /// assert_eq!(s.find(4), None);
    /// assert_eq!(s.find(3).map(|(_, v)| *v), Some('a'));
    /// assert_eq!(s.find(6).map(|(_, v)| *v), Some('c'));
    /// ```
    pub fn find(&self, t: u64) -> Option<&(TimeInterval, V)> {
        let p = self.buff.partition_point(|(i, _)| i.is_left_of(&t));

        self.buff.get(p).filter(|(i, _)| i.contains(&t))
    }

    /// Returns the intervals meeting the closed range `[start, end]`, in
    /// start order.
    ///
    /// ```
    /// use statehist::interval::{Interval, IntervalSeq};
    ///
    /// let mut s = IntervalSeq::new();
    /// s.push(Interval::range(1, 2), 'a');
    /// s.push(Interval::range(4, 6), 'b');
    /// s.push(Interval::range(6, 6), 'c');
    /// s.push(Interval::range(7, 9), 'd');
    ///
    /// let xs = s.overlapping(5, 7).iter().map(|(_, v)| *v).collect::<String>();
    /// assert_eq!(xs, "bcd");
    /// ```
    pub fn overlapping(&self, start: u64, end: u64) -> &[(TimeInterval, V)] {
        if start > end {
            return &[];
        }

        let l = self.buff.partition_point(|(i, _)| match i.end() {
            Some(b) => b < start || (b == start && i.start() < start),
            None => false,
        });
        let r = self.buff.partition_point(|(i, _)| i.start() <= end);

        if l >= r {
            return &[];
        }

        &self.buff[l..r]
    }

    /// Returns an iterator of the intervals contained in the sequence.
    pub fn iter(&self) -> impl Iterator<Item = &(TimeInterval, V)> {
        self.buff.iter()
    }

    pub fn len(&self) -> usize {
        self.buff.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buff.is_empty()
    }
}

impl<V> Default for IntervalSeq<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Bound, IntervalSeq, TimeInterval};

    #[test]
    fn test_bounds() {
        assert!(Bound::Value(7) < Bound::Infinity);
        assert!(Bound::Value(1) < Bound::Value(2));
        assert_eq!(Bound::Value(3).max(Bound::Infinity), Bound::Infinity);

        let ongoing = TimeInterval::infinite_right(1);
        let closed = TimeInterval::range(1, 2);

        assert_eq!(ongoing.end(), None);
        assert!(ongoing.contains(&u64::MAX));
        assert_eq!((closed.start(), closed.end()), (1, Some(2)));
        assert!(closed.is_left_of(&2));
    }

    #[test]
    fn test_interval_seq_lookup() {
        let mut seq = IntervalSeq::new();

        assert!(seq.find(0).is_none());
        assert!(seq.overlapping(0, 100).is_empty());

        let input = [
            (TimeInterval::range(5, 10), 0),
            (TimeInterval::range(20, 30), 1),
            (TimeInterval::range(30, 30), 2),
            (TimeInterval::range(30, 50), 3),
            (TimeInterval::range(70, 80), 4),
        ];

        for (i, v) in input.iter() {
            seq.push(*i, *v);
        }

        assert_eq!(seq.len(), 5);
        assert_eq!(seq.find(4), None);
        assert_eq!(seq.find(5).map(|x| x.1), Some(0));
        assert_eq!(seq.find(15), None);
        assert_eq!(seq.find(30).map(|x| x.1), Some(3));
        assert_eq!(seq.find(80), None);

        let ids = |s: &[(TimeInterval, i32)]| s.iter().map(|x| x.1).collect::<Vec<i32>>();

        assert_eq!(ids(seq.overlapping(0, 4)), Vec::<i32>::new());
        assert_eq!(ids(seq.overlapping(10, 19)), Vec::<i32>::new());
        assert_eq!(ids(seq.overlapping(9, 20)), vec![0, 1]);
        assert_eq!(ids(seq.overlapping(30, 30)), vec![2, 3]);
        assert_eq!(ids(seq.overlapping(31, 100)), vec![3, 4]);
        assert_eq!(ids(seq.overlapping(60, 50)), Vec::<i32>::new());
    }
}
