//! Value types for time: [`TimeInstant`], [`TimeInterval`], [`SamplingClock`]
//! and [`TimestampList`].

use std::cmp::Ordering;
use std::fmt;

/// Units a [`SamplingClock`] period is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    fn nanos_per_unit(self) -> i128 {
        match self {
            TimeUnit::Nanoseconds => 1,
            TimeUnit::Microseconds => 1_000,
            TimeUnit::Milliseconds => 1_000_000,
            TimeUnit::Seconds => 1_000_000_000,
        }
    }
}

/// A single instant: epoch seconds plus nanoseconds, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeInstant {
    pub seconds: i64,
    pub nanos: u32,
}

impl TimeInstant {
    pub fn new(seconds: i64, nanos: u32) -> Self {
        let extra_seconds = (nanos / 1_000_000_000) as i64;
        TimeInstant {
            seconds: seconds + extra_seconds,
            nanos: nanos % 1_000_000_000,
        }
    }

    pub fn from_seconds(seconds: i64) -> Self {
        TimeInstant { seconds, nanos: 0 }
    }

    /// `self + count * period` in `unit`s, used to materialize a [`SamplingClock`].
    pub fn advance(self, count: i64, period: u64, unit: TimeUnit) -> Self {
        let total_nanos = (period as i128) * (count as i128) * unit.nanos_per_unit();
        let base_nanos = (self.seconds as i128) * 1_000_000_000 + self.nanos as i128;
        let result_nanos = base_nanos + total_nanos;
        let seconds = result_nanos.div_euclid(1_000_000_000) as i64;
        let nanos = result_nanos.rem_euclid(1_000_000_000) as u32;
        TimeInstant { seconds, nanos }
    }

    pub fn as_f64_seconds(self) -> f64 {
        self.seconds as f64 + (self.nanos as f64) / 1_000_000_000.0
    }
}

impl PartialOrd for TimeInstant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeInstant {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds
            .cmp(&other.seconds)
            .then(self.nanos.cmp(&other.nanos))
    }
}

impl fmt::Display for TimeInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}

/// A closed interval `[begin, end]`. Invariant: `begin <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeInterval {
    begin: TimeInstant,
    end: TimeInstant,
}

impl TimeInterval {
    pub fn new(begin: TimeInstant, end: TimeInstant) -> Option<Self> {
        if begin <= end {
            Some(TimeInterval { begin, end })
        } else {
            None
        }
    }

    pub fn begin(&self) -> TimeInstant {
        self.begin
    }

    pub fn end(&self) -> TimeInstant {
        self.end
    }

    pub fn duration_seconds(&self) -> f64 {
        self.end.as_f64_seconds() - self.begin.as_f64_seconds()
    }

    pub fn contains(&self, instant: TimeInstant) -> bool {
        self.begin <= instant && instant <= self.end
    }

    pub fn intersects(&self, other: &TimeInterval) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }

    /// Smallest enclosing interval, or `None` if the two intervals neither
    /// overlap nor touch (spec.md does not define union over disjoint
    /// intervals for a single-interval type).
    pub fn union(&self, other: &TimeInterval) -> Option<TimeInterval> {
        if self.intersects(other) {
            Some(TimeInterval {
                begin: self.begin.min(other.begin),
                end: self.end.max(other.end),
            })
        } else {
            None
        }
    }

    pub fn intersection(&self, other: &TimeInterval) -> Option<TimeInterval> {
        if !self.intersects(other) {
            return None;
        }
        TimeInterval::new(self.begin.max(other.begin), self.end.min(other.end))
    }

    /// Splits this interval into contiguous `[start, start+step)` windows of
    /// `step` seconds; the last window may be shorter and is still closed on
    /// the overall end. Used by the request decomposer's vertical axis.
    pub fn split_by_duration(&self, step_seconds: f64) -> Vec<TimeInterval> {
        if step_seconds <= 0.0 {
            return vec![*self];
        }
        let mut out = Vec::new();
        let mut cursor = self.begin;
        loop {
            let remaining = self.end.as_f64_seconds() - cursor.as_f64_seconds();
            if remaining <= 0.0 {
                break;
            }
            let window = step_seconds.min(remaining);
            let window_end_seconds = cursor.as_f64_seconds() + window;
            let window_end = if window_end_seconds >= self.end.as_f64_seconds() {
                self.end
            } else {
                TimeInstant::new(window_end_seconds.floor() as i64, 0)
            };
            out.push(TimeInterval {
                begin: cursor,
                end: window_end,
            });
            if window_end == self.end {
                break;
            }
            cursor = window_end;
        }
        out
    }
}

/// `count` evenly-spaced instants starting at `start`, `period` apart in `period_units`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingClock {
    pub start: TimeInstant,
    pub period: u64,
    pub count: u64,
    pub period_units: TimeUnit,
}

impl SamplingClock {
    pub fn new(
        start: TimeInstant,
        period: u64,
        count: u64,
        period_units: TimeUnit,
    ) -> Option<Self> {
        if period == 0 {
            return None;
        }
        Some(SamplingClock {
            start,
            period,
            count,
            period_units,
        })
    }

    pub fn instant_at(&self, index: u64) -> Option<TimeInstant> {
        if index >= self.count {
            return None;
        }
        Some(self.start.advance(index as i64, self.period, self.period_units))
    }

    pub fn materialize(&self) -> Vec<TimeInstant> {
        (0..self.count)
            .map(|i| self.start.advance(i as i64, self.period, self.period_units))
            .collect()
    }

    pub fn end(&self) -> TimeInstant {
        if self.count == 0 {
            self.start
        } else {
            self.start
                .advance((self.count - 1) as i64, self.period, self.period_units)
        }
    }

    /// Two clocks are compatible (can be concatenated) iff they share
    /// `(period, period_units)` and `self` ends exactly one period before
    /// `other` starts.
    pub fn compatible_with(&self, other: &SamplingClock) -> bool {
        if self.period != other.period || self.period_units != other.period_units {
            return false;
        }
        self.end().advance(1, self.period, self.period_units) == other.start
    }

    /// Canonical time key for grouping: the 3-tuple that, with `count`,
    /// identifies this clock's domain. `period_units` is folded in because
    /// two clocks with the same numbers but different units are distinct.
    pub fn time_key(&self) -> (i64, u32, u64, u8, u64) {
        (
            self.start.seconds,
            self.start.nanos,
            self.period,
            self.period_units as u8,
            self.count,
        )
    }
}

/// An explicit, possibly non-uniform, sequence of instants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampList {
    timestamps: Vec<TimeInstant>,
    ordered: bool,
}

impl TimestampList {
    /// Builds a list, verifying strict monotonicity unless `ordered` is false.
    pub fn new(timestamps: Vec<TimeInstant>, ordered: bool) -> Result<Self, &'static str> {
        if ordered {
            for pair in timestamps.windows(2) {
                if pair[0] >= pair[1] {
                    return Err("timestamps must be strictly monotone");
                }
            }
        }
        Ok(TimestampList {
            timestamps,
            ordered,
        })
    }

    pub fn as_slice(&self) -> &[TimeInstant] {
        &self.timestamps
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    pub fn first(&self) -> Option<TimeInstant> {
        self.timestamps.first().copied()
    }

    pub fn last(&self) -> Option<TimeInstant> {
        self.timestamps.last().copied()
    }

    /// Cheap, collision-resistant-enough identity for grouping: head, length
    /// and last element. Full equality is checked on hash collision by the
    /// correlator (see `raw_block::TimeKey`).
    pub fn identity_digest(&self) -> (Option<TimeInstant>, usize, Option<TimeInstant>) {
        (self.first(), self.len(), self.last())
    }
}
