//! Half-open time intervals.
//!
//! A [`Timespan`] is `[begin, end)` over UTC instants. Either bound may be
//! absent, meaning unbounded in that direction. Empty timespans are never
//! constructed: operations whose result would be empty return `None` or an
//! empty list instead.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A half-open `[begin, end)` interval of UTC instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "TimespanRepr")]
pub struct Timespan {
    begin: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct TimespanRepr {
    begin: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl TryFrom<TimespanRepr> for Timespan {
    type Error = Error;

    fn try_from(repr: TimespanRepr) -> Result<Self> {
        Self::new(repr.begin, repr.end)
    }
}

impl Timespan {
    /// The interval covering all time.
    pub const ALL: Self = Self {
        begin: None,
        end: None,
    };

    /// Creates a timespan, where `None` means unbounded on that side.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if both bounds are given and `begin >= end`.
    pub fn new(begin: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<Self> {
        if let (Some(b), Some(e)) = (begin, end) {
            if b >= e {
                return Err(Error::InvalidInput(format!(
                    "timespan begin {b} is not before end {e}"
                )));
            }
        }
        Ok(Self { begin, end })
    }

    /// Creates the bounded interval `[begin, end)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `begin >= end`.
    pub fn between(begin: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        Self::new(Some(begin), Some(end))
    }

    /// Creates `[begin, ∞)`.
    #[must_use]
    pub const fn starting_at(begin: DateTime<Utc>) -> Self {
        Self {
            begin: Some(begin),
            end: None,
        }
    }

    /// Creates `(-∞, end)`.
    #[must_use]
    pub const fn ending_at(end: DateTime<Utc>) -> Self {
        Self {
            begin: None,
            end: Some(end),
        }
    }

    /// Inclusive lower bound, or `None` if unbounded below.
    #[must_use]
    pub const fn begin(&self) -> Option<DateTime<Utc>> {
        self.begin
    }

    /// Exclusive upper bound, or `None` if unbounded above.
    #[must_use]
    pub const fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    /// Returns true if the two intervals share at least one instant.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        before(self.begin, other.end) && before(other.begin, self.end)
    }

    /// Returns true if `other` lies entirely within this interval.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        cmp_begin(self.begin, other.begin) != Ordering::Greater
            && cmp_end(self.end, other.end) != Ordering::Less
    }

    /// Returns true if the instant `t` lies within this interval.
    #[must_use]
    pub fn contains_time(&self, t: DateTime<Utc>) -> bool {
        self.begin.map_or(true, |b| b <= t) && self.end.map_or(true, |e| t < e)
    }

    /// Returns the overlap of two intervals, or `None` if they are disjoint.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let begin = match cmp_begin(self.begin, other.begin) {
            Ordering::Less => other.begin,
            _ => self.begin,
        };
        let end = match cmp_end(self.end, other.end) {
            Ordering::Greater => other.end,
            _ => self.end,
        };
        before(begin, end).then_some(Self { begin, end })
    }

    /// Intersects any number of intervals.
    ///
    /// Returns `None` if the intersection is empty or no intervals were given.
    pub fn intersection_of<'a>(spans: impl IntoIterator<Item = &'a Self>) -> Option<Self> {
        let mut iter = spans.into_iter();
        let first = *iter.next()?;
        iter.try_fold(first, |acc, next| acc.intersection(next))
    }

    /// Returns the parts of this interval not covered by `other`.
    ///
    /// The result has zero pieces when `other` covers this interval, one when
    /// `other` clips a prefix or suffix (or is disjoint), and two when `other`
    /// lies strictly inside.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Vec<Self> {
        if !self.overlaps(other) {
            return vec![*self];
        }
        let mut pieces = Vec::with_capacity(2);
        if cmp_begin(self.begin, other.begin) == Ordering::Less {
            pieces.push(Self {
                begin: self.begin,
                end: other.begin,
            });
        }
        if cmp_end(self.end, other.end) == Ordering::Greater {
            pieces.push(Self {
                begin: other.end,
                end: self.end,
            });
        }
        pieces
    }
}

/// `begin < end`, where a missing begin is -∞ and a missing end is +∞.
fn before(begin: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
    match (begin, end) {
        (Some(b), Some(e)) => b < e,
        _ => true,
    }
}

fn cmp_begin(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    // Option orders None first, which is -∞ for a lower bound.
    a.cmp(&b)
}

fn cmp_end(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => x.cmp(&y),
    }
}

impl PartialOrd for Timespan {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timespan {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_begin(self.begin, other.begin).then_with(|| cmp_end(self.end, other.end))
    }
}

impl fmt::Display for Timespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.begin {
            Some(b) => write!(f, "[{}, ", b.to_rfc3339())?,
            None => write!(f, "(-∞, ")?,
        }
        match self.end {
            Some(e) => write!(f, "{})", e.to_rfc3339()),
            None => write!(f, "∞)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn empty_and_inverted_intervals_rejected() {
        assert!(Timespan::between(t(2), t(2)).is_err());
        assert!(Timespan::between(t(3), t(2)).is_err());
    }

    #[test]
    fn half_open_intervals_touching_do_not_overlap() {
        let a = Timespan::between(t(1), t(2)).unwrap();
        let b = Timespan::between(t(2), t(3)).unwrap();
        assert!(!a.overlaps(&b));
        assert!(a.intersection(&b).is_none());
        assert!(Timespan::ALL.overlaps(&a));
    }

    #[test]
    fn unbounded_intersection() {
        let a = Timespan::ending_at(t(5));
        let b = Timespan::starting_at(t(3));
        assert_eq!(a.intersection(&b), Some(Timespan::between(t(3), t(5)).unwrap()));
        assert!(Timespan::ALL.contains(&a));
        assert!(!a.contains(&Timespan::ALL));
    }

    #[test]
    fn difference_splits_into_zero_one_or_two() {
        let all = Timespan::ALL;
        let window = Timespan::between(t(2), t(4)).unwrap();
        assert_eq!(
            all.difference(&window),
            vec![Timespan::ending_at(t(2)), Timespan::starting_at(t(4))]
        );

        let prefix = Timespan::between(t(1), t(3)).unwrap();
        assert_eq!(prefix.difference(&window), vec![Timespan::between(t(1), t(2)).unwrap()]);

        assert!(window.difference(&all).is_empty());

        let disjoint = Timespan::between(t(5), t(6)).unwrap();
        assert_eq!(disjoint.difference(&window), vec![disjoint]);
    }

    #[test]
    fn intersection_of_many() {
        let spans = [
            Timespan::ending_at(t(6)),
            Timespan::starting_at(t(1)),
            Timespan::between(t(2), t(8)).unwrap(),
        ];
        assert_eq!(
            Timespan::intersection_of(&spans),
            Some(Timespan::between(t(2), t(6)).unwrap())
        );
        assert_eq!(Timespan::intersection_of(&[]), None);
    }

    #[test]
    fn contains_time_respects_half_open_end() {
        let span = Timespan::between(t(1), t(2)).unwrap();
        assert!(span.contains_time(t(1)));
        assert!(!span.contains_time(t(2)));
    }
}
