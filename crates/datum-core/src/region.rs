//! Spatial regions as pixel envelopes.
//!
//! The registry never does geometry. A [`Region`] is stored as the set of
//! pixels it touches in the universe's common skypix pixelization, kept as
//! sorted, merged, half-open index ranges. Two regions may overlap only if
//! their envelopes share a pixel; that is the only spatial test offered.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A spatial extent, represented by its common-skypix envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RegionRepr")]
pub struct Region {
    ranges: Vec<(u64, u64)>,
}

#[derive(Deserialize)]
struct RegionRepr {
    ranges: Vec<(u64, u64)>,
}

impl TryFrom<RegionRepr> for Region {
    type Error = Error;

    fn try_from(repr: RegionRepr) -> Result<Self> {
        Self::from_ranges(repr.ranges)
    }
}

impl Region {
    /// Builds a region from half-open `[start, end)` pixel ranges.
    ///
    /// Ranges are sorted and merged; empty ranges are dropped.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a range has `start > end` or the result is
    /// empty.
    pub fn from_ranges(ranges: impl IntoIterator<Item = (u64, u64)>) -> Result<Self> {
        let mut sorted: Vec<(u64, u64)> = Vec::new();
        for (start, end) in ranges {
            if start > end {
                return Err(Error::InvalidInput(format!(
                    "pixel range [{start}, {end}) is inverted"
                )));
            }
            if start < end {
                sorted.push((start, end));
            }
        }
        if sorted.is_empty() {
            return Err(Error::InvalidInput("region has no pixels".into()));
        }
        sorted.sort_unstable();

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(sorted.len());
        for (start, end) in sorted {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        Ok(Self { ranges: merged })
    }

    /// Builds a region from individual pixel indices.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if no pixels are given.
    pub fn from_pixels(pixels: impl IntoIterator<Item = u64>) -> Result<Self> {
        Self::from_ranges(pixels.into_iter().map(|p| (p, p.saturating_add(1))))
    }

    /// The merged, sorted pixel ranges of this region.
    #[must_use]
    pub fn envelope(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    /// Iterates every pixel in the envelope.
    pub fn pixels(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|&(start, end)| start..end)
    }

    /// Returns true if the envelopes share at least one pixel.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a0, a1) = self.ranges[i];
            let (b0, b1) = other.ranges[j];
            if a0 < b1 && b0 < a1 {
                return true;
            }
            if a1 <= b1 {
                i += 1;
            } else {
                j += 1;
            }
        }
        false
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Region{{")?;
        for (i, (start, end)) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "[{start}, {end})")?;
        }
        write!(f, "}}")
    }
}

/// Outcome of intersecting the regions of a coordinate's spatial families.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionOutcome {
    /// No spatial family has a region for this coordinate.
    None,
    /// Exactly one spatial family has a region.
    Single(Region),
    /// More than one family has a region; intersection is not supported.
    Indeterminate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_are_sorted_and_merged() {
        let region = Region::from_ranges([(10, 12), (1, 3), (2, 5), (12, 13)]).unwrap();
        assert_eq!(region.envelope(), &[(1, 5), (10, 13)]);
        assert_eq!(region.pixels().count(), 7);
    }

    #[test]
    fn overlap_is_pixel_sharing() {
        let a = Region::from_pixels([1, 2, 3]).unwrap();
        let b = Region::from_pixels([3, 9]).unwrap();
        let c = Region::from_pixels([4, 5]).unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn empty_region_rejected() {
        assert!(Region::from_ranges([(4, 4)]).is_err());
        assert!(Region::from_ranges([(5, 4)]).is_err());
    }
}
