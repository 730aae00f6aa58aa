//! Spatial and temporal families, and skypix systems.
//!
//! A topological family groups elements that carry the same kind of extent
//! (a region or a timespan) for the same underlying thing. At most one member
//! of a family is used for any data ID: the first member, in configured
//! order, that the data ID's graph contains.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::region::Region;

/// Which kind of extent a family describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologicalSpace {
    /// Families whose members carry regions.
    Spatial,
    /// Families whose members carry timespans.
    Temporal,
}

/// An ordered group of elements that share one kind of extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologicalFamily {
    pub(crate) name: String,
    pub(crate) space: TopologicalSpace,
    pub(crate) members: Vec<String>,
}

impl TopologicalFamily {
    /// Family name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Space this family belongs to.
    #[must_use]
    pub const fn space(&self) -> TopologicalSpace {
        self.space
    }

    /// Members in preference order.
    #[must_use]
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Picks the preferred member among those `present` accepts.
    pub fn choose(&self, present: impl Fn(&str) -> bool) -> Option<&str> {
        self.members
            .iter()
            .map(String::as_str)
            .find(|name| present(name))
    }
}

/// Supported pixelization classes.
///
/// Both are hierarchical with four children per pixel, so a pixel at one
/// level maps to a contiguous index range at any finer level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelizationClass {
    /// Hierarchical triangular mesh.
    Htm,
    /// Nested `HEALPix`.
    Healpix,
}

impl PixelizationClass {
    /// Resolves a configured class name.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an unknown class name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "htm" => Ok(Self::Htm),
            "healpix" => Ok(Self::Healpix),
            other => Err(Error::config(format!(
                "unknown pixelization class '{other}'"
            ))),
        }
    }
}

/// One skypix pixelization system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkyPixSystem {
    pub(crate) name: String,
    pub(crate) class: PixelizationClass,
    pub(crate) max_level: u8,
}

impl SkyPixSystem {
    /// System name (also the prefix of its dimension names).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pixelization class.
    #[must_use]
    pub const fn class(&self) -> PixelizationClass {
        self.class
    }

    /// Finest level.
    #[must_use]
    pub const fn max_level(&self) -> u8 {
        self.max_level
    }

    /// Name of the dimension for one level.
    #[must_use]
    pub fn dimension_name(&self, level: u8) -> String {
        format!("{}{level}", self.name)
    }

    /// Envelope, at `target_level`, of pixel `index` at `level`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the index range overflows.
    pub fn envelope(&self, level: u8, index: u64, target_level: u8) -> Result<Region> {
        let overflow = || Error::InvalidInput(format!("pixel {index} at level {level} overflows"));
        if level <= target_level {
            let shift = 2 * u32::from(target_level - level);
            let start = index.checked_shl(shift).filter(|s| s >> shift == index).ok_or_else(overflow)?;
            let end = index
                .checked_add(1)
                .and_then(|i| i.checked_shl(shift))
                .filter(|e| *e > start)
                .ok_or_else(overflow)?;
            Region::from_ranges([(start, end)])
        } else {
            let shift = 2 * u32::from(level - target_level);
            Region::from_pixels([index >> shift])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choose_prefers_configured_order() {
        let family = TopologicalFamily {
            name: "observation_regions".into(),
            space: TopologicalSpace::Spatial,
            members: vec!["visit_detector_region".into(), "visit".into()],
        };
        assert_eq!(family.choose(|n| n == "visit"), Some("visit"));
        assert_eq!(family.choose(|_| true), Some("visit_detector_region"));
        assert_eq!(family.choose(|_| false), None);
    }

    #[test]
    fn pixel_envelopes_nest() {
        let htm = SkyPixSystem {
            name: "htm".into(),
            class: PixelizationClass::Htm,
            max_level: 7,
        };
        let coarse = htm.envelope(5, 3, 7).unwrap();
        assert_eq!(coarse.envelope(), &[(48, 64)]);
        let fine = htm.envelope(7, 50, 5).unwrap();
        assert_eq!(fine.envelope(), &[(3, 4)]);
        assert!(PixelizationClass::from_name("hexagons").is_err());
    }
}
