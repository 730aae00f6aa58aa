//! Interned dimension graphs.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::element::DimensionElement;
use super::topology::{TopologicalFamily, TopologicalSpace};
use super::universe::DimensionUniverse;
use crate::error::{Error, Result};

/// The closure of a set of dimensions under required and implied
/// dependencies.
///
/// Graphs are interned by their universe: extracting the same dimension set
/// twice yields handles to the same object, so equality is a pointer check in
/// the common case. Cloning is cheap.
#[derive(Clone)]
pub struct DimensionGraph(Arc<GraphData>);

struct GraphData {
    universe: &'static DimensionUniverse,
    names: BTreeSet<String>,
    dimensions: Vec<&'static DimensionElement>,
    required: Vec<&'static DimensionElement>,
    implied: Vec<&'static DimensionElement>,
    elements: Vec<&'static DimensionElement>,
    spatial: Vec<&'static TopologicalFamily>,
    temporal: Vec<&'static TopologicalFamily>,
    /// Position of each dimension's value in a coordinate: required first,
    /// then implied.
    value_indices: HashMap<String, usize>,
}

impl DimensionGraph {
    /// Builds a graph from an already expanded, validated name set.
    pub(crate) fn build(universe: &'static DimensionUniverse, names: &BTreeSet<String>) -> Self {
        let dimensions: Vec<&'static DimensionElement> = universe
            .dimensions()
            .filter(|d| names.contains(&d.name))
            .collect();
        let implied_names: BTreeSet<&str> = dimensions
            .iter()
            .flat_map(|d| d.implied.iter().map(String::as_str))
            .collect();
        let (implied, required): (Vec<_>, Vec<_>) = dimensions
            .iter()
            .copied()
            .partition(|d| implied_names.contains(d.name.as_str()));
        let elements: Vec<&'static DimensionElement> = universe
            .elements()
            .iter()
            .filter(|e| e.required.iter().all(|r| names.contains(r)))
            .collect();
        let families_in = |space: TopologicalSpace| -> Vec<&'static TopologicalFamily> {
            universe
                .families()
                .iter()
                .filter(|f| f.space == space)
                .filter(|f| elements.iter().any(|e| f.members.contains(&e.name)))
                .collect()
        };
        let spatial = families_in(TopologicalSpace::Spatial);
        let temporal = families_in(TopologicalSpace::Temporal);
        let value_indices = required
            .iter()
            .chain(&implied)
            .enumerate()
            .map(|(i, d)| (d.name.clone(), i))
            .collect();

        Self(Arc::new(GraphData {
            universe,
            names: names.clone(),
            dimensions,
            required,
            implied,
            elements,
            spatial,
            temporal,
            value_indices,
        }))
    }

    /// Decodes a graph from the bit vector produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the length is wrong or a bit is set past
    /// the last dimension.
    pub fn decode(universe: &'static DimensionUniverse, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != universe.encode_length() {
            return Err(Error::InvalidInput(format!(
                "encoded graph has {} bytes, expected {}",
                bytes.len(),
                universe.encode_length()
            )));
        }
        let dims: Vec<&DimensionElement> = universe.dimensions().collect();
        let mut names = Vec::new();
        for (byte_pos, byte) in bytes.iter().rev().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) == 0 {
                    continue;
                }
                let index = byte_pos * 8 + bit;
                let dim = dims.get(index).ok_or_else(|| {
                    Error::InvalidInput(format!("encoded graph sets unknown dimension bit {index}"))
                })?;
                names.push(dim.name.as_str());
            }
        }
        universe.extract(names)
    }

    /// Encodes this graph as a big-endian bit vector, one bit per dimension
    /// at its dimension index.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![0_u8; self.0.universe.encode_length()];
        let len = bytes.len();
        for dim in &self.0.dimensions {
            if let Some(index) = dim.dimension_index {
                if let Some(byte) = bytes.get_mut(len - 1 - index / 8) {
                    *byte |= 1 << (index % 8);
                }
            }
        }
        bytes
    }

    /// The universe this graph belongs to.
    #[must_use]
    pub fn universe(&self) -> &'static DimensionUniverse {
        self.0.universe
    }

    /// All dimensions, topologically sorted.
    #[must_use]
    pub fn dimensions(&self) -> &[&'static DimensionElement] {
        &self.0.dimensions
    }

    /// Dimensions not implied by another dimension in the graph.
    #[must_use]
    pub fn required(&self) -> &[&'static DimensionElement] {
        &self.0.required
    }

    /// Dimensions implied by another dimension in the graph.
    #[must_use]
    pub fn implied(&self) -> &[&'static DimensionElement] {
        &self.0.implied
    }

    /// Every element whose required dimensions are all in this graph.
    #[must_use]
    pub fn elements(&self) -> &[&'static DimensionElement] {
        &self.0.elements
    }

    /// Spatial families with at least one member among the elements.
    #[must_use]
    pub fn spatial(&self) -> &[&'static TopologicalFamily] {
        &self.0.spatial
    }

    /// Temporal families with at least one member among the elements.
    #[must_use]
    pub fn temporal(&self) -> &[&'static TopologicalFamily] {
        &self.0.temporal
    }

    /// Dimension names.
    #[must_use]
    pub fn names(&self) -> &BTreeSet<String> {
        &self.0.names
    }

    /// Names of required dimensions, in coordinate value order.
    pub fn required_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.required.iter().map(|d| d.name.as_str())
    }

    /// Names of implied dimensions, in coordinate value order.
    pub fn implied_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.implied.iter().map(|d| d.name.as_str())
    }

    /// True if the graph has a dimension with this name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.names.contains(name)
    }

    /// True if the graph has an element with this name.
    #[must_use]
    pub fn contains_element(&self, name: &str) -> bool {
        self.0.elements.iter().any(|e| e.name == name)
    }

    /// True if the graph has no dimensions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.dimensions.is_empty()
    }

    /// True if every dimension of `other` is in this graph.
    #[must_use]
    pub fn is_superset(&self, other: &Self) -> bool {
        other.0.names.is_subset(&self.0.names)
    }

    /// The smallest graph containing both graphs.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the graphs belong to different universes.
    pub fn union(&self, other: &Self) -> Result<Self> {
        if !std::ptr::eq(self.0.universe, other.0.universe) {
            return Err(Error::InvalidInput(
                "cannot combine graphs from different universes".into(),
            ));
        }
        self.0.universe.extract(self.0.names.union(&other.0.names))
    }

    /// Position of a dimension's value in a coordinate (required first).
    pub(crate) fn value_index(&self, name: &str) -> Option<usize> {
        self.0.value_indices.get(name).copied()
    }

    /// Picks, for each family in `space`, the preferred element present in
    /// this graph.
    pub(crate) fn family_choices(&self, space: TopologicalSpace) -> Vec<&'static str> {
        let families = match space {
            TopologicalSpace::Spatial => &self.0.spatial,
            TopologicalSpace::Temporal => &self.0.temporal,
        };
        families
            .iter()
            .filter_map(|f| f.choose(|name| self.contains_element(name)))
            .collect()
    }

    fn dimension_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.dimensions.iter().filter_map(|d| d.dimension_index)
    }
}

impl PartialEq for DimensionGraph {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (std::ptr::eq(self.0.universe, other.0.universe) && self.0.names == other.0.names)
    }
}

impl Eq for DimensionGraph {}

impl Hash for DimensionGraph {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.universe.version().hash(state);
        self.0.names.hash(state);
    }
}

impl PartialOrd for DimensionGraph {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DimensionGraph {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .universe
            .version()
            .cmp(&other.0.universe.version())
            .then_with(|| self.dimension_indices().cmp(other.dimension_indices()))
    }
}

impl fmt::Display for DimensionGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, dim) in self.0.dimensions.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", dim.name)?;
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for DimensionGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DimensionGraph{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn universe() -> &'static DimensionUniverse {
        DimensionUniverse::standard().unwrap()
    }

    #[test]
    fn extraction_is_interned() {
        let u = universe();
        let a = u.extract(["visit", "detector"]).unwrap();
        let b = u.extract(["detector", "visit", "instrument"]).unwrap();
        assert!(Arc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn implied_dimensions_are_separated() {
        let graph = universe().extract(["visit"]).unwrap();
        let required: Vec<&str> = graph.required_names().collect();
        let implied: BTreeSet<&str> = graph.implied_names().collect();
        assert_eq!(required, ["instrument", "visit"]);
        assert_eq!(
            implied,
            BTreeSet::from(["band", "physical_filter", "visit_system"])
        );
    }

    #[test]
    fn elements_include_combinations_when_covered() {
        let graph = universe().extract(["visit", "detector"]).unwrap();
        assert!(graph.contains_element("visit_detector_region"));
        assert!(!graph.contains_element("visit_definition"));
        let only_visit = universe().extract(["visit"]).unwrap();
        assert!(!only_visit.contains_element("visit_detector_region"));
    }

    #[test]
    fn families_follow_elements() {
        let graph = universe().extract(["visit", "detector"]).unwrap();
        assert_eq!(
            graph.family_choices(TopologicalSpace::Spatial),
            ["visit_detector_region"]
        );
        assert_eq!(graph.family_choices(TopologicalSpace::Temporal), ["visit"]);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let u = universe();
        for names in [vec![], vec!["patch"], vec!["visit", "detector", "htm7"]] {
            let graph = u.extract(names).unwrap();
            let bytes = graph.encode();
            assert_eq!(bytes.len(), u.encode_length());
            assert_eq!(DimensionGraph::decode(u, &bytes).unwrap(), graph);
        }
        assert!(DimensionGraph::decode(u, &[]).is_err());
    }

    #[test]
    fn unknown_dimension_is_not_found() {
        let err = universe().extract(["nonsense"]).unwrap_err();
        assert!(err.is_not_found());
        let err = universe().extract(["visit_detector_region"]).unwrap_err();
        assert!(err.is_not_found());
    }
}
