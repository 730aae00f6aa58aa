//! The dimension system.
//!
//! A [`DimensionUniverse`] is the validated, immutable set of dimension
//! elements built from a [`DimensionConfig`]. Universes are cached per
//! config version for the life of the process; everything that refers to
//! one (graphs, elements, records) borrows it as `&'static`.
//!
//! [`DimensionGraph`]s are closed subsets of a universe's dimensions, and
//! [`DimensionRecord`]s are the metadata rows of its elements.

pub mod config;
pub mod element;
pub mod graph;
pub mod packer;
pub mod record;
pub mod topology;
pub mod universe;

pub use config::{DimensionConfig, ElementConfig, FieldConfig, PackerConfig, TopologyConfig};
pub use element::{DimensionElement, ElementKind, FieldSpec};
pub use graph::DimensionGraph;
pub use packer::{DimensionPacker, MixedRadixPacker, PackerConstructor, PackerFactory, PackerRegistry};
pub use record::DimensionRecord;
pub use topology::{PixelizationClass, SkyPixSystem, TopologicalFamily, TopologicalSpace};
pub use universe::{Directive, DimensionUniverse, UniverseBuilder};
