//! # datum-core
//!
//! Core abstractions for the datum dataset registry.
//!
//! This crate provides the types every other datum crate builds on:
//!
//! - **Dimensions**: the [`DimensionUniverse`] built from a
//!   [`DimensionConfig`], interned [`DimensionGraph`]s, element records and
//!   packers
//! - **Data coordinates**: [`DataCoordinate`], with required-only, full, and
//!   expanded capability levels
//! - **Values**: data ID values, typed column values, [`Timespan`] and
//!   [`Region`]
//! - **Storage contract**: the [`Database`] trait, table specifications, and
//!   the in-memory [`MemoryDatabase`]
//! - **Error types** and **logging setup** shared across crates
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use datum_core::prelude::*;
//!
//! let universe = DimensionUniverse::standard()?;
//! let graph = universe.extract(["detector"])?;
//!
//! let mut values = BTreeMap::new();
//! values.insert("instrument".to_string(), DataIdValue::from("Cam1"));
//! values.insert("detector".to_string(), DataIdValue::from(1));
//! let data_id = DataCoordinate::from_mapping(&values, &graph)?;
//! assert_eq!(data_id.to_string(), "{instrument: 'Cam1', detector: 1}");
//! # Ok::<(), datum_core::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod coordinate;
pub mod database;
pub mod dimensions;
pub mod error;
pub mod id;
pub mod memory;
pub mod observability;
pub mod region;
pub mod timespan;
pub mod value;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use datum_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::coordinate::{DataCoordinate, DataIdInput, RecordMap};
    pub use crate::database::{
        ColumnSpec, Database, DatabaseExt, ExclusionSpec, Filter, Row, TableSpec,
    };
    pub use crate::dimensions::{
        DimensionConfig, DimensionElement, DimensionGraph, DimensionPacker, DimensionRecord,
        DimensionUniverse, TopologicalFamily, TopologicalSpace,
    };
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::id::DatasetId;
    pub use crate::memory::{MemoryDatabase, MemoryStore};
    pub use crate::observability::LogFormat;
    pub use crate::region::{Region, RegionOutcome};
    pub use crate::timespan::Timespan;
    pub use crate::value::{DataIdValue, FieldType, Value};
}

// Re-export key types at crate root for ergonomics
pub use coordinate::{DataCoordinate, DataIdInput, RecordMap};
pub use database::{ColumnSpec, Database, DatabaseExt, ExclusionSpec, Filter, Row, TableSpec};
pub use dimensions::{
    DimensionConfig, DimensionElement, DimensionGraph, DimensionPacker, DimensionRecord,
    DimensionUniverse, ElementKind, PackerRegistry, TopologicalFamily, TopologicalSpace,
};
pub use error::{Error, ErrorKind, Result};
pub use id::DatasetId;
pub use memory::{MemoryDatabase, MemoryStore};
pub use observability::{LogFormat, init_logging};
pub use region::{Region, RegionOutcome};
pub use timespan::Timespan;
pub use value::{DataIdValue, FieldType, Value};
