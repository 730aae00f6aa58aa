//! # datum-registry
//!
//! A catalog of datasets identified by data coordinates rather than paths.
//!
//! This crate builds the catalog on the dimension model and storage
//! contract of `datum-core`, providing:
//!
//! - **Collections**: RUN, TAGGED, CALIBRATION and CHAINED collections, with
//!   validity-range certification and acyclic, type-restricted chains
//! - **Datasets**: dataset types, dataset records and collection membership
//! - **Queries**: natural joins over dimension tables with spatial and
//!   temporal relationships, predicates and dataset searches
//! - **Transfers**: JSON export and transactional import
//!
//! ## Storage Layout
//!
//! ```text
//! attributes              # dimension configuration the registry was created with
//! collection, run         # collection definitions and run metadata
//! collection_chain        # ordered chain children with type restrictions
//! dataset_type, dataset   # dataset type definitions and dataset ownership
//! dimension_{element}     # one table per stored dimension element
//! tags_{dataset_type}     # RUN and TAGGED membership, keyed by data ID
//! calibs_{dataset_type}   # CALIBRATION membership with validity ranges
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use datum_core::{DimensionConfig, MemoryDatabase};
//! use datum_registry::{CollectionType, Registry};
//!
//! # fn main() -> datum_core::Result<()> {
//! let registry = Registry::create(Arc::new(MemoryDatabase::new()), &DimensionConfig::standard()?)?;
//! registry.register_collection("calibs", CollectionType::Calibration, None)?;
//! assert_eq!(registry.get_collection("calibs")?.collection_type, CollectionType::Calibration);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod collections;
pub mod config;
pub mod dataset_type;
pub mod datasets;
pub mod dimension_records;
pub mod expression;
pub mod query;
pub mod registry;
mod tables;
pub mod transfers;

// Re-export main types at crate root
pub use collections::{
    ChainLink, CollectionQuery, CollectionRecord, CollectionType, DatasetTypeRestriction,
    NamePattern, RunRecord,
};
pub use config::RegistryConfig;
pub use dataset_type::DatasetType;
pub use datasets::{DatasetAssociation, DatasetRef};
pub use dimension_records::SyncOutcome;
pub use expression::Expr;
pub use query::{DatasetHit, DatasetSearch, MaterializedQuery, Query, QueryBuilder, QueryRow};
pub use registry::{QueryOptions, Registry};
pub use transfers::{ExportItem, ImportSummary, RepoExport};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::collections::{ChainLink, CollectionQuery, CollectionType, NamePattern};
    pub use crate::dataset_type::DatasetType;
    pub use crate::datasets::DatasetRef;
    pub use crate::registry::{QueryOptions, Registry};
    pub use crate::transfers::RepoExport;
}
