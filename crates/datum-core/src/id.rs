//! Dataset identifiers.
//!
//! Every dataset carries a ULID assigned at insertion (or preserved on
//! import). ULIDs sort by creation time, so datasets inserted later sort
//! later, and need no coordination between registry clients.
//!
//! # Example
//!
//! ```rust
//! use datum_core::id::DatasetId;
//!
//! let id = DatasetId::generate();
//! let parsed: DatasetId = id.to_string().parse().unwrap();
//! assert_eq!(id, parsed);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Unique identifier of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(Ulid);

impl DatasetId {
    /// Generates a new unique dataset ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a dataset ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the insertion timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        i64::try_from(self.0.timestamp_ms())
            .ok()
            .and_then(chrono::DateTime::from_timestamp_millis)
            .unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidInput(format!("invalid dataset ID '{s}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_id_roundtrip() {
        let id = DatasetId::generate();
        let parsed: DatasetId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(DatasetId::generate(), DatasetId::generate());
    }

    #[test]
    fn invalid_id_returns_error() {
        let result: Result<DatasetId> = "not-a-valid-ulid".parse();
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
