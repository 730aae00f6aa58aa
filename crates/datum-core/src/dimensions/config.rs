//! Dimension configuration.
//!
//! A [`DimensionConfig`] is the serialized definition of a universe. It has
//! five sections: `version` (the cache key), `skypix` (pixelization systems
//! plus the name of the common skypix dimension), `elements`, `topology`
//! (spatial and temporal families), and `packers`.
//!
//! ```json
//! {
//!   "version": 1,
//!   "skypix": { "common": "htm7", "htm": { "class": "htm", "max_level": 7 } },
//!   "elements": {
//!     "instrument": { "keys": [{ "name": "name", "type": "string" }] },
//!     "detector": {
//!       "requires": ["instrument"],
//!       "keys": [{ "name": "id", "type": "int" }]
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::FieldType;

const STANDARD_CONFIG: &str = include_str!("../../config/dimensions.json");

/// Serialized definition of a dimension universe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DimensionConfig {
    /// Universe version; the key in the process-wide universe cache.
    pub version: u32,
    /// Skypix systems and the common skypix dimension.
    pub skypix: SkyPixConfig,
    /// Dimension elements by name.
    pub elements: BTreeMap<String, ElementConfig>,
    /// Spatial and temporal families.
    #[serde(default)]
    pub topology: TopologyConfig,
    /// Packer definitions by name.
    #[serde(default)]
    pub packers: BTreeMap<String, PackerConfig>,
}

/// The `skypix` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkyPixConfig {
    /// Name of the skypix dimension used to relate all spatial elements,
    /// e.g. `htm7`.
    pub common: String,
    /// Pixelization systems by name.
    #[serde(flatten)]
    pub systems: BTreeMap<String, SkyPixSystemConfig>,
}

/// One pixelization system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkyPixSystemConfig {
    /// Pixelization class: `htm` or `healpix`.
    pub class: String,
    /// Finest level; one dimension is created per level from 1.
    #[serde(default = "default_max_level")]
    pub max_level: u8,
}

const fn default_max_level() -> u8 {
    24
}

/// One entry of the `elements` section.
///
/// An element with at least one key is a dimension and the first key is its
/// primary key. An element without keys is a combination: it has a record
/// type but no identity of its own.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElementConfig {
    /// Documentation string.
    #[serde(default)]
    pub doc: String,
    /// Dimensions that must be known to identify this element.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Dimensions whose values this element determines.
    #[serde(default)]
    pub implies: Vec<String>,
    /// Unique key fields, primary key first.
    #[serde(default)]
    pub keys: Vec<FieldConfig>,
    /// Additional record fields.
    #[serde(default)]
    pub metadata: Vec<FieldConfig>,
    /// Join this element into every query that contains its required
    /// dimensions.
    #[serde(default)]
    pub always_join: bool,
}

/// A field declaration in a key or metadata list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldConfig {
    /// Field name.
    pub name: String,
    /// Field type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Maximum length for string fields; informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    /// Whether the field may be null. Keys are never nullable.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Documentation string.
    #[serde(default)]
    pub doc: String,
}

const fn default_nullable() -> bool {
    true
}

/// The `topology` section: family name to ordered member list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyConfig {
    /// Spatial families.
    #[serde(default)]
    pub spatial: BTreeMap<String, Vec<String>>,
    /// Temporal families.
    #[serde(default)]
    pub temporal: BTreeMap<String, Vec<String>>,
}

/// One entry of the `packers` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackerConfig {
    /// Packer class name, resolved against the packer registry at load.
    pub cls: String,
    /// Dimensions held fixed; packed integers are unique only within them.
    pub fixed: Vec<String>,
    /// All dimensions the packer covers, fixed ones included.
    pub dimensions: Vec<String>,
}

impl DimensionConfig {
    /// Parses a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the JSON does not match the configuration schema.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid dimension config: {e}")))
    }

    /// Reads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read dimension config {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// The standard configuration shipped with this crate.
    ///
    /// # Errors
    ///
    /// Returns `Config` only if the bundled file is malformed.
    pub fn standard() -> Result<Self> {
        Self::from_json(STANDARD_CONFIG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_config_parses() {
        let config = DimensionConfig::standard().unwrap();
        assert_eq!(config.skypix.common, "htm7");
        assert!(config.elements.contains_key("detector"));
        assert_eq!(config.packers["visit_detector"].cls, "mixed_radix");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = DimensionConfig::from_json(
            r#"{"version": 1, "skypix": {"common": "htm7"}, "elements": {}, "colour": 3}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn field_defaults() {
        let field: FieldConfig = serde_json::from_str(r#"{"name": "seeing", "type": "float"}"#).unwrap();
        assert!(field.nullable);
        assert_eq!(field.field_type, FieldType::Float);
    }
}
