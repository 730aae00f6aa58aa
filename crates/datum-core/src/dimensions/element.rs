//! Dimension elements.

use std::cmp::Ordering;
use std::fmt;

use crate::value::FieldType;

/// What kind of element this is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementKind {
    /// An ordinary dimension with a primary key.
    Dimension,
    /// One level of a skypix pixelization system.
    SkyPix {
        /// Name of the pixelization system.
        system: String,
        /// Pixelization level.
        level: u8,
    },
    /// A join entity with a record type but no identity of its own.
    Combination,
}

/// Declaration of one record field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name.
    pub name: String,
    /// Field type.
    pub field_type: FieldType,
    /// Whether the field may be null.
    pub nullable: bool,
    /// Documentation string.
    pub doc: String,
}

impl FieldSpec {
    pub(crate) fn new(name: impl Into<String>, field_type: FieldType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable,
            doc: String::new(),
        }
    }
}

/// A dimension, skypix dimension, or combination in a universe.
///
/// Elements are owned by their universe and compare by their fixed global
/// topological index, so sorting elements always puts dependencies first.
#[derive(Debug, Clone)]
pub struct DimensionElement {
    pub(crate) name: String,
    pub(crate) doc: String,
    pub(crate) kind: ElementKind,
    pub(crate) index: usize,
    pub(crate) dimension_index: Option<usize>,
    /// Transitive requires, topologically sorted; includes the element
    /// itself for dimensions.
    pub(crate) required: Vec<String>,
    pub(crate) implied: Vec<String>,
    pub(crate) keys: Vec<FieldSpec>,
    pub(crate) metadata: Vec<FieldSpec>,
    /// Every record field, in storage order; filled in when the universe
    /// is finished.
    pub(crate) record_fields: Vec<FieldSpec>,
    pub(crate) spatial_family: Option<String>,
    pub(crate) temporal_family: Option<String>,
    pub(crate) always_join: bool,
}

impl DimensionElement {
    /// Element name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Documentation string.
    #[must_use]
    pub fn doc(&self) -> &str {
        &self.doc
    }

    /// Element kind.
    #[must_use]
    pub const fn kind(&self) -> &ElementKind {
        &self.kind
    }

    /// True for dimensions (including skypix dimensions).
    #[must_use]
    pub const fn is_dimension(&self) -> bool {
        !matches!(self.kind, ElementKind::Combination)
    }

    /// True for skypix dimensions.
    #[must_use]
    pub const fn is_skypix(&self) -> bool {
        matches!(self.kind, ElementKind::SkyPix { .. })
    }

    /// Position in the universe's topological ordering of all elements.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Position in the universe's topological ordering of dimensions.
    #[must_use]
    pub const fn dimension_index(&self) -> Option<usize> {
        self.dimension_index
    }

    /// Names of required dimensions, topologically sorted.
    #[must_use]
    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Names of directly implied dimensions.
    #[must_use]
    pub fn implied(&self) -> &[String] {
        &self.implied
    }

    /// The primary key field, for dimensions.
    #[must_use]
    pub fn primary_key(&self) -> Option<&FieldSpec> {
        self.keys.first()
    }

    /// Unique key fields (primary key first).
    #[must_use]
    pub fn keys(&self) -> &[FieldSpec] {
        &self.keys
    }

    /// Metadata fields.
    #[must_use]
    pub fn metadata(&self) -> &[FieldSpec] {
        &self.metadata
    }

    /// The spatial family this element belongs to, if any.
    #[must_use]
    pub fn spatial_family(&self) -> Option<&str> {
        self.spatial_family.as_deref()
    }

    /// The temporal family this element belongs to, if any.
    #[must_use]
    pub fn temporal_family(&self) -> Option<&str> {
        self.temporal_family.as_deref()
    }

    /// True if records carry a region.
    #[must_use]
    pub const fn is_spatial(&self) -> bool {
        self.spatial_family.is_some()
    }

    /// True if records carry a timespan.
    #[must_use]
    pub const fn is_temporal(&self) -> bool {
        self.temporal_family.is_some()
    }

    /// True if queries join this element whenever its required dimensions
    /// are present.
    #[must_use]
    pub const fn always_join(&self) -> bool {
        self.always_join
    }

    /// True if records of this element are stored in the registry.
    ///
    /// Skypix dimensions are computed, never stored.
    #[must_use]
    pub const fn has_table(&self) -> bool {
        !self.is_skypix()
    }

    /// Name of the record field holding this element's own primary key.
    #[must_use]
    pub fn primary_key_name(&self) -> Option<&str> {
        self.primary_key().map(|f| f.name.as_str())
    }

    /// Every field of this element's records.
    ///
    /// The order is: required dimension values (named after the dimension,
    /// except this element's own primary key), alternate keys, implied
    /// dimension values, metadata, then `region` and `timespan` when the
    /// element belongs to a spatial or temporal family.
    #[must_use]
    pub fn record_fields(&self) -> &[FieldSpec] {
        &self.record_fields
    }

    /// The record field that holds the value of dimension `dimension`.
    #[must_use]
    pub fn field_for_dimension<'a>(&'a self, dimension: &'a str) -> Option<&'a str> {
        if dimension == self.name {
            return self.primary_key_name();
        }
        let known = self.required.iter().chain(&self.implied).any(|d| d == dimension);
        known.then_some(dimension)
    }
}

impl PartialEq for DimensionElement {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.name == other.name
    }
}

impl Eq for DimensionElement {}

impl PartialOrd for DimensionElement {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DimensionElement {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

impl fmt::Display for DimensionElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
