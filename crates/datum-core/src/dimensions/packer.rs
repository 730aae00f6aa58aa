//! Packing data IDs into integers.
//!
//! A packer maps coordinates that share the same values for a set of
//! "fixed" dimensions to dense non-negative integers, and back. Packer
//! classes are looked up by name in a [`PackerRegistry`] when the dimension
//! configuration is loaded, so a misspelled class fails universe
//! construction instead of the first `pack` call.

use std::collections::BTreeMap;
use std::fmt;

use super::graph::DimensionGraph;
use crate::coordinate::DataCoordinate;
use crate::error::{Error, Result};
use crate::value::{DataIdValue, Value};

/// A bijection between coordinates and integers within a fixed scope.
pub trait DimensionPacker: fmt::Debug + Send + Sync {
    /// The coordinate of the fixed dimensions.
    fn fixed(&self) -> &DataCoordinate;

    /// All dimensions this packer covers, fixed ones included.
    fn dimensions(&self) -> &DimensionGraph;

    /// Maximum number of bits in any packed value.
    fn max_bits(&self) -> u32;

    /// Packs a coordinate whose fixed values match [`fixed`](Self::fixed).
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the coordinate is outside the packer's
    /// scope or a value is out of range.
    fn pack(&self, data_id: &DataCoordinate) -> Result<u64>;

    /// Inverts [`pack`](Self::pack), returning a coordinate for
    /// [`dimensions`](Self::dimensions).
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `packed` is not a valid packed value.
    fn unpack(&self, packed: u64) -> Result<DataCoordinate>;
}

/// Constructor for one packer class: fixed coordinate (with records) and
/// packer dimensions in, packer out.
pub type PackerConstructor =
    fn(fixed: DataCoordinate, dimensions: DimensionGraph) -> Result<Box<dyn DimensionPacker>>;

/// Packer class name to constructor.
#[derive(Debug, Clone, Default)]
pub struct PackerRegistry {
    constructors: BTreeMap<String, PackerConstructor>,
}

impl PackerRegistry {
    /// A registry with no classes.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry with the built-in classes (`mixed_radix`).
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("mixed_radix", MixedRadixPacker::construct);
        registry
    }

    /// Registers (or replaces) a class.
    pub fn register(&mut self, class: impl Into<String>, constructor: PackerConstructor) {
        self.constructors.insert(class.into(), constructor);
    }

    /// Looks up a class.
    #[must_use]
    pub fn get(&self, class: &str) -> Option<PackerConstructor> {
        self.constructors.get(class).copied()
    }
}

/// A configured packer, resolved against a registry at load time.
#[derive(Debug, Clone)]
pub struct PackerFactory {
    /// Packer name.
    pub name: String,
    /// Class name.
    pub cls: String,
    /// Fixed dimension names.
    pub fixed: Vec<String>,
    /// All dimension names.
    pub dimensions: Vec<String>,
    /// Resolved constructor.
    pub constructor: PackerConstructor,
}

/// Packs the non-fixed required dimensions as digits of a mixed-radix
/// number.
///
/// Digits are taken in topological order, least significant first. The
/// radix of each digit is read from the fixed records: dimension `d` uses
/// the integer field `d_max` (an exclusive upper bound) of whichever fixed
/// element's record has it.
#[derive(Debug)]
pub struct MixedRadixPacker {
    fixed: DataCoordinate,
    dimensions: DimensionGraph,
    digits: Vec<(String, u64)>,
    max_bits: u32,
}

impl MixedRadixPacker {
    /// Builds a packer; see [`PackerConstructor`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a required `<dimension>_max` field is
    /// missing or not a positive integer, or if the packed range does not
    /// fit in 64 bits.
    pub fn construct(
        fixed: DataCoordinate,
        dimensions: DimensionGraph,
    ) -> Result<Box<dyn DimensionPacker>> {
        let mut digits = Vec::new();
        let mut total: u128 = 1;
        for dim in dimensions.required() {
            if fixed.graph().contains(dim.name()) {
                continue;
            }
            let field = format!("{}_max", dim.name());
            let max = fixed
                .graph()
                .elements()
                .iter()
                .filter_map(|e| fixed.record(e.name()).ok().flatten())
                .find_map(|record| record.get(&field).and_then(Value::as_int))
                .ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "fixed records of {fixed} have no integer field '{field}'"
                    ))
                })?;
            let max = u64::try_from(max)
                .ok()
                .filter(|m| *m > 0)
                .ok_or_else(|| Error::InvalidInput(format!("'{field}' must be positive")))?;
            total = total.saturating_mul(u128::from(max));
            digits.push((dim.name().to_string(), max));
        }
        if total > u128::from(u64::MAX) + 1 {
            return Err(Error::InvalidInput(format!(
                "packed range of {dimensions} does not fit in 64 bits"
            )));
        }
        let max_bits = if total <= 1 {
            0
        } else {
            128 - (total - 1).leading_zeros()
        };
        Ok(Box::new(Self {
            fixed,
            dimensions,
            digits,
            max_bits,
        }))
    }
}

impl DimensionPacker for MixedRadixPacker {
    fn fixed(&self) -> &DataCoordinate {
        &self.fixed
    }

    fn dimensions(&self) -> &DimensionGraph {
        &self.dimensions
    }

    fn max_bits(&self) -> u32 {
        self.max_bits
    }

    fn pack(&self, data_id: &DataCoordinate) -> Result<u64> {
        for name in self.fixed.graph().required_names() {
            if data_id.get(name) != self.fixed.get(name) {
                return Err(Error::InvalidInput(format!(
                    "{data_id} does not match fixed coordinate {}",
                    self.fixed
                )));
            }
        }
        let mut packed: u64 = 0;
        let mut stride: u64 = 1;
        for (name, max) in &self.digits {
            let value = data_id
                .get(name)
                .ok_or_else(|| Error::missing_dimension(name.clone()))?;
            let digit = value
                .as_int()
                .and_then(|v| u64::try_from(v).ok())
                .filter(|v| v < max)
                .ok_or_else(|| {
                    Error::InvalidInput(format!("{name}={value} is outside [0, {max})"))
                })?;
            packed += digit * stride;
            stride = stride.saturating_mul(*max);
        }
        Ok(packed)
    }

    fn unpack(&self, packed: u64) -> Result<DataCoordinate> {
        let mut values: BTreeMap<String, DataIdValue> = BTreeMap::new();
        for name in self.fixed.graph().required_names() {
            if let Some(value) = self.fixed.get(name) {
                values.insert(name.to_string(), value.clone());
            }
        }
        let mut rest = packed;
        for (name, max) in &self.digits {
            let digit = i64::try_from(rest % max)
                .map_err(|_| Error::InvalidInput(format!("packed value {packed} overflows")))?;
            values.insert(name.clone(), DataIdValue::Int(digit));
            rest /= max;
        }
        if rest != 0 {
            return Err(Error::InvalidInput(format!(
                "packed value {packed} exceeds the range of this packer"
            )));
        }
        let required = self
            .dimensions
            .required_names()
            .map(|name| {
                values
                    .remove(name)
                    .ok_or_else(|| Error::missing_dimension(name))
            })
            .collect::<Result<Vec<_>>>()?;
        DataCoordinate::from_required_values(&self.dimensions, required)
    }
}
