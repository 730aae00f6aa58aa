//! Pre-built test fixtures for common test scenarios.
//!
//! Provides a registry over an in-memory store and loaders for a small,
//! fixed data set: one instrument (`Cam1`) with four detectors, two visits
//! built from four exposures, one skymap, and two runs of calibration
//! datasets.
//!
//! Regions are pixel envelopes in `htm7`. Visit 1 and its detector regions
//! lie inside patch 0; visit 2 and its detector regions lie inside patch 2.
//! Patches 1 and 3 overlap no observation.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};

use datum_core::{
    DataCoordinate, DataIdValue, DimensionRecord, DimensionUniverse, MemoryStore, Region, Result,
    Timespan, Value,
};
use datum_registry::{DatasetRef, DatasetType, Registry, RegistryConfig};

/// Name of the fixture instrument.
pub const INSTRUMENT: &str = "Cam1";
/// Name of the fixture skymap.
pub const SKYMAP: &str = "SkyMap1";
/// First `htm7` pixel index used by fixture regions.
pub const PIXEL_BASE: u64 = 131_072;

/// Test context with a writeable registry over a fresh store.
pub struct TestContext {
    /// Shared committed state.
    pub store: MemoryStore,
    /// Writeable registry over `store`, using the standard universe.
    pub registry: Registry,
}

impl TestContext {
    /// Creates a context with an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let registry =
            Registry::connect(&store, &RegistryConfig::default()).expect("create registry");
        Self { store, registry }
    }

    /// Creates a context with [`load_base_data`] applied.
    #[must_use]
    pub fn with_base_data() -> Self {
        let ctx = Self::new();
        load_base_data(&ctx.registry).expect("load base data");
        ctx
    }

    /// Opens a second, read-only registry over the same store.
    #[must_use]
    pub fn read_only(&self) -> Registry {
        let config = RegistryConfig {
            writeable: false,
            ..RegistryConfig::default()
        };
        Registry::connect(&self.store, &config).expect("open read-only registry")
    }

    /// The registry's universe.
    #[must_use]
    pub fn universe(&self) -> &'static DimensionUniverse {
        self.registry.universe()
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Calibration datasets written by [`load_datasets`].
#[derive(Debug, Clone)]
pub struct ImportedCalibrations {
    /// `bias` for detectors 1, 2 and 3 in run `imported_g`.
    pub bias_g: Vec<DatasetRef>,
    /// `bias` for detectors 2, 3 and 4 in run `imported_r`.
    pub bias_r: Vec<DatasetRef>,
    /// `flat` for `Cam1-G` and detectors 2 and 3 in run `imported_g`.
    pub flat_g: Vec<DatasetRef>,
    /// `flat` for `Cam1-R2` and detectors 3 and 4 in run `imported_r`.
    pub flat_r: Vec<DatasetRef>,
}

impl ImportedCalibrations {
    /// Every dataset, bias first.
    #[must_use]
    pub fn all(&self) -> Vec<DatasetRef> {
        self.bias_g
            .iter()
            .chain(&self.bias_r)
            .chain(&self.flat_g)
            .chain(&self.flat_r)
            .cloned()
            .collect()
    }

    /// Every bias dataset.
    #[must_use]
    pub fn bias(&self) -> Vec<DatasetRef> {
        self.bias_g.iter().chain(&self.bias_r).cloned().collect()
    }
}

/// A fixed UTC instant on the fixture night, `hour` hours after midnight.
#[must_use]
pub fn t(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 9, 9, 0, 0, 0).unwrap() + chrono::Duration::hours(i64::from(hour))
}

/// A timespan between fixture hours; `None` leaves that side unbounded.
#[must_use]
pub fn span(begin: Option<u32>, end: Option<u32>) -> Timespan {
    Timespan::new(begin.map(t), end.map(t)).expect("valid timespan")
}

/// A data ID over the dimensions named in `pairs`, in the standard universe.
#[must_use]
pub fn data_id(pairs: &[(&str, DataIdValue)]) -> DataCoordinate {
    let universe = DimensionUniverse::standard().expect("standard universe");
    let mapping: BTreeMap<String, DataIdValue> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect();
    DataCoordinate::infer(universe, &mapping).expect("valid data ID")
}

/// A `Cam1` detector data ID.
#[must_use]
pub fn detector_id(detector: i64) -> DataCoordinate {
    data_id(&[
        ("instrument", INSTRUMENT.into()),
        ("detector", detector.into()),
    ])
}

/// Builds a record of `element` from field pairs.
#[must_use]
pub fn record(
    universe: &'static DimensionUniverse,
    element: &str,
    fields: &[(&str, Value)],
) -> DimensionRecord {
    DimensionRecord::new(
        universe.element(element).expect("known element"),
        fields.iter().map(|(k, v)| ((*k).to_string(), v.clone())),
    )
    .expect("valid record")
}

/// A region covering `count` pixels starting `offset` pixels past
/// [`PIXEL_BASE`].
#[must_use]
pub fn pixels(offset: u64, count: u64) -> Region {
    Region::from_ranges([(PIXEL_BASE + offset, PIXEL_BASE + offset + count)]).expect("region")
}

/// Instrument, bands, physical filters and detectors.
#[must_use]
pub fn base_records(universe: &'static DimensionUniverse) -> Vec<DimensionRecord> {
    let mut records = vec![
        record(
            universe,
            "instrument",
            &[
                ("name", INSTRUMENT.into()),
                ("visit_max", Value::Int(1024)),
                ("exposure_max", Value::Int(4096)),
                ("detector_max", Value::Int(8)),
                ("class_name", "datum.instrument.Cam1".into()),
            ],
        ),
        record(universe, "band", &[("name", "g".into())]),
        record(universe, "band", &[("name", "r".into())]),
    ];
    for (filter, band) in [("Cam1-G", "g"), ("Cam1-R1", "r"), ("Cam1-R2", "r")] {
        records.push(record(
            universe,
            "physical_filter",
            &[
                ("instrument", INSTRUMENT.into()),
                ("name", filter.into()),
                ("band", band.into()),
            ],
        ));
    }
    for (id, raft, name, purpose) in [
        (1, "A", "a", "SCIENCE"),
        (2, "A", "b", "SCIENCE"),
        (3, "B", "a", "SCIENCE"),
        (4, "B", "b", "WAVEFRONT"),
    ] {
        records.push(record(
            universe,
            "detector",
            &[
                ("instrument", INSTRUMENT.into()),
                ("id", Value::Int(id)),
                ("full_name", format!("{raft}{name}").into()),
                ("raft", raft.into()),
                ("name_in_raft", name.into()),
                ("purpose", purpose.into()),
            ],
        ));
    }
    records
}

/// Inserts [`base_records`].
pub fn load_base_data(registry: &Registry) -> Result<()> {
    registry.insert_dimension_data(&base_records(registry.universe()), false)
}

/// Visit system, exposures, visits, visit regions, and the skymap.
///
/// Exposures 100 and 101 (`Cam1-G`) make up visit 1 and cover hours 1 to 3;
/// exposures 110 and 111 (`Cam1-R1`) make up visit 2 and cover hours 5 to 7.
#[must_use]
pub fn observation_records(universe: &'static DimensionUniverse) -> Vec<DimensionRecord> {
    let mut records = vec![record(
        universe,
        "visit_system",
        &[
            ("instrument", INSTRUMENT.into()),
            ("id", Value::Int(0)),
            ("name", "one-to-one".into()),
        ],
    )];
    for (id, filter, begin) in [
        (100, "Cam1-G", 1),
        (101, "Cam1-G", 2),
        (110, "Cam1-R1", 5),
        (111, "Cam1-R1", 6),
    ] {
        records.push(record(
            universe,
            "exposure",
            &[
                ("instrument", INSTRUMENT.into()),
                ("id", Value::Int(id)),
                ("obs_id", format!("CAM1_{id:06}").into()),
                ("physical_filter", filter.into()),
                ("exposure_time", Value::Float(30.0)),
                ("observation_type", "science".into()),
                ("timespan", span(Some(begin), Some(begin + 1)).into()),
            ],
        ));
    }
    for (id, name, filter, begin, offset, seeing) in [
        (1, "one", "Cam1-G", 1, 0, 0.8),
        (2, "two", "Cam1-R1", 5, 100, 1.3),
    ] {
        records.push(record(
            universe,
            "visit",
            &[
                ("instrument", INSTRUMENT.into()),
                ("id", Value::Int(id)),
                ("name", name.into()),
                ("physical_filter", filter.into()),
                ("visit_system", Value::Int(0)),
                ("exposure_time", Value::Float(60.0)),
                ("seeing", Value::Float(seeing)),
                ("region", pixels(offset, 20).into()),
                ("timespan", span(Some(begin), Some(begin + 2)).into()),
            ],
        ));
        for detector in 1..=4_u64 {
            records.push(record(
                universe,
                "visit_detector_region",
                &[
                    ("instrument", INSTRUMENT.into()),
                    ("visit", Value::Int(id)),
                    ("detector", Value::Int(i64::try_from(detector).unwrap())),
                    ("region", pixels(offset + (detector - 1) * 5, 5).into()),
                ],
            ));
        }
    }
    for (exposure, visit) in [(100, 1), (101, 1), (110, 2), (111, 2)] {
        records.push(record(
            universe,
            "visit_definition",
            &[
                ("instrument", INSTRUMENT.into()),
                ("exposure", Value::Int(exposure)),
                ("visit", Value::Int(visit)),
            ],
        ));
    }
    records.push(record(
        universe,
        "skymap",
        &[
            ("name", SKYMAP.into()),
            ("tract_max", Value::Int(10)),
            ("patch_max", Value::Int(4)),
        ],
    ));
    records.push(record(
        universe,
        "tract",
        &[
            ("skymap", SKYMAP.into()),
            ("id", Value::Int(0)),
            ("region", pixels(0, 200).into()),
        ],
    ));
    for patch in 0..4_u64 {
        let id = i64::try_from(patch).unwrap();
        records.push(record(
            universe,
            "patch",
            &[
                ("skymap", SKYMAP.into()),
                ("tract", Value::Int(0)),
                ("id", Value::Int(id)),
                ("cell_x", Value::Int(id % 2)),
                ("cell_y", Value::Int(id / 2)),
                ("region", pixels(patch * 50, 50).into()),
            ],
        ));
    }
    records
}

/// Inserts [`observation_records`]; requires [`load_base_data`].
pub fn load_observations(registry: &Registry) -> Result<()> {
    registry.insert_dimension_data(&observation_records(registry.universe()), false)
}

/// The `bias` calibration type: `(instrument, detector)`.
#[must_use]
pub fn bias_type(universe: &'static DimensionUniverse) -> DatasetType {
    DatasetType::new(
        "bias",
        universe.extract(["instrument", "detector"]).expect("graph"),
        "ExposureF",
    )
    .expect("dataset type")
    .calibration()
}

/// The `flat` calibration type: `(instrument, detector, physical_filter)`.
#[must_use]
pub fn flat_type(universe: &'static DimensionUniverse) -> DatasetType {
    DatasetType::new(
        "flat",
        universe
            .extract(["instrument", "detector", "physical_filter"])
            .expect("graph"),
        "ExposureF",
    )
    .expect("dataset type")
    .calibration()
}

/// Registers `bias` and `flat` and fills runs `imported_g` and
/// `imported_r`; requires [`load_base_data`].
pub fn load_datasets(registry: &Registry) -> Result<ImportedCalibrations> {
    let universe = registry.universe();
    registry.register_dataset_type(&bias_type(universe))?;
    registry.register_dataset_type(&flat_type(universe))?;
    registry.register_run("imported_g", None, None)?;
    registry.register_run("imported_r", None, None)?;

    let flat_id = |filter: &str, detector: i64| {
        data_id(&[
            ("instrument", INSTRUMENT.into()),
            ("detector", detector.into()),
            ("physical_filter", filter.into()),
        ])
    };
    let bias_g = registry.insert_datasets(
        "bias",
        &[detector_id(1), detector_id(2), detector_id(3)],
        "imported_g",
    )?;
    let bias_r = registry.insert_datasets(
        "bias",
        &[detector_id(2), detector_id(3), detector_id(4)],
        "imported_r",
    )?;
    let flat_g = registry.insert_datasets(
        "flat",
        &[flat_id("Cam1-G", 2), flat_id("Cam1-G", 3)],
        "imported_g",
    )?;
    let flat_r = registry.insert_datasets(
        "flat",
        &[flat_id("Cam1-R2", 3), flat_id("Cam1-R2", 4)],
        "imported_r",
    )?;
    Ok(ImportedCalibrations {
        bias_g,
        bias_r,
        flat_g,
        flat_r,
    })
}
