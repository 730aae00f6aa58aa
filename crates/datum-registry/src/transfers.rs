//! Bulk export and import of registry content.
//!
//! An export is a JSON document wrapping a list of items, each tagged with
//! its kind:
//!
//! ```json
//! {
//!   "description": "calibrations for Cam1",
//!   "version": "1.0.0",
//!   "data": [
//!     {"type": "dimension", "element": "instrument", "records": [{"name": "Cam1"}]},
//!     {"type": "collection", "collection_type": "RUN", "name": "imported_g"},
//!     {"type": "dataset_type", "name": "bias", "dimensions": ["instrument", "detector"],
//!      "storage_class": "ExposureF", "is_calibration": true},
//!     {"type": "dataset", "dataset_type": "bias", "run": "imported_g",
//!      "records": [{"dataset_id": "01J...", "data_id": {"instrument": "Cam1", "detector": 1}}]},
//!     {"type": "associations", "collection": "calibs", "collection_type": "CALIBRATION",
//!      "validity_ranges": [{"timespan": {"begin": null, "end": null}, "dataset_ids": ["01J..."]}]}
//!   ]
//! }
//! ```
//!
//! Import parses and validates the whole document before writing anything,
//! then registers and loads it inside one transaction.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use datum_core::{DataCoordinate, DataIdValue, DatasetId, DimensionRecord, Error, Result, Timespan};

use crate::collections::{ChainLink, CollectionQuery, CollectionRecord, CollectionType};
use crate::dataset_type::DatasetType;
use crate::datasets::DatasetRef;
use crate::dimension_records::SyncOutcome;
use crate::registry::Registry;

/// Version written into new exports.
pub const FORMAT_VERSION: &str = "1.0.0";

/// A complete export document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoExport {
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Format version.
    pub version: String,
    /// Items, in load order.
    pub data: Vec<ExportItem>,
}

/// One exported item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExportItem {
    /// Records of one dimension element.
    Dimension {
        /// Element name.
        element: String,
        /// Records as JSON objects keyed by field name.
        records: Vec<serde_json::Map<String, serde_json::Value>>,
    },
    /// A collection definition.
    Collection {
        /// Collection type.
        collection_type: CollectionType,
        /// Collection name.
        name: String,
        /// Run host, for RUN collections.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        /// Run timespan, for RUN collections.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timespan: Option<Timespan>,
        /// Chain children, for CHAINED collections.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        children: Vec<ChainLink>,
        /// Documentation string.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        doc: Option<String>,
    },
    /// A dataset type definition.
    DatasetType {
        /// Type name.
        name: String,
        /// Required dimension names.
        dimensions: Vec<String>,
        /// Storage class name.
        storage_class: String,
        /// Whether the type may be certified.
        #[serde(default)]
        is_calibration: bool,
    },
    /// Datasets of one type owned by one run.
    Dataset {
        /// Dataset type name.
        dataset_type: String,
        /// Owning run.
        run: String,
        /// Dataset IDs with their data IDs.
        records: Vec<ExportedDataset>,
    },
    /// Memberships of a TAGGED or CALIBRATION collection.
    Associations {
        /// Collection name.
        collection: String,
        /// Collection type; TAGGED or CALIBRATION.
        collection_type: CollectionType,
        /// TAGGED members.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        dataset_ids: Vec<DatasetId>,
        /// CALIBRATION members grouped by validity range.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        validity_ranges: Vec<ValidityRange>,
    },
}

/// One exported dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedDataset {
    /// Dataset ID, preserved on import.
    pub dataset_id: DatasetId,
    /// Required dimension values.
    pub data_id: BTreeMap<String, DataIdValue>,
}

/// Datasets certified over one validity range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityRange {
    /// Validity range.
    pub timespan: Timespan,
    /// Certified datasets.
    pub dataset_ids: Vec<DatasetId>,
}

/// Counts of what an import loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    /// Dimension records inserted (identical existing records excluded).
    pub dimension_records: usize,
    /// Collections newly registered.
    pub collections: usize,
    /// Dataset types newly registered.
    pub dataset_types: usize,
    /// Datasets inserted.
    pub datasets: usize,
    /// TAGGED associations and certifications made.
    pub associations: usize,
}

impl RepoExport {
    /// Parses an export document.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` for malformed JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes to pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if a value cannot be encoded.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Exports the matching collections, following chains to their children,
/// together with every dimension record and dataset type.
pub(crate) fn export(
    registry: &Registry,
    description: &str,
    collections: &CollectionQuery,
) -> Result<RepoExport> {
    let mut data = Vec::new();

    let storage = registry.dimension_records();
    for element in registry.universe().elements().iter().filter(|e| e.has_table()) {
        let records = storage.fetch(element.name(), &BTreeMap::new())?;
        if !records.is_empty() {
            data.push(ExportItem::Dimension {
                element: element.name().to_string(),
                records: records.iter().map(DimensionRecord::to_json).collect(),
            });
        }
    }

    let query = CollectionQuery {
        flatten_chains: true,
        include_chains: true,
        ..collections.clone()
    };
    let selected = registry.collections().query(&query)?;
    for record in &selected {
        data.push(collection_item(registry, record)?);
    }

    let dataset_types = registry.dataset_types().query(None)?;
    for dataset_type in &dataset_types {
        data.push(ExportItem::DatasetType {
            name: dataset_type.name().to_string(),
            dimensions: dataset_type
                .dimensions()
                .required_names()
                .map(str::to_string)
                .collect(),
            storage_class: dataset_type.storage_class().to_string(),
            is_calibration: dataset_type.is_calibration(),
        });
    }

    let datasets = registry.datasets();
    let mut exported: HashSet<DatasetId> = HashSet::new();
    for run in selected.iter().filter(|r| r.collection_type == CollectionType::Run) {
        for dataset_type in &dataset_types {
            let records: Vec<ExportedDataset> = datasets
                .memberships(dataset_type, run)?
                .into_iter()
                .map(|m| ExportedDataset {
                    dataset_id: m.id,
                    data_id: m.key,
                })
                .collect();
            if records.is_empty() {
                continue;
            }
            exported.extend(records.iter().map(|r| r.dataset_id));
            data.push(ExportItem::Dataset {
                dataset_type: dataset_type.name().to_string(),
                run: run.name.clone(),
                records,
            });
        }
    }

    for record in &selected {
        match record.collection_type {
            CollectionType::Tagged => {
                let mut dataset_ids = Vec::new();
                for dataset_type in &dataset_types {
                    dataset_ids.extend(
                        datasets
                            .memberships(dataset_type, record)?
                            .into_iter()
                            .map(|m| m.id)
                            .filter(|id| exported.contains(id)),
                    );
                }
                if !dataset_ids.is_empty() {
                    data.push(ExportItem::Associations {
                        collection: record.name.clone(),
                        collection_type: CollectionType::Tagged,
                        dataset_ids,
                        validity_ranges: Vec::new(),
                    });
                }
            }
            CollectionType::Calibration => {
                let mut validity_ranges: Vec<ValidityRange> = Vec::new();
                for dataset_type in dataset_types.iter().filter(|t| t.is_calibration()) {
                    for membership in datasets.memberships(dataset_type, record)? {
                        let Some(timespan) = membership.validity else {
                            continue;
                        };
                        if !exported.contains(&membership.id) {
                            continue;
                        }
                        match validity_ranges.iter_mut().find(|r| r.timespan == timespan) {
                            Some(range) => range.dataset_ids.push(membership.id),
                            None => validity_ranges.push(ValidityRange {
                                timespan,
                                dataset_ids: vec![membership.id],
                            }),
                        }
                    }
                }
                if !validity_ranges.is_empty() {
                    data.push(ExportItem::Associations {
                        collection: record.name.clone(),
                        collection_type: CollectionType::Calibration,
                        dataset_ids: Vec::new(),
                        validity_ranges,
                    });
                }
            }
            CollectionType::Run | CollectionType::Chained => {}
        }
    }

    info!(items = data.len(), datasets = exported.len(), "exported registry content");
    Ok(RepoExport {
        description: description.to_string(),
        version: FORMAT_VERSION.to_string(),
        data,
    })
}

fn collection_item(registry: &Registry, record: &CollectionRecord) -> Result<ExportItem> {
    let (host, timespan) = if record.collection_type == CollectionType::Run {
        let run = registry.collections().run(&record.name)?;
        (run.host, run.timespan)
    } else {
        (None, None)
    };
    let children = if record.collection_type == CollectionType::Chained {
        registry.collections().chain(&record.name)?
    } else {
        Vec::new()
    };
    Ok(ExportItem::Collection {
        collection_type: record.collection_type,
        name: record.name.clone(),
        host,
        timespan,
        children,
        doc: record.doc.clone(),
    })
}

struct NewCollection {
    collection_type: CollectionType,
    name: String,
    host: Option<String>,
    timespan: Option<Timespan>,
    doc: Option<String>,
}

/// A validated export, ready to load.
#[derive(Default)]
struct ImportPlan {
    dimension_records: Vec<DimensionRecord>,
    collections: Vec<NewCollection>,
    chains: Vec<(String, Vec<ChainLink>)>,
    dataset_types: Vec<DatasetType>,
    datasets: Vec<DatasetRef>,
    tagged: Vec<(String, Vec<DatasetId>)>,
    certified: Vec<(String, Timespan, Vec<DatasetId>)>,
}

fn check_version(version: &str) -> Result<()> {
    let major = |v: &str| v.split('.').next().map(str::to_string);
    if major(version) == major(FORMAT_VERSION) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "unsupported export format version '{version}' (expected {FORMAT_VERSION})"
        )))
    }
}

fn plan(registry: &Registry, export: &RepoExport) -> Result<ImportPlan> {
    check_version(&export.version)?;
    let universe = registry.universe();
    let mut plan = ImportPlan::default();

    for item in &export.data {
        match item {
            ExportItem::Dimension { element, records } => {
                let element = universe.element(element)?;
                for object in records {
                    plan.dimension_records
                        .push(DimensionRecord::from_json(element, object)?);
                }
            }
            ExportItem::Collection {
                collection_type,
                name,
                host,
                timespan,
                children,
                doc,
            } => {
                if *collection_type == CollectionType::Chained {
                    plan.chains.push((name.clone(), children.clone()));
                } else if !children.is_empty() {
                    return Err(Error::InvalidInput(format!(
                        "{collection_type} collection '{name}' cannot have children"
                    )));
                }
                plan.collections.push(NewCollection {
                    collection_type: *collection_type,
                    name: name.clone(),
                    host: host.clone(),
                    timespan: *timespan,
                    doc: doc.clone(),
                });
            }
            ExportItem::DatasetType {
                name,
                dimensions,
                storage_class,
                is_calibration,
            } => {
                let mut dataset_type =
                    DatasetType::new(name.clone(), universe.extract(dimensions)?, storage_class.clone())?;
                if *is_calibration {
                    dataset_type = dataset_type.calibration();
                }
                plan.dataset_types.push(dataset_type);
            }
            ExportItem::Dataset { .. } => {}
            ExportItem::Associations {
                collection,
                collection_type,
                dataset_ids,
                validity_ranges,
            } => match collection_type {
                CollectionType::Tagged => {
                    plan.tagged.push((collection.clone(), dataset_ids.clone()));
                }
                CollectionType::Calibration => {
                    for range in validity_ranges {
                        plan.certified.push((
                            collection.clone(),
                            range.timespan,
                            range.dataset_ids.clone(),
                        ));
                    }
                }
                other => {
                    return Err(Error::InvalidInput(format!(
                        "associations cannot target {other} collection '{collection}'"
                    )))
                }
            },
        }
    }

    // Datasets may reference types defined anywhere in the document.
    for item in &export.data {
        let ExportItem::Dataset {
            dataset_type,
            run,
            records,
        } = item
        else {
            continue;
        };
        let dataset_type = match plan.dataset_types.iter().find(|t| t.name() == dataset_type) {
            Some(t) => t.clone(),
            None => registry.dataset_types().find(dataset_type)?,
        };
        for record in records {
            plan.datasets.push(DatasetRef {
                id: record.dataset_id,
                dataset_type: dataset_type.clone(),
                data_id: DataCoordinate::from_mapping(&record.data_id, dataset_type.dimensions())?,
                run: run.clone(),
            });
        }
    }

    let known: HashSet<DatasetId> = plan.datasets.iter().map(|d| d.id).collect();
    let referenced = plan
        .tagged
        .iter()
        .flat_map(|(_, ids)| ids)
        .chain(plan.certified.iter().flat_map(|(_, _, ids)| ids));
    for id in referenced {
        if !known.contains(id) && registry.datasets().get(*id)?.is_none() {
            return Err(Error::InvalidInput(format!(
                "associations reference unknown dataset {id}"
            )));
        }
    }
    debug!(
        records = plan.dimension_records.len(),
        collections = plan.collections.len(),
        datasets = plan.datasets.len(),
        "validated import"
    );
    Ok(plan)
}

/// Validates an export, then loads it in one transaction.
pub(crate) fn import(registry: &Registry, export: &RepoExport) -> Result<ImportSummary> {
    let plan = plan(registry, export)?;
    let summary = registry.transaction(true, || load(registry, &plan))?;
    info!(
        dimension_records = summary.dimension_records,
        collections = summary.collections,
        dataset_types = summary.dataset_types,
        datasets = summary.datasets,
        associations = summary.associations,
        "imported registry content"
    );
    Ok(summary)
}

fn load(registry: &Registry, plan: &ImportPlan) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();

    for dataset_type in &plan.dataset_types {
        if registry.register_dataset_type(dataset_type)? {
            summary.dataset_types += 1;
        }
    }
    for collection in &plan.collections {
        let created = if collection.collection_type == CollectionType::Run {
            registry.register_run(&collection.name, collection.host.as_deref(), collection.timespan)?
        } else {
            registry.register_collection(&collection.name, collection.collection_type, None)?
        };
        if collection.doc.is_some() {
            registry.set_collection_documentation(&collection.name, collection.doc.as_deref())?;
        }
        if created {
            summary.collections += 1;
        }
    }
    for (parent, children) in &plan.chains {
        registry.set_collection_chain(parent, children.clone(), false)?;
    }

    for record in &plan.dimension_records {
        if registry.sync_dimension_data(record, false)? == SyncOutcome::Inserted {
            summary.dimension_records += 1;
        }
    }

    let imported = registry.import_datasets(&plan.datasets)?;
    summary.datasets = imported.len();
    let mut refs: HashMap<DatasetId, DatasetRef> =
        imported.into_iter().map(|r| (r.id, r)).collect();
    let mut resolve = |ids: &[DatasetId]| -> Result<Vec<DatasetRef>> {
        ids.iter()
            .map(|id| {
                if let Some(found) = refs.get(id) {
                    return Ok(found.clone());
                }
                let found = registry
                    .get_dataset(*id)?
                    .ok_or_else(|| Error::resource_not_found("dataset", id))?;
                refs.insert(*id, found.clone());
                Ok(found)
            })
            .collect()
    };

    for (collection, ids) in &plan.tagged {
        registry.associate(collection, &resolve(ids)?)?;
        summary.associations += ids.len();
    }
    for (collection, timespan, ids) in &plan.certified {
        registry.certify(collection, &resolve(ids)?, *timespan)?;
        summary.associations += ids.len();
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_are_tagged_by_kind() {
        let json = r#"{
            "description": "tiny",
            "version": "1.0.0",
            "data": [
                {"type": "collection", "collection_type": "CHAINED", "name": "defaults",
                 "children": [{"child": "calibs", "restriction": ["bias"]}]},
                {"type": "dataset_type", "name": "bias",
                 "dimensions": ["instrument", "detector"], "storage_class": "ExposureF",
                 "is_calibration": true}
            ]
        }"#;
        let export = RepoExport::from_json(json).unwrap();
        assert_eq!(export.data.len(), 2);
        match &export.data[0] {
            ExportItem::Collection {
                collection_type,
                children,
                host,
                ..
            } => {
                assert_eq!(*collection_type, CollectionType::Chained);
                assert_eq!(children[0], ChainLink::restricted("calibs", ["bias"]));
                assert!(host.is_none());
            }
            other => panic!("unexpected item {other:?}"),
        }
        let reparsed = RepoExport::from_json(&export.to_json().unwrap()).unwrap();
        assert_eq!(reparsed, export);
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let json = r#"{"version": "1.0.0", "data": [{"type": "file", "path": "x"}]}"#;
        assert!(RepoExport::from_json(json).is_err());
    }

    #[test]
    fn other_major_versions_are_rejected() {
        assert!(check_version("1.2.0").is_ok());
        assert!(matches!(check_version("2.0.0"), Err(Error::InvalidInput(_))));
    }
}
