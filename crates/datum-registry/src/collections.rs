//! Collections: runs, tagged sets, calibration sets, and chains.
//!
//! A collection is a named group of datasets. The four types share a name
//! space but nothing else:
//!
//! - `RUN` collections own their datasets; every dataset has exactly one.
//! - `TAGGED` collections hold an arbitrary set of associations.
//! - `CALIBRATION` collections associate datasets with validity ranges.
//! - `CHAINED` collections are ordered searches over other collections.
//!
//! Chains may nest to any depth but never form a cycle; [`set_chain`] checks
//! this before changing anything.
//!
//! [`set_chain`]: CollectionManager::set_chain

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use datum_core::database::row;
use datum_core::{Database, DatabaseExt, Error, Filter, Result, Row, Timespan, Value};

use crate::tables::{self, get_int, get_opt_str, get_str, get_timespan, opt_str};

/// The type of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectionType {
    /// Owns datasets; append-only.
    Run,
    /// A flat set of associations.
    Tagged,
    /// Associations with validity ranges.
    Calibration,
    /// An ordered search over child collections.
    Chained,
}

impl CollectionType {
    /// Every collection type.
    pub const ALL: [Self; 4] = [Self::Run, Self::Tagged, Self::Calibration, Self::Chained];

    /// The stored name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Run => "RUN",
            Self::Tagged => "TAGGED",
            Self::Calibration => "CALIBRATION",
            Self::Chained => "CHAINED",
        }
    }
}

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidInput(format!("unknown collection type '{s}'")))
    }
}

/// Which dataset types a chain link passes through.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<BTreeSet<String>>", into = "Option<BTreeSet<String>>")]
pub enum DatasetTypeRestriction {
    /// Every dataset type.
    #[default]
    Any,
    /// Only the named dataset types.
    Names(BTreeSet<String>),
}

impl DatasetTypeRestriction {
    /// A restriction to the given dataset type names.
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Names(names.into_iter().map(Into::into).collect())
    }

    /// True if datasets of `dataset_type` pass.
    #[must_use]
    pub fn allows(&self, dataset_type: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Names(names) => names.contains(dataset_type),
        }
    }

    fn to_value(&self) -> Result<Value> {
        match self {
            Self::Any => Ok(Value::Null),
            Self::Names(names) => Ok(Value::Str(serde_json::to_string(names)?)),
        }
    }

    fn from_stored(stored: Option<&str>) -> Result<Self> {
        match stored {
            None => Ok(Self::Any),
            Some(json) => Ok(Self::Names(serde_json::from_str(json)?)),
        }
    }
}

impl From<Option<BTreeSet<String>>> for DatasetTypeRestriction {
    fn from(names: Option<BTreeSet<String>>) -> Self {
        names.map_or(Self::Any, Self::Names)
    }
}

impl From<DatasetTypeRestriction> for Option<BTreeSet<String>> {
    fn from(restriction: DatasetTypeRestriction) -> Self {
        match restriction {
            DatasetTypeRestriction::Any => None,
            DatasetTypeRestriction::Names(names) => Some(names),
        }
    }
}

/// One child of a chained collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    /// Child collection name.
    pub child: String,
    /// Dataset types searched in the child.
    #[serde(default)]
    pub restriction: DatasetTypeRestriction,
}

impl ChainLink {
    /// An unrestricted link.
    #[must_use]
    pub fn new(child: impl Into<String>) -> Self {
        Self {
            child: child.into(),
            restriction: DatasetTypeRestriction::Any,
        }
    }

    /// A link searched only for the named dataset types.
    pub fn restricted<I, S>(child: impl Into<String>, dataset_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            child: child.into(),
            restriction: DatasetTypeRestriction::names(dataset_types),
        }
    }
}

impl From<&str> for ChainLink {
    fn from(child: &str) -> Self {
        Self::new(child)
    }
}

impl From<String> for ChainLink {
    fn from(child: String) -> Self {
        Self::new(child)
    }
}

/// A registered collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRecord {
    /// Collection name.
    pub name: String,
    /// Collection type.
    pub collection_type: CollectionType,
    /// Documentation string, if set.
    pub doc: Option<String>,
}

impl CollectionRecord {
    /// Checks that this collection has one of the `expected` types.
    ///
    /// # Errors
    ///
    /// Returns `CollectionTypeMismatch` otherwise.
    pub fn require(&self, expected: &[CollectionType]) -> Result<()> {
        if expected.contains(&self.collection_type) {
            return Ok(());
        }
        Err(Error::CollectionTypeMismatch {
            collection: self.name.clone(),
            actual: self.collection_type.to_string(),
            expected: expected
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" or "),
        })
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            name: get_str(row, "name")?.to_string(),
            collection_type: get_str(row, "type")?.parse()?,
            doc: get_opt_str(row, "doc")?.map(str::to_string),
        })
    }
}

/// Metadata of a `RUN` collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    /// Run name.
    pub name: String,
    /// Host the run was produced on.
    pub host: Option<String>,
    /// When the run was produced.
    pub timespan: Option<Timespan>,
}

/// A collection name or a pattern over collection names.
#[derive(Debug, Clone)]
pub enum NamePattern {
    /// A literal name.
    Exact(String),
    /// A regular expression that must match the whole name.
    Regex(Regex),
}

impl NamePattern {
    /// Compiles a regular expression pattern, anchored at both ends.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the expression does not compile.
    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(&format!("^(?:{pattern})$"))
            .map(Self::Regex)
            .map_err(|e| Error::InvalidInput(format!("bad pattern '{pattern}': {e}")))
    }

    /// True if `name` matches.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == name,
            Self::Regex(regex) => regex.is_match(name),
        }
    }
}

impl From<&str> for NamePattern {
    fn from(name: &str) -> Self {
        Self::Exact(name.to_string())
    }
}

impl From<String> for NamePattern {
    fn from(name: String) -> Self {
        Self::Exact(name)
    }
}

/// Options for [`CollectionManager::query`].
#[derive(Debug, Clone, Default)]
pub struct CollectionQuery {
    /// Names and patterns to match; empty matches every collection.
    pub patterns: Vec<NamePattern>,
    /// Only return collections of these types.
    pub types: Option<BTreeSet<CollectionType>>,
    /// Replace chained collections by their children, recursively.
    pub flatten_chains: bool,
    /// When flattening, also return the chained collections themselves.
    pub include_chains: bool,
}

/// Collection storage over a [`Database`].
#[derive(Clone, Copy)]
pub struct CollectionManager<'a> {
    db: &'a dyn Database,
}

impl<'a> CollectionManager<'a> {
    /// Wraps a database connection.
    #[must_use]
    pub const fn new(db: &'a dyn Database) -> Self {
        Self { db }
    }

    /// Registers a collection.
    ///
    /// Returns false without writing if a collection of the same name and
    /// type already exists; this is allowed on read-only registries.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if the name is taken by a collection
    /// of another type, and `ReadOnly` if a new collection is needed on a
    /// read-only connection.
    pub fn register(
        &self,
        name: &str,
        collection_type: CollectionType,
        doc: Option<&str>,
    ) -> Result<bool> {
        if name.is_empty() {
            return Err(Error::InvalidInput("collection names cannot be empty".into()));
        }
        if let Some(existing) = self.get(name)? {
            if existing.collection_type == collection_type {
                debug!(collection = name, "collection already registered");
                return Ok(false);
            }
            return Err(Error::conflict(format!(
                "collection '{name}' exists with type {}, not {collection_type}",
                existing.collection_type
            )));
        }
        self.db.require_writeable("registering a collection")?;
        self.db.transaction(true, || {
            self.db.insert_one(
                tables::COLLECTION,
                row([
                    ("name", Value::from(name)),
                    ("type", Value::from(collection_type.as_str())),
                    ("doc", opt_str(doc)),
                ]),
            )?;
            if collection_type == CollectionType::Run {
                self.db
                    .insert_one(tables::RUN, row([("name", Value::from(name))]))?;
            }
            Ok(())
        })?;
        info!(collection = name, %collection_type, "registered collection");
        Ok(true)
    }

    /// Registers a run, recording `host` and `timespan` where given.
    ///
    /// # Errors
    ///
    /// As for [`register`](Self::register).
    pub fn register_run(
        &self,
        name: &str,
        host: Option<&str>,
        timespan: Option<Timespan>,
    ) -> Result<bool> {
        let created = self.register(name, CollectionType::Run, None)?;
        let current = self.run(name)?;
        let host = host.map(str::to_string).or(current.host.clone());
        let timespan = timespan.or(current.timespan);
        if host != current.host || timespan != current.timespan {
            self.db.require_writeable("updating run metadata")?;
            self.db.update(
                tables::RUN,
                &[Filter::eq("name", name)],
                row([("host", opt_str(host.as_deref())), ("timespan", Value::from(timespan))]),
            )?;
            return Ok(true);
        }
        Ok(created)
    }

    /// Looks up a collection.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn get(&self, name: &str) -> Result<Option<CollectionRecord>> {
        self.db
            .select_one(tables::COLLECTION, &[Filter::eq("name", name)])?
            .as_ref()
            .map(CollectionRecord::from_row)
            .transpose()
    }

    /// Looks up a collection that must exist.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` if there is none.
    pub fn find(&self, name: &str) -> Result<CollectionRecord> {
        self.get(name)?.ok_or_else(|| Error::MissingCollection {
            name: name.to_string(),
        })
    }

    /// Every collection, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn all(&self) -> Result<Vec<CollectionRecord>> {
        let mut records = self
            .db
            .select(tables::COLLECTION, &[])?
            .iter()
            .map(CollectionRecord::from_row)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Metadata of a run.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` for unknown names and
    /// `CollectionTypeMismatch` for non-run collections.
    pub fn run(&self, name: &str) -> Result<RunRecord> {
        self.find(name)?.require(&[CollectionType::Run])?;
        let stored = self
            .db
            .select_one(tables::RUN, &[Filter::eq("name", name)])?
            .ok_or_else(|| Error::internal(format!("run '{name}' has no run row")))?;
        Ok(RunRecord {
            name: name.to_string(),
            host: get_opt_str(&stored, "host")?.map(str::to_string),
            timespan: get_timespan(&stored, "timespan")?,
        })
    }

    /// Sets or clears a collection's documentation string.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` for unknown names and `ReadOnly` on a
    /// read-only connection.
    pub fn set_doc(&self, name: &str, doc: Option<&str>) -> Result<()> {
        self.find(name)?;
        self.db.require_writeable("setting collection documentation")?;
        self.db.update(
            tables::COLLECTION,
            &[Filter::eq("name", name)],
            row([("doc", opt_str(doc))]),
        )?;
        Ok(())
    }

    /// Removes a collection's own rows.
    ///
    /// The caller is responsible for any dataset associations.
    ///
    /// # Errors
    ///
    /// Returns `ReferentialIntegrity` while a chain includes the collection,
    /// and `TransactionAborted` if another connection changed collections
    /// or chains before commit.
    pub fn remove(&self, name: &str) -> Result<()> {
        self.db.require_writeable("removing a collection")?;
        self.db.transaction(true, || {
            // Chains committed elsewhere before this commit abort it.
            self.db.lock_tables(&[tables::CHAIN, tables::COLLECTION])?;
            let record = self.find(name)?;
            let parents = self.parents(name)?;
            if !parents.is_empty() {
                return Err(Error::ReferentialIntegrity {
                    message: format!(
                        "collection '{name}' is a child of {}",
                        parents.into_iter().collect::<Vec<_>>().join(", ")
                    ),
                });
            }
            match record.collection_type {
                CollectionType::Chained => {
                    self.db.delete(tables::CHAIN, &[Filter::eq("parent", name)])?;
                }
                CollectionType::Run => {
                    self.db.delete(tables::RUN, &[Filter::eq("name", name)])?;
                }
                CollectionType::Tagged | CollectionType::Calibration => {}
            }
            self.db
                .delete(tables::COLLECTION, &[Filter::eq("name", name)])?;
            Ok(())
        })?;
        info!(collection = name, "removed collection");
        Ok(())
    }

    /// Chained collections that list `child` directly.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn parents(&self, child: &str) -> Result<BTreeSet<String>> {
        self.db
            .select(tables::CHAIN, &[Filter::eq("child", child)])?
            .iter()
            .map(|r| get_str(r, "parent").map(str::to_string))
            .collect()
    }

    /// The children of a chained collection, in search order.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` for unknown names and
    /// `CollectionTypeMismatch` for non-chained collections.
    pub fn chain(&self, parent: &str) -> Result<Vec<ChainLink>> {
        self.find(parent)?.require(&[CollectionType::Chained])?;
        self.links(parent)
    }

    fn links(&self, parent: &str) -> Result<Vec<ChainLink>> {
        let mut rows = self
            .db
            .select(tables::CHAIN, &[Filter::eq("parent", parent)])?;
        rows.sort_by_key(|r| get_int(r, "position").unwrap_or(i64::MAX));
        rows.iter()
            .map(|r| {
                Ok(ChainLink {
                    child: get_str(r, "child")?.to_string(),
                    restriction: DatasetTypeRestriction::from_stored(get_opt_str(r, "restriction")?)?,
                })
            })
            .collect()
    }

    /// Replaces the children of a chained collection.
    ///
    /// With `flatten`, chained children are replaced by the non-chained
    /// collections they resolve to. Duplicate children keep their first
    /// position.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the new chain would contain a cycle,
    /// `MissingCollection` for unknown children, and
    /// `CollectionTypeMismatch` if `parent` is not chained. The existing
    /// chain is unchanged on error, including `TransactionAborted` when
    /// another connection changed collections or chains before commit.
    pub fn set_chain(&self, parent: &str, children: Vec<ChainLink>, flatten: bool) -> Result<()> {
        self.db.require_writeable("setting a collection chain")?;
        let links = self.db.transaction(true, || {
            self.db.lock_tables(&[tables::CHAIN, tables::COLLECTION])?;
            self.find(parent)?.require(&[CollectionType::Chained])?;
            let links = self.checked_links(parent, children, flatten)?;
            let rows = links
                .iter()
                .enumerate()
                .map(|(position, link)| {
                    Ok(row([
                        ("parent", Value::from(parent)),
                        ("position", Value::Int(i64::try_from(position).unwrap_or(i64::MAX))),
                        ("child", Value::from(link.child.as_str())),
                        ("restriction", link.restriction.to_value()?),
                    ]))
                })
                .collect::<Result<Vec<_>>>()?;
            self.db.delete(tables::CHAIN, &[Filter::eq("parent", parent)])?;
            self.db.insert(tables::CHAIN, rows)?;
            Ok(links)
        })?;
        info!(collection = parent, children = links.len(), "set collection chain");
        Ok(())
    }

    /// Resolves and validates new chain children against the current
    /// collections and chains.
    fn checked_links(
        &self,
        parent: &str,
        children: Vec<ChainLink>,
        flatten: bool,
    ) -> Result<Vec<ChainLink>> {
        let mut links: Vec<ChainLink> = Vec::with_capacity(children.len());
        for link in children {
            let child = self.find(&link.child)?;
            if flatten && child.collection_type == CollectionType::Chained {
                for leaf in self.resolve(std::slice::from_ref(&child.name), None)? {
                    links.push(ChainLink {
                        child: leaf.name,
                        restriction: link.restriction.clone(),
                    });
                }
            } else {
                links.push(link);
            }
        }
        let mut seen = HashSet::new();
        links.retain(|l| seen.insert(l.child.clone()));

        for link in &links {
            if self.reaches(&link.child, parent, &mut HashSet::new())? {
                return Err(Error::InvalidInput(format!(
                    "adding '{}' to chain '{parent}' would create a cycle",
                    link.child
                )));
            }
        }
        Ok(links)
    }

    fn reaches(&self, from: &str, target: &str, visited: &mut HashSet<String>) -> Result<bool> {
        if from == target {
            return Ok(true);
        }
        if !visited.insert(from.to_string()) {
            return Ok(false);
        }
        for link in self.links(from)? {
            if self.reaches(&link.child, target, visited)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Flattens a collection search path into the non-chained collections
    /// it visits, in search order, without duplicates.
    ///
    /// With a dataset type, chain links whose restriction excludes it are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` for unknown names.
    pub fn resolve(
        &self,
        names: &[String],
        dataset_type: Option<&str>,
    ) -> Result<Vec<CollectionRecord>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for name in names {
            self.resolve_into(name, dataset_type, &mut seen, &mut out)?;
        }
        Ok(out)
    }

    fn resolve_into(
        &self,
        name: &str,
        dataset_type: Option<&str>,
        seen: &mut HashSet<String>,
        out: &mut Vec<CollectionRecord>,
    ) -> Result<()> {
        let record = self.find(name)?;
        if !seen.insert(record.name.clone()) {
            return Ok(());
        }
        if record.collection_type != CollectionType::Chained {
            out.push(record);
            return Ok(());
        }
        for link in self.links(name)? {
            if dataset_type.is_some_and(|t| !link.restriction.allows(t)) {
                continue;
            }
            self.resolve_into(&link.child, dataset_type, seen, out)?;
        }
        Ok(())
    }

    /// Collections matching `query`, in pattern order (regex matches in
    /// name order), without duplicates.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` for an unknown literal name.
    pub fn query(&self, query: &CollectionQuery) -> Result<Vec<CollectionRecord>> {
        let all = self.all()?;
        let mut roots = Vec::new();
        if query.patterns.is_empty() {
            roots.clone_from(&all);
        }
        for pattern in &query.patterns {
            match pattern {
                NamePattern::Exact(name) => roots.push(self.find(name)?),
                NamePattern::Regex(_) => {
                    roots.extend(all.iter().filter(|r| pattern.matches(&r.name)).cloned());
                }
            }
        }
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for record in roots {
            self.query_into(record, query, &mut seen, &mut out)?;
        }
        Ok(out)
    }

    fn query_into(
        &self,
        record: CollectionRecord,
        query: &CollectionQuery,
        seen: &mut HashSet<String>,
        out: &mut Vec<CollectionRecord>,
    ) -> Result<()> {
        if !seen.insert(record.name.clone()) {
            return Ok(());
        }
        let wanted = query
            .types
            .as_ref()
            .map_or(true, |t| t.contains(&record.collection_type));
        if record.collection_type == CollectionType::Chained && query.flatten_chains {
            if query.include_chains && wanted {
                out.push(record.clone());
            }
            for link in self.links(&record.name)? {
                let child = self.find(&link.child)?;
                self.query_into(child, query, seen, out)?;
            }
        } else if wanted {
            out.push(record);
        }
        Ok(())
    }
}

impl fmt::Debug for CollectionManager<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionManager")
            .field("writeable", &self.db.is_writeable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datum_core::MemoryDatabase;

    fn db() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        for spec in tables::static_specs() {
            db.ensure_table(&spec).unwrap();
        }
        db
    }

    #[test]
    fn register_is_idempotent_per_type() {
        let db = db();
        let c = CollectionManager::new(&db);
        assert!(c.register("tag", CollectionType::Tagged, None).unwrap());
        assert!(!c.register("tag", CollectionType::Tagged, None).unwrap());
        let err = c.register("tag", CollectionType::Run, None).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn collection_type_names_round_trip() {
        for t in CollectionType::ALL {
            assert_eq!(t.as_str().parse::<CollectionType>().unwrap(), t);
        }
        assert_eq!("chained".parse::<CollectionType>().unwrap(), CollectionType::Chained);
        assert!("bogus".parse::<CollectionType>().is_err());
    }

    #[test]
    fn chains_resolve_in_order_with_restrictions() {
        let db = db();
        let c = CollectionManager::new(&db);
        for name in ["a", "b", "c"] {
            c.register(name, CollectionType::Run, None).unwrap();
        }
        c.register("inner", CollectionType::Chained, None).unwrap();
        c.register("outer", CollectionType::Chained, None).unwrap();
        c.set_chain("inner", vec!["b".into(), "a".into()], false).unwrap();
        c.set_chain(
            "outer",
            vec![ChainLink::restricted("c", ["flat"]), "inner".into(), "a".into()],
            false,
        )
        .unwrap();

        let names = |records: Vec<CollectionRecord>| {
            records.into_iter().map(|r| r.name).collect::<Vec<_>>()
        };
        let outer = vec!["outer".to_string()];
        assert_eq!(names(c.resolve(&outer, None).unwrap()), ["c", "b", "a"]);
        assert_eq!(names(c.resolve(&outer, Some("bias")).unwrap()), ["b", "a"]);
        assert_eq!(names(c.resolve(&outer, Some("flat")).unwrap()), ["c", "b", "a"]);
    }

    #[test]
    fn cycles_are_rejected_without_mutation() {
        let db = db();
        let c = CollectionManager::new(&db);
        c.register("run", CollectionType::Run, None).unwrap();
        c.register("x", CollectionType::Chained, None).unwrap();
        c.register("y", CollectionType::Chained, None).unwrap();
        c.set_chain("x", vec!["run".into(), "y".into()], false).unwrap();

        let err = c.set_chain("y", vec!["x".into()], false).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let err = c.set_chain("x", vec!["x".into()], false).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(c.chain("x").unwrap(), vec![ChainLink::new("run"), ChainLink::new("y")]);
        assert!(c.chain("y").unwrap().is_empty());
    }

    #[test]
    fn chain_children_block_removal() {
        let db = db();
        let c = CollectionManager::new(&db);
        c.register("run", CollectionType::Run, None).unwrap();
        c.register("chain", CollectionType::Chained, None).unwrap();
        c.set_chain("chain", vec!["run".into()], false).unwrap();

        let err = c.remove("run").unwrap_err();
        assert!(matches!(err, Error::ReferentialIntegrity { .. }));
        assert!(c.get("run").unwrap().is_some());

        c.remove("chain").unwrap();
        c.remove("run").unwrap();
        assert!(matches!(c.find("run"), Err(Error::MissingCollection { .. })));
    }

    #[test]
    fn flattened_chains_store_leaves() {
        let db = db();
        let c = CollectionManager::new(&db);
        c.register("a", CollectionType::Run, None).unwrap();
        c.register("b", CollectionType::Tagged, None).unwrap();
        c.register("inner", CollectionType::Chained, None).unwrap();
        c.register("outer", CollectionType::Chained, None).unwrap();
        c.set_chain("inner", vec!["a".into(), "b".into()], false).unwrap();
        c.set_chain("outer", vec!["inner".into(), "a".into()], true).unwrap();
        assert_eq!(c.chain("outer").unwrap(), vec![ChainLink::new("a"), ChainLink::new("b")]);
    }

    #[test]
    fn query_filters_and_flattens() {
        let db = db();
        let c = CollectionManager::new(&db);
        c.register("run1", CollectionType::Run, None).unwrap();
        c.register("run2", CollectionType::Run, None).unwrap();
        c.register("tag", CollectionType::Tagged, None).unwrap();
        c.register("chain", CollectionType::Chained, None).unwrap();
        c.set_chain("chain", vec!["tag".into(), "run1".into()], false).unwrap();

        let names = |q: CollectionQuery| {
            c.query(&q).unwrap().into_iter().map(|r| r.name).collect::<Vec<_>>()
        };
        assert_eq!(
            names(CollectionQuery {
                patterns: vec![NamePattern::regex("run.").unwrap()],
                ..CollectionQuery::default()
            }),
            ["run1", "run2"]
        );
        assert_eq!(
            names(CollectionQuery {
                patterns: vec!["chain".into()],
                flatten_chains: true,
                ..CollectionQuery::default()
            }),
            ["tag", "run1"]
        );
        assert_eq!(
            names(CollectionQuery {
                patterns: vec!["chain".into()],
                flatten_chains: true,
                include_chains: true,
                ..CollectionQuery::default()
            }),
            ["chain", "tag", "run1"]
        );
        assert_eq!(
            names(CollectionQuery {
                types: Some([CollectionType::Tagged].into()),
                ..CollectionQuery::default()
            }),
            ["tag"]
        );
        assert!(NamePattern::regex("run").unwrap().matches("run"));
        assert!(!NamePattern::regex("run").unwrap().matches("run1"));
    }

    #[test]
    fn run_metadata_and_docs() {
        let db = db();
        let c = CollectionManager::new(&db);
        c.register_run("run", Some("node1"), None).unwrap();
        assert_eq!(c.run("run").unwrap().host.as_deref(), Some("node1"));
        assert!(!c.register_run("run", None, None).unwrap());
        assert_eq!(c.run("run").unwrap().host.as_deref(), Some("node1"));

        c.set_doc("run", Some("raw ingest")).unwrap();
        assert_eq!(c.find("run").unwrap().doc.as_deref(), Some("raw ingest"));

        c.register("tag", CollectionType::Tagged, None).unwrap();
        assert!(matches!(
            c.run("tag"),
            Err(Error::CollectionTypeMismatch { .. })
        ));
    }

    #[test]
    fn restrictions_serialize_as_optional_lists() {
        let link = ChainLink::restricted("calib", ["bias"]);
        let json = serde_json::to_value(&link).unwrap();
        assert_eq!(json["restriction"], serde_json::json!(["bias"]));
        let any: ChainLink = serde_json::from_value(serde_json::json!({"child": "x"})).unwrap();
        assert_eq!(any.restriction, DatasetTypeRestriction::Any);
    }
}
