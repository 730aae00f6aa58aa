//! In-memory [`Database`] implementation.
//!
//! A [`MemoryStore`] holds the committed tables; each [`MemoryDatabase`] is
//! a connection to it. A transaction works on a private copy of the tables
//! and records every write in a log. Commit replays the log against the
//! latest committed tables under the store lock, so constraints are checked
//! against whatever other connections committed in the meantime.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::database::{Database, DatabaseExt, Filter, Row, TableSpec};
use crate::error::{Error, Result};
use crate::value::Value;

#[derive(Debug, Clone)]
struct Table {
    spec: TableSpec,
    rows: Vec<Row>,
    version: u64,
}

type Tables = BTreeMap<String, Table>;

#[derive(Debug, Default)]
struct Committed {
    tables: Tables,
    version: u64,
}

/// Shared committed state for any number of connections.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Committed>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a connection.
    #[must_use]
    pub fn connect(&self, writeable: bool) -> MemoryDatabase {
        MemoryDatabase {
            store: self.clone(),
            writeable,
            conn: Mutex::new(Connection::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Committed>> {
        self.inner
            .lock()
            .map_err(|_| Error::internal("memory store lock poisoned"))
    }
}

#[derive(Debug, Clone)]
enum Op {
    EnsureTable(TableSpec),
    Insert(String, Vec<Row>),
    Replace(String, Vec<Row>),
    Ensure(String, Vec<Row>),
    Delete(String, Vec<Filter>),
    Update(String, Vec<Filter>, Row),
}

impl Op {
    fn table(&self) -> &str {
        match self {
            Self::EnsureTable(spec) => &spec.name,
            Self::Insert(t, _)
            | Self::Replace(t, _)
            | Self::Ensure(t, _)
            | Self::Delete(t, _)
            | Self::Update(t, _, _) => t,
        }
    }
}

#[derive(Debug)]
enum Frame {
    Root,
    Joined,
    Savepoint { working: Tables, log_len: usize },
}

#[derive(Debug)]
struct Transaction {
    working: Tables,
    log: Vec<Op>,
    frames: Vec<Frame>,
    locked: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct Connection {
    txn: Option<Transaction>,
    temporary: Tables,
    temporary_count: u64,
}

/// A connection to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryDatabase {
    store: MemoryStore,
    writeable: bool,
    conn: Mutex<Connection>,
}

impl MemoryDatabase {
    /// A writeable connection to a fresh store.
    #[must_use]
    pub fn new() -> Self {
        MemoryStore::new().connect(true)
    }

    /// The store this connection belongs to.
    #[must_use]
    pub const fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::internal("memory connection lock poisoned"))
    }

    fn execute(&self, op: Op) -> Result<usize> {
        let mut conn = self.connection()?;
        if let Some(table) = conn.temporary.get_mut(op.table()) {
            return apply_to_table(table, &op);
        }
        self.require_writeable(&format!("writing table '{}'", op.table()))?;
        if let Some(txn) = conn.txn.as_mut() {
            let count = apply(&mut txn.working, &op)?;
            txn.log.push(op);
            return Ok(count);
        }
        let mut store = self.store.lock()?;
        let count = apply(&mut store.tables, &op)?;
        store.version += 1;
        let version = store.version;
        if let Some(table) = store.tables.get_mut(op.table()) {
            table.version = version;
        }
        Ok(count)
    }

    fn read<T>(&self, table: &str, f: impl FnOnce(&Table) -> T) -> Result<T> {
        let conn = self.connection()?;
        if let Some(t) = conn.temporary.get(table) {
            return Ok(f(t));
        }
        if let Some(txn) = &conn.txn {
            return txn
                .working
                .get(table)
                .map(f)
                .ok_or_else(|| Error::resource_not_found("table", table));
        }
        let store = self.store.lock()?;
        store
            .tables
            .get(table)
            .map(f)
            .ok_or_else(|| Error::resource_not_found("table", table))
    }

    fn commit_root(&self, txn: Transaction) -> Result<()> {
        let mut store = self.store.lock()?;
        for (name, seen) in &txn.locked {
            let current = store.tables.get(name).map_or(0, |t| t.version);
            if current != *seen {
                warn!(table = %name, "locked table changed before commit");
                return Err(Error::TransactionAborted {
                    message: format!("table '{name}' was modified by another connection"),
                });
            }
        }
        let mut next = store.tables.clone();
        let mut touched = BTreeSet::new();
        for op in &txn.log {
            apply(&mut next, op)?;
            touched.insert(op.table().to_string());
        }
        store.version += 1;
        let version = store.version;
        for name in &touched {
            if let Some(table) = next.get_mut(name) {
                table.version = version;
            }
        }
        store.tables = next;
        debug!(ops = txn.log.len(), tables = touched.len(), "committed transaction");
        Ok(())
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl Database for MemoryDatabase {
    fn is_writeable(&self) -> bool {
        self.writeable
    }

    fn ensure_table(&self, spec: &TableSpec) -> Result<bool> {
        spec.validate()?;
        match self.read(&spec.name, |t| t.spec == *spec) {
            Ok(true) => return Ok(false),
            Ok(false) => {
                return Err(Error::conflict(format!(
                    "table '{}' exists with a different definition",
                    spec.name
                )))
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        self.execute(Op::EnsureTable(spec.clone()))?;
        Ok(true)
    }

    fn table_spec(&self, table: &str) -> Result<TableSpec> {
        self.read(table, |t| t.spec.clone())
    }

    fn insert(&self, table: &str, rows: Vec<Row>) -> Result<()> {
        self.execute(Op::Insert(table.to_string(), rows)).map(|_| ())
    }

    fn replace(&self, table: &str, rows: Vec<Row>) -> Result<()> {
        self.execute(Op::Replace(table.to_string(), rows)).map(|_| ())
    }

    fn ensure(&self, table: &str, rows: Vec<Row>) -> Result<usize> {
        self.execute(Op::Ensure(table.to_string(), rows))
    }

    fn delete(&self, table: &str, filters: &[Filter]) -> Result<usize> {
        self.execute(Op::Delete(table.to_string(), filters.to_vec()))
    }

    fn update(&self, table: &str, filters: &[Filter], values: Row) -> Result<usize> {
        self.execute(Op::Update(table.to_string(), filters.to_vec(), values))
    }

    fn select(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>> {
        self.read(table, |t| {
            t.rows
                .iter()
                .filter(|r| Filter::all(filters, r))
                .cloned()
                .collect()
        })
    }

    fn begin(&self, savepoint: bool) -> Result<()> {
        let mut conn = self.connection()?;
        match conn.txn.as_mut() {
            Some(txn) if savepoint => {
                let frame = Frame::Savepoint {
                    working: txn.working.clone(),
                    log_len: txn.log.len(),
                };
                txn.frames.push(frame);
            }
            Some(txn) => txn.frames.push(Frame::Joined),
            None => {
                let working = self.store.lock()?.tables.clone();
                conn.txn = Some(Transaction {
                    working,
                    log: Vec::new(),
                    frames: vec![Frame::Root],
                    locked: BTreeMap::new(),
                });
            }
        }
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut conn = self.connection()?;
        let txn = conn
            .txn
            .as_mut()
            .ok_or_else(|| Error::internal("commit without an open transaction"))?;
        match txn.frames.pop() {
            Some(Frame::Root) => {}
            Some(_) => return Ok(()),
            None => return Err(Error::internal("transaction has no open scope")),
        }
        match conn.txn.take() {
            Some(txn) => self.commit_root(txn),
            None => Ok(()),
        }
    }

    fn rollback(&self) -> Result<()> {
        let mut conn = self.connection()?;
        let txn = conn
            .txn
            .as_mut()
            .ok_or_else(|| Error::internal("rollback without an open transaction"))?;
        match txn.frames.pop() {
            Some(Frame::Savepoint { working, log_len }) => {
                txn.working = working;
                txn.log.truncate(log_len);
            }
            Some(Frame::Joined) => {}
            Some(Frame::Root) | None => {
                conn.txn = None;
                debug!("rolled back transaction");
            }
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.connection().is_ok_and(|c| c.txn.is_some())
    }

    fn lock_tables(&self, tables: &[&str]) -> Result<()> {
        let mut conn = self.connection()?;
        let txn = conn
            .txn
            .as_mut()
            .ok_or_else(|| Error::internal("lock_tables outside a transaction"))?;
        for &name in tables {
            let version = txn
                .working
                .get(name)
                .map(|t| t.version)
                .ok_or_else(|| Error::resource_not_found("table", name))?;
            txn.locked.entry(name.to_string()).or_insert(version);
        }
        Ok(())
    }

    fn create_temporary_table(&self, spec: &TableSpec) -> Result<String> {
        spec.validate()?;
        let mut conn = self.connection()?;
        conn.temporary_count += 1;
        let name = format!("tmp{}_{}", conn.temporary_count, spec.name);
        let mut spec = spec.clone();
        spec.name.clone_from(&name);
        conn.temporary.insert(
            name.clone(),
            Table {
                spec,
                rows: Vec::new(),
                version: 0,
            },
        );
        Ok(name)
    }

    fn drop_temporary_table(&self, name: &str) -> Result<()> {
        self.connection()?
            .temporary
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::resource_not_found("temporary table", name))
    }
}

fn apply(tables: &mut Tables, op: &Op) -> Result<usize> {
    if let Op::EnsureTable(spec) = op {
        return match tables.get(&spec.name) {
            Some(existing) if existing.spec == *spec => Ok(0),
            Some(_) => Err(Error::conflict(format!(
                "table '{}' exists with a different definition",
                spec.name
            ))),
            None => {
                tables.insert(
                    spec.name.clone(),
                    Table {
                        spec: spec.clone(),
                        rows: Vec::new(),
                        version: 0,
                    },
                );
                Ok(1)
            }
        };
    }
    let table = tables
        .get_mut(op.table())
        .ok_or_else(|| Error::resource_not_found("table", op.table()))?;
    apply_to_table(table, op)
}

/// Applies one write to a table. The table is untouched on error.
fn apply_to_table(table: &mut Table, op: &Op) -> Result<usize> {
    let spec = &table.spec;
    let mut next = table.rows.clone();
    let count = match op {
        Op::EnsureTable(_) => 0,
        Op::Insert(_, rows) => {
            for row in rows {
                let row = spec.normalize(row.clone())?;
                if let Some(problem) = key_collision(spec, &next, &row, None)
                    .or_else(|| exclusion_violation(spec, &next, &row, None))
                {
                    return Err(Error::conflict(problem));
                }
                next.push(row);
            }
            rows.len()
        }
        Op::Replace(_, rows) => {
            for row in rows {
                let row = spec.normalize(row.clone())?;
                if !spec.primary_key.is_empty() {
                    next.retain(|existing| !same_columns(&spec.primary_key, existing, &row));
                }
                if let Some(problem) = key_collision(spec, &next, &row, None)
                    .or_else(|| exclusion_violation(spec, &next, &row, None))
                {
                    return Err(Error::conflict(problem));
                }
                next.push(row);
            }
            rows.len()
        }
        Op::Ensure(_, rows) => {
            let mut inserted = 0;
            for row in rows {
                let row = spec.normalize(row.clone())?;
                if key_collision(spec, &next, &row, None).is_some() {
                    continue;
                }
                if let Some(problem) = exclusion_violation(spec, &next, &row, None) {
                    return Err(Error::conflict(problem));
                }
                next.push(row);
                inserted += 1;
            }
            inserted
        }
        Op::Delete(_, filters) => {
            let before = next.len();
            next.retain(|r| !Filter::all(filters, r));
            before - next.len()
        }
        Op::Update(_, filters, values) => {
            let targets: Vec<usize> = next
                .iter()
                .enumerate()
                .filter(|(_, r)| Filter::all(filters, r))
                .map(|(i, _)| i)
                .collect();
            for &i in &targets {
                let mut updated = next[i].clone();
                updated.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
                let updated = spec.normalize(updated)?;
                if let Some(problem) = key_collision(spec, &next, &updated, Some(i))
                    .or_else(|| exclusion_violation(spec, &next, &updated, Some(i)))
                {
                    return Err(Error::conflict(problem));
                }
                next[i] = updated;
            }
            targets.len()
        }
    };
    table.rows = next;
    Ok(count)
}

fn same_columns(columns: &[String], a: &Row, b: &Row) -> bool {
    columns.iter().all(|c| a.get(c) == b.get(c))
}

fn has_null(columns: &[String], row: &Row) -> bool {
    columns
        .iter()
        .any(|c| row.get(c).map_or(true, Value::is_null))
}

fn others<'a>(rows: &'a [Row], skip: Option<usize>) -> impl Iterator<Item = &'a Row> + 'a {
    rows.iter()
        .enumerate()
        .filter(move |(i, _)| Some(*i) != skip)
        .map(|(_, r)| r)
}

fn key_collision(spec: &TableSpec, rows: &[Row], row: &Row, skip: Option<usize>) -> Option<String> {
    if !spec.primary_key.is_empty()
        && others(rows, skip).any(|r| same_columns(&spec.primary_key, r, row))
    {
        return Some(format!(
            "duplicate primary key ({}) in '{}'",
            spec.primary_key.join(", "),
            spec.name
        ));
    }
    for columns in &spec.unique {
        if has_null(columns, row) {
            continue;
        }
        if others(rows, skip).any(|r| same_columns(columns, r, row)) {
            return Some(format!(
                "duplicate value for unique ({}) in '{}'",
                columns.join(", "),
                spec.name
            ));
        }
    }
    None
}

fn exclusion_violation(
    spec: &TableSpec,
    rows: &[Row],
    row: &Row,
    skip: Option<usize>,
) -> Option<String> {
    for exclusion in &spec.exclusions {
        let Some(span) = row.get(&exclusion.timespan).and_then(Value::as_timespan) else {
            continue;
        };
        let clash = others(rows, skip).any(|r| {
            same_columns(&exclusion.columns, r, row)
                && r.get(&exclusion.timespan)
                    .and_then(Value::as_timespan)
                    .is_some_and(|t| t.overlaps(span))
        });
        if clash {
            return Some(format!(
                "overlapping '{}' for equal ({}) in '{}'",
                exclusion.timespan,
                exclusion.columns.join(", "),
                spec.name
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{row, ColumnSpec};
    use crate::timespan::Timespan;
    use crate::value::FieldType;
    use chrono::{TimeZone, Utc};

    fn people() -> TableSpec {
        TableSpec::new("people")
            .column(ColumnSpec::required("id", FieldType::Int))
            .column(ColumnSpec::nullable("email", FieldType::String))
            .primary_key(["id"])
            .unique(["email"])
    }

    fn certs() -> TableSpec {
        TableSpec::new("certs")
            .column(ColumnSpec::required("detector", FieldType::Int))
            .column(ColumnSpec::required("validity", FieldType::Timespan))
            .exclusion(["detector"], "validity")
    }

    fn span(a: u32, b: u32) -> Timespan {
        let t = |h| Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap();
        Timespan::between(t(a), t(b)).unwrap()
    }

    #[test]
    fn ensure_table_is_idempotent_and_detects_redefinition() {
        let db = MemoryDatabase::new();
        assert!(db.ensure_table(&people()).unwrap());
        assert!(!db.ensure_table(&people()).unwrap());
        let changed = people().column(ColumnSpec::nullable("age", FieldType::Int));
        assert!(db.ensure_table(&changed).unwrap_err().is_conflict());
    }

    #[test]
    fn insert_batch_is_atomic() {
        let db = MemoryDatabase::new();
        db.ensure_table(&people()).unwrap();
        let err = db
            .insert("people", vec![row([("id", 1)]), row([("id", 1)])])
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(db.select("people", &[]).unwrap().is_empty());
    }

    #[test]
    fn unique_skips_nulls_and_ensure_skips_collisions() {
        let db = MemoryDatabase::new();
        db.ensure_table(&people()).unwrap();
        db.insert("people", vec![row([("id", 1)]), row([("id", 2)])]).unwrap();
        db.insert_one("people", row([("id", Value::Int(3)), ("email", "a@x".into())]))
            .unwrap();
        let inserted = db
            .ensure(
                "people",
                vec![
                    row([("id", Value::Int(3)), ("email", "b@x".into())]),
                    row([("id", Value::Int(4)), ("email", "a@x".into())]),
                    row([("id", 5)]),
                ],
            )
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(db.select("people", &[]).unwrap().len(), 4);
    }

    #[test]
    fn exclusion_rejects_overlap_per_key() {
        let db = MemoryDatabase::new();
        db.ensure_table(&certs()).unwrap();
        db.insert_one("certs", row([("detector", Value::Int(1)), ("validity", span(1, 3).into())]))
            .unwrap();
        db.insert_one("certs", row([("detector", Value::Int(2)), ("validity", span(1, 3).into())]))
            .unwrap();
        db.insert_one("certs", row([("detector", Value::Int(1)), ("validity", span(3, 4).into())]))
            .unwrap();
        let err = db
            .insert_one("certs", row([("detector", Value::Int(1)), ("validity", span(2, 5).into())]))
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn savepoint_rollback_keeps_outer_work() {
        let db = MemoryDatabase::new();
        db.ensure_table(&people()).unwrap();
        db.transaction(false, || {
            db.insert_one("people", row([("id", 1)]))?;
            let inner = db.transaction(true, || {
                db.insert_one("people", row([("id", 2)]))?;
                db.insert_one("people", row([("id", 1)]))
            });
            assert!(inner.is_err());
            Ok(())
        })
        .unwrap();
        let ids: Vec<_> = db
            .select("people", &[])
            .unwrap()
            .iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(ids, vec![Value::Int(1)]);
    }

    #[test]
    fn outer_error_rolls_back_everything() {
        let db = MemoryDatabase::new();
        db.ensure_table(&people()).unwrap();
        let result: Result<()> = db.transaction(false, || {
            db.insert_one("people", row([("id", 1)]))?;
            db.transaction(false, || db.insert_one("people", row([("id", 2)])))?;
            Err(Error::InvalidInput("stop".into()))
        });
        assert!(result.is_err());
        assert!(!db.in_transaction());
        assert!(db.select("people", &[]).unwrap().is_empty());
    }

    #[test]
    fn uncommitted_writes_are_private_to_the_connection() {
        let store = MemoryStore::new();
        let a = store.connect(true);
        let b = store.connect(true);
        a.ensure_table(&people()).unwrap();
        a.begin(false).unwrap();
        a.insert_one("people", row([("id", 1)])).unwrap();
        assert!(b.select("people", &[]).unwrap().is_empty());
        a.commit().unwrap();
        assert_eq!(b.select("people", &[]).unwrap().len(), 1);
    }

    #[test]
    fn commit_rechecks_constraints_against_concurrent_writers() {
        let store = MemoryStore::new();
        let a = store.connect(true);
        let b = store.connect(true);
        a.ensure_table(&certs()).unwrap();
        a.begin(false).unwrap();
        a.insert_one("certs", row([("detector", Value::Int(1)), ("validity", span(1, 3).into())]))
            .unwrap();
        b.insert_one("certs", row([("detector", Value::Int(1)), ("validity", span(2, 4).into())]))
            .unwrap();
        assert!(a.commit().unwrap_err().is_conflict());
        assert_eq!(a.select("certs", &[]).unwrap().len(), 1);
    }

    #[test]
    fn locked_table_change_aborts_commit() {
        let store = MemoryStore::new();
        let a = store.connect(true);
        let b = store.connect(true);
        a.ensure_table(&people()).unwrap();
        a.begin(false).unwrap();
        a.lock_tables(&["people"]).unwrap();
        b.insert_one("people", row([("id", 7)])).unwrap();
        a.insert_one("people", row([("id", 8)])).unwrap();
        assert!(matches!(a.commit(), Err(Error::TransactionAborted { .. })));
    }

    #[test]
    fn read_only_connection_rejects_writes_but_not_temporary_tables() {
        let store = MemoryStore::new();
        store.connect(true).ensure_table(&people()).unwrap();
        let ro = store.connect(false);
        assert!(!ro.ensure_table(&people()).unwrap());
        assert!(matches!(
            ro.insert_one("people", row([("id", 1)])),
            Err(Error::ReadOnly { .. })
        ));
        let tmp = ro.create_temporary_table(&people()).unwrap();
        ro.insert_one(&tmp, row([("id", 1)])).unwrap();
        assert_eq!(ro.select(&tmp, &[]).unwrap().len(), 1);
        ro.drop_temporary_table(&tmp).unwrap();
        assert!(ro.select(&tmp, &[]).is_err());
    }

    #[test]
    fn update_checks_constraints() {
        let db = MemoryDatabase::new();
        db.ensure_table(&people()).unwrap();
        db.insert("people", vec![row([("id", 1)]), row([("id", 2)])]).unwrap();
        let changed = db
            .update("people", &[Filter::eq("id", 2)], row([("email", "z@x")]))
            .unwrap();
        assert_eq!(changed, 1);
        assert!(db
            .update("people", &[Filter::eq("id", 2)], row([("id", 1)]))
            .is_err());
        assert_eq!(db.delete("people", &[Filter::eq("id", 1)]).unwrap(), 1);
    }
}
