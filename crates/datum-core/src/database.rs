//! The relational storage contract.
//!
//! The registry never talks to a storage engine directly. It describes its
//! tables with [`TableSpec`] and reads and writes [`Row`]s through the
//! [`Database`] trait, which any engine can implement. Constraint
//! enforcement (primary keys, unique keys, and timespan exclusion) belongs to
//! the implementation so it holds across connections.
//!
//! ## Transactions
//!
//! [`DatabaseExt::transaction`] runs a closure inside a transaction. The
//! outermost call opens one; nested calls either join it or, with
//! `savepoint = true`, open a savepoint that is rolled back on its own when
//! the closure returns an error. An error that escapes the outermost call
//! rolls everything back.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::timespan::Timespan;
use crate::value::{FieldType, Value};

/// A stored row: column name to value.
pub type Row = BTreeMap<String, Value>;

/// A column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Column type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Whether NULL is allowed.
    pub nullable: bool,
}

impl ColumnSpec {
    /// A non-nullable column.
    #[must_use]
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
        }
    }

    /// A nullable column.
    #[must_use]
    pub fn nullable(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
        }
    }
}

/// Forbids two rows that agree on `columns` from having overlapping
/// timespans in `timespan`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionSpec {
    /// Columns compared for equality.
    pub columns: Vec<String>,
    /// The timespan column compared for overlap.
    pub timespan: String,
}

/// The definition of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Table name.
    pub name: String,
    /// Columns, in declaration order.
    pub columns: Vec<ColumnSpec>,
    /// Primary key columns; empty for none.
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Unique column sets. A set is skipped for rows where any of its
    /// columns is NULL.
    #[serde(default)]
    pub unique: Vec<Vec<String>>,
    /// Timespan exclusion constraints.
    #[serde(default)]
    pub exclusions: Vec<ExclusionSpec>,
}

impl TableSpec {
    /// Starts a table definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            unique: Vec::new(),
            exclusions: Vec::new(),
        }
    }

    /// Adds a column.
    #[must_use]
    pub fn column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    /// Sets the primary key.
    #[must_use]
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a unique constraint.
    #[must_use]
    pub fn unique<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique.push(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a timespan exclusion constraint.
    #[must_use]
    pub fn exclusion<I, S>(mut self, columns: I, timespan: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclusions.push(ExclusionSpec {
            columns: columns.into_iter().map(Into::into).collect(),
            timespan: timespan.into(),
        });
        self
    }

    /// Looks up a column.
    #[must_use]
    pub fn get_column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Checks that every constraint refers to a declared column.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` naming the first unknown column.
    pub fn validate(&self) -> Result<()> {
        let referenced = self
            .primary_key
            .iter()
            .chain(self.unique.iter().flatten())
            .chain(
                self.exclusions
                    .iter()
                    .flat_map(|x| x.columns.iter().chain(std::iter::once(&x.timespan))),
            );
        for name in referenced {
            if self.get_column(name).is_none() {
                return Err(Error::InvalidInput(format!(
                    "table '{}' constraint refers to unknown column '{name}'",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Validates a row against the column definitions, returning it with
    /// every column present (absent nullable columns become NULL).
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for unknown columns, missing non-nullable
    /// values, and values of the wrong type.
    pub fn normalize(&self, mut row: Row) -> Result<Row> {
        let mut out = Row::new();
        for column in &self.columns {
            let value = match row.remove(&column.name) {
                Some(Value::Int(v)) if column.field_type == FieldType::Float => {
                    #[allow(clippy::cast_precision_loss)]
                    let as_float = v as f64;
                    Value::Float(as_float)
                }
                Some(v) => v,
                None => Value::Null,
            };
            if value.is_null() && !column.nullable {
                return Err(Error::InvalidInput(format!(
                    "table '{}' requires a value for '{}'",
                    self.name, column.name
                )));
            }
            if !column.field_type.accepts(&value) {
                return Err(Error::InvalidInput(format!(
                    "column '{}.{}' expects {:?}, got {value}",
                    self.name, column.name, column.field_type
                )));
            }
            out.insert(column.name.clone(), value);
        }
        if let Some(unknown) = row.keys().next() {
            return Err(Error::InvalidInput(format!(
                "table '{}' has no column '{unknown}'",
                self.name
            )));
        }
        Ok(out)
    }
}

/// One term of a conjunctive row filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// The column equals the value (`NULL` matches `NULL`).
    Eq(String, Value),
    /// The column equals one of the values.
    In(String, Vec<Value>),
    /// The timespan column overlaps the given timespan. NULL never matches.
    Overlaps(String, Timespan),
}

impl Filter {
    /// Equality filter.
    #[must_use]
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(column.into(), value.into())
    }

    /// Membership filter.
    #[must_use]
    pub fn one_of(column: impl Into<String>, values: impl IntoIterator<Item = Value>) -> Self {
        Self::In(column.into(), values.into_iter().collect())
    }

    /// Timespan overlap filter.
    #[must_use]
    pub fn overlaps(column: impl Into<String>, timespan: Timespan) -> Self {
        Self::Overlaps(column.into(), timespan)
    }

    /// Tests one row.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::Eq(column, value) => row.get(column).unwrap_or(&Value::Null) == value,
            Self::In(column, values) => row.get(column).is_some_and(|v| values.contains(v)),
            Self::Overlaps(column, span) => row
                .get(column)
                .and_then(Value::as_timespan)
                .is_some_and(|t| t.overlaps(span)),
        }
    }

    /// Tests a row against a conjunction of filters.
    #[must_use]
    pub fn all(filters: &[Self], row: &Row) -> bool {
        filters.iter().all(|f| f.matches(row))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq(c, v) => write!(f, "{c} = {v}"),
            Self::In(c, vs) => {
                write!(f, "{c} IN (")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
            Self::Overlaps(c, t) => write!(f, "{c} OVERLAPS {t}"),
        }
    }
}

/// A relational store.
///
/// Every mutating method is atomic on its own: if it fails, none of its rows
/// were written. Methods called outside a transaction commit immediately.
pub trait Database: Send + Sync {
    /// Whether this connection accepts writes.
    fn is_writeable(&self) -> bool;

    /// Creates a table if it does not exist.
    ///
    /// Returns true if the table was created. An existing table with the
    /// same definition is a no-op, even on a read-only connection.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if a table with this name exists
    /// with a different definition, and `ReadOnly` if creation is needed on
    /// a read-only connection.
    fn ensure_table(&self, spec: &TableSpec) -> Result<bool>;

    /// Returns a table's definition.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` for unknown tables.
    fn table_spec(&self, table: &str) -> Result<TableSpec>;

    /// Inserts rows.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if a row violates a constraint.
    fn insert(&self, table: &str, rows: Vec<Row>) -> Result<()>;

    /// Inserts rows, replacing any with the same primary key.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if a row violates a non-primary-key
    /// constraint.
    fn replace(&self, table: &str, rows: Vec<Row>) -> Result<()>;

    /// Inserts rows that do not collide with an existing primary or unique
    /// key, skipping those that do. Returns the number inserted.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` for exclusion violations.
    fn ensure(&self, table: &str, rows: Vec<Row>) -> Result<usize>;

    /// Deletes matching rows, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` for unknown tables.
    fn delete(&self, table: &str, filters: &[Filter]) -> Result<usize>;

    /// Sets columns on matching rows, returning how many were changed.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if an updated row violates a
    /// constraint.
    fn update(&self, table: &str, filters: &[Filter], values: Row) -> Result<usize>;

    /// Returns matching rows in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` for unknown tables.
    fn select(&self, table: &str, filters: &[Filter]) -> Result<Vec<Row>>;

    /// Opens a transaction, or a nested scope within the current one.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the store cannot start a transaction.
    fn begin(&self, savepoint: bool) -> Result<()>;

    /// Closes the innermost scope, committing if it is the outermost.
    ///
    /// # Errors
    ///
    /// Returns `TransactionAborted` if commit found a conflicting change;
    /// the transaction is then rolled back.
    fn commit(&self) -> Result<()>;

    /// Abandons the innermost scope.
    ///
    /// Savepoints and the outermost scope discard their changes; a joined
    /// scope discards nothing, leaving that to its parent.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if no transaction is open.
    fn rollback(&self) -> Result<()>;

    /// True if a transaction is open.
    fn in_transaction(&self) -> bool;

    /// Locks tables for the rest of the current transaction: commit fails
    /// if another connection changed them since the transaction began.
    ///
    /// # Errors
    ///
    /// Returns `Internal` outside a transaction and `ResourceNotFound` for
    /// unknown tables.
    fn lock_tables(&self, tables: &[&str]) -> Result<()>;

    /// Creates a connection-private table and returns its generated name.
    /// Allowed on read-only connections.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for malformed definitions.
    fn create_temporary_table(&self, spec: &TableSpec) -> Result<String>;

    /// Drops a temporary table.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if no such temporary table exists.
    fn drop_temporary_table(&self, name: &str) -> Result<()>;
}

/// Scoped transactions for any [`Database`].
pub trait DatabaseExt: Database {
    /// Runs `body` inside a transaction scope.
    ///
    /// The scope is committed when `body` returns `Ok` and rolled back when
    /// it returns `Err`; the body's error is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns the body's error, or a commit failure.
    fn transaction<T>(&self, savepoint: bool, body: impl FnOnce() -> Result<T>) -> Result<T> {
        self.begin(savepoint)?;
        match body() {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback() {
                    tracing::error!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Inserts a single row.
    ///
    /// # Errors
    ///
    /// As for [`Database::insert`].
    fn insert_one(&self, table: &str, row: Row) -> Result<()> {
        self.insert(table, vec![row])
    }

    /// Returns the single matching row, if any.
    ///
    /// # Errors
    ///
    /// Returns `AmbiguousResult` if more than one row matches.
    fn select_one(&self, table: &str, filters: &[Filter]) -> Result<Option<Row>> {
        let mut rows = self.select(table, filters)?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            n => Err(Error::ambiguous(format!(
                "{n} rows of '{table}' match a single-row lookup"
            ))),
        }
    }

    /// Rejects the call on a read-only connection.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnly` naming `operation`.
    fn require_writeable(&self, operation: &str) -> Result<()> {
        if self.is_writeable() {
            Ok(())
        } else {
            Err(Error::read_only(format!(
                "{operation} is not allowed on a read-only connection"
            )))
        }
    }
}

impl<D: Database + ?Sized> DatabaseExt for D {}

/// Builds a row from `(column, value)` pairs.
#[must_use]
pub fn row<I, K, V>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
