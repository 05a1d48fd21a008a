//! Table-bound CRUD facade.
//!
//! A [`RecordAccessor`] resolves its table from a [`Model`] once, at
//! construction, and offers the common single-table verbs on top of
//! [`QueryBuilder`]. Every verb checks the binding before touching the
//! connection.

use crate::core::db::Connection;
use crate::core::{DataError, Fetched, Record, Result, Row, Value};
use crate::query::{Direction, QueryBuilder};
use chrono::Utc;
use tracing::{debug, warn};

/// A domain model's table binding.
pub trait Model {
    const TABLE: &'static str;
    const PRIMARY_KEY: &'static str = "id";
    const CREATED_AT: &'static str = "created_at";
    const UPDATED_AT: &'static str = "updated_at";
}

/// Current timestamp in the format stored in `created_at`/`updated_at`.
fn timestamp() -> Value {
    Value::Text(Utc::now().format("%Y-%m-%d %H:%M:%S").to_string())
}

/// CRUD over one table.
///
/// `query_by_condition` buffers its rows; `first`/`get` read that buffer
/// until the next `query_by_condition` replaces it.
pub struct RecordAccessor<'c> {
    conn: &'c mut Connection,
    table: Option<String>,
    primary_key: String,
    created_at: String,
    updated_at: String,
    buffer: Option<Vec<Row>>,
}

impl<'c> RecordAccessor<'c> {
    /// Binds to `M::TABLE`.
    pub fn for_model<M: Model>(conn: &'c mut Connection) -> Self {
        let mut accessor = Self::with_table(conn, Some(M::TABLE));
        accessor.primary_key = M::PRIMARY_KEY.to_string();
        accessor.created_at = M::CREATED_AT.to_string();
        accessor.updated_at = M::UPDATED_AT.to_string();
        accessor
    }

    /// Binds to a table known only at runtime. `None` or an empty name leaves
    /// the accessor unbound; every operation then fails with a configuration error.
    pub fn with_table(conn: &'c mut Connection, table: Option<&str>) -> Self {
        RecordAccessor {
            conn,
            table: table
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            primary_key: "id".to_string(),
            created_at: "created_at".to_string(),
            updated_at: "updated_at".to_string(),
            buffer: None,
        }
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    fn bound_table(&self) -> Result<String> {
        self.table.clone().ok_or_else(|| {
            DataError::Configuration("record accessor has no table bound to it".to_string())
        })
    }

    fn builder(&mut self) -> QueryBuilder<'_> {
        QueryBuilder::new(self.conn)
    }

    /// Inserts `record`, stamping `created_at`/`updated_at` when absent.
    pub fn save(&mut self, mut record: Record) -> Result<bool> {
        let table = self.bound_table()?;
        let now = timestamp();
        if !record.contains(&self.created_at) {
            record.insert(self.created_at.clone(), now.clone());
        }
        if !record.contains(&self.updated_at) {
            record.insert(self.updated_at.clone(), now);
        }

        let outcome = self.builder().insert(&table, &record)?.execute()?;
        Ok(outcome.affected().unwrap_or(0) > 0)
    }

    /// Updates rows matching every non-blank field of `predicate` with the
    /// non-blank fields of `record`, stamping `updated_at` when absent.
    ///
    /// An empty `predicate` updates every row in the table. A predicate whose
    /// fields are all blank is rejected rather than widened to every row.
    pub fn quick_update(&mut self, record: &Record, predicate: &Record) -> Result<u64> {
        let table = self.bound_table()?;

        let mut changes: Row = record
            .iter()
            .filter(|(_, value)| !value.is_blank())
            .map(|(column, value)| (column, value.clone()))
            .collect();
        if !changes.contains(&self.updated_at) {
            changes.insert(self.updated_at.clone(), timestamp());
        }

        let filters: Vec<(&str, &Value)> = predicate.iter().filter(|(_, v)| !v.is_blank()).collect();
        if filters.is_empty() && !predicate.is_empty() {
            return Err(DataError::Validation(
                "update predicate has no non-empty fields; pass an empty predicate to update every row"
                    .to_string(),
            ));
        }
        if predicate.is_empty() {
            warn!(table = %table, "quick_update without predicate touches every row");
        }

        let mut qb = QueryBuilder::new(self.conn);
        qb.update(&table, &changes)?;
        for (column, value) in filters {
            qb.where_eq(column, value.clone())?;
        }
        Ok(qb.execute()?.affected().unwrap_or(0))
    }

    /// Every row, in backend order.
    pub fn fetch_all(&mut self) -> Result<Vec<Row>> {
        let table = self.bound_table()?;
        self.builder().select(&table, &[])?.get()
    }

    /// Every row, oldest first.
    pub fn fetch_all_ascending(&mut self) -> Result<Vec<Row>> {
        self.fetch_ordered(Direction::Asc)
    }

    /// Every row, newest first.
    pub fn fetch_all_descending(&mut self) -> Result<Vec<Row>> {
        self.fetch_ordered(Direction::Desc)
    }

    /// Oldest row, or `Fetched::NotFound` on an empty table.
    pub fn fetch_first_ascending(&mut self) -> Result<Fetched> {
        Ok(self.fetch_ordered(Direction::Asc)?.into_iter().next().into())
    }

    /// Newest row, or `Fetched::NotFound` on an empty table.
    pub fn fetch_first_descending(&mut self) -> Result<Fetched> {
        Ok(self.fetch_ordered(Direction::Desc)?.into_iter().next().into())
    }

    fn fetch_ordered(&mut self, direction: Direction) -> Result<Vec<Row>> {
        let table = self.bound_table()?;
        let created_at = self.created_at.clone();
        self.builder()
            .select(&table, &[])?
            .order_by(&created_at, direction)?
            .get()
    }

    /// Single-row lookup by primary key.
    pub fn fetch_by_id(&mut self, id: impl Into<Value>) -> Result<Fetched> {
        let table = self.bound_table()?;
        let primary_key = self.primary_key.clone();
        self.builder()
            .select(&table, &[])?
            .where_eq(&primary_key, id)?
            .limit(1)
            .first()
    }

    /// Whether any row matches every field of `predicate` by equality.
    pub fn exists_by_condition(&mut self, predicate: &Record) -> Result<bool> {
        let table = self.bound_table()?;
        let primary_key = self.primary_key.clone();
        let mut qb = QueryBuilder::new(self.conn);
        qb.select(&table, &[primary_key.as_str()])?;
        for (column, value) in predicate.iter() {
            qb.where_eq(column, value.clone())?;
        }
        Ok(qb.limit(1).first()?.is_found())
    }

    /// Runs a multi-field equality query and buffers the rows for `first`/`get`.
    ///
    /// The previous buffer is dropped first, so a failed query leaves nothing behind.
    pub fn query_by_condition(&mut self, predicate: &Record) -> Result<&mut Self> {
        self.buffer = None;
        let table = self.bound_table()?;
        let mut qb = QueryBuilder::new(self.conn);
        qb.select(&table, &[])?;
        for (column, value) in predicate.iter() {
            qb.where_eq(column, value.clone())?;
        }
        let rows = qb.get()?;
        debug!(table = %table, rows = rows.len(), "buffered query result");
        self.buffer = Some(rows);
        Ok(self)
    }

    pub fn is_buffered(&self) -> bool {
        self.buffer.is_some()
    }

    /// First buffered row, or `Fetched::NotFound` when nothing matched or nothing was queried.
    pub fn first(&self) -> Fetched {
        self.buffer
            .as_ref()
            .and_then(|rows| rows.first())
            .cloned()
            .into()
    }

    /// All buffered rows.
    pub fn get(&self) -> Vec<Row> {
        self.buffer.clone().unwrap_or_default()
    }

    pub fn delete_by_id(&mut self, id: impl Into<Value>) -> Result<bool> {
        let table = self.bound_table()?;
        let primary_key = self.primary_key.clone();
        let outcome = self
            .builder()
            .delete(&table)?
            .where_eq(&primary_key, id)?
            .execute()?;
        Ok(outcome.affected().unwrap_or(0) > 0)
    }

    pub fn count(&mut self) -> Result<u64> {
        let table = self.bound_table()?;
        let first = self.builder().count(&table)?.first()?;
        let count = first
            .row()
            .and_then(|row| row.get("aggregate"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
