//! Fluent statement builder bound to one connection.

use super::{validate_column, validate_table, Dialect, Direction, JoinKind};
use crate::core::db::Connection;
use crate::core::{DataError, Fetched, Result, ResultSet, Row, Value};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    And(String),
    AndNot(String),
}

/// The statement under construction. Consumed by `execute`, which leaves a
/// fresh empty query behind.
#[derive(Debug, Default)]
struct Query {
    kind: Option<StatementKind>,
    table: String,
    /// Select list, or the target columns of an insert/update
    columns: Vec<String>,
    /// Insert/update values, in `columns` order
    values: Vec<Value>,
    joins: Vec<String>,
    conditions: Vec<Condition>,
    condition_params: Vec<Value>,
    order_by: Vec<String>,
    limit: Option<u64>,
}

impl Query {
    fn render(&self, dialect: Dialect) -> Result<(String, Vec<Value>)> {
        let kind = self.kind.ok_or_else(|| {
            DataError::Validation(
                "no statement to execute: call select, insert, update or delete first".to_string(),
            )
        })?;

        if kind != StatementKind::Select {
            let stray = [
                (self.limit.is_some(), "LIMIT"),
                (!self.joins.is_empty(), "JOIN"),
                (!self.order_by.is_empty(), "ORDER BY"),
            ];
            if let Some((_, clause)) = stray.iter().find(|(set, _)| *set) {
                return Err(DataError::Validation(format!(
                    "{} is only supported on SELECT statements",
                    clause
                )));
            }
        }

        let mut sql = match kind {
            StatementKind::Select => {
                let top = match (dialect, self.limit) {
                    (Dialect::AtP, Some(n)) => format!("TOP {} ", n),
                    _ => String::new(),
                };
                format!("SELECT {}{} FROM {}", top, self.columns.join(", "), self.table)
            }
            StatementKind::Insert => format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.table,
                self.columns.join(", "),
                vec!["?"; self.columns.len()].join(", ")
            ),
            StatementKind::Update => format!(
                "UPDATE {} SET {}",
                self.table,
                self.columns
                    .iter()
                    .map(|c| format!("{} = ?", c))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            StatementKind::Delete => format!("DELETE FROM {}", self.table),
        };

        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }

        for (idx, condition) in self.conditions.iter().enumerate() {
            sql.push_str(if idx == 0 { " WHERE " } else { " AND " });
            match condition {
                Condition::And(text) => sql.push_str(text),
                Condition::AndNot(text) => {
                    sql.push_str("NOT ");
                    sql.push_str(text);
                }
            }
        }

        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        if let (Some(n), false) = (self.limit, dialect == Dialect::AtP) {
            sql.push_str(&format!(" LIMIT {}", n));
        }

        let mut params = self.values.clone();
        params.extend(self.condition_params.iter().cloned());
        Ok((dialect.number_placeholders(&sql), params))
    }
}

/// What `execute` produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Rows of a SELECT
    Rows(ResultSet),
    /// Row count of an INSERT, UPDATE or DELETE
    Affected(u64),
}

impl Outcome {
    pub fn affected(&self) -> Option<u64> {
        match self {
            Outcome::Affected(n) => Some(*n),
            Outcome::Rows(_) => None,
        }
    }

    pub fn into_result_set(self) -> Option<ResultSet> {
        match self {
            Outcome::Rows(rows) => Some(rows),
            Outcome::Affected(_) => None,
        }
    }
}

/// Builds and runs parameterized statements against one connection.
///
/// ```no_run
/// # use rowbound::{Connection, QueryBuilder, Direction};
/// # fn demo(conn: &mut Connection) -> rowbound::Result<()> {
/// let rows = QueryBuilder::new(conn)
///     .select("users", &["id", "email"])?
///     .where_eq("status", "active")?
///     .order_by("created_at", Direction::Desc)?
///     .get()?;
/// # Ok(())
/// # }
/// ```
pub struct QueryBuilder<'c> {
    conn: &'c mut Connection,
    query: Query,
}

impl<'c> QueryBuilder<'c> {
    pub fn new(conn: &'c mut Connection) -> Self {
        QueryBuilder {
            conn,
            query: Query::default(),
        }
    }

    /// Prefixed, validated table identifier.
    fn table_name(&self, table: &str) -> Result<String> {
        validate_table(table)?;
        let prefix = self.conn.table_prefix();
        Ok(match table.split_once('.') {
            Some((schema, name)) => format!("{}.{}{}", schema, prefix, name),
            None => format!("{}{}", prefix, table),
        })
    }

    /// Starts a new statement, discarding everything staged for the previous one.
    fn begin(&mut self, kind: StatementKind, table: &str) -> Result<()> {
        let table = self.table_name(table)?;
        self.query = Query {
            kind: Some(kind),
            table,
            ..Query::default()
        };
        Ok(())
    }

    /// Starts a SELECT of `columns` (all columns when empty).
    pub fn select(&mut self, table: &str, columns: &[&str]) -> Result<&mut Self> {
        for column in columns {
            validate_column(column)?;
        }
        self.begin(StatementKind::Select, table)?;
        self.query.columns = if columns.is_empty() {
            vec!["*".to_string()]
        } else {
            columns.iter().map(|c| c.to_string()).collect()
        };
        Ok(self)
    }

    /// Starts a `SELECT COUNT(*) AS aggregate`.
    pub fn count(&mut self, table: &str) -> Result<&mut Self> {
        self.begin(StatementKind::Select, table)?;
        self.query.columns = vec!["COUNT(*) AS aggregate".to_string()];
        Ok(self)
    }

    /// Starts an INSERT of every column in `record`.
    pub fn insert(&mut self, table: &str, record: &Row) -> Result<&mut Self> {
        self.stage_values(StatementKind::Insert, table, record)
    }

    /// Starts an UPDATE staging `column = ?` for every column in `values`.
    pub fn update(&mut self, table: &str, values: &Row) -> Result<&mut Self> {
        self.stage_values(StatementKind::Update, table, values)
    }

    fn stage_values(&mut self, kind: StatementKind, table: &str, record: &Row) -> Result<&mut Self> {
        if record.is_empty() {
            return Err(DataError::Validation(format!(
                "{} of '{}' needs at least one column",
                if kind == StatementKind::Insert { "insert" } else { "update" },
                table
            )));
        }
        for column in record.columns() {
            validate_column(column)?;
            if column.ends_with('*') {
                return Err(DataError::Validation(format!("invalid column name '{}'", column)));
            }
        }
        self.begin(kind, table)?;
        for (column, value) in record.iter() {
            self.query.columns.push(column.to_string());
            self.query.values.push(value.clone());
        }
        Ok(self)
    }

    pub fn delete(&mut self, table: &str) -> Result<&mut Self> {
        self.begin(StatementKind::Delete, table)?;
        Ok(self)
    }

    /// Adds a raw condition; the first opens `WHERE`, later ones join with `AND`.
    ///
    /// The text is structural: put values through [`where_bind`](Self::where_bind),
    /// [`where_eq`](Self::where_eq) or [`where_in`](Self::where_in) instead.
    /// A `?` inside a quoted literal or an SQL comment is not a placeholder.
    pub fn where_(&mut self, condition: &str) -> &mut Self {
        self.query.conditions.push(Condition::And(condition.to_string()));
        self
    }

    /// Adds a condition containing `?` markers, binding `values` to them in order.
    pub fn where_bind<I, V>(&mut self, condition: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.query.conditions.push(Condition::And(condition.to_string()));
        self.query
            .condition_params
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Adds `AND NOT <condition>`. Without a preceding condition it opens `WHERE NOT`.
    pub fn where_not(&mut self, condition: &str) -> &mut Self {
        self.query.conditions.push(Condition::AndNot(condition.to_string()));
        self
    }

    /// Adds `column = ?`, or `column IS NULL` for a null value.
    pub fn where_eq(&mut self, column: &str, value: impl Into<Value>) -> Result<&mut Self> {
        validate_column(column)?;
        let value = value.into();
        if value.is_null() {
            self.query.conditions.push(Condition::And(format!("{} IS NULL", column)));
        } else {
            self.query.conditions.push(Condition::And(format!("{} = ?", column)));
            self.query.condition_params.push(value);
        }
        Ok(self)
    }

    /// Adds `column IN (?, ...)` with one placeholder per value.
    ///
    /// # Errors
    ///
    /// `DataError::Validation` when `values` is empty.
    pub fn where_in<I, V>(&mut self, column: &str, values: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        validate_column(column)?;
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return Err(DataError::Validation(format!(
                "IN list for '{}' must contain at least one value",
                column
            )));
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        self.query
            .conditions
            .push(Condition::And(format!("{} IN ({})", column, placeholders)));
        self.query.condition_params.extend(values);
        Ok(self)
    }

    pub fn order_by(&mut self, column: &str, direction: Direction) -> Result<&mut Self> {
        validate_column(column)?;
        self.query
            .order_by
            .push(format!("{} {}", column, direction.as_sql()));
        Ok(self)
    }

    /// Adds `<kind> JOIN table ON on`.
    pub fn join(&mut self, table: &str, on: &str, kind: JoinKind) -> Result<&mut Self> {
        let table = self.table_name(table)?;
        self.query
            .joins
            .push(format!("{} {} ON {}", kind.as_sql(), table, on));
        Ok(self)
    }

    pub fn limit(&mut self, n: u64) -> &mut Self {
        self.query.limit = Some(n);
        self
    }

    /// Statement text and bound parameters, without executing.
    pub fn to_sql(&self) -> Result<(String, Vec<Value>)> {
        self.query.render(self.conn.dialect())
    }

    /// Drops the statement under construction.
    pub fn reset(&mut self) {
        self.query = Query::default();
    }

    /// Sends the statement with its bound parameters.
    ///
    /// The builder is reset whether or not execution succeeds.
    pub fn execute(&mut self) -> Result<Outcome> {
        let query = std::mem::take(&mut self.query);
        let (sql, params) = query.render(self.conn.dialect())?;
        debug!(sql = %sql, params = params.len(), "executing statement");

        match query.kind {
            Some(StatementKind::Select) => Ok(Outcome::Rows(self.conn.query(&sql, &params)?)),
            _ => Ok(Outcome::Affected(self.conn.execute(&sql, &params)?)),
        }
    }

    fn execute_select(&mut self) -> Result<ResultSet> {
        if self.query.kind != Some(StatementKind::Select) {
            self.reset();
            return Err(DataError::Validation(
                "get() and first() need a SELECT statement".to_string(),
            ));
        }
        Ok(self.execute()?.into_result_set().unwrap_or_default())
    }

    /// Runs the SELECT and returns every row in order.
    pub fn get(&mut self) -> Result<Vec<Row>> {
        Ok(self.execute_select()?.into_rows())
    }

    /// Runs the SELECT and returns its first row, or `Fetched::NotFound`.
    pub fn first(&mut self) -> Result<Fetched> {
        Ok(self.execute_select()?.into_first())
    }
}
