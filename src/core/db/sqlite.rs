/// Embedded Backend Module
///
/// The built-in native driver for the embedded file-backed backend, on top
/// of rusqlite. Extra options are applied as pragmas on the handle.

use crate::config::DriverKind;
use crate::core::db::connection::{Dialer, NativeHandle};
use crate::core::db::connector::{ConnectPlan, Target};
use crate::core::{DataError, Result, ResultSet, Row, Value};
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection};
use tracing::debug;

/// Opens rusqlite handles for `Target::File` plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialer;

impl Dialer for SqliteDialer {
    fn dial(&self, plan: &ConnectPlan) -> Result<Box<dyn NativeHandle>> {
        let path = match &plan.target {
            Target::File(path) => path,
            other => {
                return Err(DataError::connection(
                    plan.driver,
                    format!("embedded driver cannot open a {} target", other.kind()),
                ))
            }
        };

        let opened = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        };
        let conn = opened.map_err(|e| DataError::connection(plan.driver, e.to_string()))?;

        if let Some(timeout) = plan.timeout {
            conn.busy_timeout(timeout)
                .map_err(|e| DataError::connection(plan.driver, e.to_string()))?;
        }
        debug!(path = %path, "opened embedded database");

        Ok(Box::new(SqliteHandle { conn: Some(conn) }))
    }
}

/// A rusqlite connection behind the [`NativeHandle`] seam.
#[derive(Debug)]
pub struct SqliteHandle {
    conn: Option<Connection>,
}

impl SqliteHandle {
    /// Wraps an already opened rusqlite connection.
    pub fn new(conn: Connection) -> Self {
        SqliteHandle { conn: Some(conn) }
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| DataError::connection(DriverKind::EmbeddedFile, "handle is closed"))
    }
}

impl NativeHandle for SqliteHandle {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Row::new();
            for (idx, name) in columns.iter().enumerate() {
                record.insert(name.clone(), from_value_ref(row.get_ref(idx)?));
            }
            out.push(record);
        }

        Ok(ResultSet::new(columns, out))
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let affected = self.conn()?.execute(sql, params_from_iter(params.iter()))?;
        Ok(affected as u64)
    }

    fn run_command(&mut self, command: &str) -> Result<()> {
        self.conn()?.execute_batch(command)?;
        Ok(())
    }

    fn set_attribute(&mut self, name: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        match value.parse::<i64>() {
            Ok(number) => conn.pragma_update(None, name, number)?,
            Err(_) => conn.pragma_update(None, name, value)?,
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close()
                .map_err(|(_, e)| DataError::connection(DriverKind::EmbeddedFile, e.to_string()))?;
        }
        Ok(())
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        use rusqlite::types::Value as SqlValue;
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Real(r) => ToSqlOutput::Owned(SqlValue::Real(*r)),
            Value::Text(t) => ToSqlOutput::Borrowed(ValueRef::Text(t.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}
