/// Relational-Tuned Backend Module
///
/// Native driver for the `relational-tuned` backend on top of the `mysql`
/// crate's synchronous client. The connect plan carries a
/// `mysql:host=..;port=..;dbname=..;charset=..` DSN plus credentials; session
/// tuning (`SET NAMES`, `sql_mode`, engine, extra options) arrives as setup
/// commands and runs over the text protocol. Statements run as prepared
/// statements with positional parameters.

use crate::config::DriverKind;
use crate::core::db::connection::{Dialer, NativeHandle};
use crate::core::db::connector::{ConnectPlan, Target};
use crate::core::{DataError, Result, ResultSet, Row, Value};
use mysql::prelude::Queryable;
use mysql::{Conn, OptsBuilder, Params};
use std::collections::BTreeMap;
use tracing::debug;

const DRIVER: DriverKind = DriverKind::RelationalTuned;

/// Opens `mysql` connections for `Target::Dsn` plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlDialer;

impl Dialer for MysqlDialer {
    fn dial(&self, plan: &ConnectPlan) -> Result<Box<dyn NativeHandle>> {
        let dsn = match &plan.target {
            Target::Dsn(dsn) => dsn,
            other => {
                return Err(DataError::connection(
                    DRIVER,
                    format!("mysql driver cannot open a {} target", other.kind()),
                ))
            }
        };
        let fields = dsn_fields(dsn)?;

        let port = match fields.get("port") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| DataError::connection(DRIVER, format!("invalid port '{}' in DSN", raw)))?,
            None => 3306,
        };
        let mut opts = OptsBuilder::new()
            .ip_or_hostname(fields.get("host").cloned())
            .tcp_port(port)
            .db_name(fields.get("dbname").cloned())
            .tcp_connect_timeout(plan.timeout);
        if let Some(credentials) = &plan.credentials {
            opts = opts
                .user(Some(credentials.username.clone()))
                .pass(credentials.password.clone());
        }

        let conn = Conn::new(opts).map_err(|e| DataError::connection(DRIVER, e.to_string()))?;
        debug!(host = ?fields.get("host"), port, "opened mysql connection");
        Ok(Box::new(MysqlHandle { conn: Some(conn) }))
    }
}

/// Splits `mysql:k=v;k=v` into its fields.
fn dsn_fields(dsn: &str) -> Result<BTreeMap<String, String>> {
    let body = dsn.strip_prefix("mysql:").ok_or_else(|| {
        DataError::connection(DRIVER, format!("DSN '{}' does not start with 'mysql:'", dsn))
    })?;
    Ok(body
        .split(';')
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect())
}

pub struct MysqlHandle {
    conn: Option<Conn>,
}

impl MysqlHandle {
    fn conn(&mut self) -> Result<&mut Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| DataError::connection(DRIVER, "handle is closed"))
    }
}

/// Server-side rejections are query errors; everything else is the transport.
fn classify(err: mysql::Error) -> DataError {
    match err {
        mysql::Error::MySqlError(e) => DataError::Query(e.to_string()),
        other => DataError::connection(DRIVER, other.to_string()),
    }
}

fn to_params(params: &[Value]) -> Params {
    if params.is_empty() {
        Params::Empty
    } else {
        Params::Positional(params.iter().map(to_mysql).collect())
    }
}

fn to_mysql(value: &Value) -> mysql::Value {
    match value {
        Value::Null => mysql::Value::NULL,
        Value::Bool(b) => mysql::Value::Int(i64::from(*b)),
        Value::Integer(i) => mysql::Value::Int(*i),
        Value::Real(r) => mysql::Value::Double(*r),
        Value::Text(t) => mysql::Value::Bytes(t.clone().into_bytes()),
        Value::Blob(b) => mysql::Value::Bytes(b.clone()),
    }
}

fn from_mysql(value: &mysql::Value) -> Value {
    match value {
        mysql::Value::NULL => Value::Null,
        mysql::Value::Int(i) => Value::Integer(*i),
        mysql::Value::UInt(u) => match i64::try_from(*u) {
            Ok(i) => Value::Integer(i),
            Err(_) => Value::Text(u.to_string()),
        },
        mysql::Value::Float(f) => Value::Real(f64::from(*f)),
        mysql::Value::Double(d) => Value::Real(*d),
        mysql::Value::Bytes(bytes) => match String::from_utf8(bytes.clone()) {
            Ok(text) => Value::Text(text),
            Err(_) => Value::Blob(bytes.clone()),
        },
        mysql::Value::Date(year, month, day, hour, minute, second, micros) => {
            let mut text = format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            );
            if *micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            Value::Text(text)
        }
        mysql::Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let total_hours = u64::from(*days) * 24 + u64::from(*hours);
            let mut text = format!(
                "{}{:02}:{:02}:{:02}",
                if *negative { "-" } else { "" },
                total_hours,
                minutes,
                seconds
            );
            if *micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            Value::Text(text)
        }
    }
}

impl NativeHandle for MysqlHandle {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        let conn = self.conn()?;
        let stmt = conn.prep(sql).map_err(classify)?;
        let columns: Vec<String> = stmt
            .columns()
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect();
        let rows: Vec<mysql::Row> = conn.exec(&stmt, to_params(params)).map_err(classify)?;

        let out = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(idx, name)| {
                        let value = row.as_ref(idx).map(from_mysql).unwrap_or(Value::Null);
                        (name.clone(), value)
                    })
                    .collect::<Row>()
            })
            .collect();

        Ok(ResultSet::new(columns, out))
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let conn = self.conn()?;
        conn.exec_drop(sql, to_params(params)).map_err(classify)?;
        Ok(conn.affected_rows())
    }

    fn run_command(&mut self, command: &str) -> Result<()> {
        self.conn()?.query_drop(command).map_err(classify)
    }

    fn close(&mut self) -> Result<()> {
        // the client sends COM_QUIT on drop
        self.conn.take();
        Ok(())
    }
}
