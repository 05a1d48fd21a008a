/// Relational-Schema Backend Module
///
/// Native driver for the `relational-schema` backend on top of the
/// synchronous `postgres` client. The plan's libpq keyword/value DSN already
/// carries the credentials and the schema search path, so dialing is a parse
/// plus connect. Values bind through a `ToSql` impl that narrows integers and
/// floats to the parameter type the server inferred.

use crate::config::DriverKind;
use crate::core::db::connection::{Dialer, NativeHandle};
use crate::core::db::connector::{ConnectPlan, Target};
use crate::core::{DataError, Result, ResultSet, Row, Value};
use bytes::BytesMut;
use postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use postgres::{Client, Config, NoTls};
use std::error::Error as StdError;
use tracing::debug;

const DRIVER: DriverKind = DriverKind::RelationalSchema;

type BoxError = Box<dyn StdError + Sync + Send>;

/// Opens `postgres` clients for `Target::Dsn` plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialer;

impl Dialer for PostgresDialer {
    fn dial(&self, plan: &ConnectPlan) -> Result<Box<dyn NativeHandle>> {
        let dsn = match &plan.target {
            Target::Dsn(dsn) => dsn,
            other => {
                return Err(DataError::connection(
                    DRIVER,
                    format!("postgres driver cannot open a {} target", other.kind()),
                ))
            }
        };

        let mut config: Config = dsn
            .parse()
            .map_err(|e: postgres::Error| DataError::connection(DRIVER, e.to_string()))?;
        if let Some(timeout) = plan.timeout {
            config.connect_timeout(timeout);
        }
        let client = config
            .connect(NoTls)
            .map_err(|e| DataError::connection(DRIVER, e.to_string()))?;
        debug!(target = %plan.target.redacted(), "opened postgres connection");
        Ok(Box::new(PostgresHandle { client: Some(client) }))
    }
}

pub struct PostgresHandle {
    client: Option<Client>,
}

impl PostgresHandle {
    fn client(&mut self) -> Result<&mut Client> {
        self.client
            .as_mut()
            .ok_or_else(|| DataError::connection(DRIVER, "handle is closed"))
    }
}

fn classify(err: postgres::Error) -> DataError {
    let io_failure = err.source().map_or(false, |s| s.is::<std::io::Error>());
    if err.as_db_error().is_none() && (err.is_closed() || io_failure) {
        DataError::connection(DRIVER, err.to_string())
    } else {
        DataError::Query(err.to_string())
    }
}

fn bind(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

fn int_to_sql(value: i64, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
    if *ty == Type::INT2 {
        i16::try_from(value)?.to_sql(ty, out)
    } else if *ty == Type::INT4 {
        i32::try_from(value)?.to_sql(ty, out)
    } else if *ty == Type::FLOAT8 {
        (value as f64).to_sql(ty, out)
    } else if *ty == Type::BOOL {
        (value != 0).to_sql(ty, out)
    } else {
        value.to_sql(ty, out)
    }
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) if *ty == Type::BOOL => b.to_sql(ty, out),
            Value::Bool(b) => int_to_sql(i64::from(*b), ty, out),
            Value::Integer(i) => int_to_sql(*i, ty, out),
            Value::Real(r) if *ty == Type::FLOAT4 => (*r as f32).to_sql(ty, out),
            Value::Real(r) => r.to_sql(ty, out),
            Value::Text(t) => t.as_str().to_sql(ty, out),
            Value::Blob(b) => b.as_slice().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Reads one column by its declared type; unknown types go through text.
fn column_value(row: &postgres::Row, idx: usize) -> std::result::Result<Value, postgres::Error> {
    let ty = row.columns()[idx].type_();
    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Integer(v.into()))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?.map(|v| Value::Integer(v.into()))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(Value::Integer)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?.map(|v| Value::Real(v.into()))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(Value::Real)
    } else if *ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Blob)
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(|v| Value::Text(v.format("%Y-%m-%d %H:%M:%S").to_string()))
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
            .map(|v| Value::Text(v.format("%Y-%m-%d %H:%M:%S").to_string()))
    } else if *ty == Type::DATE {
        row.try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map(|v| Value::Text(v.format("%Y-%m-%d").to_string()))
    } else {
        row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
    };
    Ok(value.unwrap_or(Value::Null))
}

impl NativeHandle for PostgresHandle {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        let client = self.client()?;
        let stmt = client.prepare(sql).map_err(classify)?;
        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
        let rows = client.query(&stmt, &bind(params)).map_err(classify)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut mapped = Row::new();
            for (idx, name) in columns.iter().enumerate() {
                mapped.insert(name.clone(), column_value(row, idx).map_err(classify)?);
            }
            out.push(mapped);
        }
        Ok(ResultSet::new(columns, out))
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.client()?.execute(sql, &bind(params)).map_err(classify)
    }

    fn run_command(&mut self, command: &str) -> Result<()> {
        self.client()?.batch_execute(command).map_err(classify)
    }

    fn close(&mut self) -> Result<()> {
        match self.client.take() {
            Some(client) => client
                .close()
                .map_err(|e| DataError::connection(DRIVER, e.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchemaSettings;
    use crate::core::db::Connector;
    use crate::test_utils::unreachable_settings;

    fn encode(value: &Value, ty: &Type) -> std::result::Result<Vec<u8>, BoxError> {
        let mut out = BytesMut::new();
        value.to_sql(ty, &mut out)?;
        Ok(out.to_vec())
    }

    #[test]
    fn test_integers_narrow_to_parameter_type() {
        assert_eq!(encode(&Value::Integer(7), &Type::INT2).unwrap(), 7i16.to_be_bytes());
        assert_eq!(encode(&Value::Integer(7), &Type::INT4).unwrap(), 7i32.to_be_bytes());
        assert_eq!(encode(&Value::Integer(7), &Type::INT8).unwrap(), 7i64.to_be_bytes());
        assert!(encode(&Value::Integer(70_000), &Type::INT2).is_err());
    }

    #[test]
    fn test_scalar_encoding() {
        assert_eq!(encode(&Value::Bool(true), &Type::BOOL).unwrap(), vec![1]);
        assert_eq!(encode(&Value::Bool(true), &Type::INT4).unwrap(), 1i32.to_be_bytes());
        assert_eq!(encode(&Value::Real(1.5), &Type::FLOAT4).unwrap(), 1.5f32.to_be_bytes());
        assert_eq!(encode(&Value::from("abc"), &Type::TEXT).unwrap(), b"abc".to_vec());

        let mut out = BytesMut::new();
        assert!(matches!(Value::Null.to_sql(&Type::TEXT, &mut out), Ok(IsNull::Yes)));
    }

    #[test]
    fn test_dial_failures_are_connection_errors() {
        let settings = unreachable_settings(Connector::RelationalSchema(SchemaSettings::default()));
        let mut wrong_target = settings.connector.plan(&settings).unwrap();
        wrong_target.target = Target::File("app.db".to_string());
        assert!(matches!(PostgresDialer.dial(&wrong_target), Err(DataError::Connection { .. })));

        let plan = settings.connector.plan(&settings).unwrap();
        match PostgresDialer.dial(&plan) {
            Err(DataError::Connection { driver, .. }) => assert_eq!(driver, "relational-schema"),
            Err(other) => panic!("Expected Connection error, got {:?}", other),
            Ok(_) => panic!("nothing listens on port 1"),
        }
    }
}
