/// Enterprise-SQL Backend Module
///
/// Native driver for the `enterprise-sql` backend on top of `tiberius`.
/// Tiberius is async-only, so every handle owns a current-thread tokio
/// runtime and blocks on it for each call. Handles must therefore not be
/// used from inside another tokio runtime.
///
/// Session options from the plan run through `simple_query`, not
/// `sp_executesql`, so that they outlive the batch that set them.

use crate::config::DriverKind;
use crate::core::db::connection::{Dialer, NativeHandle};
use crate::core::db::connector::{ConnectPlan, Target};
use crate::core::{DataError, Result, ResultSet, Row, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql, ToSql};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

const DRIVER: DriverKind = DriverKind::EnterpriseSql;

type TdsClient = Client<Compat<TcpStream>>;

/// Opens `tiberius` clients for `Target::Options` plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlDialer;

fn tds_config(options: &BTreeMap<String, String>) -> Result<Config> {
    let mut config = Config::new();
    config.host(options.get("server").map(String::as_str).unwrap_or("127.0.0.1"));
    if let Some(raw) = options.get("port").filter(|p| !p.is_empty()) {
        let port = raw
            .parse::<u16>()
            .map_err(|_| DataError::connection(DRIVER, format!("invalid port '{}'", raw)))?;
        config.port(port);
    }
    if let Some(database) = options.get("database") {
        config.database(database);
    }
    if let Some(user) = options.get("user") {
        let password = options.get("password").map(String::as_str).unwrap_or("");
        config.authentication(AuthMethod::sql_server(user, password));
    }
    config.trust_cert();
    Ok(config)
}

async fn within<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| DataError::connection(DRIVER, format!("timed out after {:?}", limit)))?,
        None => fut.await,
    }
}

impl Dialer for MssqlDialer {
    fn dial(&self, plan: &ConnectPlan) -> Result<Box<dyn NativeHandle>> {
        let options = match &plan.target {
            Target::Options(options) => options,
            other => {
                return Err(DataError::connection(
                    DRIVER,
                    format!("tiberius driver cannot open a {} target", other.kind()),
                ))
            }
        };
        let config = tds_config(options)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DataError::connection(DRIVER, e.to_string()))?;

        let connect = async move {
            let tcp = TcpStream::connect(config.get_addr())
                .await
                .map_err(|e| DataError::connection(DRIVER, e.to_string()))?;
            tcp.set_nodelay(true)
                .map_err(|e| DataError::connection(DRIVER, e.to_string()))?;
            Client::connect(config, tcp.compat_write())
                .await
                .map_err(|e| DataError::connection(DRIVER, e.to_string()))
        };
        let client = runtime.block_on(within(plan.timeout, connect))?;

        debug!(target = %plan.target.redacted(), "opened tiberius client");
        Ok(Box::new(MssqlHandle {
            runtime,
            client: Some(client),
        }))
    }
}

pub struct MssqlHandle {
    runtime: Runtime,
    client: Option<TdsClient>,
}

impl MssqlHandle {
    fn parts(&mut self) -> Result<(&Runtime, &mut TdsClient)> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| DataError::connection(DRIVER, "handle is closed"))?;
        Ok((&self.runtime, client))
    }
}

fn classify(err: tiberius::error::Error) -> DataError {
    match err {
        tiberius::error::Error::Io { .. } => DataError::connection(DRIVER, err.to_string()),
        other => DataError::Query(other.to_string()),
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            Value::Null => ColumnData::String(None),
            Value::Bool(b) => ColumnData::Bit(Some(*b)),
            Value::Integer(i) => ColumnData::I64(Some(*i)),
            Value::Real(r) => ColumnData::F64(Some(*r)),
            Value::Text(t) => ColumnData::String(Some(Cow::Borrowed(t.as_str()))),
            Value::Blob(b) => ColumnData::Binary(Some(Cow::Borrowed(b.as_slice()))),
        }
    }
}

fn bind(params: &[Value]) -> Vec<&dyn ToSql> {
    params.iter().map(|v| v as &dyn ToSql).collect()
}

fn text<T: ToString>(value: Option<T>) -> Value {
    value.map(|v| Value::Text(v.to_string())).unwrap_or(Value::Null)
}

fn from_column(data: &ColumnData<'static>) -> Result<Value> {
    let value = match data {
        ColumnData::U8(v) => v.map(|n| Value::Integer(n.into())).unwrap_or(Value::Null),
        ColumnData::I16(v) => v.map(|n| Value::Integer(n.into())).unwrap_or(Value::Null),
        ColumnData::I32(v) => v.map(|n| Value::Integer(n.into())).unwrap_or(Value::Null),
        ColumnData::I64(v) => v.map(Value::Integer).unwrap_or(Value::Null),
        ColumnData::F32(v) => v.map(|n| Value::Real(n.into())).unwrap_or(Value::Null),
        ColumnData::F64(v) => v.map(Value::Real).unwrap_or(Value::Null),
        ColumnData::Bit(v) => v.map(Value::Bool).unwrap_or(Value::Null),
        ColumnData::String(v) => text(v.as_deref()),
        ColumnData::Guid(v) => text(v.as_ref()),
        ColumnData::Numeric(v) => text(v.as_ref()),
        ColumnData::Xml(v) => text(v.as_deref()),
        ColumnData::Binary(v) => v
            .as_ref()
            .map(|b| Value::Blob(b.to_vec()))
            .unwrap_or(Value::Null),
        ColumnData::Date(_) => text(
            chrono::NaiveDate::from_sql(data)
                .map_err(classify)?
                .map(|d| d.format("%Y-%m-%d")),
        ),
        ColumnData::Time(_) => text(chrono::NaiveTime::from_sql(data).map_err(classify)?),
        ColumnData::DateTimeOffset(_) => text(
            chrono::DateTime::<chrono::Utc>::from_sql(data)
                .map_err(classify)?
                .map(|d| d.format("%Y-%m-%d %H:%M:%S")),
        ),
        _ => text(
            chrono::NaiveDateTime::from_sql(data)
                .map_err(classify)?
                .map(|d| d.format("%Y-%m-%d %H:%M:%S")),
        ),
    };
    Ok(value)
}

impl NativeHandle for MssqlHandle {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        let (runtime, client) = self.parts()?;
        let (columns, rows) = runtime.block_on(async {
            let mut stream = client.query(sql, &bind(params)).await?;
            let columns: Vec<String> = stream
                .columns()
                .await?
                .map(|cols| cols.iter().map(|c| c.name().to_string()).collect())
                .unwrap_or_default();
            let rows = stream.into_first_result().await?;
            Ok::<_, tiberius::error::Error>((columns, rows))
        })
        .map_err(classify)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut mapped = Row::new();
            for (name, data) in columns.iter().zip(row.into_iter()) {
                mapped.insert(name.clone(), from_column(&data)?);
            }
            out.push(mapped);
        }
        Ok(ResultSet::new(columns, out))
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let (runtime, client) = self.parts()?;
        runtime
            .block_on(async { client.execute(sql, &bind(params)).await })
            .map(|result| result.total())
            .map_err(classify)
    }

    fn run_command(&mut self, command: &str) -> Result<()> {
        let (runtime, client) = self.parts()?;
        runtime
            .block_on(async { client.simple_query(command).await?.into_results().await })
            .map(|_| ())
            .map_err(classify)
    }

    fn close(&mut self) -> Result<()> {
        match self.client.take() {
            Some(client) => self
                .runtime
                .block_on(client.close())
                .map_err(|e| DataError::connection(DRIVER, e.to_string())),
            None => Ok(()),
        }
    }
}
