// Core infrastructure modules
pub mod config;
pub mod core;

// Feature-specific modules
pub mod query;
pub mod record;

#[cfg(test)]
mod test_utils;

pub use crate::config::{configure, load_config, ConnectionConfig, DriverKind, EnvSource, ProcessEnv, ResolvedSettings};
pub use crate::core::db::{
    Connection, ConnectionManager, ConnectionPool, Connector, Dialer, DialerRegistry, MongoDialer,
    MssqlDialer, MysqlDialer, NativeHandle, PooledConnection, PostgresDialer, SqliteDialer,
};
pub use crate::core::{DataError, Fetched, Record, Result, ResultSet, Row, Value};
pub use crate::query::{Dialect, Direction, JoinKind, Outcome, QueryBuilder};
pub use crate::record::{Model, RecordAccessor};
