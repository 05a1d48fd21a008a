/// Connection Management Module
///
/// This module owns the lifecycle of a backend handle: resolving settings,
/// dialing the native driver for the selected backend, applying the
/// backend's session setup, and closing the handle exactly once.

use crate::config::{configure, ConnectionConfig, DriverKind, EnvSource, ProcessEnv, ResolvedSettings};
use crate::core::db::connector::{ConnectPlan, SetupStep};
use crate::core::db::mongo::MongoDialer;
use crate::core::db::mssql::MssqlDialer;
use crate::core::db::mysql::MysqlDialer;
use crate::core::db::postgres::PostgresDialer;
use crate::core::db::sqlite::SqliteDialer;
use crate::core::{DataError, ResultSet, Result, Value};
use crate::query::Dialect;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A live handle to one backend, as exposed by its native driver.
///
/// Statements arrive with `?` placeholders already renumbered for the
/// backend's dialect; values are always passed separately in `params`.
pub trait NativeHandle: Send {
    /// Runs a statement that produces rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<ResultSet>;

    /// Runs a mutating statement and reports the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Runs a parameterless session command.
    fn run_command(&mut self, command: &str) -> Result<()>;

    /// Sets an attribute on the handle itself.
    fn set_attribute(&mut self, name: &str, _value: &str) -> Result<()> {
        Err(DataError::Query(format!(
            "handle attribute '{}' is not supported by this backend",
            name
        )))
    }

    /// Releases the handle. Called at most once.
    fn close(&mut self) -> Result<()>;
}

/// A native driver able to open handles for one backend.
pub trait Dialer: Send + Sync {
    /// Opens a handle for `plan.target`.
    ///
    /// Setup steps are applied by the caller afterwards; failures should be
    /// reported as `DataError::Connection` with the driver's own message.
    fn dial(&self, plan: &ConnectPlan) -> Result<Box<dyn NativeHandle>>;
}

/// Native drivers by backend.
///
/// `default()` registers the built-in driver for every backend. Applications
/// may replace any of them with `register`.
#[derive(Clone)]
pub struct DialerRegistry {
    dialers: HashMap<DriverKind, Arc<dyn Dialer>>,
}

impl DialerRegistry {
    /// A registry with no drivers at all.
    pub fn empty() -> Self {
        DialerRegistry {
            dialers: HashMap::new(),
        }
    }

    pub fn register(&mut self, driver: DriverKind, dialer: Arc<dyn Dialer>) -> &mut Self {
        self.dialers.insert(driver, dialer);
        self
    }

    pub fn get(&self, driver: DriverKind) -> Option<Arc<dyn Dialer>> {
        self.dialers.get(&driver).cloned()
    }

    pub fn supports(&self, driver: DriverKind) -> bool {
        self.dialers.contains_key(&driver)
    }
}

impl Default for DialerRegistry {
    fn default() -> Self {
        let mut registry = DialerRegistry::empty();
        registry
            .register(DriverKind::RelationalTuned, Arc::new(MysqlDialer))
            .register(DriverKind::RelationalSchema, Arc::new(PostgresDialer))
            .register(DriverKind::DocumentStore, Arc::new(MongoDialer))
            .register(DriverKind::EmbeddedFile, Arc::new(SqliteDialer))
            .register(DriverKind::EnterpriseSql, Arc::new(MssqlDialer));
        registry
    }
}

impl fmt::Debug for DialerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut drivers: Vec<_> = self.dialers.keys().map(DriverKind::as_str).collect();
        drivers.sort_unstable();
        f.debug_struct("DialerRegistry").field("drivers", &drivers).finish()
    }
}

/// An open connection to one backend.
///
/// Statements on the same connection run strictly in submission order. A
/// connection is closed exactly once, either explicitly or on drop.
pub struct Connection {
    id: Uuid,
    driver: DriverKind,
    prefix: String,
    handle: Option<Box<dyn NativeHandle>>,
}

impl Connection {
    /// Wraps an already opened native handle.
    pub fn new(driver: DriverKind, prefix: impl Into<String>, handle: Box<dyn NativeHandle>) -> Self {
        Connection {
            id: Uuid::new_v4(),
            driver,
            prefix: prefix.into(),
            handle: Some(handle),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn driver(&self) -> DriverKind {
        self.driver
    }

    pub fn dialect(&self) -> Dialect {
        Dialect::for_driver(self.driver)
    }

    pub fn table_prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// Runs a row-producing statement with bound parameters.
    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        debug!(connection = %self.id, sql, params = params.len(), "query");
        self.handle_mut()?.query(sql, params)
    }

    /// Runs a mutating statement with bound parameters.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        debug!(connection = %self.id, sql, params = params.len(), "execute");
        self.handle_mut()?.execute(sql, params)
    }

    /// Closes the handle. Closing an already closed connection is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(mut handle) => {
                info!(connection = %self.id, driver = %self.driver, "closing connection");
                handle.close()
            }
            None => Ok(()),
        }
    }

    fn handle_mut(&mut self) -> Result<&mut (dyn NativeHandle + 'static)> {
        let driver = self.driver;
        self.handle
            .as_deref_mut()
            .ok_or_else(|| DataError::connection(driver, "connection is closed"))
    }

    fn apply(&mut self, step: &SetupStep) -> Result<()> {
        match step {
            SetupStep::Command(command) => {
                debug!(connection = %self.id, command = %command, "session command");
                self.handle_mut()?.run_command(command)
            }
            SetupStep::Attribute { name, value } => {
                debug!(connection = %self.id, attribute = %name, value = %value, "handle attribute");
                self.handle_mut()?.set_attribute(name, value)
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(connection = %self.id, error = %e, "failed to close connection on drop");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("driver", &self.driver)
            .field("prefix", &self.prefix)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Connection manager for one backend.
///
/// Owns at most one live [`Connection`]; the connection is never shared with
/// another manager.
#[derive(Debug)]
pub struct ConnectionManager {
    settings: ResolvedSettings,
    dialers: DialerRegistry,
    connection: Option<Connection>,
}

impl ConnectionManager {
    /// Creates a manager using the built-in drivers.
    pub fn new(settings: ResolvedSettings) -> Self {
        Self::with_dialers(settings, DialerRegistry::default())
    }

    pub fn with_dialers(settings: ResolvedSettings, dialers: DialerRegistry) -> Self {
        ConnectionManager {
            settings,
            dialers,
            connection: None,
        }
    }

    /// Merges environment overrides over `config` and selects the backend settings.
    pub fn configure(config: &ConnectionConfig, env: &dyn EnvSource) -> Result<ResolvedSettings> {
        configure(config, env)
    }

    /// Resolves `config` against the process environment.
    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        Ok(Self::new(Self::configure(config, &ProcessEnv)?))
    }

    pub fn settings(&self) -> &ResolvedSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().map_or(false, |c| !c.is_closed())
    }

    /// Opens the connection, or returns the one already open.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Connection` carrying the backend's diagnostic when
    /// the handshake or session setup fails. The manager stays usable: a
    /// later call may succeed.
    pub fn connect(&mut self) -> Result<&mut Connection> {
        if !self.is_connected() {
            let connection = Self::open(&self.settings, &self.dialers)?;
            self.connection = Some(connection);
        }
        self.connection()
    }

    /// The open connection.
    pub fn connection(&mut self) -> Result<&mut Connection> {
        match self.connection.as_mut() {
            Some(connection) if !connection.is_closed() => Ok(connection),
            _ => Err(DataError::connection(self.settings.driver, "not connected")),
        }
    }

    /// Closes the connection. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        match self.connection.take() {
            Some(mut connection) => connection.close(),
            None => Ok(()),
        }
    }

    /// Closes any open connection and dials again with the stored settings.
    pub fn reconnect(&mut self) -> Result<&mut Connection> {
        if let Err(e) = self.close() {
            warn!(driver = %self.settings.driver, error = %e, "close before reconnect failed");
        }
        self.connect()
    }

    /// Dials one connection and runs the backend's setup steps on it.
    pub fn open(settings: &ResolvedSettings, dialers: &DialerRegistry) -> Result<Connection> {
        let driver = settings.driver;
        let plan = settings.connector.plan(settings)?;
        let dialer = dialers.get(driver).ok_or_else(|| {
            DataError::connection(driver, format!("no native driver registered for {}", driver))
        })?;

        info!(driver = %driver, target = %plan.target.redacted(), "opening connection");
        let handle = dialer.dial(&plan).map_err(|e| {
            warn!(driver = %driver, error = %e, "connection failed");
            as_connection_error(driver, e)
        })?;

        let mut connection = Connection::new(driver, settings.connector.prefix(), handle);
        for step in &plan.setup {
            if let Err(e) = connection.apply(step) {
                warn!(driver = %driver, error = %e, "session setup failed");
                if let Err(close_err) = connection.close() {
                    warn!(driver = %driver, error = %close_err, "close after failed setup");
                }
                return Err(as_connection_error(driver, e));
            }
        }

        info!(connection = %connection.id(), driver = %driver, "connection ready");
        Ok(connection)
    }
}

fn as_connection_error(driver: DriverKind, err: DataError) -> DataError {
    match err {
        DataError::Connection { .. } => err,
        DataError::Query(message) | DataError::Configuration(message) | DataError::Validation(message) => {
            DataError::connection(driver, message)
        }
        other => DataError::connection(driver, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddedSettings, TunedSettings};
    use crate::core::db::Connector;
    use crate::test_utils::{mock_settings, Call, MockDialer};

    fn embedded_settings(path: &str) -> ResolvedSettings {
        ResolvedSettings {
            driver: DriverKind::EmbeddedFile,
            host: None,
            port: None,
            username: None,
            password: None,
            database: Some(path.to_string()),
            connect_timeout: None,
            debug: false,
            connector: Connector::EmbeddedFile(EmbeddedSettings {
                foreign_key_constraints: Some(true),
                ..EmbeddedSettings::default()
            }),
        }
    }

    #[test]
    fn test_connect_and_close_embedded() {
        let mut manager = ConnectionManager::new(embedded_settings(":memory:"));
        assert!(!manager.is_connected());

        let conn = manager.connect().unwrap();
        assert_eq!(conn.driver(), DriverKind::EmbeddedFile);
        let rows = conn.query("PRAGMA foreign_keys", &[]).unwrap();
        assert_eq!(rows.into_first().row().and_then(|r| r.get("foreign_keys")), Some(&Value::Integer(1)));
        assert!(manager.is_connected());

        manager.close().unwrap();
        assert!(!manager.is_connected());
        // second close is a no-op
        manager.close().unwrap();
    }

    #[test]
    fn test_connect_reuses_open_connection() {
        let mut manager = ConnectionManager::new(embedded_settings(":memory:"));
        let first = manager.connect().unwrap().id();
        let second = manager.connect().unwrap().id();
        assert_eq!(first, second);

        let third = manager.reconnect().unwrap().id();
        assert_ne!(first, third);
    }

    #[test]
    fn test_connection_error_is_recoverable() {
        let mut manager = ConnectionManager::new(embedded_settings("/nonexistent/path/database.db"));
        match manager.connect() {
            Err(DataError::Connection { driver, message }) => {
                assert_eq!(driver, "embedded-file");
                assert!(!message.is_empty());
            }
            other => panic!("Expected Connection error, got {:?}", other),
        }
        assert!(!manager.is_connected());
        assert!(matches!(manager.connection(), Err(DataError::Connection { .. })));
    }

    #[test]
    fn test_unregistered_driver_fails_with_connection_error() {
        let settings = mock_settings(Connector::RelationalTuned(TunedSettings::default()));
        let mut manager = ConnectionManager::with_dialers(settings, DialerRegistry::empty());
        match manager.connect() {
            Err(DataError::Connection { message, .. }) => {
                assert!(message.contains("no native driver registered"))
            }
            other => panic!("Expected Connection error, got {:?}", other),
        }
    }

    #[test]
    fn test_default_registry_covers_every_backend() {
        let registry = DialerRegistry::default();
        for driver in [
            DriverKind::RelationalTuned,
            DriverKind::RelationalSchema,
            DriverKind::DocumentStore,
            DriverKind::EmbeddedFile,
            DriverKind::EnterpriseSql,
        ] {
            assert!(registry.supports(driver), "{} has no driver", driver);
        }
    }

    #[test]
    fn test_setup_steps_run_in_order_after_dial() {
        let tuned = TunedSettings {
            strict: Some(false),
            engine: Some("InnoDB".to_string()),
            ..TunedSettings::default()
        };
        let settings = mock_settings(Connector::RelationalTuned(tuned));
        let dialer = MockDialer::new();
        let mut registry = DialerRegistry::empty();
        registry.register(DriverKind::RelationalTuned, Arc::new(dialer.clone()));

        let mut manager = ConnectionManager::with_dialers(settings, registry);
        manager.connect().unwrap();

        let calls = dialer.calls();
        assert!(matches!(calls[0], Call::Dial(_)));
        assert_eq!(
            calls[1..],
            [
                Call::Command("SET NAMES 'utf8mb4' COLLATE 'utf8mb4_unicode_ci'".to_string()),
                Call::Command("SET SESSION sql_mode = 'NO_ENGINE_SUBSTITUTION'".to_string()),
                Call::Command("SET SESSION default_storage_engine = 'InnoDB'".to_string()),
            ]
        );
    }

    #[test]
    fn test_failed_setup_closes_handle_and_reports_connection_error() {
        let settings = mock_settings(Connector::RelationalTuned(TunedSettings::default()));
        let dialer = MockDialer::new().failing_commands("Unknown character set: 'utf8mb4'");
        let mut registry = DialerRegistry::empty();
        registry.register(DriverKind::RelationalTuned, Arc::new(dialer.clone()));

        let mut manager = ConnectionManager::with_dialers(settings, registry);
        match manager.connect() {
            Err(DataError::Connection { message, .. }) => assert!(message.contains("Unknown character set")),
            other => panic!("Expected Connection error, got {:?}", other),
        }
        assert_eq!(dialer.calls().last(), Some(&Call::Close));
    }

    #[test]
    fn test_closed_connection_rejects_statements_and_closes_once() {
        let dialer = MockDialer::new();
        let mut registry = DialerRegistry::empty();
        registry.register(DriverKind::RelationalTuned, Arc::new(dialer.clone()));
        let settings = mock_settings(Connector::RelationalTuned(TunedSettings::default()));

        let mut conn = ConnectionManager::open(&settings, &registry).unwrap();
        conn.close().unwrap();
        conn.close().unwrap();
        assert!(matches!(conn.query("SELECT 1", &[]), Err(DataError::Connection { .. })));
        drop(conn);

        let closes = dialer.calls().iter().filter(|c| **c == Call::Close).count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_drop_closes_connection() {
        let dialer = MockDialer::new();
        let mut registry = DialerRegistry::empty();
        registry.register(DriverKind::RelationalTuned, Arc::new(dialer.clone()));
        let settings = mock_settings(Connector::RelationalTuned(TunedSettings::default()));

        {
            let mut manager = ConnectionManager::with_dialers(settings, registry);
            manager.connect().unwrap();
        }
        assert_eq!(dialer.calls().last(), Some(&Call::Close));
    }
}
