/// # Test Utilities Module
///
/// Shared fixtures for unit tests: a recording mock driver for the networked
/// backends and a seeded in-memory database for the embedded one.

use crate::config::{
    DocumentSettings, DriverKind, EmbeddedSettings, EnterpriseSettings, ResolvedSettings,
    SchemaSettings, TunedSettings,
};
use crate::core::db::{ConnectPlan, Connection, Connector, Dialer, NativeHandle, SqliteHandle, Target};
use crate::core::{DataError, Result, ResultSet, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// One interaction with a mock handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Dial(Target),
    Query(String, Vec<Value>),
    Execute(String, Vec<Value>),
    Command(String),
    Attribute(String, String),
    Close,
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    results: VecDeque<ResultSet>,
}

/// Driver that records every call and never talks to a real backend.
#[derive(Clone, Default)]
pub struct MockDialer {
    state: Arc<Mutex<MockState>>,
    dial_error: Option<String>,
    command_error: Option<String>,
}

impl MockDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dial fails with `message`.
    pub fn failing_dial(mut self, message: &str) -> Self {
        self.dial_error = Some(message.to_string());
        self
    }

    /// Every session command fails with `message`.
    pub fn failing_commands(mut self, message: &str) -> Self {
        self.command_error = Some(message.to_string());
        self
    }

    /// Queues a result for the next `query` call.
    pub fn push_result(&self, result: ResultSet) {
        self.state.lock().unwrap().results.push_back(result);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn handle(&self) -> MockHandle {
        MockHandle {
            dialer: self.clone(),
        }
    }
}

impl Dialer for MockDialer {
    fn dial(&self, plan: &ConnectPlan) -> Result<Box<dyn NativeHandle>> {
        self.record(Call::Dial(plan.target.clone()));
        match &self.dial_error {
            Some(message) => Err(DataError::connection(plan.driver, message.clone())),
            None => Ok(Box::new(self.handle())),
        }
    }
}

struct MockHandle {
    dialer: MockDialer,
}

impl NativeHandle for MockHandle {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        self.dialer.record(Call::Query(sql.to_string(), params.to_vec()));
        let next = self.dialer.state.lock().unwrap().results.pop_front();
        Ok(next.unwrap_or_default())
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.dialer.record(Call::Execute(sql.to_string(), params.to_vec()));
        Ok(1)
    }

    fn run_command(&mut self, command: &str) -> Result<()> {
        self.dialer.record(Call::Command(command.to_string()));
        match &self.dialer.command_error {
            Some(message) => Err(DataError::Query(message.clone())),
            None => Ok(()),
        }
    }

    fn set_attribute(&mut self, name: &str, value: &str) -> Result<()> {
        self.dialer.record(Call::Attribute(name.to_string(), value.to_string()));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.dialer.record(Call::Close);
        Ok(())
    }
}

/// Settings for `connector` with fixed test credentials.
pub fn mock_settings(connector: Connector) -> ResolvedSettings {
    ResolvedSettings {
        driver: connector.driver(),
        host: Some("db.internal".to_string()),
        port: None,
        username: Some("app".to_string()),
        password: Some("secret".to_string()),
        database: Some("app".to_string()),
        connect_timeout: None,
        debug: false,
        connector,
    }
}

/// Settings pointing at a local port nothing listens on, with a short timeout.
pub fn unreachable_settings(connector: Connector) -> ResolvedSettings {
    let mut settings = mock_settings(connector);
    settings.host = Some("127.0.0.1".to_string());
    settings.port = Some(1);
    settings.connect_timeout = Some(std::time::Duration::from_secs(1));
    settings
}

/// A connection over a mock handle; the dialer exposes what the handle saw.
pub fn mock_connection(driver: DriverKind) -> (Connection, MockDialer) {
    mock_connection_with_prefix(driver, "")
}

pub fn mock_connection_with_prefix(driver: DriverKind, prefix: &str) -> (Connection, MockDialer) {
    let dialer = MockDialer::new();
    let conn = Connection::new(driver, prefix, Box::new(dialer.handle()));
    (conn, dialer)
}

/// Default settings block for `driver`.
pub fn default_connector(driver: DriverKind) -> Connector {
    match driver {
        DriverKind::RelationalTuned => Connector::RelationalTuned(TunedSettings::default()),
        DriverKind::RelationalSchema => Connector::RelationalSchema(SchemaSettings::default()),
        DriverKind::DocumentStore => Connector::DocumentStore(DocumentSettings::default()),
        DriverKind::EmbeddedFile => Connector::EmbeddedFile(EmbeddedSettings::default()),
        DriverKind::EnterpriseSql => Connector::EnterpriseSql(EnterpriseSettings::default()),
    }
}

/// In-memory embedded connection with a seeded `users` table.
///
/// | id | username | active | created_at          |
/// |----|----------|--------|---------------------|
/// | 1  | alice    | 1      | 2024-01-02 09:00:00 |
/// | 2  | bob      | 1      | 2024-01-03 09:00:00 |
/// | 3  | carol    | 0      | 2024-01-01 09:00:00 |
pub fn sample_connection() -> Connection {
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "
        CREATE TABLE users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            email TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT,
            updated_at TEXT
        );
        INSERT INTO users (username, email, status, active, created_at, updated_at) VALUES
            ('alice', 'alice@example.com', 'active', 1, '2024-01-02 09:00:00', '2024-01-02 09:00:00'),
            ('bob', 'bob@example.com', 'active', 1, '2024-01-03 09:00:00', '2024-01-03 09:00:00'),
            ('carol', 'carol@example.com', 'suspended', 0, '2024-01-01 09:00:00', '2024-01-01 09:00:00');
        ",
    )
    .unwrap();
    Connection::new(DriverKind::EmbeddedFile, "", Box::new(SqliteHandle::new(conn)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_records_in_order() {
        let (mut conn, dialer) = mock_connection(DriverKind::RelationalSchema);
        dialer.push_result(ResultSet::new(vec!["n".to_string()], Vec::new()));
        let rows = conn.query("SELECT n FROM t WHERE id = $1", &[Value::Integer(1)]).unwrap();
        assert_eq!(rows.columns(), ["n".to_string()]);
        conn.execute("DELETE FROM t", &[]).unwrap();
        drop(conn);

        assert_eq!(
            dialer.calls(),
            vec![
                Call::Query("SELECT n FROM t WHERE id = $1".to_string(), vec![Value::Integer(1)]),
                Call::Execute("DELETE FROM t".to_string(), Vec::new()),
                Call::Close,
            ]
        );
    }

    #[test]
    fn test_failing_dial() {
        let dialer = MockDialer::new().failing_dial("connection refused");
        let settings = mock_settings(default_connector(DriverKind::DocumentStore));
        let plan = settings.connector.plan(&settings).unwrap();
        assert!(matches!(dialer.dial(&plan), Err(DataError::Connection { .. })));
    }

    #[test]
    fn test_sample_connection_is_seeded() {
        let mut conn = sample_connection();
        let rows = conn.query("SELECT COUNT(*) AS n FROM users", &[]).unwrap();
        assert_eq!(rows.into_first().row().and_then(|r| r.get("n")), Some(&Value::Integer(3)));
    }
}
