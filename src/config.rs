//! Connection configuration: the static TOML record, environment overrides
//! and the resolved per-backend settings handed to the connection manager.
use crate::core::db::Connector;
use crate::core::{DataError, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable names recognised as overrides.
pub const ENV_DRIVER: &str = "DB_CONNECTION";
pub const ENV_HOST: &str = "DB_HOST";
pub const ENV_PORT: &str = "DB_PORT";
pub const ENV_USERNAME: &str = "DB_USERNAME";
pub const ENV_PASSWORD: &str = "DB_PASSWORD";
pub const ENV_DATABASE: &str = "DB_DATABASE";

/// The five supported storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    /// Relational SQL with charset/collation/strict-mode/engine session tuning
    RelationalTuned,
    /// Relational SQL with schema search path and SSL mode
    RelationalSchema,
    /// Document store
    DocumentStore,
    /// Embedded file-backed database
    EmbeddedFile,
    /// Enterprise relational SQL
    EnterpriseSql,
}

impl DriverKind {
    pub const ALL: [DriverKind; 5] = [
        DriverKind::RelationalTuned,
        DriverKind::RelationalSchema,
        DriverKind::DocumentStore,
        DriverKind::EmbeddedFile,
        DriverKind::EnterpriseSql,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::RelationalTuned => "relational-tuned",
            DriverKind::RelationalSchema => "relational-schema",
            DriverKind::DocumentStore => "document-store",
            DriverKind::EmbeddedFile => "embedded-file",
            DriverKind::EnterpriseSql => "enterprise-sql",
        }
    }

    /// Port used when neither the config file nor the environment sets one.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            DriverKind::RelationalTuned => Some(3306),
            DriverKind::RelationalSchema => Some(5432),
            DriverKind::DocumentStore => Some(27017),
            DriverKind::EmbeddedFile => None,
            DriverKind::EnterpriseSql => Some(1433),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        DriverKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| DataError::Configuration(format!("unsupported database driver '{}'", s)))
    }
}

/// Top-level connection configuration parsed from a TOML file.
///
/// `driver` stays a plain string here so an unknown identifier surfaces as a
/// configuration error at resolve time rather than as a parse failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionConfig {
    pub driver: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    /// Seconds to wait while establishing a connection
    pub connect_timeout: Option<u64>,
    /// Expose full backend diagnostics to end users
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub connections: BackendBlocks,
}

/// Per-backend settings blocks, keyed by driver identifier.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendBlocks {
    #[serde(rename = "relational-tuned")]
    pub relational_tuned: Option<TunedSettings>,
    #[serde(rename = "relational-schema")]
    pub relational_schema: Option<SchemaSettings>,
    #[serde(rename = "document-store")]
    pub document_store: Option<DocumentSettings>,
    #[serde(rename = "embedded-file")]
    pub embedded_file: Option<EmbeddedSettings>,
    #[serde(rename = "enterprise-sql")]
    pub enterprise_sql: Option<EnterpriseSettings>,
}

/// `relational-tuned` session tuning.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TunedSettings {
    pub charset: Option<String>,
    pub collation: Option<String>,
    #[serde(default)]
    pub prefix: String,
    /// `Some(true)` enables strict SQL modes, `Some(false)` relaxes them, `None` leaves the server default
    pub strict: Option<bool>,
    pub engine: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// `relational-schema` connection string extras.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SchemaSettings {
    pub charset: Option<String>,
    #[serde(default)]
    pub prefix: String,
    pub schema: Option<String>,
    pub sslmode: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DocumentSettings {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// `embedded-file` settings. `database` falls back to the top-level field.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EmbeddedSettings {
    pub database: Option<String>,
    #[serde(default)]
    pub prefix: String,
    pub foreign_key_constraints: Option<bool>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EnterpriseSettings {
    pub charset: Option<String>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Source of environment overrides.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads overrides from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Settings after environment overrides, with the backend selected.
#[derive(Clone, PartialEq)]
pub struct ResolvedSettings {
    pub driver: DriverKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub debug: bool,
    pub connector: Connector,
}

impl fmt::Debug for ResolvedSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedSettings")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("connect_timeout", &self.connect_timeout)
            .field("debug", &self.debug)
            .field("connector", &self.connector)
            .finish()
    }
}

impl ConnectionConfig {
    /// Resolves against the process environment.
    pub fn resolve(&self) -> Result<ResolvedSettings> {
        configure(self, &ProcessEnv)
    }
}

/// Returns the override for `key` when it is set and non-empty.
fn env_override(env: &dyn EnvSource, key: &str) -> Option<String> {
    env.var(key).filter(|value| !value.trim().is_empty())
}

/// Merges environment overrides over `config` and selects the backend.
///
/// # Errors
///
/// Returns `DataError::Configuration` if no driver is set, the driver is not
/// one of the five known identifiers, its `[connections.<driver>]` block is
/// missing, or the port override is not a number.
pub fn configure(config: &ConnectionConfig, env: &dyn EnvSource) -> Result<ResolvedSettings> {
    let driver_name = env_override(env, ENV_DRIVER)
        .or_else(|| config.driver.clone().filter(|d| !d.trim().is_empty()))
        .ok_or_else(|| DataError::Configuration("no database driver configured".to_string()))?;
    let driver: DriverKind = driver_name.parse()?;

    let port = match env_override(env, ENV_PORT) {
        Some(raw) => Some(raw.trim().parse::<u16>().map_err(|_| {
            DataError::Configuration(format!("{} must be a port number, got '{}'", ENV_PORT, raw))
        })?),
        None => config.port.or_else(|| driver.default_port()),
    };

    let missing_block = || {
        DataError::Configuration(format!(
            "missing settings block [connections.{}]",
            driver.as_str()
        ))
    };
    let blocks = &config.connections;
    let connector = match driver {
        DriverKind::RelationalTuned => {
            Connector::RelationalTuned(blocks.relational_tuned.clone().ok_or_else(missing_block)?)
        }
        DriverKind::RelationalSchema => {
            Connector::RelationalSchema(blocks.relational_schema.clone().ok_or_else(missing_block)?)
        }
        DriverKind::DocumentStore => {
            Connector::DocumentStore(blocks.document_store.clone().ok_or_else(missing_block)?)
        }
        DriverKind::EmbeddedFile => {
            let mut block = blocks.embedded_file.clone().ok_or_else(missing_block)?;
            // DB_DATABASE outranks the block's own path, which outranks the top level.
            if env_override(env, ENV_DATABASE).is_some() {
                block.database = None;
            }
            Connector::EmbeddedFile(block)
        }
        DriverKind::EnterpriseSql => {
            Connector::EnterpriseSql(blocks.enterprise_sql.clone().ok_or_else(missing_block)?)
        }
    };

    Ok(ResolvedSettings {
        driver,
        host: env_override(env, ENV_HOST).or_else(|| config.host.clone()),
        port,
        username: env_override(env, ENV_USERNAME).or_else(|| config.username.clone()),
        password: env_override(env, ENV_PASSWORD).or_else(|| config.password.clone()),
        database: env_override(env, ENV_DATABASE).or_else(|| config.database.clone()),
        connect_timeout: config.connect_timeout.map(Duration::from_secs),
        debug: config.debug,
        connector,
    })
}

/// Loads connection configuration from a TOML file at the given path.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ConnectionConfig> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}
