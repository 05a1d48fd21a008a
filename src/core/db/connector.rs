/// Connector Module
///
/// One variant per backend, selected once when settings are resolved. Each
/// variant knows how to turn resolved settings into a [`ConnectPlan`]: the
/// target the native driver should dial plus the ordered session commands
/// or handle attributes to apply once the handle is open.
use crate::config::{
    DocumentSettings, DriverKind, EmbeddedSettings, EnterpriseSettings, ResolvedSettings,
    SchemaSettings, TunedSettings,
};
use crate::core::{DataError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

const STRICT_SQL_MODE: &str = "ONLY_FULL_GROUP_BY,STRICT_TRANS_TABLES,NO_ZERO_IN_DATE,NO_ZERO_DATE,ERROR_FOR_DIVISION_BY_ZERO,NO_ENGINE_SUBSTITUTION";
const RELAXED_SQL_MODE: &str = "NO_ENGINE_SUBSTITUTION";

static OPTION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").expect("valid option name pattern"));
static OPTION_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.+-]+$").expect("valid option token pattern"));

/// Backend selection together with its settings block.
#[derive(Debug, Clone, PartialEq)]
pub enum Connector {
    RelationalTuned(TunedSettings),
    RelationalSchema(SchemaSettings),
    DocumentStore(DocumentSettings),
    EmbeddedFile(EmbeddedSettings),
    EnterpriseSql(EnterpriseSettings),
}

/// Where the native driver should connect.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Driver connection string
    Dsn(String),
    /// Key/value options handed to a client constructor
    Options(BTreeMap<String, String>),
    /// Path of a database file (`:memory:` for a private in-memory database)
    File(String),
}

impl Target {
    /// Short name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Target::Dsn(_) => "dsn",
            Target::Options(_) => "options",
            Target::File(_) => "file",
        }
    }

    /// Rendering with any password masked, for logs.
    pub fn redacted(&self) -> String {
        static DSN_PASSWORD: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"password=('(?:[^'\\]|\\.)*'|\S+)").expect("valid redaction pattern")
        });
        match self {
            Target::Dsn(dsn) => DSN_PASSWORD.replace_all(dsn, "password=***").into_owned(),
            Target::Options(options) => options
                .iter()
                .map(|(k, v)| {
                    if k == "password" {
                        format!("{}=***", k)
                    } else {
                        format!("{}={}", k, v)
                    }
                })
                .collect::<Vec<_>>()
                .join(" "),
            Target::File(path) => path.clone(),
        }
    }
}

/// A step applied to a freshly opened handle, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SetupStep {
    /// Session command sent as a statement
    Command(String),
    /// Attribute set on the handle itself
    Attribute { name: String, value: String },
}

#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Everything a native driver needs to open and prepare one handle.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectPlan {
    pub driver: DriverKind,
    pub target: Target,
    /// Credentials passed beside the target (`None` when embedded in it)
    pub credentials: Option<Credentials>,
    pub setup: Vec<SetupStep>,
    pub timeout: Option<Duration>,
}

impl Connector {
    pub fn driver(&self) -> DriverKind {
        match self {
            Connector::RelationalTuned(_) => DriverKind::RelationalTuned,
            Connector::RelationalSchema(_) => DriverKind::RelationalSchema,
            Connector::DocumentStore(_) => DriverKind::DocumentStore,
            Connector::EmbeddedFile(_) => DriverKind::EmbeddedFile,
            Connector::EnterpriseSql(_) => DriverKind::EnterpriseSql,
        }
    }

    /// Table prefix applied by the query builder.
    pub fn prefix(&self) -> &str {
        match self {
            Connector::RelationalTuned(s) => &s.prefix,
            Connector::RelationalSchema(s) => &s.prefix,
            Connector::DocumentStore(s) => &s.prefix,
            Connector::EmbeddedFile(s) => &s.prefix,
            Connector::EnterpriseSql(s) => &s.prefix,
        }
    }

    /// Builds the connect procedure for this backend.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Configuration` when an extra option has a name or
    /// value that cannot be sent safely, or when the embedded backend has no
    /// database path.
    pub fn plan(&self, settings: &ResolvedSettings) -> Result<ConnectPlan> {
        let (target, credentials, setup) = match self {
            Connector::RelationalTuned(s) => plan_tuned(s, settings)?,
            Connector::RelationalSchema(s) => plan_schema(s, settings)?,
            Connector::DocumentStore(s) => plan_document(s, settings),
            Connector::EmbeddedFile(s) => plan_embedded(s, settings)?,
            Connector::EnterpriseSql(s) => plan_enterprise(s, settings)?,
        };
        Ok(ConnectPlan {
            driver: self.driver(),
            target,
            credentials,
            setup,
            timeout: settings.connect_timeout,
        })
    }
}

type PlanParts = (Target, Option<Credentials>, Vec<SetupStep>);

fn host(settings: &ResolvedSettings) -> &str {
    settings.host.as_deref().unwrap_or("127.0.0.1")
}

fn port(settings: &ResolvedSettings) -> String {
    settings
        .port
        .or_else(|| settings.driver.default_port())
        .map(|p| p.to_string())
        .unwrap_or_default()
}

fn credentials(settings: &ResolvedSettings) -> Option<Credentials> {
    settings.username.as_ref().map(|username| Credentials {
        username: username.clone(),
        password: settings.password.clone(),
    })
}

/// SQL string literal.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Value inside a keyword/value connection string.
fn conninfo_value(value: &str) -> String {
    let plain = !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
    }
}

fn option_name(name: &str) -> Result<&str> {
    if OPTION_NAME.is_match(name) {
        Ok(name)
    } else {
        Err(DataError::Configuration(format!("invalid session option name '{}'", name)))
    }
}

fn plan_tuned(s: &TunedSettings, settings: &ResolvedSettings) -> Result<PlanParts> {
    let charset = s.charset.as_deref().unwrap_or("utf8mb4");
    let collation = s.collation.as_deref().unwrap_or("utf8mb4_unicode_ci");

    let mut dsn = format!("mysql:host={};port={}", host(settings), port(settings));
    if let Some(database) = &settings.database {
        dsn.push_str(&format!(";dbname={}", database));
    }
    dsn.push_str(&format!(";charset={}", charset));

    let mut setup = vec![SetupStep::Command(format!(
        "SET NAMES {} COLLATE {}",
        quote(charset),
        quote(collation)
    ))];
    match s.strict {
        Some(true) => setup.push(SetupStep::Command(format!(
            "SET SESSION sql_mode = {}",
            quote(STRICT_SQL_MODE)
        ))),
        Some(false) => setup.push(SetupStep::Command(format!(
            "SET SESSION sql_mode = {}",
            quote(RELAXED_SQL_MODE)
        ))),
        None => {}
    }
    if let Some(engine) = &s.engine {
        setup.push(SetupStep::Command(format!(
            "SET SESSION default_storage_engine = {}",
            quote(engine)
        )));
    }
    for (name, value) in &s.options {
        setup.push(SetupStep::Command(format!(
            "SET SESSION {} = {}",
            option_name(name)?,
            quote(value)
        )));
    }

    Ok((Target::Dsn(dsn), credentials(settings), setup))
}

fn plan_schema(s: &SchemaSettings, settings: &ResolvedSettings) -> Result<PlanParts> {
    let mut parts = vec![
        format!("host={}", conninfo_value(host(settings))),
        format!("port={}", port(settings)),
    ];
    if let Some(database) = &settings.database {
        parts.push(format!("dbname={}", conninfo_value(database)));
    }
    if let Some(username) = &settings.username {
        parts.push(format!("user={}", conninfo_value(username)));
    }
    if let Some(password) = &settings.password {
        parts.push(format!("password={}", conninfo_value(password)));
    }
    if let Some(schema) = s.schema.as_deref().filter(|v| !v.is_empty()) {
        parts.push(format!(
            "options={}",
            conninfo_value(&format!("-c search_path={}", schema))
        ));
    }
    if let Some(sslmode) = s.sslmode.as_deref().filter(|v| !v.is_empty()) {
        parts.push(format!("sslmode={}", conninfo_value(sslmode)));
    }

    let charset = s.charset.as_deref().unwrap_or("utf8");
    let mut setup = vec![SetupStep::Command(format!(
        "SET client_encoding TO {}",
        quote(charset)
    ))];
    for (name, value) in &s.options {
        setup.push(SetupStep::Command(format!(
            "SET {} TO {}",
            option_name(name)?,
            quote(value)
        )));
    }

    Ok((Target::Dsn(parts.join(" ")), None, setup))
}

fn plan_document(s: &DocumentSettings, settings: &ResolvedSettings) -> PlanParts {
    let mut options = BTreeMap::new();
    options.insert("host".to_string(), host(settings).to_string());
    options.insert("port".to_string(), port(settings));
    if let Some(username) = &settings.username {
        options.insert("username".to_string(), username.clone());
    }
    if let Some(password) = &settings.password {
        options.insert("password".to_string(), password.clone());
    }
    if let Some(database) = &settings.database {
        options.insert("database".to_string(), database.clone());
    }
    // Extra options never shadow the core connection fields.
    for (name, value) in &s.options {
        options.entry(name.clone()).or_insert_with(|| value.clone());
    }
    (Target::Options(options), None, Vec::new())
}

fn plan_embedded(s: &EmbeddedSettings, settings: &ResolvedSettings) -> Result<PlanParts> {
    let path = s
        .database
        .as_deref()
        .or(settings.database.as_deref())
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| {
            DataError::Configuration("embedded-file backend requires a database path".to_string())
        })?;

    let mut setup = Vec::new();
    if let Some(enforce) = s.foreign_key_constraints {
        setup.push(SetupStep::Attribute {
            name: "foreign_keys".to_string(),
            value: if enforce { "1" } else { "0" }.to_string(),
        });
    }
    for (name, value) in &s.options {
        setup.push(SetupStep::Attribute {
            name: option_name(name)?.to_string(),
            value: value.clone(),
        });
    }

    Ok((Target::File(path.to_string()), None, setup))
}

fn plan_enterprise(s: &EnterpriseSettings, settings: &ResolvedSettings) -> Result<PlanParts> {
    let mut options = BTreeMap::new();
    options.insert("server".to_string(), host(settings).to_string());
    options.insert("port".to_string(), port(settings));
    options.insert(
        "charset".to_string(),
        s.charset.clone().unwrap_or_else(|| "UTF-8".to_string()),
    );
    if let Some(database) = &settings.database {
        options.insert("database".to_string(), database.clone());
    }
    if let Some(username) = &settings.username {
        options.insert("user".to_string(), username.clone());
    }
    if let Some(password) = &settings.password {
        options.insert("password".to_string(), password.clone());
    }

    let mut setup = Vec::new();
    for (name, value) in &s.options {
        if !OPTION_TOKEN.is_match(value) {
            return Err(DataError::Configuration(format!(
                "invalid value '{}' for session option '{}'",
                value, name
            )));
        }
        setup.push(SetupStep::Command(format!("SET {} {}", option_name(name)?, value)));
    }

    Ok((Target::Options(options), None, setup))
}
