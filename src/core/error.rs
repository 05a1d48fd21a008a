/// Rowbound Error Module
///
/// This module defines the error taxonomy shared by the connection manager,
/// the query builder and the record accessor. Caller mistakes
/// (`Configuration`, `Validation`) are kept apart from backend faults
/// (`Connection`, `Query`) so callers can decide what is worth retrying.
use thiserror::Error;

/// Comprehensive error type for the data-access layer.
///
/// A zero-row lookup is not an error: single-row operations return
/// [`Fetched::NotFound`](crate::core::Fetched::NotFound) instead.
#[derive(Error, Debug)]
pub enum DataError {
    /// Missing driver, missing per-backend settings block or unresolved table binding
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Handshake, authentication or network failure reported by a backend
    #[error("Connection error ({driver}): {message}")]
    Connection {
        /// Driver identifier the failure came from
        driver: String,
        /// Backend-native diagnostic text
        message: String,
    },

    /// Malformed builder input (empty IN-list, bad sort direction, bad identifier)
    #[error("Validation error: {0}")]
    Validation(String),

    /// The backend rejected a well-formed statement
    #[error("Query error: {0}")]
    Query(String),

    /// Pool checkout timed out or the pool was shut down
    #[error("Pool error: {0}")]
    Pool(String),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file parsing errors
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl DataError {
    /// Builds a connection error tagged with the driver it came from.
    pub fn connection(driver: impl ToString, message: impl Into<String>) -> Self {
        DataError::Connection {
            driver: driver.to_string(),
            message: message.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Only transport-level faults qualify. Caller mistakes and statements the
    /// backend refused will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DataError::Connection { .. } | DataError::Pool(_))
    }

    /// Message suitable for showing to an end user.
    ///
    /// With `debug` set the full diagnostic is returned; otherwise backend
    /// faults collapse to a generic sentence so driver internals do not leak.
    pub fn public_message(&self, debug: bool) -> String {
        if debug {
            return self.to_string();
        }
        match self {
            DataError::Connection { .. } => "Unable to connect to the database.".to_string(),
            DataError::Query(_) => "The database could not complete the request.".to_string(),
            DataError::Pool(_) => "The database is busy, try again later.".to_string(),
            DataError::Io(_) | DataError::Toml(_) => {
                "The database configuration could not be read.".to_string()
            }
            DataError::Configuration(_) | DataError::Validation(_) => self.to_string(),
        }
    }
}

impl From<rusqlite::Error> for DataError {
    fn from(err: rusqlite::Error) -> Self {
        DataError::Query(err.to_string())
    }
}

/// Type alias for Result to use DataError as the error type.
pub type Result<T> = std::result::Result<T, DataError>;
