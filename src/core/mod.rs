/// Core Module for Rowbound
///
/// Shared infrastructure for the data-access layer: the error taxonomy,
/// the value/row model and the connection plumbing for every backend.

pub mod db;
pub mod error;
pub mod value;

// Re-export commonly used types for convenience
pub use error::{DataError, Result};
pub use value::{Fetched, Record, ResultSet, Row, Value};
