/// Database Module
///
/// This module provides the connection layer for Rowbound, organized into
/// focused submodules.
///
/// ## Architecture
///
/// - **Connectors** (`connector.rs`): one variant per backend, turning resolved settings into a connect plan
/// - **Connection Management** (`connection.rs`): native handle/driver seams, `Connection`, `ConnectionManager`
/// - **Native Drivers**: `mysql.rs` (relational-tuned), `postgres.rs` (relational-schema),
///   `mongo.rs` (document-store), `sqlite.rs` (embedded-file), `mssql.rs` (enterprise-sql)
/// - **Pooling** (`pool.rs`): fixed-capacity checkout/checkin for concurrent callers
///
/// ## Error Handling
///
/// Dial and session-setup failures surface as `DataError::Connection` with the
/// backend's own diagnostic; nothing in this layer terminates the process.
pub mod connection;
pub mod connector;
pub mod mongo;
pub mod mssql;
pub mod mysql;
pub mod pool;
pub mod postgres;
pub mod sqlite;

pub use self::connection::*;
pub use self::connector::*;
pub use self::mongo::*;
pub use self::mssql::*;
pub use self::mysql::*;
pub use self::pool::*;
pub use self::postgres::*;
pub use self::sqlite::*;
