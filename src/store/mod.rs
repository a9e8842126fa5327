//! Persistence layer: libSQL-backed storage for rules and execution logs.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, ExecutionLog, LogStatus, LogStore, RuleStore};
