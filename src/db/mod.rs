pub mod manager;

pub use manager::{AuditLogEntry, DatabaseManager, ExecutionResult, StorageStats};
