//! Execution Gateway
//!
//! Runs validated statements against the SQLite schema with a row cap, a
//! bounded result cache, audit logging, and usage counters. Callable only
//! with an already-validated statement; a minimal prefix/keyword guard is
//! re-run here regardless of caller.
//!
//! Locking: the connection and cache mutexes are held only around the
//! storage call and cache mutation, never across network calls or backoff
//! delays.

use crate::config::DatabaseConfig;
use crate::error::{QueryError, Result};
use crate::schema;
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

lazy_static! {
    static ref RE_WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

pub type Row = serde_json::Map<String, Value>;

/// Result of one gateway execution. Immutable once returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub elapsed: Duration,
    pub truncated: bool,
    pub from_cache: bool,
}

/// One append-only audit record, read back for diagnostics only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub user_id: String,
    pub sql_hash: String,
    pub sql_text: String,
    pub row_count: i64,
    pub execution_time: f64,
    pub created_at: String,
}

/// Aggregate usage counters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StorageStats {
    pub queries_executed: u64,
    pub cache_hits: u64,
}

/// Bounded FIFO cache keyed by normalized statement hash; the oldest entry
/// is evicted when full.
struct QueryCache {
    entries: HashMap<String, ExecutionResult>,
    order: VecDeque<String>,
    max_size: usize,
}

impl QueryCache {
    fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    fn get(&self, key: &str) -> Option<ExecutionResult> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: String, value: ExecutionResult) {
        if self.max_size == 0 {
            return;
        }
        if !self.entries.contains_key(&key) {
            if self.entries.len() >= self.max_size {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
            self.order.push_back(key.clone());
        }
        self.entries.insert(key, value);
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

pub struct DatabaseManager {
    conn: Mutex<Connection>,
    cache: Mutex<QueryCache>,
    max_results: usize,
    queries_executed: AtomicU64,
    cache_hits: AtomicU64,
}

impl DatabaseManager {
    pub fn open(path: &Path, config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        apply_performance_settings(&conn, config)?;
        info!(path = %path.display(), "database opened");
        Ok(Self {
            conn: Mutex::new(conn),
            cache: Mutex::new(QueryCache::new(config.cache_size)),
            max_results: config.max_results,
            queries_executed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        })
    }

    /// In-memory database, used by tests and demos.
    pub fn open_in_memory(config: &DatabaseConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_performance_settings(&conn, config)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cache: Mutex::new(QueryCache::new(config.cache_size)),
            max_results: config.max_results,
            queries_executed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        })
    }

    /// Create the four schema tables, the audit log, and all indexes.
    pub fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        conn.execute_batch(schema::SCHEMA_DDL)?;
        for index in schema::SCHEMA_INDEXES {
            conn.execute(index, [])?;
        }
        info!("schema tables and indexes created");
        Ok(())
    }

    /// Bulk-load interface for the (external) record importer. Not reachable
    /// from any generated statement; the read-only guard does not apply.
    pub fn ingest_batch(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    /// Execute a validated read-only statement for `user_id`.
    ///
    /// Consults the bounded cache first; otherwise runs the statement with
    /// the row cap, appends one audit entry regardless of outcome, and
    /// caches the result.
    pub fn execute_query(&self, sql: &str, user_id: &str) -> Result<ExecutionResult> {
        // Defense in depth: minimal re-check even for validated callers.
        minimal_guard(sql)?;

        let normalized = normalize_sql(sql);
        let hash = sql_hash(&normalized);

        {
            let cache = self.cache.lock().map_err(lock_poisoned)?;
            if let Some(mut cached) = cache.get(&hash) {
                drop(cache);
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(%hash, "query served from cache");
                cached.from_cache = true;
                return Ok(cached);
            }
        }

        let start = Instant::now();
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let outcome = run_select(&conn, sql, self.max_results);
        let elapsed = start.elapsed();
        self.queries_executed.fetch_add(1, Ordering::Relaxed);

        // One audit row per storage execution, success or failure.
        let row_count = outcome.as_ref().map(|(rows, _)| rows.len()).unwrap_or(0);
        if let Err(err) = append_audit(&conn, user_id, &hash, sql, row_count as i64, elapsed) {
            warn!(error = %err, "failed to append audit entry");
        }
        drop(conn);

        let (rows, truncated) = outcome?;
        let result = ExecutionResult {
            row_count: rows.len(),
            rows,
            elapsed,
            truncated,
            from_cache: false,
        };

        {
            let mut cache = self.cache.lock().map_err(lock_poisoned)?;
            cache.put(hash, result.clone());
        }

        info!(
            rows = result.row_count,
            truncated = result.truncated,
            elapsed_ms = elapsed.as_millis() as u64,
            "query executed"
        );
        Ok(result)
    }

    /// Most recent audit entries, newest first. Read-side diagnostics only.
    pub fn recent_audit_entries(&self, limit: usize) -> Result<Vec<AuditLogEntry>> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT user_id, query_hash, query_text, result_count, execution_time, created_at \
             FROM query_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map([limit as i64], |row| {
                Ok(AuditLogEntry {
                    user_id: row.get(0)?,
                    sql_hash: row.get(1)?,
                    sql_text: row.get(2)?,
                    row_count: row.get(3)?,
                    execution_time: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Record counts for the four schema tables.
    pub fn table_stats(&self) -> Result<HashMap<String, i64>> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let mut stats = HashMap::new();
        for table in schema::ALLOWED_TABLES {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
            stats.insert(table.to_string(), count);
        }
        Ok(stats)
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            queries_executed: self.queries_executed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    pub fn clear_cache(&self) -> Result<()> {
        let mut cache = self.cache.lock().map_err(lock_poisoned)?;
        cache.clear();
        Ok(())
    }
}

fn lock_poisoned<T>(_: std::sync::PoisonError<T>) -> QueryError {
    QueryError::Storage("storage lock poisoned".to_string())
}

fn apply_performance_settings(conn: &Connection, config: &DatabaseConfig) -> Result<()> {
    conn.busy_timeout(Duration::from_secs(config.query_timeout_secs))?;
    // PRAGMA failures are non-fatal tuning problems.
    for pragma in [
        "PRAGMA journal_mode = WAL",
        "PRAGMA synchronous = NORMAL",
        "PRAGMA cache_size = 10000",
        "PRAGMA temp_store = MEMORY",
        "PRAGMA foreign_keys = ON",
    ] {
        if let Err(err) = conn.execute_batch(pragma) {
            warn!(pragma, error = %err, "pragma not applied");
        }
    }
    Ok(())
}

/// Cheap prefix/keyword/single-statement check, independent of the full
/// validator.
fn minimal_guard(sql: &str) -> Result<()> {
    let trimmed = sql.trim();
    if !trimmed.to_uppercase().starts_with("SELECT") {
        return Err(QueryError::Policy(
            "gateway accepts SELECT statements only".to_string(),
        ));
    }
    if trimmed.trim_end_matches(';').contains(';') {
        return Err(QueryError::Policy(
            "gateway accepts a single statement only".to_string(),
        ));
    }
    if let Some(keyword) = schema::find_forbidden_keyword(trimmed) {
        return Err(QueryError::Policy(format!("forbidden keyword: {}", keyword)));
    }
    Ok(())
}

/// Whitespace-collapsed, case-folded form used for the cache key and the
/// audit hash.
pub fn normalize_sql(sql: &str) -> String {
    RE_WHITESPACE
        .replace_all(sql.trim().trim_end_matches(';'), " ")
        .to_lowercase()
}

pub fn sql_hash(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn run_select(conn: &Connection, sql: &str, max_results: usize) -> Result<(Vec<Row>, bool)> {
    let mut stmt = conn.prepare(sql)?;
    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();

    let mut rows = stmt.query([])?;
    let mut collected: Vec<Row> = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next()? {
        if collected.len() >= max_results {
            truncated = true;
            break;
        }
        let mut record = Row::new();
        for (idx, name) in column_names.iter().enumerate() {
            record.insert(name.clone(), value_to_json(row.get_ref(idx)?));
        }
        collected.push(record);
    }
    if truncated {
        warn!(max_results, "result set capped");
    }
    Ok((collected, truncated))
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
    }
}

fn append_audit(
    conn: &Connection,
    user_id: &str,
    hash: &str,
    sql: &str,
    row_count: i64,
    elapsed: Duration,
) -> Result<()> {
    conn.execute(
        "INSERT INTO query_log (user_id, query_hash, query_text, result_count, execution_time, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            user_id,
            hash,
            sql,
            row_count,
            elapsed.as_secs_f64(),
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}
