//! Data store boundary for rate-limit records, session baselines and audit
//! events.
//!
//! The guard never owns persistence. Everything it needs is expressed through
//! [`DataStore`]: keyed JSON records, prefix queries and a per-key
//! compare-and-swap so counters can be updated without a read-then-write race.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{GuardError, Result};
use crate::lock_utils::lock_or_fail;

/// Selection of records by key prefix and optional key range
#[derive(Debug, Clone, Default)]
pub struct StoreFilter {
    /// Key prefix, e.g. `audit:` or `ratelimit:`
    pub prefix: String,
    /// Smallest key returned (inclusive)
    pub start: Option<String>,
    /// Keys must sort strictly below this one
    pub end: Option<String>,
    /// Maximum number of records returned (oldest keys first)
    pub limit: Option<usize>,
}

impl StoreFilter {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    pub fn with_start(mut self, start: impl Into<String>) -> Self {
        self.start = Some(start.into());
        self
    }

    pub fn with_end(mut self, end: impl Into<String>) -> Self {
        self.end = Some(end.into());
        self
    }

    /// Whether `key` falls inside the prefix and range
    pub fn matches(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
            && self.start.as_deref().map_or(true, |start| key >= start)
            && self.end.as_deref().map_or(true, |end| key < end)
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Persistence used by the rate limiter, session detector and audit sink.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn upsert(&self, key: &str, record: Value) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Records whose key starts with `filter.prefix`, ordered by key
    async fn query(&self, filter: &StoreFilter) -> Result<Vec<(String, Value)>>;

    /// Atomically replace the record at `key` if it still equals `expected`
    /// (`None` meaning "absent"). Returns `false` when another writer won.
    async fn compare_and_swap(&self, key: &str, expected: Option<&Value>, new: Value) -> Result<bool>;
}

// ============================================
// In-memory store
// ============================================

/// Sharded in-process store. Suitable for a single process or for tests.
#[derive(Debug)]
pub struct MemoryStore {
    records: DashMap<String, Value>,
    /// When false every operation reports `StoreUnavailable` (outage simulation)
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability; used to exercise fail-open / fail-closed paths
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GuardError::StoreUnavailable("memory store marked unavailable".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_available()?;
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn upsert(&self, key: &str, record: Value) -> Result<()> {
        self.ensure_available()?;
        self.records.insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_available()?;
        self.records.remove(key);
        Ok(())
    }

    async fn query(&self, filter: &StoreFilter) -> Result<Vec<(String, Value)>> {
        self.ensure_available()?;
        let mut rows: Vec<(String, Value)> = self
            .records
            .iter()
            .filter(|r| filter.matches(r.key()))
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<&Value>, new: Value) -> Result<bool> {
        self.ensure_available()?;
        // The entry guard holds the shard lock for the whole comparison.
        let swapped = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if expected == Some(entry.get()) {
                    entry.insert(new);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                if expected.is_none() {
                    entry.insert(new);
                    true
                } else {
                    false
                }
            }
        };
        Ok(swapped)
    }
}

// ============================================
// SQLite store
// ============================================

/// Relational store keeping each record as a JSON document in one table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a store database
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        let store = Self::init(conn)?;
        info!("Opened guard store database: {:?}", db_path.as_ref());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS guard_records (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

fn parse_row(raw: &str) -> Result<Value> {
    Ok(serde_json::from_str(raw)?)
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = lock_or_fail(&self.conn, "sqlite store")?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM guard_records WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        raw.as_deref().map(parse_row).transpose()
    }

    async fn upsert(&self, key: &str, record: Value) -> Result<()> {
        let conn = lock_or_fail(&self.conn, "sqlite store")?;
        conn.execute(
            "INSERT OR REPLACE INTO guard_records (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, record.to_string(), Self::now()],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let conn = lock_or_fail(&self.conn, "sqlite store")?;
        conn.execute("DELETE FROM guard_records WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn query(&self, filter: &StoreFilter) -> Result<Vec<(String, Value)>> {
        let conn = lock_or_fail(&self.conn, "sqlite store")?;
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(
            "SELECT key, value FROM guard_records
             WHERE key >= ?1 AND substr(key, 1, length(?1)) = ?1
               AND (?3 IS NULL OR key >= ?3)
               AND (?4 IS NULL OR key < ?4)
             ORDER BY key LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![filter.prefix, limit, filter.start, filter.end], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (key, raw) = row?;
            out.push((key, parse_row(&raw)?));
        }
        Ok(out)
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<&Value>, new: Value) -> Result<bool> {
        let mut conn = lock_or_fail(&self.conn, "sqlite store")?;
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT value FROM guard_records WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.as_deref().map(parse_row).transpose()?;

        if current.as_ref() != expected {
            debug!("CAS lost for {}", key);
            return Ok(false);
        }

        tx.execute(
            "INSERT OR REPLACE INTO guard_records (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, new.to_string(), Self::now()],
        )?;
        tx.commit()?;
        Ok(true)
    }
}
