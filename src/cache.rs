use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, params};

/// Namespace for inferred schema mappings, keyed by file fingerprint.
pub const NS_SCHEMA: &str = "schema";
/// Namespace for code-match results, keyed by normalized query.
pub const NS_MATCHES: &str = "matches";

/// Durable key/value cache backed by SQLite. Survives restarts so repeat
/// ingests and repeat code lookups skip their expensive inference paths.
pub struct KvCache {
    conn: Mutex<Connection>,
}

impl KvCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open cache at {}", path.display()))?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS kv_cache (
                 namespace  TEXT NOT NULL,
                 key        TEXT NOT NULL,
                 value      TEXT NOT NULL,
                 stored_at  TEXT NOT NULL DEFAULT (datetime('now')),
                 PRIMARY KEY (namespace, key)
             );",
        )
        .context("Failed to initialize cache schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("cache connection poisoned"))
    }

    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT value FROM kv_cache WHERE namespace = ?1 AND key = ?2")?;
        let value = stmt
            .query_row(params![namespace, key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO kv_cache (namespace, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, key) DO UPDATE
                 SET value = excluded.value, stored_at = datetime('now')",
            params![namespace, key, value],
        )?;
        Ok(())
    }
}
