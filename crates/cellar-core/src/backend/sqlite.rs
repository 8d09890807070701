//! SQLite-backed document store.
//!
//! Every namespace is one row of the documents table: `id` is the namespace
//! name and `data` is a JSON object mapping encoded keys to entries. Field
//! mutations go through SQLite's JSON1 functions in a single statement, so a
//! write touches exactly one field of one document and is atomic with respect to
//! every other connection on the same database file, in this process or another.

use super::traits::{CacheBackend, NamespaceStats};
use crate::codec::{self, StoredEntry};
use crate::config::{BackendConfig, CacheDefaults};
use crate::error::{CellarError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    File(PathBuf),
    Memory,
}

impl DatabaseTarget {
    /// Parse a connection string: `sqlite:///abs/path.db`, `sqlite://rel.db`,
    /// `sqlite::memory:`, `:memory:` or a bare path. Query parameters are
    /// returned separately.
    pub fn parse(url: &str) -> Result<(Self, Vec<(String, String)>)> {
        let (location, query) = match url.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (url, None),
        };

        let params = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        let target = if location == ":memory:" || location == "sqlite::memory:" {
            DatabaseTarget::Memory
        } else if let Some(path) = location.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(CellarError::config(format!(
                    "sqlite url '{}' does not name a database file",
                    url
                )));
            }
            DatabaseTarget::File(PathBuf::from(path))
        } else if location.contains("://") {
            return Err(CellarError::config(format!(
                "unsupported url scheme for the sqlite backend: '{}'",
                url
            )));
        } else if location.is_empty() {
            return Err(CellarError::config("sqlite url must not be empty"));
        } else {
            DatabaseTarget::File(PathBuf::from(location))
        };

        Ok((target, params))
    }
}

/// SQLite-based document store.
///
/// Thread-safe via internal mutex on the connection; safe across processes
/// through SQLite's own file locking.
pub struct SqliteDocumentStore {
    /// Database connection (wrapped for thread safety).
    conn: Arc<Mutex<Connection>>,
    /// Documents table name.
    table: String,
    /// Advisory locks table name.
    locks_table: String,
    /// Database file, `None` for in-memory databases.
    path: Option<PathBuf>,
}

impl SqliteDocumentStore {
    /// Open (or create) a store at the given database path with defaults.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(
            DatabaseTarget::File(db_path.as_ref().to_path_buf()),
            CacheDefaults::DOCUMENTS_TABLE,
            CacheDefaults::BUSY_TIMEOUT,
        )
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_options(
            DatabaseTarget::Memory,
            CacheDefaults::DOCUMENTS_TABLE,
            CacheDefaults::BUSY_TIMEOUT,
        )
    }

    /// Open a store described by a backend configuration.
    ///
    /// Recognized extras (also accepted as url query parameters):
    /// `table` and `busy_timeout_ms`. `data_dir` and `lock_dir` are accepted
    /// and ignored.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| CellarError::config("the sqlite backend requires a url"))?;
        let (target, query) = DatabaseTarget::parse(url)?;

        let mut effective = config.clone();
        for (name, value) in query {
            effective.extras.entry(name).or_insert(value);
        }

        let table = effective
            .option("table")
            .unwrap_or(CacheDefaults::DOCUMENTS_TABLE)
            .to_string();
        let busy_timeout = effective
            .option_u64("busy_timeout_ms")?
            .map(Duration::from_millis)
            .unwrap_or(CacheDefaults::BUSY_TIMEOUT);

        Self::with_options(target, &table, busy_timeout)
    }

    /// Open a store with explicit table name and busy timeout.
    pub fn with_options(target: DatabaseTarget, table: &str, busy_timeout: Duration) -> Result<Self> {
        validate_table_name(table)?;

        let (conn, path) = match target {
            DatabaseTarget::Memory => {
                let conn = Connection::open_in_memory().map_err(|e| {
                    CellarError::from_sqlite(format!("Failed to open in-memory database: {}", e), e)
                })?;
                (conn, None)
            }
            DatabaseTarget::File(path) => {
                // Create parent directory if needed
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| CellarError::io_with_path(e, parent))?;
                }

                let conn = Connection::open(&path).map_err(|e| {
                    CellarError::from_sqlite(
                        format!("Failed to open document store {}: {}", path.display(), e),
                        e,
                    )
                })?;
                (conn, Some(path))
            }
        };

        conn.busy_timeout(busy_timeout).map_err(|e| {
            CellarError::from_sqlite(format!("Failed to set busy timeout: {}", e), e)
        })?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| CellarError::from_sqlite(format!("Failed to set pragmas: {}", e), e))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.to_string(),
            locks_table: format!("{}_locks", table),
            path,
        };

        store.init_schema()?;

        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(&format!(
            r#"
            -- One JSON document per namespace
            CREATE TABLE IF NOT EXISTS {docs} (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL DEFAULT '{{}}',
                updated_at TEXT NOT NULL
            );

            -- Advisory namespace locks
            CREATE TABLE IF NOT EXISTS {locks} (
                namespace TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                acquired_at INTEGER NOT NULL
            );
            "#,
            docs = self.table,
            locks = self.locks_table,
        ))
        .map_err(|e| {
            CellarError::from_sqlite(format!("Failed to initialize document schema: {}", e), e)
        })?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CellarError::unavailable(format!("Failed to lock database: {}", e)))
    }

    /// Database file backing this store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Documents table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Read the raw document text of a namespace.
    fn read_document(&self, namespace: &str) -> Result<Option<(String, String)>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT data, updated_at FROM {} WHERE id = ?1", self.table),
            params![namespace],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| CellarError::from_sqlite(format!("Failed to read namespace: {}", e), e))
    }
}

/// JSON path addressing one top-level member of a document.
fn field_path(key: &str) -> Result<String> {
    if key.is_empty() || key.contains(['"', '\\']) {
        return Err(CellarError::encoding(format!(
            "'{}' is not an encoded key",
            key
        )));
    }
    Ok(format!("$.\"{}\"", key))
}

fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CellarError::config(format!(
            "invalid table name '{}': use letters, digits and underscores",
            table
        )))
    }
}

fn parse_document(namespace: &str, raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => {
            warn!(
                "Namespace '{}' holds a malformed document, treating it as empty",
                namespace
            );
            Map::new()
        }
    }
}

impl CacheBackend for SqliteDocumentStore {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn has_key(&self, namespace: &str, key: &str) -> Result<bool> {
        // Same shape checks as `get`, so a malformed field is absent for both.
        Ok(self.get(namespace, key)?.is_some())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredEntry>> {
        let path = field_path(key)?;
        let conn = self.conn()?;

        let row: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                &format!(
                    r#"
                    SELECT
                        CASE WHEN json_type(data, ?2) = 'object' THEN json_extract(data, ?2) END,
                        json_type(data, ?2)
                    FROM {}
                    WHERE id = ?1 AND json_valid(data)
                    "#,
                    self.table
                ),
                params![namespace, path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| CellarError::from_sqlite(format!("Failed to read entry: {}", e), e))?;

        match row {
            None | Some((None, None)) => Ok(None),
            Some((None, Some(kind))) => {
                warn!(
                    "Field '{}' in namespace '{}' holds a {} instead of an entry, treating as absent",
                    key, namespace, kind
                );
                Ok(None)
            }
            Some((Some(raw), _)) => {
                let entry = codec::entry_from_json(&raw);
                if entry.is_none() {
                    warn!(
                        "Field '{}' in namespace '{}' is not a valid entry, treating as absent",
                        key, namespace
                    );
                }
                Ok(entry)
            }
        }
    }

    fn set(&self, namespace: &str, key: &str, entry: &StoredEntry) -> Result<()> {
        let path = field_path(key)?;
        let raw = codec::entry_to_json(entry)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn()?;

        conn.execute(
            &format!(
                r#"
                INSERT INTO {t} (id, data, updated_at)
                VALUES (?1, json_object(?2, json(?3)), ?4)
                ON CONFLICT(id) DO UPDATE SET
                    data = json_set(
                        CASE WHEN json_valid({t}.data)
                            THEN CASE WHEN json_type({t}.data) = 'object' THEN {t}.data ELSE '{{}}' END
                            ELSE '{{}}'
                        END,
                        ?5,
                        json(?3)
                    ),
                    updated_at = ?4
                "#,
                t = self.table
            ),
            params![namespace, key, raw, now, path],
        )
        .map_err(|e| CellarError::from_sqlite(format!("Failed to set entry: {}", e), e))?;

        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        let path = field_path(key)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn()?;

        conn.execute(
            &format!(
                "UPDATE {} SET data = json_remove(data, ?2), updated_at = ?3 WHERE id = ?1 AND json_valid(data)",
                self.table
            ),
            params![namespace, path, now],
        )
        .map_err(|e| CellarError::from_sqlite(format!("Failed to remove entry: {}", e), e))?;

        Ok(())
    }

    fn clear(&self, namespace: &str) -> Result<()> {
        let conn = self.conn()?;

        let deleted = conn
            .execute(
                &format!("DELETE FROM {} WHERE id = ?1", self.table),
                params![namespace],
            )
            .map_err(|e| {
                CellarError::from_sqlite(format!("Failed to clear namespace: {}", e), e)
            })?;

        debug!("Cleared namespace '{}' ({} record)", namespace, deleted);

        Ok(())
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let Some((raw, _)) = self.read_document(namespace)? else {
            return Ok(Vec::new());
        };
        Ok(parse_document(namespace, &raw).into_iter().map(|(k, _)| k).collect())
    }

    fn try_lock(&self, namespace: &str, owner: &str, stale_after: Duration) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let stale_before = now.saturating_sub(stale_after.as_millis() as i64);
        let conn = self.conn()?;

        let changed = conn
            .execute(
                &format!(
                    r#"
                    INSERT INTO {l} (namespace, owner, acquired_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(namespace) DO UPDATE SET
                        owner = excluded.owner,
                        acquired_at = excluded.acquired_at
                    WHERE {l}.acquired_at < ?4 OR {l}.owner = excluded.owner
                    "#,
                    l = self.locks_table
                ),
                params![namespace, owner, now, stale_before],
            )
            .map_err(|e| CellarError::from_sqlite(format!("Failed to take lock: {}", e), e))?;

        Ok(changed > 0)
    }

    fn unlock(&self, namespace: &str, owner: &str) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            &format!(
                "DELETE FROM {} WHERE namespace = ?1 AND owner = ?2",
                self.locks_table
            ),
            params![namespace, owner],
        )
        .map_err(|e| CellarError::from_sqlite(format!("Failed to release lock: {}", e), e))?;

        Ok(())
    }

    fn namespace_stats(&self, namespace: &str) -> Result<Option<NamespaceStats>> {
        let Some((raw, updated_at)) = self.read_document(namespace)? else {
            return Ok(None);
        };

        let last_modified = DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .ok();

        Ok(Some(NamespaceStats {
            namespace: namespace.to_string(),
            entry_count: parse_document(namespace, &raw).len(),
            total_size_bytes: raw.len() as u64,
            last_modified,
        }))
    }
}
