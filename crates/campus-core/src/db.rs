// SQLite persistence for durable client state.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// Key-value store backing the session's sticky settings.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path`. `":memory:"` gives an
    /// ephemeral database for tests.
    pub fn open(path: &str) -> Result<Self> {
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create database directory {}", parent.display())
                    })?;
                }
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS session_state (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Panics if the mutex is poisoned.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    /// Persist a JSON value under `key`, replacing any previous value.
    pub fn save_state(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let json_str = serde_json::to_string(value).context("failed to serialize state value")?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO session_state (key, value) VALUES (?1, ?2)",
                params![key, json_str],
            )
            .with_context(|| format!("failed to save state {key}"))?;
        Ok(())
    }

    /// Load the value stored under `key`, or `None` if it was never saved.
    pub fn load_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let json_str: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM session_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to load state {key}"))?;

        json_str
            .map(|s| serde_json::from_str(&s).context("failed to deserialize state value"))
            .transpose()
    }

    /// Remove `key`. Returns whether a row existed.
    pub fn delete_state(&self, key: &str) -> Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM session_state WHERE key = ?1", params![key])
            .with_context(|| format!("failed to delete state {key}"))?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_db() -> Database {
        Database::open(":memory:").expect("in-memory database should open")
    }

    #[test]
    fn open_creates_table() {
        let db = test_db();
        let conn = db.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'session_state'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn save_and_load_state() {
        let db = test_db();
        db.save_state("selected_school_id", &json!("s-42")).unwrap();
        assert_eq!(
            db.load_state("selected_school_id").unwrap(),
            Some(json!("s-42"))
        );
    }

    #[test]
    fn load_missing_key_is_none() {
        let db = test_db();
        assert!(db.load_state("nope").unwrap().is_none());
    }

    #[test]
    fn save_overwrites() {
        let db = test_db();
        db.save_state("k", &json!(1)).unwrap();
        db.save_state("k", &json!({"a": [1, 2]})).unwrap();
        assert_eq!(db.load_state("k").unwrap(), Some(json!({"a": [1, 2]})));
    }

    #[test]
    fn delete_reports_whether_key_existed() {
        let db = test_db();
        db.save_state("k", &json!(true)).unwrap();
        assert!(db.delete_state("k").unwrap());
        assert!(!db.delete_state("k").unwrap());
        assert!(db.load_state("k").unwrap().is_none());
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = std::env::temp_dir().join("campus_db_reopen_test");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("nested/campus.db");
        let path_str = path.to_str().unwrap();

        {
            let db = Database::open(path_str).unwrap();
            db.save_state("selected_school_id", &json!("s-7")).unwrap();
        }
        let db = Database::open(path_str).unwrap();
        assert_eq!(
            db.load_state("selected_school_id").unwrap(),
            Some(json!("s-7"))
        );

        drop(db);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
