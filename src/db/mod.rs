//! SQLite database handle
//!
//! One connection behind an async mutex; statements are brief and run inline
//! on the calling task. Repositories go through [`Db::with`] so they can open
//! multi-statement transactions against the same connection.

pub mod schema;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::types::{HelmsmanError, Result};

/// Shared SQLite handle
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| HelmsmanError::Database(format!("failed to open {}: {}", path.display(), e)))?;
        Self::init(conn, &path.display().to_string())
    }

    /// In-memory database, used by tests and ephemeral deployments
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| HelmsmanError::Database(format!("failed to open :memory:: {}", e)))?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| HelmsmanError::Database(format!("pragma setup failed: {}", e)))?;
        // journal_mode returns the resulting mode as a row
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))
            .map_err(|e| HelmsmanError::Database(format!("pragma setup failed: {}", e)))?;
        conn.execute_batch(schema::SCHEMA)
            .map_err(|e| HelmsmanError::Database(format!("schema apply failed: {}", e)))?;
        info!("Database ready at {}", label);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection while holding the lock
    pub async fn with<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock().await;
        f(&mut conn)
    }
}
