//! Local SQLite stand-in for the Google sheet.
//!
//! Keeps the same row-oriented model: one header row and an append-only list
//! of rows, each stored as a JSON array of cells.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{SheetBackend, StoreError};

#[derive(Clone)]
pub struct SqliteSheet {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSheet {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(classify)?;

        // journal_mode PRAGMA always returns the resulting mode
        let _: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(classify)?;

        Self::run_migrations(&conn)?;
        info!("Request sheet database opened at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(classify)?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sheet_header (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                cells TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sheet_rows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cells TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )
        .map_err(classify)
    }
}

#[async_trait]
impl SheetBackend for SqliteSheet {
    async fn read_header(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().await;
        match stored_header(&conn)? {
            Some(cells) => decode(&cells),
            None => Ok(Vec::new()),
        }
    }

    async fn write_header(&self, header: &[String]) -> Result<(), StoreError> {
        let cells = encode(header)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sheet_header (id, cells) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET cells = excluded.cells",
            params![cells],
        )
        .map_err(classify)?;
        debug!("Sheet header written");
        Ok(())
    }

    async fn append_row(&self, row: &[String]) -> Result<(), StoreError> {
        let cells = encode(row)?;
        let conn = self.conn.lock().await;
        conn.execute("INSERT INTO sheet_rows (cells) VALUES (?1)", params![cells])
            .map_err(classify)?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<Vec<String>>, StoreError> {
        let conn = self.conn.lock().await;

        let mut rows = Vec::new();
        let header = stored_header(&conn)?;
        if let Some(header) = header {
            rows.push(decode(&header)?);
        }

        let mut stmt = conn
            .prepare("SELECT cells FROM sheet_rows ORDER BY id ASC")
            .map_err(classify)?;
        let stored = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)?;

        for cells in stored {
            rows.push(decode(&cells)?);
        }
        Ok(rows)
    }
}

fn stored_header(conn: &Connection) -> Result<Option<String>, StoreError> {
    conn.query_row("SELECT cells FROM sheet_header WHERE id = 1", [], |row| {
        row.get(0)
    })
    .optional()
    .map_err(classify)
}

fn encode<S: serde::Serialize>(cells: &[S]) -> Result<String, StoreError> {
    serde_json::to_string(cells).map_err(|e| StoreError::Malformed(e.to_string()))
}

fn decode(cells: &str) -> Result<Vec<String>, StoreError> {
    serde_json::from_str(cells).map_err(|e| StoreError::Malformed(e.to_string()))
}

/// Map SQLite failures onto the store's retry classes
fn classify(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            StoreError::Transient(e.to_string())
        }
        Some(ErrorCode::ReadOnly) | Some(ErrorCode::PermissionDenied) => {
            StoreError::Permission(e.to_string())
        }
        Some(ErrorCode::CannotOpen) => StoreError::Config(e.to_string()),
        _ => StoreError::Malformed(e.to_string()),
    }
}
