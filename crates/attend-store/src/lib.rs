//! attend-store — SQLite persistence for the attendance kiosk.
//!
//! Two tables: `identities` (the enrolled face/card gallery, embeddings
//! encrypted at rest) and `attendance` (append-only sign-in log). All access
//! goes through [`Store`], a handle over a `tokio-rusqlite` connection; every
//! operation is async and fallible.
//!
//! Card uniqueness across identities is deliberately NOT a storage
//! constraint: callers enforce it with a check-then-write lookup, which
//! leaves a narrow race between two simultaneous binds. That matches the
//! system this store serves; see the workspace design notes before "fixing"
//! it here.

use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

mod attendance;
mod crypto;
mod export;
mod identity;

pub use attendance::AttendanceRecord;
pub use crypto::EmbeddingCipher;
pub use export::{export_to_file, render_csv, EXPORT_FILE_NAME};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("embedding encryption failed")]
    Encrypt,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL,
    card_id       TEXT NOT NULL,
    embedding     BLOB,
    model_version TEXT,
    image_path    TEXT
);
CREATE TABLE IF NOT EXISTS attendance (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id INTEGER NOT NULL,
    card_id     TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,
    signed      INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_attendance_pair
    ON attendance (identity_id, card_id, timestamp);
";

/// Handle to the kiosk database.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
    cipher: EmbeddingCipher,
}

impl Store {
    /// Open (creating if needed) the database at `db_path`, with the
    /// embedding key file at `key_path`.
    pub async fn open(db_path: &Path, key_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let cipher = EmbeddingCipher::load_or_create(key_path)?;
        tracing::info!(
            db = %db_path.display(),
            key_fingerprint = cipher.fingerprint(),
            "opening store"
        );

        let conn = Connection::open(db_path).await?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, cipher })
    }

    /// In-memory store with an ephemeral key. Used by tests and diagnostics.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let cipher = EmbeddingCipher::ephemeral();
        let conn = Connection::open_in_memory().await?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn, cipher })
    }
}
