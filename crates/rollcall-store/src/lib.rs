//! rollcall-store: SQLite persistence for enrolled identities and attendance.
//!
//! # Schema
//!
//! `identities` is keyed by `identity_id` and holds one little-endian `f32`
//! embedding blob per identity. `attendance` carries a unique index over
//! `(identity_id, subject_id, date)`; the index is the only guard against
//! double attendance, so concurrent writers cannot race past it.
//!
//! `store_meta` pins the embedding dimension and model version the database
//! was created with. Opening it with a different profile fails.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::{EmbeddingProfile, StoreError};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

mod identities;
mod ledger;

pub use identities::SqliteEmbeddingStore;
pub use ledger::SqliteAttendanceLedger;

const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS identities (
    identity_id TEXT PRIMARY KEY,
    class_id TEXT NOT NULL,
    roll_number TEXT NOT NULL,
    display_name TEXT NOT NULL,
    model_version TEXT NOT NULL,
    embedding_dimension INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    enrolled_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_identities_class ON identities(class_id);

CREATE TABLE IF NOT EXISTS attendance (
    record_id TEXT PRIMARY KEY,
    identity_id TEXT NOT NULL,
    class_id TEXT NOT NULL,
    subject_id TEXT NOT NULL,
    date TEXT NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('present', 'absent', 'unresolved')),
    match_score REAL,
    recorded_at INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_dedup
    ON attendance(identity_id, subject_id, date);

CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);
";

/// Handle to the rollcall database. Cloning shares the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Connection>,
    profile: EmbeddingProfile,
}

impl Database {
    /// Open (or create) the database file, enable WAL, and apply the schema.
    pub async fn open(
        path: impl AsRef<Path>,
        profile: EmbeddingProfile,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Backend(format!("create {}: {e}", parent.display()))
                })?;
            }
        }

        let conn = Connection::open(path).await.map_err(backend)?;
        conn.call(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            tracing::debug!(journal_mode = %mode, "sqlite journal mode set");
            Ok(())
        })
        .await
        .map_err(backend)?;

        tracing::info!(path = %path.display(), "database opened");
        Self::init(conn, profile).await
    }

    /// Private in-memory database, used by tests and dry runs.
    pub async fn open_in_memory(profile: EmbeddingProfile) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(backend)?;
        Self::init(conn, profile).await
    }

    async fn init(conn: Connection, profile: EmbeddingProfile) -> Result<Self, StoreError> {
        let configured = profile.clone();
        let stored = conn
            .call(move |conn| {
                conn.execute_batch(SCHEMA)?;
                let tx = conn.transaction()?;
                let dimension: Option<String> = tx
                    .query_row(
                        "SELECT value FROM store_meta WHERE key = 'embedding_dimension'",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?;
                let model_version: Option<String> = tx
                    .query_row(
                        "SELECT value FROM store_meta WHERE key = 'model_version'",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?;

                let stored = match (dimension, model_version) {
                    (Some(d), Some(m)) => Some((d, m)),
                    _ => {
                        tx.execute(
                            "INSERT OR REPLACE INTO store_meta (key, value) VALUES ('embedding_dimension', ?1)",
                            [configured.dimension.to_string()],
                        )?;
                        tx.execute(
                            "INSERT OR REPLACE INTO store_meta (key, value) VALUES ('model_version', ?1)",
                            [&configured.model_version],
                        )?;
                        None
                    }
                };
                tx.commit()?;
                Ok(stored)
            })
            .await
            .map_err(backend)?;

        if let Some((dimension, model_version)) = stored {
            let dimension = dimension
                .parse::<usize>()
                .map_err(|e| StoreError::Corrupt(format!("store_meta dimension: {e}")))?;
            let stored = EmbeddingProfile::new(dimension, model_version);
            if stored != profile {
                return Err(StoreError::ProfileMismatch {
                    stored,
                    configured: profile,
                });
            }
        } else {
            tracing::info!(
                dimension = profile.dimension,
                model_version = %profile.model_version,
                "initialized new store"
            );
        }

        Ok(Self {
            conn: Arc::new(conn),
            profile,
        })
    }

    pub fn profile(&self) -> &EmbeddingProfile {
        &self.profile
    }

    pub fn identities(&self) -> SqliteEmbeddingStore {
        SqliteEmbeddingStore::new(Arc::clone(&self.conn), self.profile.clone())
    }

    pub fn ledger(&self) -> SqliteAttendanceLedger {
        SqliteAttendanceLedger::new(Arc::clone(&self.conn))
    }
}

pub(crate) fn backend(err: tokio_rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

pub(crate) fn encode_embedding(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode_embedding(blob: &[u8], dimension: usize) -> Result<Vec<f32>, StoreError> {
    let expected_len = dimension * std::mem::size_of::<f32>();
    if blob.len() != expected_len {
        return Err(StoreError::Corrupt(format!(
            "embedding blob is {} bytes, expected {expected_len}",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub(crate) fn parse_date(s: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .map_err(|e| StoreError::Corrupt(format!("bad date {s:?}: {e}")))
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}
