//! Append-only attendance log.
//!
//! Records are created exactly once per accepted sign-in and never mutated.
//! The only queries the sign-in contract needs are the most-recent record
//! for an (identity, card) pair — the duplicate-suppression probe — and
//! range/full reads for export. Deletion exists solely as an administrative
//! bulk clear.

use crate::{Store, StoreError};
use attend_core::CardId;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

/// One confirmed (or administratively recorded) sign-in.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub identity_id: i64,
    pub card_id: CardId,
    /// Face-detection wall-clock time, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub signed: bool,
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let card_raw: String = row.get(2)?;
    let card_id = CardId::normalize(&card_raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unusable card id {card_raw:?}").into(),
        )
    })?;
    Ok(AttendanceRecord {
        id: row.get(0)?,
        identity_id: row.get(1)?,
        card_id,
        timestamp_ms: row.get(3)?,
        signed: row.get::<_, i64>(4)? != 0,
    })
}

const RECORD_COLS: &str = "id, identity_id, card_id, timestamp, signed";

impl Store {
    /// Append one attendance record; returns its assigned id.
    pub async fn insert_attendance(
        &self,
        identity_id: i64,
        card_id: &CardId,
        timestamp_ms: i64,
        signed: bool,
    ) -> Result<i64, StoreError> {
        let card = card_id.clone();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance (identity_id, card_id, timestamp, signed)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![identity_id, card.as_str(), timestamp_ms, signed as i64],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    /// Most recent record for (identity, card), by timestamp. This is the
    /// duplicate-suppression probe.
    pub async fn latest_attendance(
        &self,
        identity_id: i64,
        card_id: &CardId,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let card = card_id.clone();
        let record = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        &format!(
                            "SELECT {RECORD_COLS} FROM attendance
                             WHERE identity_id = ?1 AND card_id = ?2
                             ORDER BY timestamp DESC LIMIT 1"
                        ),
                        params![identity_id, card.as_str()],
                        row_to_record,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(record)
    }

    /// All records in insertion order, for export.
    pub async fn list_attendance(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let records = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {RECORD_COLS} FROM attendance ORDER BY id"))?;
                let rows = stmt.query_map([], row_to_record)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(records)
    }

    /// Records with `start_ms <= timestamp < end_ms`, for ranged export
    /// ("today only").
    pub async fn attendance_between(
        &self,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RECORD_COLS} FROM attendance
                     WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY id"
                ))?;
                let rows = stmt.query_map(params![start_ms, end_ms], row_to_record)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(records)
    }

    /// Administrative bulk clear. Returns how many records were removed.
    pub async fn clear_attendance(&self) -> Result<usize, StoreError> {
        let removed = self
            .conn
            .call(|conn| Ok(conn.execute("DELETE FROM attendance", [])?))
            .await?;
        Ok(removed)
    }
}
