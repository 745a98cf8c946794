//! CSV export of attendance records.
//!
//! The column layout is a wire format consumed by downstream reporting —
//! header `faceId,nfcId,timestamp,isSigned`, millisecond epoch timestamps,
//! lowercase booleans — and must not change.

use crate::{AttendanceRecord, StoreError};
use std::path::{Path, PathBuf};

pub const EXPORT_FILE_NAME: &str = "sign_in_export.csv";

/// Render records to CSV text.
pub fn render_csv(records: &[AttendanceRecord]) -> String {
    let mut out = String::from("faceId,nfcId,timestamp,isSigned\n");
    for r in records {
        out.push_str(&format!(
            "{},{},{},{}\n",
            r.identity_id, r.card_id, r.timestamp_ms, r.signed
        ));
    }
    out
}

/// Write the CSV into `export_dir` (created if missing); returns the file
/// path.
pub async fn export_to_file(
    records: &[AttendanceRecord],
    export_dir: &Path,
) -> Result<PathBuf, StoreError> {
    tokio::fs::create_dir_all(export_dir).await?;
    let path = export_dir.join(EXPORT_FILE_NAME);
    tokio::fs::write(&path, render_csv(records)).await?;
    tracing::info!(path = %path.display(), records = records.len(), "exported attendance CSV");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use attend_core::CardId;

    fn record(identity_id: i64, card: &str, ts: i64, signed: bool) -> AttendanceRecord {
        AttendanceRecord {
            id: 0,
            identity_id,
            card_id: CardId::normalize(card).unwrap(),
            timestamp_ms: ts,
            signed,
        }
    }

    #[test]
    fn exact_wire_format() {
        let records = vec![record(1, "AA", 1000, true)];
        assert_eq!(
            render_csv(&records),
            "faceId,nfcId,timestamp,isSigned\n1,AA,1000,true\n"
        );
    }

    #[test]
    fn empty_export_is_header_only() {
        assert_eq!(render_csv(&[]), "faceId,nfcId,timestamp,isSigned\n");
    }

    #[test]
    fn one_row_per_record_in_order() {
        let records = vec![
            record(1, "AA", 1000, true),
            record(2, "04A1B2C3", 2000, false),
        ];
        let csv = render_csv(&records);
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(
            lines,
            vec![
                "faceId,nfcId,timestamp,isSigned",
                "1,AA,1000,true",
                "2,04A1B2C3,2000,false",
            ]
        );
    }
}
