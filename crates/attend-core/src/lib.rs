//! attend-core — Face matching primitives for the attendance kiosk.
//!
//! Embedding extraction runs a MobileFaceNet-style ONNX model via ONNX
//! Runtime; matching is a cosine-similarity linear scan over the enrolled
//! gallery. Card identifiers are normalized here so every comparison in the
//! system sees the same canonical form.

use std::path::PathBuf;

pub mod card;
pub mod embedder;
pub mod types;

pub use card::{CardError, CardId};
pub use embedder::{EmbedderError, FaceEmbedder};
pub use types::{CosineMatcher, Embedding, Identity, MatchResult, Matcher};

/// Default cosine threshold for an unconstrained gallery match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.65;

/// Stricter threshold for confirming a probe against a single known identity
/// (the card-first flow, where the card already names the expected person).
pub const STRICT_MATCH_THRESHOLD: f32 = 0.75;

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// Attendance timestamps are millisecond epoch values end to end.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Default directory searched for the embedding model file.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("attend/models")
}
