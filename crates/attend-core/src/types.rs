use serde::{Deserialize, Serialize};

use crate::card::CardId;

/// Face embedding vector (128-dimensional for MobileFaceNet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding.
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero vector on
    /// either side yields 0.0 (denominator floor, never a division by zero).
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Serialize to little-endian f32 bytes, the at-rest blob format.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.values.len() * 4);
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Parse an embedding from little-endian f32 bytes.
    ///
    /// Returns `None` if the byte length is not a multiple of 4.
    pub fn from_le_bytes(bytes: &[u8], model_version: Option<String>) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self {
            values,
            model_version,
        })
    }
}

/// An enrolled identity: display name, face embedding, bound card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Stable row id assigned by the store (0 before first insert).
    pub id: i64,
    pub name: String,
    /// Missing when the identity was enrolled without a face capture.
    pub embedding: Option<Embedding>,
    /// Bound card identifier, normalized uppercase hex.
    pub card_id: CardId,
    /// Optional reference photo captured at enrollment.
    pub image_path: Option<String>,
}

/// Result of matching a probe embedding against the gallery.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best candidate [-1, 1].
    pub similarity: f32,
    pub identity_id: Option<i64>,
    pub identity_name: Option<String>,
}

impl MatchResult {
    fn no_match(similarity: f32) -> Self {
        Self {
            matched: false,
            similarity,
            identity_id: None,
            identity_name: None,
        }
    }
}

/// Strategy for comparing a probe embedding against the enrolled gallery.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[Identity], threshold: f32) -> MatchResult;
}

/// Cosine similarity matcher.
///
/// Scans the whole gallery with no early exit and keeps the highest
/// similarity seen; strict `>` means ties resolve to the first entry
/// encountered in gallery order. `matched` is only set when the best
/// similarity reaches the threshold. Identities without an embedding are
/// skipped.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[Identity], threshold: f32) -> MatchResult {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, identity) in gallery.iter().enumerate() {
            let Some(stored) = &identity.embedding else {
                continue;
            };
            let sim = probe.similarity(stored);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_sim >= threshold => MatchResult {
                matched: true,
                similarity: best_sim,
                identity_id: Some(gallery[idx].id),
                identity_name: Some(gallery[idx].name.clone()),
            },
            Some(_) => MatchResult::no_match(best_sim),
            None => MatchResult::no_match(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding {
            values: values.to_vec(),
            model_version: None,
        }
    }

    fn identity(id: i64, name: &str, values: &[f32]) -> Identity {
        Identity {
            id,
            name: name.into(),
            embedding: Some(emb(values)),
            card_id: CardId::normalize("AA").unwrap(),
            image_path: None,
        }
    }

    #[test]
    fn similarity_of_identical_vectors_is_one() {
        let a = emb(&[0.6, 0.8, 0.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn similarity_is_symmetric() {
        let a = emb(&[0.3, -0.2, 0.9]);
        let b = emb(&[-0.5, 0.1, 0.4]);
        assert!((a.similarity(&b) - b.similarity(&a)).abs() < 1e-6);
    }

    #[test]
    fn similarity_orthogonal_is_zero() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn similarity_zero_vector_is_zero() {
        let zero = emb(&[0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(zero.similarity(&b), 0.0);
        assert_eq!(b.similarity(&zero), 0.0);
    }

    #[test]
    fn matcher_never_returns_identity_below_threshold() {
        let probe = emb(&[1.0, 0.0, 0.0]);
        let gallery = vec![identity(1, "alice", &[0.0, 1.0, 0.0])];
        let result = CosineMatcher.compare(&probe, &gallery, 0.65);
        assert!(!result.matched);
        assert!(result.identity_id.is_none());
    }

    #[test]
    fn matcher_finds_best_even_when_last() {
        let probe = emb(&[1.0, 0.0, 0.0]);
        let gallery = vec![
            identity(1, "decoy-a", &[0.0, 1.0, 0.0]),
            identity(2, "decoy-b", &[0.0, 0.0, 1.0]),
            identity(3, "target", &[1.0, 0.0, 0.0]),
        ];
        let result = CosineMatcher.compare(&probe, &gallery, 0.5);
        assert!(result.matched);
        assert_eq!(result.identity_id, Some(3));
        assert_eq!(result.identity_name.as_deref(), Some("target"));
        assert!((result.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn matcher_resolves_ties_to_first_encountered() {
        let probe = emb(&[1.0, 0.0]);
        let gallery = vec![
            identity(7, "first", &[2.0, 0.0]),
            identity(8, "second", &[1.0, 0.0]),
        ];
        let result = CosineMatcher.compare(&probe, &gallery, 0.9);
        assert_eq!(result.identity_id, Some(7));
    }

    #[test]
    fn matcher_empty_gallery() {
        let probe = emb(&[1.0, 0.0]);
        let result = CosineMatcher.compare(&probe, &[], 0.5);
        assert!(!result.matched);
        assert_eq!(result.similarity, 0.0);
    }

    #[test]
    fn matcher_skips_identities_without_embedding() {
        let probe = emb(&[1.0, 0.0]);
        let mut no_face = identity(1, "no-face", &[1.0, 0.0]);
        no_face.embedding = None;
        let result = CosineMatcher.compare(&probe, &[no_face], 0.5);
        assert!(!result.matched);
        assert_eq!(result.similarity, 0.0);
    }

    #[test]
    fn embedding_byte_roundtrip() {
        let a = emb(&[0.25, -1.5, 3.75]);
        let bytes = a.to_le_bytes();
        assert_eq!(bytes.len(), 12);
        let back = Embedding::from_le_bytes(&bytes, None).unwrap();
        assert_eq!(back.values, a.values);
    }

    #[test]
    fn embedding_from_ragged_bytes_is_none() {
        assert!(Embedding::from_le_bytes(&[0, 1, 2], None).is_none());
    }
}
