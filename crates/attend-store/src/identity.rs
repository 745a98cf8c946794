//! Identity gallery operations.

use crate::{EmbeddingCipher, Store, StoreError};
use attend_core::{CardId, Embedding, Identity};
use rusqlite::{params, OptionalExtension, Row};

/// Decode one `identities` row. Rows whose card id no longer normalizes
/// (legacy junk) or whose embedding fails to decrypt are degraded rather
/// than fatal: the former yields `None`, the latter an identity without an
/// embedding.
fn row_to_identity(row: &Row<'_>, cipher: &EmbeddingCipher) -> rusqlite::Result<Option<Identity>> {
    let id: i64 = row.get(0)?;
    let name: String = row.get(1)?;
    let card_raw: String = row.get(2)?;
    let blob: Option<Vec<u8>> = row.get(3)?;
    let model_version: Option<String> = row.get(4)?;
    let image_path: Option<String> = row.get(5)?;

    let Ok(card_id) = CardId::normalize(&card_raw) else {
        tracing::warn!(id, card = %card_raw, "identity row has unusable card id; skipping");
        return Ok(None);
    };

    let embedding = blob.and_then(|blob| {
        let plaintext = cipher.decrypt(&blob);
        if plaintext.is_none() {
            tracing::warn!(id, "embedding blob failed to decrypt; matching disabled for this identity");
        }
        plaintext.and_then(|p| Embedding::from_le_bytes(&p, model_version.clone()))
    });

    Ok(Some(Identity {
        id,
        name,
        embedding,
        card_id,
        image_path,
    }))
}

const IDENTITY_COLS: &str = "id, name, card_id, embedding, model_version, image_path";

impl Store {
    /// Insert a new identity; returns its assigned id.
    ///
    /// Card uniqueness is the caller's responsibility (check-then-write).
    pub async fn insert_identity(
        &self,
        name: String,
        card_id: CardId,
        embedding: Option<&Embedding>,
        image_path: Option<String>,
    ) -> Result<i64, StoreError> {
        let (blob, model_version) = self.encode_embedding(embedding)?;
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO identities (name, card_id, embedding, model_version, image_path)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![name, card_id.as_str(), blob, model_version, image_path],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    /// Replace an existing identity row.
    pub async fn update_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        let (blob, model_version) = self.encode_embedding(identity.embedding.as_ref())?;
        let id = identity.id;
        let name = identity.name.clone();
        let card = identity.card_id.clone();
        let image_path = identity.image_path.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE identities
                     SET name = ?2, card_id = ?3, embedding = ?4, model_version = ?5, image_path = ?6
                     WHERE id = ?1",
                    params![id, name, card.as_str(), blob, model_version, image_path],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Delete an identity. Returns whether a row existed.
    pub async fn delete_identity(&self, id: i64) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM identities WHERE id = ?1", params![id])?;
                Ok(n > 0)
            })
            .await?;
        Ok(deleted)
    }

    pub async fn identity_by_id(&self, id: i64) -> Result<Option<Identity>, StoreError> {
        let cipher = self.cipher.clone();
        let identity = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {IDENTITY_COLS} FROM identities WHERE id = ?1"),
                        params![id],
                        |row| row_to_identity(row, &cipher),
                    )
                    .optional()?;
                Ok(row.flatten())
            })
            .await?;
        Ok(identity)
    }

    /// Point lookup by normalized card id — the card-ownership check.
    pub async fn identity_by_card(&self, card: &CardId) -> Result<Option<Identity>, StoreError> {
        let cipher = self.cipher.clone();
        let card = card.clone();
        let identity = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        &format!(
                            "SELECT {IDENTITY_COLS} FROM identities WHERE card_id = ?1 LIMIT 1"
                        ),
                        params![card.as_str()],
                        |row| row_to_identity(row, &cipher),
                    )
                    .optional()?;
                Ok(row.flatten())
            })
            .await?;
        Ok(identity)
    }

    /// Full gallery fetch, in stable id order.
    pub async fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let cipher = self.cipher.clone();
        let identities = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {IDENTITY_COLS} FROM identities ORDER BY id"
                ))?;
                let rows = stmt.query_map([], |row| row_to_identity(row, &cipher))?;
                let mut out = Vec::new();
                for row in rows {
                    if let Some(identity) = row? {
                        out.push(identity);
                    }
                }
                Ok(out)
            })
            .await?;
        Ok(identities)
    }

    /// One-shot startup migration: rewrite any stored card id that is not in
    /// canonical form, so scans always compare against the stored format.
    /// Returns how many rows were rewritten.
    pub async fn normalize_stored_cards(&self) -> Result<usize, StoreError> {
        let updated = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, card_id FROM identities")?;
                let rows: Vec<(i64, String)> = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<_>>()?;

                let mut updated = 0usize;
                for (id, raw) in rows {
                    let Ok(norm) = CardId::normalize(&raw) else {
                        tracing::warn!(id, card = %raw, "stored card id has no hex digits; leaving as-is");
                        continue;
                    };
                    if norm.as_str() != raw {
                        conn.execute(
                            "UPDATE identities SET card_id = ?2 WHERE id = ?1",
                            params![id, norm.as_str()],
                        )?;
                        updated += 1;
                    }
                }
                Ok(updated)
            })
            .await?;
        if updated > 0 {
            tracing::info!(updated, "normalized legacy card ids");
        }
        Ok(updated)
    }

    fn encode_embedding(
        &self,
        embedding: Option<&Embedding>,
    ) -> Result<(Option<Vec<u8>>, Option<String>), StoreError> {
        match embedding {
            Some(e) => {
                let blob = self
                    .cipher
                    .encrypt(&e.to_le_bytes())
                    .ok_or(StoreError::Encrypt)?;
                Ok((Some(blob), e.model_version.clone()))
            }
            None => Ok((None, None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(values: &[f32]) -> Embedding {
        Embedding {
            values: values.to_vec(),
            model_version: Some("mobile_face_net".into()),
        }
    }

    fn card(s: &str) -> CardId {
        CardId::normalize(s).unwrap()
    }

    #[tokio::test]
    async fn insert_and_fetch_roundtrips_embedding() {
        let store = Store::open_in_memory().await.unwrap();
        let emb = embedding(&[0.1, -0.2, 0.3]);
        let id = store
            .insert_identity("alice".into(), card("04A1B2C3"), Some(&emb), None)
            .await
            .unwrap();

        let fetched = store.identity_by_id(id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "alice");
        assert_eq!(fetched.card_id.as_str(), "04A1B2C3");
        assert_eq!(fetched.embedding.unwrap(), emb);
    }

    #[tokio::test]
    async fn embedding_is_not_stored_in_plaintext() {
        let store = Store::open_in_memory().await.unwrap();
        let emb = embedding(&[0.5, 0.5]);
        let id = store
            .insert_identity("bob".into(), card("AA"), Some(&emb), None)
            .await
            .unwrap();

        let raw: Vec<u8> = store
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT embedding FROM identities WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        let plaintext = emb.to_le_bytes();
        assert!(!raw
            .windows(plaintext.len())
            .any(|window| window == plaintext.as_slice()));
    }

    #[tokio::test]
    async fn lookup_by_card_normalized_form() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .insert_identity("alice".into(), card("04A1B2C3"), None, None)
            .await
            .unwrap();

        let hit = store
            .identity_by_card(&card("04-a1-b2-c3"))
            .await
            .unwrap();
        assert_eq!(hit.unwrap().name, "alice");

        let miss = store.identity_by_card(&card("FFFF")).await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn update_and_delete() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store
            .insert_identity("carol".into(), card("BB"), None, None)
            .await
            .unwrap();

        let mut identity = store.identity_by_id(id).await.unwrap().unwrap();
        identity.name = "caroline".into();
        identity.card_id = card("CC");
        store.update_identity(&identity).await.unwrap();

        let updated = store.identity_by_id(id).await.unwrap().unwrap();
        assert_eq!(updated.name, "caroline");
        assert_eq!(updated.card_id.as_str(), "CC");

        assert!(store.delete_identity(id).await.unwrap());
        assert!(!store.delete_identity(id).await.unwrap());
        assert!(store.identity_by_id(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn startup_normalization_rewrites_legacy_rows() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .conn
            .call(|conn| {
                conn.execute(
                    "INSERT INTO identities (name, card_id) VALUES ('legacy', '04-a1-b2-c3')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let updated = store.normalize_stored_cards().await.unwrap();
        assert_eq!(updated, 1);

        let hit = store.identity_by_card(&card("04A1B2C3")).await.unwrap();
        assert_eq!(hit.unwrap().name, "legacy");

        // second run is a no-op
        assert_eq!(store.normalize_stored_cards().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_is_in_stable_id_order() {
        let store = Store::open_in_memory().await.unwrap();
        for (name, c) in [("a", "01"), ("b", "02"), ("c", "03")] {
            store
                .insert_identity(name.into(), card(c), None, None)
                .await
                .unwrap();
        }
        let all = store.list_identities().await.unwrap();
        let names: Vec<_> = all.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
