use crate::engine::EngineHandle;
use crate::gallery::Gallery;
use attend_core::CardId;
use attend_store::{export_to_file, Store};
use std::path::PathBuf;
use std::sync::Arc;
use zbus::interface;

/// D-Bus interface for the Attend kiosk daemon.
///
/// Bus name: org.freedesktop.Attend1
/// Object path: /org/freedesktop/Attend1
pub struct AttendService {
    pub store: Store,
    pub gallery: Arc<Gallery>,
    pub engine: EngineHandle,
    pub export_dir: PathBuf,
    pub frames_per_enroll: usize,
    pub started_at_ms: i64,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.freedesktop.Attend1")]
impl AttendService {
    /// Capture the person at the kiosk and enroll them under `name` with
    /// the given card. Returns the new identity id.
    async fn enroll(&self, name: &str, card: &str) -> zbus::fdo::Result<i64> {
        tracing::info!(name, card, "enroll requested");
        if name.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("name is empty".into()));
        }
        let card = CardId::normalize(card)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

        if let Some(owner) = self.store.identity_by_card(&card).await.map_err(failed)? {
            return Err(zbus::fdo::Error::Failed(format!(
                "card {card} is already bound to {}",
                owner.name
            )));
        }

        let capture = self
            .engine
            .enroll(self.frames_per_enroll)
            .await
            .map_err(failed)?;
        let id = self
            .store
            .insert_identity(name.trim().to_string(), card, Some(&capture.embedding), None)
            .await
            .map_err(failed)?;
        self.gallery.reload(&self.store).await.map_err(failed)?;
        tracing::info!(id, name, "identity enrolled");
        Ok(id)
    }

    /// List enrolled identities as JSON.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self.store.list_identities().await.map_err(failed)?;
        let rows: Vec<_> = identities
            .iter()
            .map(|i| {
                serde_json::json!({
                    "id": i.id,
                    "name": i.name,
                    "card": i.card_id.as_str(),
                    "has_embedding": i.embedding.is_some(),
                })
            })
            .collect();
        serde_json::to_string(&rows).map_err(failed)
    }

    /// Remove an identity. Returns whether it existed.
    async fn remove_identity(&self, id: i64) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "remove_identity requested");
        let removed = self.store.delete_identity(id).await.map_err(failed)?;
        if removed {
            self.gallery.reload(&self.store).await.map_err(failed)?;
        }
        Ok(removed)
    }

    /// Rebind an identity to a different card. Returns whether the
    /// identity existed.
    async fn bind_card(&self, id: i64, card: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(id, card, "bind_card requested");
        let card = CardId::normalize(card)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

        if let Some(owner) = self.store.identity_by_card(&card).await.map_err(failed)? {
            if owner.id != id {
                return Err(zbus::fdo::Error::Failed(format!(
                    "card {card} is already bound to {}",
                    owner.name
                )));
            }
        }
        let Some(mut identity) = self.store.identity_by_id(id).await.map_err(failed)? else {
            return Ok(false);
        };
        identity.card_id = card;
        self.store.update_identity(&identity).await.map_err(failed)?;
        self.gallery.reload(&self.store).await.map_err(failed)?;
        Ok(true)
    }

    /// Write attendance records to a CSV file; returns its path. A
    /// `[start_ms, end_ms)` range restricts the export; 0,0 exports
    /// everything.
    async fn export_csv(&self, start_ms: i64, end_ms: i64) -> zbus::fdo::Result<String> {
        let records = if start_ms == 0 && end_ms == 0 {
            self.store.list_attendance().await.map_err(failed)?
        } else {
            self.store
                .attendance_between(start_ms, end_ms)
                .await
                .map_err(failed)?
        };
        let path = export_to_file(&records, &self.export_dir)
            .await
            .map_err(failed)?;
        Ok(path.to_string_lossy().into_owned())
    }

    /// Return attendance records as JSON, newest last. `limit` of 0 means
    /// all records.
    async fn records(&self, limit: u32) -> zbus::fdo::Result<String> {
        let mut records = self.store.list_attendance().await.map_err(failed)?;
        if limit > 0 && records.len() > limit as usize {
            records.drain(..records.len() - limit as usize);
        }
        serde_json::to_string(&records).map_err(failed)
    }

    /// Delete all attendance records. Returns how many were removed.
    async fn clear_records(&self) -> zbus::fdo::Result<u32> {
        let removed = self.store.clear_attendance().await.map_err(failed)?;
        tracing::info!(removed, "attendance records cleared");
        Ok(removed as u32)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let records = self.store.list_attendance().await.map_err(failed)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "started_at_ms": self.started_at_ms,
            "gallery_size": self.gallery.len().await,
            "record_count": records.len(),
        })
        .to_string())
    }
}
