//! In-memory gallery snapshot.
//!
//! Matching runs against an immutable snapshot of the identity table.
//! Administrative writes (enroll, remove, bind) call [`Gallery::reload`]
//! after committing, so the next frame sees the change without the match
//! path ever touching SQLite.

use attend_core::Identity;
use attend_store::{Store, StoreError};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct Gallery {
    snapshot: RwLock<Arc<Vec<Identity>>>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-fetch all identities from the store. Returns the gallery size.
    pub async fn reload(&self, store: &Store) -> Result<usize, StoreError> {
        let identities = store.list_identities().await?;
        let count = identities.len();
        *self.snapshot.write().await = Arc::new(identities);
        tracing::debug!(count, "gallery reloaded");
        Ok(count)
    }

    pub async fn snapshot(&self) -> Arc<Vec<Identity>> {
        self.snapshot.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.snapshot.read().await.len()
    }
}
