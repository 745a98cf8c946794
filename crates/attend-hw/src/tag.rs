//! Card reader input: an asynchronous stream of normalized tag reads.
//!
//! Keyboard-wedge NFC readers show up as a character device that emits one
//! identifier per line. [`TagReader`] tails that device, normalizes each line
//! to a [`CardId`], stamps it, and forwards it on a channel. [`TagQueue`]
//! gives consumers the required superseding semantics: bounded retention of
//! the most recent reads, newest popped first.

use attend_core::{now_ms, CardId};
use std::collections::VecDeque;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// How many queued reads are retained; older reads beyond this are dropped.
pub const TAG_QUEUE_CAPACITY: usize = 10;

#[derive(Error, Debug)]
pub enum TagError {
    #[error("failed to open tag reader {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A single observed tag read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEvent {
    pub card: CardId,
    /// Arrival wall-clock time, milliseconds since the Unix epoch.
    pub observed_at_ms: i64,
}

/// Bounded queue of recent tag reads, newest at the back.
///
/// `push` beyond capacity drops the oldest entry. `pop_latest` removes and
/// returns the newest — older queued reads are superseded once a newer one
/// arrives, but stay queued until consumed. Consumers pop at most one event
/// per matching evaluation, so there is no guarantee every read is evaluated
/// when reads outpace consumption.
#[derive(Debug, Default)]
pub struct TagQueue {
    entries: VecDeque<TagEvent>,
}

impl TagQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: TagEvent) {
        if self.entries.len() >= TAG_QUEUE_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(event);
    }

    /// Remove and return the most recent read, if any.
    pub fn pop_latest(&mut self) -> Option<TagEvent> {
        self.entries.pop_back()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Tails a reader device and forwards normalized tag events.
pub struct TagReader {
    device_path: PathBuf,
}

impl TagReader {
    pub fn new(device_path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
        }
    }

    /// Open the device and spawn a task that pushes each normalized read
    /// into `tx`. Lines that normalize to nothing (chatter, empty reads) are
    /// logged and dropped. The task exits when the device closes or every
    /// receiver is gone.
    pub async fn spawn(self, tx: mpsc::Sender<TagEvent>) -> Result<(), TagError> {
        let file = tokio::fs::File::open(&self.device_path)
            .await
            .map_err(|source| TagError::Open {
                path: self.device_path.clone(),
                source,
            })?;

        tracing::info!(device = %self.device_path.display(), "tag reader opened");

        tokio::spawn(async move {
            let mut lines = BufReader::new(file).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let card = match CardId::normalize(&line) {
                            Ok(card) => card,
                            Err(err) => {
                                tracing::debug!(%err, "ignoring unparsable tag read");
                                continue;
                            }
                        };
                        let event = TagEvent {
                            card,
                            observed_at_ms: now_ms(),
                        };
                        tracing::debug!(card = %event.card, "tag read");
                        if tx.send(event).await.is_err() {
                            tracing::info!("tag consumer gone; reader task exiting");
                            return;
                        }
                    }
                    Ok(None) => {
                        tracing::warn!(device = %self.device_path.display(), "tag reader stream ended");
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(%err, "tag reader read failed; exiting");
                        return;
                    }
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(card: &str, at: i64) -> TagEvent {
        TagEvent {
            card: CardId::normalize(card).unwrap(),
            observed_at_ms: at,
        }
    }

    #[test]
    fn pop_latest_returns_newest_first() {
        let mut q = TagQueue::new();
        q.push(event("AA", 1));
        q.push(event("BB", 2));
        q.push(event("CC", 3));

        assert_eq!(q.pop_latest().unwrap().card.as_str(), "CC");
        assert_eq!(q.pop_latest().unwrap().card.as_str(), "BB");
        assert_eq!(q.pop_latest().unwrap().card.as_str(), "AA");
        assert!(q.pop_latest().is_none());
    }

    #[test]
    fn push_beyond_capacity_drops_oldest() {
        let mut q = TagQueue::new();
        for i in 0..15 {
            q.push(event(&format!("{i:02X}"), i));
        }
        assert_eq!(q.len(), TAG_QUEUE_CAPACITY);

        // newest is the last pushed; the first five were dropped
        assert_eq!(q.pop_latest().unwrap().observed_at_ms, 14);
        let mut oldest = None;
        while let Some(e) = q.pop_latest() {
            oldest = Some(e);
        }
        assert_eq!(oldest.unwrap().observed_at_ms, 5);
    }

    #[test]
    fn clear_empties_queue() {
        let mut q = TagQueue::new();
        q.push(event("AA", 1));
        q.clear();
        assert!(q.is_empty());
    }
}
