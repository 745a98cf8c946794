//! Sign-in coordination: pairing face matches with card taps.
//!
//! The coordinator is a single-owner state machine driven by three event
//! sources: face observations from the capture engine, tag events from the
//! card reader, and expiry ticks. It holds at most one pending half of a
//! sign-in at a time:
//!
//!   Idle -> FaceMatched -> confirmed   (face seen first, card within 30 s)
//!   Idle -> CardPending -> confirmed   (card seen first, face within 30 s)
//!
//! A confirmed sign-in is stamped with the face-detection time, not the
//! card-tap time. Every accepted or rejected attempt surfaces as a
//! [`SignInOutcome`] so the caller can log or display it; storage failures
//! reject the attempt instead of taking the daemon down.

use crate::gallery::Gallery;
use attend_core::{CardId, CosineMatcher, Embedding, Matcher};
use attend_hw::TagEvent;
use attend_store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One face embedding lifted out of a camera frame.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub embedding: Embedding,
    /// Wall-clock capture time, milliseconds since the Unix epoch.
    pub detected_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Open-gallery acceptance threshold for cosine similarity.
    pub match_threshold: f32,
    /// Single-identity threshold used when verifying a face against the
    /// known owner of a pending card.
    pub strict_threshold: f32,
    /// How long one half of a sign-in waits for the other.
    pub pairing_window_ms: i64,
    /// Repeat sign-ins for the same (identity, card) pair inside this
    /// window are suppressed.
    pub duplicate_window_ms: i64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            match_threshold: attend_core::DEFAULT_MATCH_THRESHOLD,
            strict_threshold: attend_core::STRICT_MATCH_THRESHOLD,
            pairing_window_ms: 30_000,
            duplicate_window_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// The tapped card is bound to nobody.
    CardNotRecognized { card: CardId },
    /// The tapped card belongs to a different enrolled identity.
    OwnedByOther { card: CardId, owner: String },
    /// The tapped card is not the one bound to the matched identity.
    WrongCard { expected: CardId, got: CardId },
    /// Same (identity, card) pair already recorded inside the duplicate
    /// window.
    Duplicate {
        identity_id: i64,
        last_seen_ms: i64,
    },
    /// The pairing window elapsed with only one half present.
    Timeout,
    /// The record could not be written.
    StoreUnavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignInOutcome {
    Recorded {
        record_id: i64,
        identity_id: i64,
        name: String,
        card: CardId,
        /// Face-detection time carried into the record.
        timestamp_ms: i64,
        similarity: f32,
    },
    Rejected(RejectReason),
}

enum Pending {
    Idle,
    FaceMatched {
        identity_id: i64,
        name: String,
        /// Card bound to the identity at match time.
        card: CardId,
        similarity: f32,
        detected_at_ms: i64,
        generation: u64,
    },
    CardPending {
        card: CardId,
        observed_at_ms: i64,
        generation: u64,
    },
}

pub struct SignInCoordinator {
    store: Store,
    gallery: Arc<Gallery>,
    matcher: CosineMatcher,
    settings: CoordinatorSettings,
    state: Pending,
    generation: u64,
    expire_tx: mpsc::Sender<u64>,
}

impl SignInCoordinator {
    pub fn new(
        store: Store,
        gallery: Arc<Gallery>,
        settings: CoordinatorSettings,
        expire_tx: mpsc::Sender<u64>,
    ) -> Self {
        Self {
            store,
            gallery,
            matcher: CosineMatcher,
            settings,
            state: Pending::Idle,
            generation: 0,
            expire_tx,
        }
    }

    /// Feed one face observation. `None` means no attempt concluded (no
    /// match, or a pending half was armed and is now waiting).
    pub async fn on_face(&mut self, obs: FaceObservation) -> Option<SignInOutcome> {
        if let Pending::CardPending {
            card,
            observed_at_ms,
            ..
        } = &self.state
        {
            if obs.detected_at_ms - observed_at_ms <= self.settings.pairing_window_ms {
                let card = card.clone();
                return self.face_against_pending_card(obs, card).await;
            }
            // Window already elapsed; the expiry tick reports the timeout.
            self.state = Pending::Idle;
        }

        let snapshot = self.gallery.snapshot().await;
        let result = self
            .matcher
            .compare(&obs.embedding, &snapshot, self.settings.match_threshold);
        if !result.matched {
            tracing::trace!(similarity = result.similarity, "no gallery match for frame");
            return None;
        }
        let identity_id = result.identity_id?;
        let identity = snapshot.iter().find(|i| i.id == identity_id)?;

        tracing::info!(
            identity = identity_id,
            name = %identity.name,
            similarity = result.similarity,
            "face matched; waiting for card"
        );
        let generation = self.arm();
        self.state = Pending::FaceMatched {
            identity_id,
            name: identity.name.clone(),
            card: identity.card_id.clone(),
            similarity: result.similarity,
            detected_at_ms: obs.detected_at_ms,
            generation,
        };
        None
    }

    /// Feed one card tap.
    pub async fn on_tag(&mut self, event: TagEvent) -> Option<SignInOutcome> {
        match &self.state {
            Pending::FaceMatched {
                identity_id,
                name,
                card,
                similarity,
                detected_at_ms,
                ..
            } if event.observed_at_ms - detected_at_ms <= self.settings.pairing_window_ms => {
                let (identity_id, name, expected, similarity, detected_at_ms) = (
                    *identity_id,
                    name.clone(),
                    card.clone(),
                    *similarity,
                    *detected_at_ms,
                );
                self.card_against_pending_face(
                    event,
                    identity_id,
                    name,
                    expected,
                    similarity,
                    detected_at_ms,
                )
                .await
            }
            _ => {
                // Idle, or a stale pending half. Arm the card side of a
                // sign-in; a strict face verification completes it.
                let generation = self.arm();
                tracing::info!(card = %event.card, "card tapped; waiting for face");
                self.state = Pending::CardPending {
                    card: event.card,
                    observed_at_ms: event.observed_at_ms,
                    generation,
                };
                None
            }
        }
    }

    /// Expiry tick for a pairing window opened at `generation`. Stale ticks
    /// (the state moved on since) are no-ops.
    pub fn on_expired(&mut self, generation: u64) -> Option<SignInOutcome> {
        let current = match &self.state {
            Pending::FaceMatched { generation, .. } | Pending::CardPending { generation, .. } => {
                *generation
            }
            Pending::Idle => return None,
        };
        if current != generation {
            return None;
        }
        tracing::info!("pairing window expired");
        self.state = Pending::Idle;
        Some(SignInOutcome::Rejected(RejectReason::Timeout))
    }

    /// Strict verification of an incoming face against the owner of the
    /// pending card. Below-threshold frames stay pending silently; the
    /// right person may still walk up.
    async fn face_against_pending_card(
        &mut self,
        obs: FaceObservation,
        card: CardId,
    ) -> Option<SignInOutcome> {
        let owner = match self.store.identity_by_card(&card).await {
            Ok(owner) => owner,
            Err(e) => {
                tracing::error!(error = %e, "card owner lookup failed");
                self.state = Pending::Idle;
                return Some(SignInOutcome::Rejected(RejectReason::StoreUnavailable));
            }
        };
        let Some(owner) = owner else {
            self.state = Pending::Idle;
            return Some(SignInOutcome::Rejected(RejectReason::CardNotRecognized {
                card,
            }));
        };
        let Some(stored) = &owner.embedding else {
            tracing::debug!(identity = owner.id, "card owner has no embedding");
            return None;
        };
        let similarity = obs.embedding.similarity(stored);
        if similarity < self.settings.strict_threshold {
            tracing::trace!(
                identity = owner.id,
                similarity,
                "below strict threshold; still waiting"
            );
            return None;
        }
        let outcome = self
            .confirm(
                owner.id,
                owner.name.clone(),
                card,
                similarity,
                obs.detected_at_ms,
                obs.detected_at_ms,
            )
            .await;
        Some(outcome)
    }

    /// Acceptance rule for a card tap landing on a pending face match.
    async fn card_against_pending_face(
        &mut self,
        event: TagEvent,
        identity_id: i64,
        name: String,
        expected: CardId,
        similarity: f32,
        detected_at_ms: i64,
    ) -> Option<SignInOutcome> {
        let owner = match self.store.identity_by_card(&event.card).await {
            Ok(owner) => owner,
            Err(e) => {
                tracing::error!(error = %e, "card owner lookup failed");
                self.state = Pending::Idle;
                return Some(SignInOutcome::Rejected(RejectReason::StoreUnavailable));
            }
        };

        if event.card != expected {
            // The matched person stays pending; they may tap the right
            // card next.
            let reason = match owner {
                Some(o) if o.id != identity_id => RejectReason::OwnedByOther {
                    card: event.card,
                    owner: o.name,
                },
                Some(_) => RejectReason::WrongCard {
                    expected,
                    got: event.card,
                },
                None => RejectReason::CardNotRecognized { card: event.card },
            };
            return Some(SignInOutcome::Rejected(reason));
        }

        // Re-check ownership at tap time; the binding may have moved since
        // the gallery snapshot was taken.
        match owner {
            None => {
                self.state = Pending::Idle;
                Some(SignInOutcome::Rejected(RejectReason::CardNotRecognized {
                    card: event.card,
                }))
            }
            Some(o) if o.id != identity_id => {
                self.state = Pending::Idle;
                Some(SignInOutcome::Rejected(RejectReason::OwnedByOther {
                    card: event.card,
                    owner: o.name,
                }))
            }
            Some(_) => {
                let outcome = self
                    .confirm(
                        identity_id,
                        name,
                        event.card,
                        similarity,
                        detected_at_ms,
                        event.observed_at_ms,
                    )
                    .await;
                Some(outcome)
            }
        }
    }

    /// Both halves agree. Suppress duplicates, then append the record with
    /// the face-detection timestamp.
    async fn confirm(
        &mut self,
        identity_id: i64,
        name: String,
        card: CardId,
        similarity: f32,
        detected_at_ms: i64,
        attempt_at_ms: i64,
    ) -> SignInOutcome {
        self.state = Pending::Idle;

        let last = match self.store.latest_attendance(identity_id, &card).await {
            Ok(last) => last,
            Err(e) => {
                tracing::error!(error = %e, "duplicate probe failed");
                return SignInOutcome::Rejected(RejectReason::StoreUnavailable);
            }
        };
        if let Some(last) = last {
            if attempt_at_ms - last.timestamp_ms <= self.settings.duplicate_window_ms {
                tracing::info!(
                    identity = identity_id,
                    last_seen_ms = last.timestamp_ms,
                    "duplicate sign-in suppressed"
                );
                return SignInOutcome::Rejected(RejectReason::Duplicate {
                    identity_id,
                    last_seen_ms: last.timestamp_ms,
                });
            }
        }

        match self
            .store
            .insert_attendance(identity_id, &card, detected_at_ms, true)
            .await
        {
            Ok(record_id) => {
                tracing::info!(
                    record = record_id,
                    identity = identity_id,
                    name = %name,
                    card = %card,
                    similarity,
                    "sign-in recorded"
                );
                SignInOutcome::Recorded {
                    record_id,
                    identity_id,
                    name,
                    card,
                    timestamp_ms: detected_at_ms,
                    similarity,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, identity = identity_id, "failed to write record");
                SignInOutcome::Rejected(RejectReason::StoreUnavailable)
            }
        }
    }

    /// Bump the generation and schedule an expiry tick for it.
    fn arm(&mut self) -> u64 {
        self.generation += 1;
        let generation = self.generation;
        let tx = self.expire_tx.clone();
        let window = Duration::from_millis(self.settings.pairing_window_ms.max(0) as u64);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = tx.send(generation).await;
        });
        generation
    }

    #[cfg(test)]
    fn pending_generation(&self) -> Option<u64> {
        match &self.state {
            Pending::Idle => None,
            Pending::FaceMatched { generation, .. } | Pending::CardPending { generation, .. } => {
                Some(*generation)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_embedding(axis: usize) -> Embedding {
        let mut values = vec![0.0f32; 8];
        values[axis] = 1.0;
        Embedding {
            values,
            model_version: Some("mobile_face_net".into()),
        }
    }

    fn card(s: &str) -> CardId {
        CardId::normalize(s).unwrap()
    }

    fn face(axis: usize, at_ms: i64) -> FaceObservation {
        FaceObservation {
            embedding: unit_embedding(axis),
            detected_at_ms: at_ms,
        }
    }

    fn tap(s: &str, at_ms: i64) -> TagEvent {
        TagEvent {
            card: card(s),
            observed_at_ms: at_ms,
        }
    }

    async fn setup(identities: &[(&str, &str, usize)]) -> (Store, SignInCoordinator) {
        let store = Store::open_in_memory().await.unwrap();
        for (name, c, axis) in identities {
            store
                .insert_identity(
                    (*name).into(),
                    card(c),
                    Some(&unit_embedding(*axis)),
                    None,
                )
                .await
                .unwrap();
        }
        let gallery = Arc::new(Gallery::new());
        gallery.reload(&store).await.unwrap();
        let (expire_tx, _expire_rx) = mpsc::channel(8);
        let coordinator = SignInCoordinator::new(
            store.clone(),
            gallery,
            CoordinatorSettings::default(),
            expire_tx,
        );
        (store, coordinator)
    }

    #[tokio::test]
    async fn face_then_card_records_with_face_timestamp() {
        let (store, mut c) = setup(&[("alice", "04A1B2C3", 0)]).await;

        assert!(c.on_face(face(0, 1_000)).await.is_none());
        let outcome = c.on_tag(tap("04-a1-b2-c3", 5_000)).await.unwrap();

        match outcome {
            SignInOutcome::Recorded {
                name, timestamp_ms, ..
            } => {
                assert_eq!(name, "alice");
                assert_eq!(timestamp_ms, 1_000);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let records = store.list_attendance().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp_ms, 1_000);
    }

    #[tokio::test]
    async fn card_then_face_uses_strict_threshold() {
        let (store, mut c) = setup(&[("alice", "AA", 0)]).await;

        assert!(c.on_tag(tap("AA", 0)).await.is_none());
        // Wrong person in front of the camera: stays pending, no outcome.
        assert!(c.on_face(face(1, 1_000)).await.is_none());
        assert!(store.list_attendance().await.unwrap().is_empty());

        let outcome = c.on_face(face(0, 2_000)).await.unwrap();
        match outcome {
            SignInOutcome::Recorded { timestamp_ms, .. } => assert_eq!(timestamp_ms, 2_000),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_within_window_is_suppressed() {
        let (store, mut c) = setup(&[("alice", "AA", 0)]).await;

        c.on_face(face(0, 1_000)).await;
        c.on_tag(tap("AA", 2_000)).await.unwrap();

        c.on_face(face(0, 8_000)).await;
        let second = c.on_tag(tap("AA", 9_000)).await.unwrap();
        assert_eq!(
            second,
            SignInOutcome::Rejected(RejectReason::Duplicate {
                identity_id: 1,
                last_seen_ms: 1_000,
            })
        );
        assert_eq!(store.list_attendance().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeat_after_window_is_recorded() {
        let (store, mut c) = setup(&[("alice", "AA", 0)]).await;

        c.on_face(face(0, 1_000)).await;
        c.on_tag(tap("AA", 2_000)).await.unwrap();

        // The probe measures against the tap time, not the stored stamp
        // plus window alone: 12_001 - 1_000 > 10_000.
        c.on_face(face(0, 12_000)).await;
        let second = c.on_tag(tap("AA", 12_001)).await.unwrap();
        assert!(matches!(second, SignInOutcome::Recorded { .. }));
        assert_eq!(store.list_attendance().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn card_owned_by_someone_else_is_rejected() {
        let (store, mut c) = setup(&[("alice", "AA", 0), ("bob", "BB", 1)]).await;

        c.on_face(face(1, 1_000)).await; // bob
        let outcome = c.on_tag(tap("AA", 2_000)).await.unwrap(); // alice's card
        assert_eq!(
            outcome,
            SignInOutcome::Rejected(RejectReason::OwnedByOther {
                card: card("AA"),
                owner: "alice".into(),
            })
        );
        assert!(store.list_attendance().await.unwrap().is_empty());

        // bob is still pending; the right card completes the sign-in.
        let outcome = c.on_tag(tap("BB", 3_000)).await.unwrap();
        assert!(matches!(outcome, SignInOutcome::Recorded { .. }));
    }

    #[tokio::test]
    async fn unknown_card_keeps_face_pending() {
        let (store, mut c) = setup(&[("alice", "AA", 0)]).await;

        c.on_face(face(0, 1_000)).await;
        let outcome = c.on_tag(tap("FFFF", 2_000)).await.unwrap();
        assert_eq!(
            outcome,
            SignInOutcome::Rejected(RejectReason::CardNotRecognized { card: card("FFFF") })
        );
        assert!(store.list_attendance().await.unwrap().is_empty());

        let outcome = c.on_tag(tap("AA", 3_000)).await.unwrap();
        assert!(matches!(outcome, SignInOutcome::Recorded { .. }));
    }

    #[tokio::test]
    async fn tap_after_pairing_window_does_not_record() {
        let (store, mut c) = setup(&[("alice", "AA", 0)]).await;

        c.on_face(face(0, 0)).await;
        // 30_001 ms later: the face half is stale; the tap arms the card
        // side instead of completing a sign-in.
        assert!(c.on_tag(tap("AA", 30_001)).await.is_none());
        assert!(store.list_attendance().await.unwrap().is_empty());

        // A fresh face inside the card window completes it.
        let outcome = c.on_face(face(0, 31_000)).await.unwrap();
        match outcome {
            SignInOutcome::Recorded { timestamp_ms, .. } => assert_eq!(timestamp_ms, 31_000),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn below_threshold_face_changes_nothing() {
        let (store, mut c) = setup(&[("alice", "AA", 0)]).await;
        assert!(c.on_face(face(1, 1_000)).await.is_none());
        assert!(c.pending_generation().is_none());
        assert!(store.list_attendance().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_expiry_tick_is_a_noop() {
        let (_store, mut c) = setup(&[("alice", "AA", 0)]).await;

        c.on_face(face(0, 1_000)).await;
        let first = c.pending_generation().unwrap();

        // A newer face match supersedes the first window.
        c.on_face(face(0, 2_000)).await;
        let second = c.pending_generation().unwrap();
        assert_ne!(first, second);

        assert!(c.on_expired(first).is_none());
        assert_eq!(c.pending_generation(), Some(second));

        assert_eq!(
            c.on_expired(second),
            Some(SignInOutcome::Rejected(RejectReason::Timeout))
        );
        assert!(c.pending_generation().is_none());
    }

    #[tokio::test]
    async fn newer_card_tap_replaces_pending_card() {
        let (_store, mut c) = setup(&[("alice", "AA", 0), ("bob", "BB", 1)]).await;

        assert!(c.on_tag(tap("AA", 0)).await.is_none());
        assert!(c.on_tag(tap("BB", 1_000)).await.is_none());

        // The face completing the pair is verified against the newest card.
        let outcome = c.on_face(face(1, 2_000)).await.unwrap();
        match outcome {
            SignInOutcome::Recorded { name, .. } => assert_eq!(name, "bob"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
