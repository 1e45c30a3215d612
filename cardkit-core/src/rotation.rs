//! Key rotation lifecycle.
//!
//! A card moves from `(key_version, next_rotation_at)` to
//! `(key_version + 1, next_rotation_at')` either during a scheduled sweep or
//! lazily when the verifier meets a card whose deadline has passed. Both
//! paths go through [`KeyRotationManager::rotate_if_due`], and the store
//! commit is conditional on the key version the rotation started from, so a
//! card rotates at most once per deadline however many triggers race.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::audit::{AuditEvent, AuditRecord, AuditSink};
use crate::card::Card;
use crate::clock::Clock;
use crate::error::{CardKitError, CardKitResult};
use crate::primitives::{CardId, CardSecret};
use crate::role::RolePolicy;
use crate::storage::{wrap_card_secret, CredentialStore, KeyWrap, RotationCommit};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Cards rotated by this sweep.
    pub rotated: Vec<CardId>,
    /// Cards whose rotation failed, with the error. Retried next sweep.
    pub failed: Vec<(CardId, String)>,
}

/// Schedules and performs card secret rotation.
pub struct KeyRotationManager {
    store: Arc<dyn CredentialStore>,
    wrap: Arc<dyn KeyWrap>,
    policy: RolePolicy,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl KeyRotationManager {
    /// Creates a manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        wrap: Arc<dyn KeyWrap>,
        policy: RolePolicy,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            wrap,
            policy,
            audit,
            clock,
        }
    }

    /// Role policy used to compute rotation deadlines.
    #[must_use]
    pub const fn policy(&self) -> &RolePolicy {
        &self.policy
    }

    /// Rotates the card if it is active and its deadline has passed.
    ///
    /// Returns `true` if this call committed a rotation, `false` if none was
    /// due or a concurrent rotation committed first.
    ///
    /// # Errors
    ///
    /// - [`CardKitError::NotFound`] if the card does not exist.
    /// - [`CardKitError::RotationFailed`] if wrapping or committing failed. The
    ///   card keeps its previous secret.
    pub fn rotate_if_due(&self, card_id: &CardId) -> CardKitResult<bool> {
        let card = self.load(card_id)?;
        let now = self.clock.now();
        if !card.is_rotation_due(now) {
            return Ok(false);
        }
        self.rotate_card(&card, now)
    }

    /// Rotates an active card immediately, regardless of its deadline.
    ///
    /// # Errors
    ///
    /// As [`rotate_if_due`](Self::rotate_if_due), plus
    /// [`CardKitError::InvalidInput`] for a revoked card.
    pub fn rotate(&self, card_id: &CardId) -> CardKitResult<bool> {
        let card = self.load(card_id)?;
        if !card.active {
            return Err(CardKitError::InvalidInput(
                "revoked cards are not rotated".to_string(),
            ));
        }
        self.rotate_card(&card, self.clock.now())
    }

    /// Rotates every active card whose deadline has passed.
    ///
    /// A failure for one card is recorded in the report and does not stop the
    /// sweep.
    ///
    /// # Errors
    ///
    /// Returns an error only if the due cards cannot be listed.
    pub fn sweep(&self) -> CardKitResult<SweepReport> {
        let due = self.store.due_for_rotation(self.clock.now())?;
        let mut report = SweepReport::default();
        for card_id in due {
            match self.rotate_if_due(&card_id) {
                Ok(true) => report.rotated.push(card_id),
                Ok(false) => {}
                Err(err) => report.failed.push((card_id, err.to_string())),
            }
        }
        if !report.rotated.is_empty() || !report.failed.is_empty() {
            log::info!(
                "rotation sweep: {} rotated, {} failed",
                report.rotated.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until `shutdown` flips to
    /// `true` or its sender is dropped.
    pub async fn run_scheduled(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("rotation scheduler started, interval {interval:?}");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let manager = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || manager.sweep()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => log::warn!("rotation sweep failed: {err}"),
                        Err(err) => log::error!("rotation sweep task aborted: {err}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("rotation scheduler stopped");
    }

    fn load(&self, card_id: &CardId) -> CardKitResult<Card> {
        self.store.get(card_id)?.ok_or(CardKitError::NotFound)
    }

    fn rotate_card(&self, card: &Card, now: u64) -> CardKitResult<bool> {
        match self.commit_new_secret(card, now) {
            Ok(committed) => Ok(committed),
            Err(err) => {
                log::warn!("rotation of card {} failed: {err}", card.card_id);
                self.audit.record(AuditRecord::new(
                    AuditEvent::KeyRotationFailed,
                    Some(card.card_id),
                    false,
                    err.to_string(),
                ));
                Err(err)
            }
        }
    }

    fn commit_new_secret(&self, card: &Card, now: u64) -> CardKitResult<bool> {
        let key_version = card
            .key_version
            .checked_add(1)
            .ok_or_else(|| CardKitError::RotationFailed("key version exhausted".to_string()))?;
        let secret = CardSecret::generate();
        let wrapped_secret = wrap_card_secret(self.wrap.as_ref(), &card.card_id, &secret)
            .map_err(|err| CardKitError::RotationFailed(err.to_string()))?;
        let commit = RotationCommit {
            expected_key_version: card.key_version,
            wrapped_secret,
            key_version,
            next_rotation_at: self.policy.next_rotation_at(card.role, now),
        };

        let committed = self
            .store
            .commit_rotation(&card.card_id, &commit)
            .map_err(|err| CardKitError::RotationFailed(err.to_string()))?;
        if committed {
            log::info!("card {} rotated to key version {key_version}", card.card_id);
            self.audit.record(AuditRecord::new(
                AuditEvent::KeyRotated,
                Some(card.card_id),
                true,
                format!("key_version={key_version}"),
            ));
        } else {
            log::debug!(
                "rotation of card {} superseded by a concurrent rotation",
                card.card_id
            );
        }
        Ok(committed)
    }
}
