//! Card issuance and administration.

use std::sync::Arc;

use crate::audit::{AuditEvent, AuditRecord, AuditSink};
use crate::card::{Card, IssuedCard, TagScheme};
use crate::clock::Clock;
use crate::controller::CachedCard;
use crate::error::{CardKitError, CardKitResult};
use crate::primitives::{CardId, CardSecret};
use crate::role::{Role, RolePolicy};
use crate::rotation::KeyRotationManager;
use crate::storage::{unwrap_card_secret, wrap_card_secret, CredentialStore, ExtendOutcome, KeyWrap};
use crate::verifier::{PresentedCode, Verdict, Verifier};

/// Front door of the central system: issues cards, administers them, and
/// verifies presented codes.
///
/// ```ignore
/// let service = CardService::new(store, Arc::new(KekWrap::from_env()?), policy, audit, clock);
/// let issued = service.issue("alice", Role::Guest, None)?;
/// ```
pub struct CardService {
    store: Arc<dyn CredentialStore>,
    wrap: Arc<dyn KeyWrap>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    rotation: Arc<KeyRotationManager>,
    verifier: Verifier,
}

impl CardService {
    /// Wires a service, its rotation manager, and its verifier over one store.
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        wrap: Arc<dyn KeyWrap>,
        policy: RolePolicy,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rotation = Arc::new(KeyRotationManager::new(
            Arc::clone(&store),
            Arc::clone(&wrap),
            policy,
            Arc::clone(&audit),
            Arc::clone(&clock),
        ));
        let verifier = Verifier::new(
            Arc::clone(&store),
            Arc::clone(&wrap),
            Arc::clone(&rotation),
            Arc::clone(&audit),
            Arc::clone(&clock),
        );
        Self {
            store,
            wrap,
            audit,
            clock,
            rotation,
            verifier,
        }
    }

    /// Rotation manager sharing this service's store.
    #[must_use]
    pub fn rotation(&self) -> Arc<KeyRotationManager> {
        Arc::clone(&self.rotation)
    }

    /// Issues a basic-scheme card. `ttl` of `None` uses the role's default.
    ///
    /// # Errors
    ///
    /// - [`CardKitError::InvalidInput`] for an empty owner or a zero TTL.
    /// - Wrap or store errors.
    pub fn issue(&self, owner: &str, role: Role, ttl: Option<u64>) -> CardKitResult<IssuedCard> {
        self.issue_with_scheme(owner, role, ttl, TagScheme::Basic)
    }

    /// Issues a card using `scheme`.
    ///
    /// # Errors
    ///
    /// As [`issue`](Self::issue).
    pub fn issue_with_scheme(
        &self,
        owner: &str,
        role: Role,
        ttl: Option<u64>,
        scheme: TagScheme,
    ) -> CardKitResult<IssuedCard> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(CardKitError::InvalidInput("owner must not be empty".to_string()));
        }
        let policy = self.rotation.policy();
        let ttl = ttl.unwrap_or_else(|| policy.default_ttl(role));
        if ttl == 0 {
            return Err(CardKitError::InvalidInput("ttl must be positive".to_string()));
        }

        let now = self.clock.now();
        let card_id = CardId::random();
        let secret = CardSecret::generate();
        let card = Card {
            card_id,
            wrapped_secret: wrap_card_secret(self.wrap.as_ref(), &card_id, &secret)?,
            owner: owner.to_string(),
            role,
            scheme,
            created_at: now,
            expires_at: now.saturating_add(ttl),
            active: true,
            last_counter: None,
            key_version: 1,
            next_rotation_at: policy.next_rotation_at(role, now),
        };
        self.store.put(card.clone())?;

        log::info!("issued {role} card {card_id} ({scheme}) expiring at {}", card.expires_at);
        self.audit.record(AuditRecord::new(
            AuditEvent::CardCreated,
            Some(card_id),
            true,
            format!("role={role} scheme={scheme}"),
        ));
        Ok(IssuedCard { card, secret })
    }

    /// Loads a card record.
    ///
    /// # Errors
    ///
    /// [`CardKitError::NotFound`] if the card does not exist.
    pub fn get(&self, card_id: &CardId) -> CardKitResult<Card> {
        self.store.get(card_id)?.ok_or(CardKitError::NotFound)
    }

    /// Revokes a card. Revocation is terminal.
    ///
    /// # Errors
    ///
    /// [`CardKitError::NotFound`] if the card does not exist.
    pub fn revoke(&self, card_id: &CardId) -> CardKitResult<()> {
        if !self.store.deactivate(card_id)? {
            return Err(CardKitError::NotFound);
        }
        log::info!("revoked card {card_id}");
        self.audit.record(AuditRecord::new(
            AuditEvent::CardRevoked,
            Some(*card_id),
            true,
            "",
        ));
        Ok(())
    }

    /// Extends a card's validity by `extra_seconds` from its current end.
    ///
    /// Returns the new `expires_at`. Extending never revives a revoked card,
    /// and a card whose validity already ended stays expired.
    ///
    /// # Errors
    ///
    /// - [`CardKitError::NotFound`] if the card does not exist.
    /// - [`CardKitError::InvalidInput`] if the card has already expired.
    pub fn extend(&self, card_id: &CardId, extra_seconds: u64) -> CardKitResult<u64> {
        let now = self.clock.now();
        let expires_at = match self.store.extend_expires_at(card_id, extra_seconds, now)? {
            ExtendOutcome::Extended(expires_at) => expires_at,
            ExtendOutcome::Expired => {
                log::warn!("refused to extend expired card {card_id}");
                self.audit.record(AuditRecord::new(
                    AuditEvent::CardExtended,
                    Some(*card_id),
                    false,
                    "expired",
                ));
                return Err(CardKitError::InvalidInput("card has expired".to_string()));
            }
            ExtendOutcome::NotFound => return Err(CardKitError::NotFound),
        };
        log::info!("extended card {card_id} to {expires_at}");
        self.audit.record(AuditRecord::new(
            AuditEvent::CardExtended,
            Some(*card_id),
            true,
            format!("expires_at={expires_at}"),
        ));
        Ok(expires_at)
    }

    /// Verifies a presented code.
    pub fn verify(&self, code: &PresentedCode) -> Verdict {
        self.verifier.verify(code)
    }

    /// Rotates the card's secret if its deadline has passed.
    ///
    /// # Errors
    ///
    /// See [`KeyRotationManager::rotate_if_due`].
    pub fn rotate_if_due(&self, card_id: &CardId) -> CardKitResult<bool> {
        self.rotation.rotate_if_due(card_id)
    }

    /// Unwraps the card's current secret for re-personalization after a
    /// rotation.
    ///
    /// # Errors
    ///
    /// [`CardKitError::NotFound`], or [`CardKitError::Crypto`] on unwrap failure.
    pub fn personalization_secret(&self, card_id: &CardId) -> CardKitResult<CardSecret> {
        let card = self.get(card_id)?;
        unwrap_card_secret(self.wrap.as_ref(), card_id, &card.wrapped_secret)
    }

    /// Exports cache entries for an offline controller.
    ///
    /// # Errors
    ///
    /// [`CardKitError::NotFound`] for an unknown card, or unwrap errors.
    pub fn cache_snapshot(&self, card_ids: &[CardId]) -> CardKitResult<Vec<CachedCard>> {
        card_ids
            .iter()
            .map(|card_id| {
                let card = self.get(card_id)?;
                let secret = unwrap_card_secret(self.wrap.as_ref(), card_id, &card.wrapped_secret)?;
                Ok(CachedCard::from_card(&card, secret))
            })
            .collect()
    }
}
