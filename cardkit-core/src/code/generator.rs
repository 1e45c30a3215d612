//! Card-side code generation.

use std::sync::{Arc, Mutex};

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::card::TagScheme;
use crate::encoding::{counter_to_le, encode_b64url, NONCE_LEN};
use crate::error::{CardKitError, CardKitResult};
use crate::primitives::{CardId, CardSecret, Tag};

use super::counter::CounterJournal;
use super::mac::{derive_tag, DoorBinding};

/// A one-time authentication code as produced by a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OneTimeCode {
    /// Card the code belongs to.
    pub card_id: CardId,
    /// Strictly increasing counter, never 0.
    pub counter: u64,
    /// Truncated authentication tag.
    pub tag: Tag,
    /// Door binding for the door-bound scheme.
    pub binding: Option<DoorBinding>,
}

impl OneTimeCode {
    /// Wire form: every binary field as unpadded URL-safe base64.
    #[must_use]
    pub fn to_wire(&self) -> WireCode {
        WireCode {
            card_id: self.card_id.to_string(),
            counter: encode_b64url(&counter_to_le(self.counter)),
            tag: encode_b64url(self.tag.as_bytes()),
            door_id: self
                .binding
                .map(|binding| encode_b64url(&binding.door_id.to_be_bytes())),
            nonce: self.binding.map(|binding| encode_b64url(&binding.nonce)),
        }
    }
}

/// Transport representation of a presented code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCode {
    /// 16-byte card identifier.
    pub card_id: String,
    /// 8-byte little-endian counter.
    pub counter: String,
    /// 16-byte tag.
    pub tag: String,
    /// 4-byte big-endian door identifier (door-bound scheme only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub door_id: Option<String>,
    /// 12-byte nonce (door-bound scheme only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Produces one-time codes for a single card.
///
/// The counter mark is written to the [`CounterJournal`] before a code is
/// released. If that write fails no code is produced, so a restart can never
/// reuse a counter that was handed out.
pub struct CodeGenerator {
    card_id: CardId,
    secret: CardSecret,
    scheme: TagScheme,
    journal: Arc<dyn CounterJournal>,
    counter: Mutex<u64>,
}

impl CodeGenerator {
    /// Opens a generator, resuming above the journal's persisted mark.
    ///
    /// # Errors
    ///
    /// Returns [`CardKitError::CounterPersistence`] if the mark cannot be read.
    pub fn open(
        card_id: CardId,
        secret: CardSecret,
        scheme: TagScheme,
        journal: Arc<dyn CounterJournal>,
    ) -> CardKitResult<Self> {
        let mark = journal
            .load(&card_id)
            .map_err(|err| CardKitError::CounterPersistence(err.to_string()))?
            .unwrap_or(0);
        log::debug!("code generator for {card_id} resumes after counter {mark}");
        Ok(Self {
            card_id,
            secret,
            scheme,
            journal,
            counter: Mutex::new(mark),
        })
    }

    /// Card this generator produces codes for.
    #[must_use]
    pub const fn card_id(&self) -> &CardId {
        &self.card_id
    }

    /// Last counter released (0 before the first code).
    ///
    /// # Errors
    ///
    /// Returns an error if the counter lock is poisoned.
    pub fn current_counter(&self) -> CardKitResult<u64> {
        self.counter
            .lock()
            .map(|counter| *counter)
            .map_err(|_| CardKitError::poisoned("generator counter"))
    }

    /// Next basic-scheme code.
    ///
    /// Activation and expiry are not consulted: policy is enforced at
    /// verification.
    ///
    /// # Errors
    ///
    /// - [`CardKitError::InvalidInput`] if the card uses the door-bound scheme.
    /// - [`CardKitError::CounterExhausted`] at `u64::MAX`.
    /// - [`CardKitError::CounterPersistence`] if the mark cannot be persisted.
    pub fn next_code(&self) -> CardKitResult<OneTimeCode> {
        self.require_scheme(TagScheme::Basic)?;
        self.issue(None)
    }

    /// Next door-bound code for `door_id` with a fresh random nonce.
    ///
    /// # Errors
    ///
    /// As [`next_code`](Self::next_code), with the scheme check reversed.
    pub fn next_door_code(&self, door_id: u32) -> CardKitResult<OneTimeCode> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        self.next_door_code_with_nonce(door_id, nonce)
    }

    /// Next door-bound code with a caller-chosen nonce (reader challenge).
    ///
    /// # Errors
    ///
    /// As [`next_door_code`](Self::next_door_code).
    pub fn next_door_code_with_nonce(
        &self,
        door_id: u32,
        nonce: [u8; NONCE_LEN],
    ) -> CardKitResult<OneTimeCode> {
        self.require_scheme(TagScheme::DoorBound)?;
        self.issue(Some(DoorBinding { door_id, nonce }))
    }

    fn require_scheme(&self, wanted: TagScheme) -> CardKitResult<()> {
        if self.scheme == wanted {
            Ok(())
        } else {
            Err(CardKitError::InvalidInput(format!(
                "card uses the {} scheme, not {wanted}",
                self.scheme
            )))
        }
    }

    fn issue(&self, binding: Option<DoorBinding>) -> CardKitResult<OneTimeCode> {
        let mut counter = self
            .counter
            .lock()
            .map_err(|_| CardKitError::poisoned("generator counter"))?;
        let next = counter.checked_add(1).ok_or(CardKitError::CounterExhausted)?;

        self.journal
            .persist(&self.card_id, next)
            .map_err(|err| CardKitError::CounterPersistence(err.to_string()))?;
        *counter = next;

        Ok(OneTimeCode {
            card_id: self.card_id,
            counter: next,
            tag: derive_tag(&self.secret, &self.card_id, next, binding.as_ref()),
            binding,
        })
    }
}
