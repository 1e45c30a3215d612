use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::primitives::{CardId, CardSecret};
use crate::role::Role;

/// Tag derivation scheme a card was personalized with.
///
/// Stored per card so a verifier never has to guess which derivation a
/// presented code uses.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TagScheme {
    /// `Trunc16(HMAC(K_master, cardId || LE64(ctr)))`.
    #[default]
    Basic,
    /// `Trunc16(HMAC(K_ctr, cardId || doorId || nonce || LE64(ctr)))` with
    /// `K_ctr = HMAC(K_master, "ctr" || LE64(ctr))`.
    DoorBound,
}

/// A stored card credential.
///
/// The secret is only ever held wrapped under the deployment key-encryption
/// key. `last_counter` is `None` until the first code is accepted.
#[derive(Clone, PartialEq, Eq)]
pub struct Card {
    /// Immutable identifier.
    pub card_id: CardId,
    /// Envelope-encrypted `K_master`.
    pub wrapped_secret: Vec<u8>,
    /// Display label of the holder.
    pub owner: String,
    /// Role selecting validity and rotation policy.
    pub role: Role,
    /// Tag derivation scheme.
    pub scheme: TagScheme,
    /// Issuance time.
    pub created_at: u64,
    /// End of validity. Verification fails once `now > expires_at`.
    pub expires_at: u64,
    /// `false` once revoked. Revocation is terminal.
    pub active: bool,
    /// Highest accepted counter.
    pub last_counter: Option<u64>,
    /// Incremented on every rotation, starting at 1.
    pub key_version: u32,
    /// Deadline for the next rotation.
    pub next_rotation_at: u64,
}

impl Card {
    /// Whether the validity window has passed at `now`.
    #[must_use]
    pub const fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }

    /// Whether the card's secret is due for rotation at `now`.
    #[must_use]
    pub const fn is_rotation_due(&self, now: u64) -> bool {
        self.active && now >= self.next_rotation_at
    }

    /// Whether `counter` would be rejected as a replay.
    ///
    /// Counter `0` is never produced by a generator and is always a replay.
    #[must_use]
    pub fn is_replay(&self, counter: u64) -> bool {
        counter <= self.last_counter.unwrap_or(0)
    }
}

impl fmt::Debug for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Card")
            .field("card_id", &self.card_id)
            .field("wrapped_secret", &format_args!("<{} bytes>", self.wrapped_secret.len()))
            .field("owner", &self.owner)
            .field("role", &self.role)
            .field("scheme", &self.scheme)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("active", &self.active)
            .field("last_counter", &self.last_counter)
            .field("key_version", &self.key_version)
            .field("next_rotation_at", &self.next_rotation_at)
            .finish()
    }
}

/// Result of issuance: the stored record plus the plaintext secret, handed out
/// once so the physical card can be personalized.
#[derive(Debug, Clone)]
pub struct IssuedCard {
    /// The stored record.
    pub card: Card,
    /// Plaintext `K_master` for personalization.
    pub secret: CardSecret,
}
