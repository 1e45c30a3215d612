//! Online verification of presented one-time codes.
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. resolve the card
//! 2. reject revoked cards
//! 3. reject expired cards
//! 4. rotate lazily if the rotation deadline has passed, then re-resolve
//! 5. decode the presented fields (length and scheme checks)
//! 6. reject replayed counters
//! 7. recompute the tag and compare in constant time
//! 8. advance the stored counter with a compare-and-set
//!
//! Nothing on this path returns an error: every failure becomes a
//! [`DenyReason`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::audit::{AuditEvent, AuditRecord, AuditSink};
use crate::card::{Card, TagScheme};
use crate::clock::Clock;
use crate::code::{derive_tag, DoorBinding, OneTimeCode, WireCode};
use crate::encoding::{counter_from_le, counter_to_le, decode_b64url, door_id_from_be, fixed, NONCE_LEN, TAG_LEN};
use crate::error::CardKitError;
use crate::primitives::{CardId, CardSecret, Tag};
use crate::rotation::KeyRotationManager;
use crate::storage::{unwrap_card_secret, CredentialStore, KeyWrap};

/// Why a code was denied.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// No card with the presented identifier.
    NotFound,
    /// The card was revoked.
    Inactive,
    /// The card's validity ended.
    Expired,
    /// A field has the wrong length or encoding, or the wrong scheme was used.
    InvalidInput,
    /// The counter is not above the last accepted counter.
    ReplayedCounter,
    /// The tag was valid but a concurrent verification advanced the counter first.
    ReplayLostRace,
    /// The tag does not match.
    BadSignature,
    /// An internal dependency failed; the decision fails closed.
    Unavailable,
}

impl DenyReason {
    /// Coarse category shown to callers.
    #[must_use]
    pub const fn category(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Inactive => "inactive",
            Self::Expired => "expired",
            Self::InvalidInput => "invalid_input",
            Self::ReplayedCounter | Self::ReplayLostRace => "replay",
            Self::BadSignature => "bad_signature",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Grant or deny with the reason of a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Verdict {
    /// Whether access is granted.
    pub granted: bool,
    /// Reason of a denial; `None` when granted.
    pub reason: Option<DenyReason>,
}

impl Verdict {
    /// A grant.
    #[must_use]
    pub const fn grant() -> Self {
        Self {
            granted: true,
            reason: None,
        }
    }

    /// A denial.
    #[must_use]
    pub const fn deny(reason: DenyReason) -> Self {
        Self {
            granted: false,
            reason: Some(reason),
        }
    }

    /// `"granted"` or the snake-case deny reason.
    #[must_use]
    pub fn reason_code(&self) -> String {
        self.reason
            .map_or_else(|| "granted".to_string(), |reason| reason.to_string())
    }
}

impl From<Result<(), DenyReason>> for Verdict {
    fn from(outcome: Result<(), DenyReason>) -> Self {
        match outcome {
            Ok(()) => Self::grant(),
            Err(reason) => Self::deny(reason),
        }
    }
}

/// Door fields of a presented door-bound code, undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedDoor {
    /// Door identifier bytes (4, big-endian).
    pub door_id: Vec<u8>,
    /// Nonce bytes (12).
    pub nonce: Vec<u8>,
}

/// A code as presented by a reader, before any length check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedCode {
    /// Card identifier bytes (16).
    pub card_id: Vec<u8>,
    /// Counter bytes (8, little-endian).
    pub counter: Vec<u8>,
    /// Tag bytes (16).
    pub tag: Vec<u8>,
    /// Door fields of the door-bound scheme.
    pub door: Option<PresentedDoor>,
}

impl PresentedCode {
    /// A basic-scheme presentation.
    #[must_use]
    pub fn new(card_id: &CardId, counter: &[u8], tag: &[u8]) -> Self {
        Self {
            card_id: card_id.as_bytes().to_vec(),
            counter: counter.to_vec(),
            tag: tag.to_vec(),
            door: None,
        }
    }

    /// Adds door-bound fields.
    #[must_use]
    pub fn with_door(mut self, door_id: &[u8], nonce: &[u8]) -> Self {
        self.door = Some(PresentedDoor {
            door_id: door_id.to_vec(),
            nonce: nonce.to_vec(),
        });
        self
    }

    /// Builds a presentation from its wire form.
    ///
    /// A field that is not valid base64 is kept empty, so it fails the length
    /// check of the step that reads it.
    #[must_use]
    pub fn from_wire(wire: &WireCode) -> Self {
        let decode = |field: &str| decode_b64url(field).unwrap_or_default();
        let door = match (&wire.door_id, &wire.nonce) {
            (None, None) => None,
            (door_id, nonce) => Some(PresentedDoor {
                door_id: door_id.as_deref().map(decode).unwrap_or_default(),
                nonce: nonce.as_deref().map(decode).unwrap_or_default(),
            }),
        };
        Self {
            card_id: decode(&wire.card_id),
            counter: decode(&wire.counter),
            tag: decode(&wire.tag),
            door,
        }
    }

    /// The card identifier, if it has the right length.
    #[must_use]
    pub fn card_id(&self) -> Option<CardId> {
        fixed::<16>(&self.card_id, "card id").ok().map(CardId::new)
    }
}

impl From<&OneTimeCode> for PresentedCode {
    fn from(code: &OneTimeCode) -> Self {
        let presented = Self::new(&code.card_id, &counter_to_le(code.counter), code.tag.as_bytes());
        match code.binding {
            Some(binding) => presented.with_door(&binding.door_id.to_be_bytes(), &binding.nonce),
            None => presented,
        }
    }
}

/// Presented fields after the shape checks.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DecodedCode {
    pub(crate) counter: u64,
    pub(crate) tag: [u8; TAG_LEN],
    pub(crate) binding: Option<DoorBinding>,
}

/// Steps 2 and 3.
pub(crate) const fn check_lifecycle(active: bool, expires_at: u64, now: u64) -> Result<(), DenyReason> {
    if !active {
        return Err(DenyReason::Inactive);
    }
    if now > expires_at {
        return Err(DenyReason::Expired);
    }
    Ok(())
}

/// Step 5. The presented door fields must match the card's scheme.
pub(crate) fn decode_presented(
    code: &PresentedCode,
    scheme: TagScheme,
) -> Result<DecodedCode, DenyReason> {
    let counter = counter_from_le(&code.counter).map_err(|_| DenyReason::InvalidInput)?;
    let tag = fixed::<TAG_LEN>(&code.tag, "tag").map_err(|_| DenyReason::InvalidInput)?;
    let binding = match (scheme, &code.door) {
        (TagScheme::Basic, None) => None,
        (TagScheme::DoorBound, Some(door)) => Some(DoorBinding {
            door_id: door_id_from_be(&door.door_id).map_err(|_| DenyReason::InvalidInput)?,
            nonce: fixed::<NONCE_LEN>(&door.nonce, "nonce").map_err(|_| DenyReason::InvalidInput)?,
        }),
        _ => return Err(DenyReason::InvalidInput),
    };
    Ok(DecodedCode {
        counter,
        tag,
        binding,
    })
}

/// Step 6.
pub(crate) fn check_replay(last_counter: Option<u64>, counter: u64) -> Result<(), DenyReason> {
    if counter <= last_counter.unwrap_or(0) {
        Err(DenyReason::ReplayedCounter)
    } else {
        Ok(())
    }
}

/// Step 7.
pub(crate) fn check_tag(
    secret: &CardSecret,
    card_id: &CardId,
    decoded: &DecodedCode,
) -> Result<(), DenyReason> {
    let expected: Tag = derive_tag(secret, card_id, decoded.counter, decoded.binding.as_ref());
    if expected.ct_eq(&decoded.tag) {
        Ok(())
    } else {
        Err(DenyReason::BadSignature)
    }
}

fn unavailable(context: &str, err: &CardKitError) -> DenyReason {
    log::error!("{context}: {err}");
    DenyReason::Unavailable
}

/// Verifies codes against a [`CredentialStore`].
pub struct Verifier {
    store: Arc<dyn CredentialStore>,
    wrap: Arc<dyn KeyWrap>,
    rotation: Arc<KeyRotationManager>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl Verifier {
    /// Creates a verifier.
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        wrap: Arc<dyn KeyWrap>,
        rotation: Arc<KeyRotationManager>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            wrap,
            rotation,
            audit,
            clock,
        }
    }

    /// Decides whether `code` is granted. Each call is audited.
    pub fn verify(&self, code: &PresentedCode) -> Verdict {
        let verdict = Verdict::from(self.evaluate(code));
        let card_id = code.card_id();
        match verdict.reason {
            None => log::debug!("code granted for card {card_id:?}"),
            Some(reason @ (DenyReason::BadSignature | DenyReason::ReplayLostRace)) => {
                log::warn!("code denied for card {card_id:?}: {reason}");
            }
            Some(reason) => log::debug!("code denied for card {card_id:?}: {reason}"),
        }
        self.audit.record(AuditRecord::new(
            AuditEvent::Verify,
            card_id,
            verdict.granted,
            verdict.reason_code(),
        ));
        verdict
    }

    /// Verifies a code in its wire form.
    pub fn verify_wire(&self, wire: &WireCode) -> Verdict {
        self.verify(&PresentedCode::from_wire(wire))
    }

    fn resolve(&self, card_id: &CardId) -> Result<Card, DenyReason> {
        self.store
            .get(card_id)
            .map_err(|err| unavailable("card lookup failed", &err))?
            .ok_or(DenyReason::NotFound)
    }

    fn evaluate(&self, code: &PresentedCode) -> Result<(), DenyReason> {
        let card_id = code.card_id().ok_or(DenyReason::NotFound)?;
        let mut card = self.resolve(&card_id)?;
        let now = self.clock.now();
        check_lifecycle(card.active, card.expires_at, now)?;

        if card.is_rotation_due(now) {
            // A failed rotation leaves the previous secret in place.
            if let Err(err) = self.rotation.rotate_if_due(&card_id) {
                log::warn!("lazy rotation of card {card_id} failed: {err}");
            }
            card = self.resolve(&card_id)?;
            check_lifecycle(card.active, card.expires_at, now)?;
        }

        let decoded = decode_presented(code, card.scheme)?;
        check_replay(card.last_counter, decoded.counter)?;

        let secret = unwrap_card_secret(self.wrap.as_ref(), &card_id, &card.wrapped_secret)
            .map_err(|err| unavailable("card secret unwrap failed", &err))?;
        check_tag(&secret, &card_id, &decoded)?;

        let advanced = self
            .store
            .compare_and_set_counter(&card_id, decoded.counter, decoded.counter)
            .map_err(|err| unavailable("counter update failed", &err))?;
        if advanced {
            Ok(())
        } else {
            Err(DenyReason::ReplayLostRace)
        }
    }
}
