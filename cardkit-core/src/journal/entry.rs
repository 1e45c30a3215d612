use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};
use subtle::ConstantTimeEq;

use crate::primitives::CardId;

/// Kind of journaled event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JournalEvent {
    /// First entry of every journal. Never pruned.
    Init,
    /// A card was added to the local cache.
    CardAdded,
    /// A card was removed from the local cache.
    CardRemoved,
    /// The local cache was replaced by a snapshot.
    CacheLoad,
    /// A presentation was granted.
    AccessGranted,
    /// A presentation was denied.
    AccessDenied,
    /// A sync attempt succeeded.
    Sync,
    /// A sync attempt failed.
    SyncError,
    /// Any other local failure.
    Error,
}

/// One signed journal entry. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    /// Position in the journal, starting at 0 for `INIT`.
    pub seq: u64,
    /// Unix seconds.
    pub timestamp: u64,
    /// Controller that wrote the entry.
    pub controller_id: String,
    /// Event kind.
    pub event_type: JournalEvent,
    /// Free text. Never contains secret material.
    pub message: String,
    /// Card concerned, if any.
    pub card_id: Option<CardId>,
    /// SHA-256 binding the fields above to the controller signing secret.
    #[serde(with = "hex::serde")]
    pub signature: [u8; 32],
}

/// Signs and checks journal entries with the controller-local secret.
///
/// The secret is independent of every card secret.
pub struct JournalSigner {
    secret: SecretBox<[u8; 32]>,
}

impl JournalSigner {
    /// Creates a signer from the controller signing secret.
    #[must_use]
    pub fn new(secret: [u8; 32]) -> Self {
        Self {
            secret: SecretBox::new(Box::new(secret)),
        }
    }

    /// Computes the signature of `entry`, ignoring its current `signature`.
    #[must_use]
    pub fn sign(&self, entry: &JournalEntry) -> [u8; 32] {
        let event_type = entry.event_type.to_string();
        let card_id: &[u8] = entry.card_id.as_ref().map_or(&[][..], |id| &id.as_bytes()[..]);
        let seq = entry.seq.to_be_bytes();
        let timestamp = entry.timestamp.to_be_bytes();
        let fields: [&[u8]; 6] = [
            event_type.as_bytes(),
            entry.message.as_bytes(),
            card_id,
            &seq,
            &timestamp,
            entry.controller_id.as_bytes(),
        ];

        let mut hasher = Sha256::new();
        for field in fields {
            // Fields are length-prefixed so adjacent fields cannot be shifted.
            hasher.update(u32::try_from(field.len()).unwrap_or(u32::MAX).to_be_bytes());
            hasher.update(field);
        }
        hasher.update(self.secret.expose_secret());
        hasher.finalize().into()
    }

    /// Whether the stored signature matches the entry content.
    #[must_use]
    pub fn verify(&self, entry: &JournalEntry) -> bool {
        self.sign(entry)[..].ct_eq(&entry.signature[..]).into()
    }

    /// Sequence numbers of entries whose signature does not match, or whose
    /// position breaks the strictly increasing order.
    #[must_use]
    pub fn find_tampered(&self, entries: &[JournalEntry]) -> Vec<u64> {
        let mut previous: Option<u64> = None;
        entries
            .iter()
            .filter_map(|entry| {
                let out_of_order = previous.is_some_and(|seq| entry.seq <= seq);
                previous = Some(entry.seq);
                (out_of_order || !self.verify(entry)).then_some(entry.seq)
            })
            .collect()
    }
}

impl std::fmt::Debug for JournalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalSigner").finish_non_exhaustive()
    }
}
