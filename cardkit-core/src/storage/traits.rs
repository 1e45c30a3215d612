//! Storage interfaces consumed by the core.

use crate::card::Card;
use crate::error::CardKitResult;
use crate::primitives::CardId;

/// Key material produced by one rotation, committed atomically.
#[derive(Clone, PartialEq, Eq)]
pub struct RotationCommit {
    /// Key version the rotation was computed from. The commit only applies
    /// if the stored version still matches.
    pub expected_key_version: u32,
    /// New envelope-encrypted secret.
    pub wrapped_secret: Vec<u8>,
    /// New key version (`expected_key_version + 1`).
    pub key_version: u32,
    /// New rotation deadline.
    pub next_rotation_at: u64,
}

/// Outcome of [`CredentialStore::extend_expires_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendOutcome {
    /// The new end of validity.
    Extended(u64),
    /// The card had already expired; nothing changed.
    Expired,
    /// No such card.
    NotFound,
}

/// Card record store.
///
/// Pure data layer: no protocol logic lives behind this trait. The counter is
/// the only contended field and only moves through
/// [`compare_and_set_counter`](CredentialStore::compare_and_set_counter);
/// key material only moves through
/// [`commit_rotation`](CredentialStore::commit_rotation).
///
/// # Implementation Notes
///
/// A persistent implementation maps each conditional method onto a single
/// conditional `UPDATE ... WHERE` statement and reports whether a row changed.
pub trait CredentialStore: Send + Sync {
    /// Loads a card.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails. A missing card is `Ok(None)`.
    fn get(&self, card_id: &CardId) -> CardKitResult<Option<Card>>;

    /// Inserts a card, or replaces the record of an existing one.
    ///
    /// Replacing a record never lowers its stored counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn put(&self, card: Card) -> CardKitResult<()>;

    /// Sets the counter to `new_value` only if the stored counter is still
    /// strictly less than `expected_less_than`.
    ///
    /// Returns `false` when no record changed (card missing, or a concurrent
    /// update already advanced the counter).
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn compare_and_set_counter(
        &self,
        card_id: &CardId,
        expected_less_than: u64,
        new_value: u64,
    ) -> CardKitResult<bool>;

    /// Applies rotated key material if the stored key version still equals
    /// `commit.expected_key_version`. Never touches the counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn commit_rotation(&self, card_id: &CardId, commit: &RotationCommit) -> CardKitResult<bool>;

    /// Marks a card inactive. There is no inverse operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn deactivate(&self, card_id: &CardId) -> CardKitResult<bool>;

    /// Moves the end of validity of a card `extra_seconds` further, unless the
    /// card is already expired at `now`. Expiry is terminal.
    ///
    /// The check and the update are one atomic step, so concurrent extensions
    /// all apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn extend_expires_at(
        &self,
        card_id: &CardId,
        extra_seconds: u64,
        now: u64,
    ) -> CardKitResult<ExtendOutcome>;

    /// Identifiers of active cards whose rotation deadline is at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn due_for_rotation(&self, now: u64) -> CardKitResult<Vec<CardId>>;
}

/// Atomic storage for small files (counter marks, cache snapshots).
///
/// Writes MUST be atomic: readers see either the complete old content or the
/// complete new content, never a partial write.
pub trait AtomicBlobStore: Send + Sync {
    /// Reads a blob by name. A missing blob is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    fn read(&self, name: &str) -> CardKitResult<Option<Vec<u8>>>;

    /// Atomically writes a blob, replacing any existing content.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn write_atomic(&self, name: &str, bytes: &[u8]) -> CardKitResult<()>;

    /// Deletes a blob. Deleting a missing blob succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error only for actual I/O failures.
    fn delete(&self, name: &str) -> CardKitResult<()>;

    /// Checks if a blob exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read operation fails.
    fn exists(&self, name: &str) -> CardKitResult<bool> {
        Ok(self.read(name)?.is_some())
    }
}
