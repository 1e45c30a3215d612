//! Durable counter high-water marks for the card side.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::encoding::{counter_from_le, counter_to_le};
use crate::error::{CardKitError, CardKitResult};
use crate::primitives::CardId;
use crate::storage::AtomicBlobStore;

/// Persists the highest counter a generator has released.
///
/// `persist` must be durable when it returns `Ok`: the generator releases a
/// code only afterwards.
pub trait CounterJournal: Send + Sync {
    /// Returns the persisted mark, or `None` if nothing was ever persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium cannot be read.
    fn load(&self, card_id: &CardId) -> CardKitResult<Option<u64>>;

    /// Durably records `counter` as the new mark.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    fn persist(&self, card_id: &CardId, counter: u64) -> CardKitResult<()>;
}

/// Volatile [`CounterJournal`]. Does not survive restarts.
#[derive(Debug, Default)]
pub struct MemoryCounterJournal {
    mark: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryCounterJournal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent writes fail. Used to exercise fail-closed paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl CounterJournal for MemoryCounterJournal {
    fn load(&self, _card_id: &CardId) -> CardKitResult<Option<u64>> {
        let mark = self.mark.load(Ordering::SeqCst);
        Ok((mark != 0).then_some(mark))
    }

    fn persist(&self, _card_id: &CardId, counter: u64) -> CardKitResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CardKitError::Storage("counter journal is read-only".to_string()));
        }
        self.mark.fetch_max(counter, Ordering::SeqCst);
        Ok(())
    }
}

/// [`CounterJournal`] stored as one 8-byte little-endian blob per card.
pub struct BlobCounterJournal {
    store: Arc<dyn AtomicBlobStore>,
}

impl BlobCounterJournal {
    /// Creates a journal over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn AtomicBlobStore>) -> Self {
        Self { store }
    }

    fn blob_name(card_id: &CardId) -> String {
        format!("counter-{card_id}.bin")
    }
}

impl CounterJournal for BlobCounterJournal {
    fn load(&self, card_id: &CardId) -> CardKitResult<Option<u64>> {
        self.store
            .read(&Self::blob_name(card_id))?
            .map(|bytes| counter_from_le(&bytes))
            .transpose()
    }

    fn persist(&self, card_id: &CardId, counter: u64) -> CardKitResult<()> {
        self.store
            .write_atomic(&Self::blob_name(card_id), &counter_to_le(counter))
    }
}
