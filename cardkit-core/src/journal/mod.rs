//! Tamper-evident, append-only controller journal.
//!
//! Every entry carries a gap-free sequence number and a signature binding its
//! content to a controller-local secret. Entries are never modified; the
//! retention policy may drop old entries but always keeps `INIT` and anything
//! the sync server has not acknowledged yet.

mod entry;
mod store;

pub use entry::{JournalEntry, JournalEvent, JournalSigner};
pub use store::{FileJournalStore, JournalStore, MemoryJournalStore};

use crate::error::{CardKitError, CardKitResult};
use crate::primitives::CardId;

const INIT_SEQ: u64 = 0;

/// In-memory view of a journal over its [`JournalStore`].
pub struct Journal {
    controller_id: String,
    signer: JournalSigner,
    store: Box<dyn JournalStore>,
    entries: Vec<JournalEntry>,
    next_seq: u64,
    acknowledged: Option<u64>,
}

impl Journal {
    /// Loads the journal from `store`, writing the `INIT` entry if the store
    /// is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read, or the `INIT` entry
    /// cannot be written.
    pub fn open(
        controller_id: &str,
        signer: JournalSigner,
        store: Box<dyn JournalStore>,
        now: u64,
    ) -> CardKitResult<Self> {
        let entries = store.load()?;
        let acknowledged = store.acknowledged()?;
        let next_seq = entries.last().map_or(INIT_SEQ, |entry| entry.seq + 1);
        let mut journal = Self {
            controller_id: controller_id.to_string(),
            signer,
            store,
            entries,
            next_seq,
            acknowledged,
        };
        if journal.entries.is_empty() {
            journal.append(
                JournalEvent::Init,
                format!("journal initialized for controller {controller_id}"),
                None,
                now,
            )?;
        }
        Ok(journal)
    }

    /// Signs and appends one entry. The entry is visible only once stored.
    ///
    /// # Errors
    ///
    /// Returns the store error; the sequence number is not consumed.
    pub fn append(
        &mut self,
        event_type: JournalEvent,
        message: impl Into<String>,
        card_id: Option<CardId>,
        timestamp: u64,
    ) -> CardKitResult<&JournalEntry> {
        let mut entry = JournalEntry {
            seq: self.next_seq,
            timestamp,
            controller_id: self.controller_id.clone(),
            event_type,
            message: message.into(),
            card_id,
            signature: [0; 32],
        };
        entry.signature = self.signer.sign(&entry);
        self.store.append(&entry)?;
        self.next_seq += 1;
        self.entries.push(entry);
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// All retained entries in append order.
    #[must_use]
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    /// Highest sequence number acknowledged by the sync server.
    #[must_use]
    pub const fn acknowledged(&self) -> Option<u64> {
        self.acknowledged
    }

    fn is_unsynced(&self, entry: &JournalEntry) -> bool {
        self.acknowledged.is_none_or(|acked| entry.seq > acked)
    }

    /// Up to `limit` entries not yet acknowledged, oldest first.
    #[must_use]
    pub fn unsynced(&self, limit: usize) -> Vec<JournalEntry> {
        self.entries
            .iter()
            .filter(|entry| self.is_unsynced(entry))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Number of entries not yet acknowledged.
    #[must_use]
    pub fn unsynced_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| self.is_unsynced(entry))
            .count()
    }

    /// Moves the acknowledged cursor forward to `seq`, clamped to the last
    /// written entry. Never moves it backwards.
    ///
    /// Returns the cursor after the update.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor cannot be persisted.
    pub fn acknowledge(&mut self, seq: u64) -> CardKitResult<Option<u64>> {
        let Some(last) = self.next_seq.checked_sub(1) else {
            return Ok(self.acknowledged);
        };
        let seq = seq.min(last);
        if self.acknowledged.is_some_and(|acked| acked >= seq) {
            return Ok(self.acknowledged);
        }
        self.store.set_acknowledged(seq)?;
        self.acknowledged = Some(seq);
        Ok(self.acknowledged)
    }

    /// Sequence numbers of entries failing signature or order validation.
    #[must_use]
    pub fn validate(&self) -> Vec<u64> {
        self.signer.find_tampered(&self.entries)
    }

    /// Drops acknowledged entries older than `cutoff`, keeping `INIT`.
    ///
    /// Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be rewritten; the journal is then
    /// left unchanged.
    pub fn prune(&mut self, cutoff: u64) -> CardKitResult<usize> {
        let kept: Vec<JournalEntry> = self
            .entries
            .iter()
            .filter(|entry| {
                entry.event_type == JournalEvent::Init
                    || entry.timestamp >= cutoff
                    || self.is_unsynced(entry)
            })
            .cloned()
            .collect();
        let removed = self.entries.len() - kept.len();
        if removed == 0 {
            return Ok(0);
        }
        self.store.rewrite(&kept)?;
        self.entries = kept;
        log::info!("pruned {removed} journal entries older than {cutoff}");
        Ok(removed)
    }

    /// Number of retained entries of `event_type`.
    #[must_use]
    pub fn count(&self, event_type: JournalEvent) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.event_type == event_type)
            .count()
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("controller_id", &self.controller_id)
            .field("entries", &self.entries.len())
            .field("next_seq", &self.next_seq)
            .field("acknowledged", &self.acknowledged)
            .finish_non_exhaustive()
    }
}

/// Checks a standalone list of entries (for example a file exported from a
/// controller) and returns the sequence numbers that fail validation.
///
/// # Errors
///
/// Returns [`CardKitError::InvalidInput`] if `entries` is empty or does not
/// start with `INIT`.
pub fn validate_entries(signer: &JournalSigner, entries: &[JournalEntry]) -> CardKitResult<Vec<u64>> {
    match entries.first() {
        Some(first) if first.event_type == JournalEvent::Init && first.seq == INIT_SEQ => {
            Ok(signer.find_tampered(entries))
        }
        Some(_) => Err(CardKitError::InvalidInput(
            "journal does not start with INIT".to_string(),
        )),
        None => Err(CardKitError::InvalidInput("journal is empty".to_string())),
    }
}
