//! In-memory implementations of the storage traits.
//!
//! The credential store keeps one slot per card: an atomic counter plus a
//! lock over the remaining fields, so counter advancement never waits on a
//! rotation or an administrative write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::card::Card;
use crate::error::{CardKitError, CardKitResult};
use crate::primitives::CardId;

use super::traits::{AtomicBlobStore, CredentialStore, ExtendOutcome, RotationCommit};

/// Counter value representing "no code accepted yet". Never accepted itself.
const COUNTER_UNSET: u64 = 0;

struct CardSlot {
    record: RwLock<Card>,
    last_counter: AtomicU64,
}

impl CardSlot {
    fn new(mut card: Card) -> Self {
        let counter = card.last_counter.take().unwrap_or(COUNTER_UNSET);
        Self {
            record: RwLock::new(card),
            last_counter: AtomicU64::new(counter),
        }
    }

    fn snapshot(&self) -> CardKitResult<Card> {
        let mut card = self
            .record
            .read()
            .map_err(|_| CardKitError::poisoned("card record"))?
            .clone();
        let counter = self.last_counter.load(Ordering::SeqCst);
        card.last_counter = (counter != COUNTER_UNSET).then_some(counter);
        Ok(card)
    }

    fn raise_counter(&self, counter: u64) {
        self.last_counter.fetch_max(counter, Ordering::SeqCst);
    }
}

/// Concurrent in-memory [`CredentialStore`].
#[derive(Default)]
pub struct MemoryCredentialStore {
    cards: RwLock<HashMap<CardId, Arc<CardSlot>>>,
}

impl MemoryCredentialStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored cards.
    ///
    /// # Errors
    ///
    /// Returns an error if the map lock is poisoned.
    pub fn len(&self) -> CardKitResult<usize> {
        Ok(self
            .cards
            .read()
            .map_err(|_| CardKitError::poisoned("card map"))?
            .len())
    }

    /// Whether the store holds no cards.
    ///
    /// # Errors
    ///
    /// Returns an error if the map lock is poisoned.
    pub fn is_empty(&self) -> CardKitResult<bool> {
        Ok(self.len()? == 0)
    }

    fn slot(&self, card_id: &CardId) -> CardKitResult<Option<Arc<CardSlot>>> {
        Ok(self
            .cards
            .read()
            .map_err(|_| CardKitError::poisoned("card map"))?
            .get(card_id)
            .cloned())
    }

    fn update_record(
        &self,
        card_id: &CardId,
        apply: impl FnOnce(&mut Card) -> bool,
    ) -> CardKitResult<bool> {
        let Some(slot) = self.slot(card_id)? else {
            return Ok(false);
        };
        let mut record = slot
            .record
            .write()
            .map_err(|_| CardKitError::poisoned("card record"))?;
        Ok(apply(&mut record))
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, card_id: &CardId) -> CardKitResult<Option<Card>> {
        self.slot(card_id)?.map(|slot| slot.snapshot()).transpose()
    }

    fn put(&self, card: Card) -> CardKitResult<()> {
        let mut cards = self
            .cards
            .write()
            .map_err(|_| CardKitError::poisoned("card map"))?;
        if let Some(slot) = cards.get(&card.card_id) {
            let mut card = card;
            if let Some(counter) = card.last_counter.take() {
                slot.raise_counter(counter);
            }
            *slot
                .record
                .write()
                .map_err(|_| CardKitError::poisoned("card record"))? = card;
        } else {
            cards.insert(card.card_id, Arc::new(CardSlot::new(card)));
        }
        Ok(())
    }

    fn compare_and_set_counter(
        &self,
        card_id: &CardId,
        expected_less_than: u64,
        new_value: u64,
    ) -> CardKitResult<bool> {
        let Some(slot) = self.slot(card_id)? else {
            return Ok(false);
        };
        Ok(slot
            .last_counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < expected_less_than).then_some(new_value)
            })
            .is_ok())
    }

    fn commit_rotation(&self, card_id: &CardId, commit: &RotationCommit) -> CardKitResult<bool> {
        self.update_record(card_id, |card| {
            if card.key_version != commit.expected_key_version {
                return false;
            }
            card.wrapped_secret.clone_from(&commit.wrapped_secret);
            card.key_version = commit.key_version;
            card.next_rotation_at = commit.next_rotation_at;
            true
        })
    }

    fn deactivate(&self, card_id: &CardId) -> CardKitResult<bool> {
        self.update_record(card_id, |card| {
            card.active = false;
            true
        })
    }

    fn extend_expires_at(
        &self,
        card_id: &CardId,
        extra_seconds: u64,
        now: u64,
    ) -> CardKitResult<ExtendOutcome> {
        let mut outcome = ExtendOutcome::NotFound;
        self.update_record(card_id, |card| {
            outcome = if card.is_expired(now) {
                ExtendOutcome::Expired
            } else {
                card.expires_at = card.expires_at.saturating_add(extra_seconds);
                ExtendOutcome::Extended(card.expires_at)
            };
            true
        })?;
        Ok(outcome)
    }

    fn due_for_rotation(&self, now: u64) -> CardKitResult<Vec<CardId>> {
        let slots: Vec<Arc<CardSlot>> = self
            .cards
            .read()
            .map_err(|_| CardKitError::poisoned("card map"))?
            .values()
            .cloned()
            .collect();
        let mut due = Vec::new();
        for slot in slots {
            let record = slot
                .record
                .read()
                .map_err(|_| CardKitError::poisoned("card record"))?;
            if record.is_rotation_due(now) {
                due.push(record.card_id);
            }
        }
        due.sort();
        Ok(due)
    }
}

/// In-memory atomic blob store backed by a `HashMap`.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Creates an empty blob store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AtomicBlobStore for MemoryBlobStore {
    fn read(&self, name: &str) -> CardKitResult<Option<Vec<u8>>> {
        let guard = self
            .blobs
            .lock()
            .map_err(|_| CardKitError::poisoned("blob store"))?;
        Ok(guard.get(name).cloned())
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> CardKitResult<()> {
        self.blobs
            .lock()
            .map_err(|_| CardKitError::poisoned("blob store"))?
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> CardKitResult<()> {
        self.blobs
            .lock()
            .map_err(|_| CardKitError::poisoned("blob store"))?
            .remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::card::TagScheme;
    use crate::role::Role;

    fn card(id: u8) -> Card {
        Card {
            card_id: CardId::new([id; 16]),
            wrapped_secret: vec![id; 8],
            owner: format!("owner-{id}"),
            role: Role::Permanent,
            scheme: TagScheme::Basic,
            created_at: 0,
            expires_at: 1_000,
            active: true,
            last_counter: None,
            key_version: 1,
            next_rotation_at: 500,
        }
    }

    #[test]
    fn test_get_missing_card() {
        let store = MemoryCredentialStore::new();
        assert!(store.get(&CardId::new([0; 16])).expect("get").is_none());
        assert!(!store
            .compare_and_set_counter(&CardId::new([0; 16]), 1, 1)
            .expect("cas"));
    }

    #[test]
    fn test_counter_starts_unset_and_advances() {
        let store = MemoryCredentialStore::new();
        let card = card(1);
        store.put(card.clone()).expect("put");
        assert_eq!(store.get(&card.card_id).expect("get").expect("card").last_counter, None);

        assert!(store.compare_and_set_counter(&card.card_id, 3, 3).expect("cas"));
        assert!(!store.compare_and_set_counter(&card.card_id, 3, 3).expect("cas"));
        assert!(!store.compare_and_set_counter(&card.card_id, 2, 2).expect("cas"));
        assert_eq!(
            store.get(&card.card_id).expect("get").expect("card").last_counter,
            Some(3)
        );
    }

    #[test]
    fn test_put_never_lowers_counter() {
        let store = MemoryCredentialStore::new();
        let mut card = card(2);
        store.put(card.clone()).expect("put");
        assert!(store.compare_and_set_counter(&card.card_id, 10, 10).expect("cas"));

        card.owner = "renamed".to_string();
        card.last_counter = Some(4);
        store.put(card.clone()).expect("put");
        let stored = store.get(&card.card_id).expect("get").expect("card");
        assert_eq!(stored.owner, "renamed");
        assert_eq!(stored.last_counter, Some(10));
    }

    #[test]
    fn test_rotation_commit_is_conditional_on_version() {
        let store = MemoryCredentialStore::new();
        let card = card(3);
        store.put(card.clone()).expect("put");
        assert!(store.compare_and_set_counter(&card.card_id, 7, 7).expect("cas"));

        let commit = RotationCommit {
            expected_key_version: 1,
            wrapped_secret: vec![0xEE; 8],
            key_version: 2,
            next_rotation_at: 900,
        };
        assert!(store.commit_rotation(&card.card_id, &commit).expect("commit"));
        assert!(!store.commit_rotation(&card.card_id, &commit).expect("commit"));

        let stored = store.get(&card.card_id).expect("get").expect("card");
        assert_eq!(stored.key_version, 2);
        assert_eq!(stored.wrapped_secret, vec![0xEE; 8]);
        assert_eq!(stored.last_counter, Some(7));
    }

    #[test]
    fn test_due_for_rotation_skips_inactive() {
        let store = MemoryCredentialStore::new();
        store.put(card(4)).expect("put");
        store.put(card(5)).expect("put");
        assert!(store.deactivate(&CardId::new([5; 16])).expect("deactivate"));

        assert!(store.due_for_rotation(499).expect("due").is_empty());
        assert_eq!(
            store.due_for_rotation(500).expect("due"),
            vec![CardId::new([4; 16])]
        );
    }

    #[test]
    fn test_concurrent_cas_on_same_counter_has_one_winner() {
        let store = Arc::new(MemoryCredentialStore::new());
        let card = card(6);
        store.put(card.clone()).expect("put");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store
                        .compare_and_set_counter(&card.card_id, 42, 42)
                        .expect("cas")
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_extend_refuses_expired_card() {
        let store = MemoryCredentialStore::new();
        let card = card(6);
        store.put(card.clone()).expect("put");

        assert_eq!(
            store.extend_expires_at(&card.card_id, 100, 1_000).expect("extend"),
            ExtendOutcome::Extended(1_100)
        );
        assert_eq!(
            store.extend_expires_at(&card.card_id, 100, 1_101).expect("extend"),
            ExtendOutcome::Expired
        );
        assert_eq!(
            store
                .extend_expires_at(&CardId::new([0; 16]), 100, 0)
                .expect("extend"),
            ExtendOutcome::NotFound
        );
    }

    #[test]
    fn test_concurrent_extensions_all_apply() {
        let store = Arc::new(MemoryCredentialStore::new());
        let card = card(7);
        store.put(card.clone()).expect("put");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store
                        .extend_expires_at(&card.card_id, 10, 0)
                        .expect("extend")
                })
            })
            .collect();
        for handle in handles {
            assert!(matches!(
                handle.join().expect("join"),
                ExtendOutcome::Extended(_)
            ));
        }
        assert_eq!(
            store.get(&card.card_id).expect("get").expect("card").expires_at,
            1_080
        );
    }

    #[test]
    fn test_blob_store_round_trip() {
        let store = MemoryBlobStore::new();
        assert!(!store.exists("a").expect("exists"));
        store.write_atomic("a", b"bytes").expect("write");
        assert_eq!(store.read("a").expect("read"), Some(b"bytes".to_vec()));
        store.delete("a").expect("delete");
        store.delete("a").expect("delete twice");
        assert!(store.read("a").expect("read").is_none());
    }
}
