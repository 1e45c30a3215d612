use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::card::{Card, TagScheme};
use crate::primitives::{CardId, CardSecret};
use crate::role::Role;

/// The controller's local view of a card: what verification needs, nothing
/// more. May be stale until the next snapshot.
#[derive(Debug, Clone)]
pub struct CachedCard {
    /// Card identifier.
    pub card_id: CardId,
    /// Holder label, checked by QR admission.
    pub owner: String,
    /// Role of the card.
    pub role: Role,
    /// Tag derivation scheme.
    pub scheme: TagScheme,
    /// Current plaintext secret. Never logged or journaled.
    pub secret: CardSecret,
    /// End of validity.
    pub expires_at: u64,
    /// `false` once revoked.
    pub active: bool,
    /// Highest counter accepted (centrally or locally).
    pub last_counter: Option<u64>,
}

impl CachedCard {
    /// Builds a cache entry from a card record and its unwrapped secret.
    #[must_use]
    pub fn from_card(card: &Card, secret: CardSecret) -> Self {
        Self {
            card_id: card.card_id,
            owner: card.owner.clone(),
            role: card.role,
            scheme: card.scheme,
            secret,
            expires_at: card.expires_at,
            active: card.active,
            last_counter: card.last_counter,
        }
    }
}

/// Serialized form of a [`CachedCard`], only ever written sealed.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(super) struct PersistedCard {
    #[zeroize(skip)]
    card_id: CardId,
    owner: String,
    #[zeroize(skip)]
    role: Role,
    #[zeroize(skip)]
    scheme: TagScheme,
    secret: [u8; 32],
    expires_at: u64,
    active: bool,
    last_counter: Option<u64>,
}

impl From<&CachedCard> for PersistedCard {
    fn from(card: &CachedCard) -> Self {
        Self {
            card_id: card.card_id,
            owner: card.owner.clone(),
            role: card.role,
            scheme: card.scheme,
            secret: *card.secret.as_bytes(),
            expires_at: card.expires_at,
            active: card.active,
            last_counter: card.last_counter,
        }
    }
}

impl From<&PersistedCard> for CachedCard {
    fn from(card: &PersistedCard) -> Self {
        Self {
            card_id: card.card_id,
            owner: card.owner.clone(),
            role: card.role,
            scheme: card.scheme,
            secret: CardSecret::from_bytes(card.secret),
            expires_at: card.expires_at,
            active: card.active,
            last_counter: card.last_counter,
        }
    }
}

/// Sealed form of the whole cache.
#[derive(Serialize, Deserialize)]
pub(super) struct PersistedCache {
    pub(super) cards: Vec<PersistedCard>,
    pub(super) marks: Vec<(CardId, u64)>,
}

struct Slot {
    card: CachedCard,
    last_used: u64,
}

/// Capacity-bounded card cache. When full, inserting a new card evicts the
/// one least recently admitted.
///
/// Besides the cached cards it keeps the highest counter accepted for every
/// card it has seen. Marks outlive eviction and snapshot replacement, so a
/// stale entry added back later can never accept a counter again.
pub(super) struct CardCache {
    capacity: usize,
    slots: HashMap<CardId, Slot>,
    marks: HashMap<CardId, u64>,
    tick: u64,
}

impl CardCache {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: HashMap::new(),
            marks: HashMap::new(),
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub(super) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(super) fn get(&self, card_id: &CardId) -> Option<&CachedCard> {
        self.slots.get(card_id).map(|slot| &slot.card)
    }

    pub(super) fn cards(&self) -> impl Iterator<Item = &CachedCard> {
        self.slots.values().map(|slot| &slot.card)
    }

    /// Counter high-water marks of every card seen.
    pub(super) fn marks(&self) -> impl Iterator<Item = (CardId, u64)> + '_ {
        self.marks.iter().map(|(card_id, counter)| (*card_id, *counter))
    }

    /// Raises the mark of `card_id` (and its cached counter) to `counter`.
    pub(super) fn raise_mark(&mut self, card_id: CardId, counter: u64) {
        let mark = self.marks.entry(card_id).or_insert(0);
        *mark = (*mark).max(counter);
        if let Some(slot) = self.slots.get_mut(&card_id) {
            slot.card.last_counter = slot.card.last_counter.max(Some(counter));
        }
    }

    /// Inserts or refreshes a card. Its counter is raised to the card's
    /// mark, so a refresh never lowers it. Returns the evicted card id, if any.
    pub(super) fn insert(&mut self, mut card: CachedCard) -> Option<CardId> {
        let tick = self.next_tick();
        card.last_counter = card
            .last_counter
            .max(self.marks.get(&card.card_id).copied());
        if let Some(counter) = card.last_counter {
            self.marks.insert(card.card_id, counter);
        }
        if let Some(slot) = self.slots.get_mut(&card.card_id) {
            slot.card = card;
            slot.last_used = tick;
            return None;
        }

        let evicted = if self.slots.len() >= self.capacity {
            self.slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(card_id, _)| *card_id)
        } else {
            None
        };
        if let Some(card_id) = &evicted {
            self.slots.remove(card_id);
        }
        self.slots.insert(card.card_id, Slot { card, last_used: tick });
        evicted
    }

    /// Drops a cached card. Its mark stays.
    pub(super) fn remove(&mut self, card_id: &CardId) -> bool {
        self.slots.remove(card_id).is_some()
    }

    /// Marks the card as just admitted (for eviction order).
    pub(super) fn touch(&mut self, card_id: &CardId) {
        let tick = self.next_tick();
        if let Some(slot) = self.slots.get_mut(card_id) {
            slot.last_used = tick;
        }
    }

    /// Sets the cached counter to `counter` only if it is still below it.
    pub(super) fn advance_counter(&mut self, card_id: &CardId, counter: u64) -> bool {
        match self.slots.get_mut(card_id) {
            Some(slot) if slot.card.last_counter.unwrap_or(0) < counter => {
                slot.card.last_counter = Some(counter);
                self.marks.insert(*card_id, counter);
                true
            }
            _ => false,
        }
    }

    /// Replaces the cached cards. Marks are kept and applied to the new entries.
    pub(super) fn replace(&mut self, cards: Vec<CachedCard>) -> usize {
        self.slots.clear();
        for card in cards {
            self.insert(card);
        }
        self.slots.len()
    }
}
