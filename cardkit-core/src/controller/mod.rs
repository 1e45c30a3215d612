//! Offline access controller.
//!
//! Decides presentations locally against a bounded card cache, journals
//! every decision, and pushes the journal to the server when it can. The
//! cache and the journal live behind one `RwLock`: admissions take the write
//! lock (they advance counters), statistics and exports take the read lock,
//! and sync holds a lock only while reading or recording, never while the
//! batch is in flight.

mod cache;
mod qr;
mod sync;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::config::ControllerConfig;
use crate::error::{CardKitError, CardKitResult};
use crate::journal::{Journal, JournalEntry, JournalEvent, JournalSigner, JournalStore};
use crate::primitives::CardId;
use crate::storage::{AtomicBlobStore, KeyWrap};
use crate::verifier::{
    check_lifecycle, check_replay, check_tag, decode_presented, DenyReason, PresentedCode, Verdict,
};

pub use cache::CachedCard;
use cache::{CardCache, PersistedCache, PersistedCard};
pub use qr::QrPayload;
pub use sync::{MemorySyncServer, SyncAck, SyncBatch, SyncResult, SyncTransport};

const CACHE_BLOB: &str = "controller-cache.bin";
/// Message prefix of counter grants; the counter follows in decimal.
const GRANT_PREFIX: &str = "counter ";

/// How much a decision can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    /// Authenticated one-time code with anti-replay.
    Counter,
    /// Unsigned QR payload: identity and lifecycle only, no freshness proof.
    QrUnverified,
}

/// A local admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Grant or deny.
    pub verdict: Verdict,
    /// Trust tier of the evidence the decision rests on.
    pub trust: TrustTier,
    /// Card the presentation named, if it could be parsed.
    pub card_id: Option<CardId>,
}

impl Decision {
    /// Whether access is granted.
    #[must_use]
    pub const fn granted(&self) -> bool {
        self.verdict.granted
    }

    /// Reason of a denial.
    #[must_use]
    pub const fn reason(&self) -> Option<DenyReason> {
        self.verdict.reason
    }
}

/// Read-only controller statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStats {
    /// Controller identifier.
    pub controller_id: String,
    /// Retained journal entries.
    pub total_events: usize,
    /// Granted admissions since the journal was created.
    pub granted: u64,
    /// Denied admissions since the journal was created.
    pub denied: u64,
    /// Cards currently cached.
    pub cached_cards: usize,
    /// Journal entries not yet acknowledged by the server.
    pub unsynced_entries: usize,
}

struct ControllerState {
    cache: CardCache,
    journal: Journal,
    granted: u64,
    denied: u64,
}

/// Collaborators of an [`OfflineController`].
pub struct ControllerParts {
    /// Journal backing storage.
    pub journal_store: Box<dyn JournalStore>,
    /// Controller-local journal signing secret.
    pub signing_secret: [u8; 32],
    /// Seals the persisted cache.
    pub wrap: Arc<dyn KeyWrap>,
    /// Where the cache is persisted; `None` keeps it in memory only.
    pub blobs: Option<Arc<dyn AtomicBlobStore>>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Local decision point that works without connectivity.
pub struct OfflineController {
    config: ControllerConfig,
    wrap: Arc<dyn KeyWrap>,
    blobs: Option<Arc<dyn AtomicBlobStore>>,
    clock: Arc<dyn Clock>,
    state: RwLock<ControllerState>,
}

impl OfflineController {
    /// Opens a controller: loads (or initializes) the journal and restores a
    /// persisted cache if one exists.
    ///
    /// Counters granted in retained journal entries are applied on top of
    /// the restored cache, so grants made after the last
    /// [`persist_cache`](Self::persist_cache) are never accepted again.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration, an unreadable journal,
    /// or a persisted cache that cannot be unsealed.
    pub fn open(config: ControllerConfig, parts: ControllerParts) -> CardKitResult<Self> {
        config.validate()?;
        let ControllerParts {
            journal_store,
            signing_secret,
            wrap,
            blobs,
            clock,
        } = parts;

        let journal = Journal::open(
            &config.controller_id,
            JournalSigner::new(signing_secret),
            journal_store,
            clock.now(),
        )?;
        let granted = journal.count(JournalEvent::AccessGranted) as u64;
        let denied = journal.count(JournalEvent::AccessDenied) as u64;

        let mut cache = CardCache::new(config.cache_capacity);
        if let Some(blobs) = &blobs {
            if let Some(sealed) = blobs.read(CACHE_BLOB)? {
                let restored = unseal_cache(wrap.as_ref(), &config.controller_id, &sealed)?;
                log::info!("restored {} cached cards", restored.cards.len());
                for (card_id, counter) in &restored.marks {
                    cache.raise_mark(*card_id, *counter);
                }
                cache.replace(restored.cards.iter().map(CachedCard::from).collect());
            }
        }
        for (card_id, counter) in granted_counters(journal.entries()) {
            cache.raise_mark(card_id, counter);
        }

        log::info!(
            "controller {} opened with {} journal entries",
            config.controller_id,
            journal.entries().len()
        );
        Ok(Self {
            config,
            wrap,
            blobs,
            clock,
            state: RwLock::new(ControllerState {
                cache,
                journal,
                granted,
                denied,
            }),
        })
    }

    /// Controller identifier.
    #[must_use]
    pub fn controller_id(&self) -> &str {
        &self.config.controller_id
    }

    fn read(&self) -> CardKitResult<RwLockReadGuard<'_, ControllerState>> {
        self.state
            .read()
            .map_err(|_| CardKitError::poisoned("controller state"))
    }

    fn write(&self) -> CardKitResult<RwLockWriteGuard<'_, ControllerState>> {
        self.state
            .write()
            .map_err(|_| CardKitError::poisoned("controller state"))
    }

    /// Adds or refreshes one cached card.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal entry cannot be written; the cache is
    /// then unchanged.
    pub fn add_card(&self, card: CachedCard) -> CardKitResult<()> {
        let now = self.clock.now();
        let mut state = self.write()?;
        let card_id = card.card_id;
        state.journal.append(
            JournalEvent::CardAdded,
            format!("card added ({}, {})", card.role, card.scheme),
            Some(card_id),
            now,
        )?;
        if let Some(evicted) = state.cache.insert(card) {
            log::info!("cache full, evicted card {evicted}");
        }
        Ok(())
    }

    /// Removes a card from the cache. Returns whether it was cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal entry cannot be written.
    pub fn remove_card(&self, card_id: &CardId) -> CardKitResult<bool> {
        let now = self.clock.now();
        let mut state = self.write()?;
        if state.cache.get(card_id).is_none() {
            return Ok(false);
        }
        state
            .journal
            .append(JournalEvent::CardRemoved, "card removed", Some(*card_id), now)?;
        Ok(state.cache.remove(card_id))
    }

    /// Replaces the cache with a snapshot from the server.
    ///
    /// Counters already accepted locally are kept if higher than the snapshot's.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal entry cannot be written.
    pub fn load_snapshot(&self, cards: Vec<CachedCard>) -> CardKitResult<usize> {
        let now = self.clock.now();
        let mut state = self.write()?;
        let offered = cards.len();
        state.journal.append(
            JournalEvent::CacheLoad,
            format!("cache snapshot with {offered} cards"),
            None,
            now,
        )?;
        Ok(state.cache.replace(cards))
    }

    /// Admits a basic-scheme code.
    pub fn admit(&self, card_id: &CardId, counter: &[u8], tag: &[u8]) -> Decision {
        self.admit_presented(&PresentedCode::new(card_id, counter, tag))
    }

    /// Admits a door-bound code.
    pub fn admit_door(
        &self,
        card_id: &CardId,
        counter: &[u8],
        tag: &[u8],
        door_id: &[u8],
        nonce: &[u8],
    ) -> Decision {
        self.admit_presented(&PresentedCode::new(card_id, counter, tag).with_door(door_id, nonce))
    }

    /// Admits any presented code against the local cache.
    ///
    /// The decision is journaled before it is returned. If the journal cannot
    /// be written the presentation is denied; a counter already advanced by a
    /// valid code stays advanced.
    pub fn admit_presented(&self, code: &PresentedCode) -> Decision {
        let card_id = code.card_id();
        let now = self.clock.now();
        let Ok(mut state) = self.write() else {
            return Self::decision(Verdict::deny(DenyReason::Unavailable), TrustTier::Counter, card_id);
        };

        let outcome = Self::evaluate_code(&mut state.cache, code, card_id, now);
        let message = match outcome {
            Ok(counter) => format!("{GRANT_PREFIX}{counter}"),
            Err(reason) => reason.to_string(),
        };
        let verdict = Verdict::from(outcome.map(|_| ()));
        let verdict = Self::record(&mut state, verdict, message, card_id, now);
        Self::decision(verdict, TrustTier::Counter, card_id)
    }

    fn evaluate_code(
        cache: &mut CardCache,
        code: &PresentedCode,
        card_id: Option<CardId>,
        now: u64,
    ) -> Result<u64, DenyReason> {
        let card_id = card_id.ok_or(DenyReason::NotFound)?;
        let card = cache.get(&card_id).ok_or(DenyReason::NotFound)?;
        check_lifecycle(card.active, card.expires_at, now)?;
        let decoded = decode_presented(code, card.scheme)?;
        check_replay(card.last_counter, decoded.counter)?;
        check_tag(&card.secret, &card_id, &decoded)?;
        if !cache.advance_counter(&card_id, decoded.counter) {
            return Err(DenyReason::ReplayLostRace);
        }
        cache.touch(&card_id);
        Ok(decoded.counter)
    }

    /// Admits an unsigned QR payload (raw text or base64).
    ///
    /// Only identity (card id and owner) and lifecycle are checked. The
    /// payload proves nothing about freshness, so the decision carries
    /// [`TrustTier::QrUnverified`].
    pub fn admit_qr(&self, payload: &str) -> Decision {
        let parsed = QrPayload::parse(payload);
        let card_id = parsed.as_ref().ok().map(|payload| payload.card_id);
        let now = self.clock.now();
        let Ok(mut state) = self.write() else {
            return Self::decision(
                Verdict::deny(DenyReason::Unavailable),
                TrustTier::QrUnverified,
                card_id,
            );
        };

        let outcome = parsed
            .map_err(|_| DenyReason::InvalidInput)
            .and_then(|payload| {
                let card = state.cache.get(&payload.card_id).ok_or(DenyReason::NotFound)?;
                if card.owner != payload.owner {
                    return Err(DenyReason::InvalidInput);
                }
                check_lifecycle(card.active, card.expires_at, now)
            });
        if outcome.is_ok() {
            if let Some(card_id) = &card_id {
                state.cache.touch(card_id);
            }
        }
        let message = match outcome {
            Ok(()) => "qr".to_string(),
            Err(reason) => format!("qr {reason}"),
        };
        let verdict = Self::record(&mut state, Verdict::from(outcome), message, card_id, now);
        Self::decision(verdict, TrustTier::QrUnverified, card_id)
    }

    fn record(
        state: &mut ControllerState,
        verdict: Verdict,
        message: String,
        card_id: Option<CardId>,
        now: u64,
    ) -> Verdict {
        let event = if verdict.granted {
            JournalEvent::AccessGranted
        } else {
            JournalEvent::AccessDenied
        };
        match state.journal.append(event, message, card_id, now) {
            Ok(_) if verdict.granted => {
                state.granted += 1;
                verdict
            }
            Ok(_) => {
                state.denied += 1;
                verdict
            }
            Err(err) => {
                log::error!("journal append failed, denying: {err}");
                state.denied += 1;
                Verdict::deny(DenyReason::Unavailable)
            }
        }
    }

    const fn decision(verdict: Verdict, trust: TrustTier, card_id: Option<CardId>) -> Decision {
        Decision {
            verdict,
            trust,
            card_id,
        }
    }

    /// Pushes unsynced journal entries through `transport`.
    ///
    /// Never fails: the outcome, including timeouts, is reported in the
    /// [`SyncResult`] and journaled as `SYNC` or `SYNC_ERROR`. Admissions keep
    /// running while the batch is in flight.
    pub async fn sync(&self, transport: &dyn SyncTransport) -> SyncResult {
        let snapshot = self.read().map(|state| {
            (
                state.journal.unsynced(self.config.sync_batch_size),
                state.journal.acknowledged(),
            )
        });
        let (entries, acknowledged) = match snapshot {
            Ok(snapshot) => snapshot,
            Err(err) => return failed_sync(0, None, err.to_string()),
        };
        if entries.is_empty() {
            return SyncResult {
                success: true,
                transmitted: 0,
                acknowledged_through: acknowledged,
                message: "nothing to sync".to_string(),
            };
        }

        let transmitted = entries.len();
        let sent_through = entries.last().map_or(0, |entry| entry.seq);
        let batch = SyncBatch {
            batch_id: Uuid::new_v4(),
            controller_id: self.config.controller_id.clone(),
            entries,
        };
        let batch_id = batch.batch_id;
        log::debug!("sync batch {batch_id}: {transmitted} entries");

        let outcome =
            match tokio::time::timeout(self.config.sync_timeout(), transport.push(batch)).await {
                Ok(Ok(ack)) => Ok(ack),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(CardKitError::Timeout(format!(
                    "sync did not complete within {:?}",
                    self.config.sync_timeout()
                ))),
            };

        let now = self.clock.now();
        let Ok(mut state) = self.write() else {
            return failed_sync(transmitted, acknowledged, "controller state lock poisoned".to_string());
        };
        match outcome {
            Ok(ack) => {
                let cursor = match ack.acknowledged_through {
                    Some(seq) => {
                        if seq > sent_through {
                            log::warn!(
                                "server acknowledged through {seq}, batch {batch_id} ended at {sent_through}"
                            );
                        }
                        state.journal.acknowledge(seq.min(sent_through))
                    }
                    None => Ok(state.journal.acknowledged()),
                };
                let cursor = match cursor {
                    Ok(cursor) => cursor,
                    Err(err) => {
                        log::error!("could not persist sync cursor: {err}");
                        state.journal.acknowledged()
                    }
                };
                let message = format!(
                    "batch {batch_id}: sent {transmitted}, acknowledged through {cursor:?}"
                );
                if let Err(err) = state.journal.append(JournalEvent::Sync, message.clone(), None, now) {
                    log::error!("journal append failed after sync: {err}");
                }
                log::info!("{message}");
                SyncResult {
                    success: true,
                    transmitted,
                    acknowledged_through: cursor,
                    message,
                }
            }
            Err(err) => {
                let message = format!("batch {batch_id}: {err}");
                log::warn!("sync failed, staying offline: {message}");
                if let Err(err) =
                    state
                        .journal
                        .append(JournalEvent::SyncError, message.clone(), None, now)
                {
                    log::error!("journal append failed after sync error: {err}");
                }
                failed_sync(transmitted, state.journal.acknowledged(), message)
            }
        }
    }

    /// Statistics snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn stats(&self) -> CardKitResult<ControllerStats> {
        let state = self.read()?;
        Ok(ControllerStats {
            controller_id: self.config.controller_id.clone(),
            total_events: state.journal.entries().len(),
            granted: state.granted,
            denied: state.denied,
            cached_cards: state.cache.len(),
            unsynced_entries: state.journal.unsynced_count(),
        })
    }

    /// Copies every retained journal entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn export_journal(&self) -> CardKitResult<Vec<JournalEntry>> {
        Ok(self.read()?.journal.entries().to_vec())
    }

    /// Sequence numbers of journal entries that fail validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn validate_journal(&self) -> CardKitResult<Vec<u64>> {
        Ok(self.read()?.journal.validate())
    }

    /// Applies the retention policy: drops acknowledged entries older than
    /// `cutoff`, keeping `INIT`. Returns the number removed.
    ///
    /// With a blob store the cache, counter marks included, is persisted
    /// first, since pruned grants can no longer be replayed into it on open.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be persisted or the journal cannot
    /// be rewritten; nothing is pruned then.
    pub fn prune_journal(&self, cutoff: u64) -> CardKitResult<usize> {
        let mut state = self.write()?;
        if let Some(blobs) = &self.blobs {
            blobs.write_atomic(CACHE_BLOB, &self.seal(&state.cache)?)?;
        }
        state.journal.prune(cutoff)
    }

    /// Prunes with the configured retention window relative to now.
    ///
    /// # Errors
    ///
    /// As [`prune_journal`](Self::prune_journal).
    pub fn apply_retention(&self) -> CardKitResult<usize> {
        let cutoff = self
            .clock
            .now()
            .saturating_sub(self.config.journal_retention_secs);
        self.prune_journal(cutoff)
    }

    /// Persists the cache, sealed with the controller's key wrap.
    ///
    /// # Errors
    ///
    /// Returns [`CardKitError::InvalidInput`] when the controller has no blob
    /// store, or the seal/write error.
    pub fn persist_cache(&self) -> CardKitResult<()> {
        let blobs = self.blobs.as_ref().ok_or_else(|| {
            CardKitError::InvalidInput("controller has no cache store".to_string())
        })?;
        let sealed = self.seal(&self.read()?.cache)?;
        blobs.write_atomic(CACHE_BLOB, &sealed)
    }

    fn seal(&self, cache: &CardCache) -> CardKitResult<Vec<u8>> {
        let persisted = PersistedCache {
            cards: cache.cards().map(PersistedCard::from).collect(),
            marks: cache.marks().collect(),
        };
        seal_cache(self.wrap.as_ref(), &self.config.controller_id, &persisted)
    }

    /// Cached view of one card.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn cached_card(&self, card_id: &CardId) -> CardKitResult<Option<CachedCard>> {
        Ok(self.read()?.cache.get(card_id).cloned())
    }
}

fn failed_sync(transmitted: usize, acknowledged: Option<u64>, message: String) -> SyncResult {
    SyncResult {
        success: false,
        transmitted,
        acknowledged_through: acknowledged,
        message,
    }
}

fn cache_aad(controller_id: &str) -> Vec<u8> {
    [b"cardkit:controller-cache:".as_slice(), controller_id.as_bytes()].concat()
}

/// Highest granted counter per card among `entries`.
///
/// Entries failing validation are included: they can only raise a mark.
fn granted_counters(entries: &[JournalEntry]) -> HashMap<CardId, u64> {
    let mut marks = HashMap::new();
    for entry in entries {
        if entry.event_type != JournalEvent::AccessGranted {
            continue;
        }
        let (Some(card_id), Some(counter)) = (
            entry.card_id,
            entry
                .message
                .strip_prefix(GRANT_PREFIX)
                .and_then(|counter| counter.parse::<u64>().ok()),
        ) else {
            continue;
        };
        let mark = marks.entry(card_id).or_insert(0);
        *mark = counter.max(*mark);
    }
    marks
}

fn seal_cache(wrap: &dyn KeyWrap, controller_id: &str, cache: &PersistedCache) -> CardKitResult<Vec<u8>> {
    let mut plaintext = Zeroizing::new(Vec::new());
    ciborium::ser::into_writer(cache, &mut *plaintext)
        .map_err(|err| CardKitError::Serialization(err.to_string()))?;
    wrap.wrap(&plaintext, &cache_aad(controller_id))
}

fn unseal_cache(wrap: &dyn KeyWrap, controller_id: &str, sealed: &[u8]) -> CardKitResult<PersistedCache> {
    let plaintext = wrap.unwrap(sealed, &cache_aad(controller_id))?;
    ciborium::de::from_reader(plaintext.as_slice())
        .map_err(|err| CardKitError::Serialization(err.to_string()))
}
