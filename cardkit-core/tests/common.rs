//! Common test utilities shared across integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cardkit_core::audit::MemoryAuditSink;
use cardkit_core::code::{CodeGenerator, MemoryCounterJournal};
use cardkit_core::controller::{CachedCard, ControllerParts, OfflineController};
use cardkit_core::journal::{JournalEntry, JournalStore, MemoryJournalStore};
use cardkit_core::storage::{AtomicBlobStore, KekWrap, KeyWrap, MemoryCredentialStore};
use cardkit_core::{
    CardId, CardKitError, CardKitResult, CardService, ControllerConfig, IssuedCard,
    ManualClock, RolePolicy,
};
use zeroize::Zeroizing;

pub const START: u64 = 1_700_000_000;
pub const HOUR: u64 = 60 * 60;
pub const JOURNAL_SECRET: [u8; 32] = [7; 32];

/// [`KeyWrap`] delegating to a [`KekWrap`] that can be told to fail.
pub struct FlakyWrap {
    inner: KekWrap,
    fail_wrap: AtomicBool,
    fail_unwrap: AtomicBool,
    fail_for: Mutex<HashSet<CardId>>,
}

impl FlakyWrap {
    pub fn new() -> Self {
        Self {
            inner: KekWrap::generate(),
            fail_wrap: AtomicBool::new(false),
            fail_unwrap: AtomicBool::new(false),
            fail_for: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_fail_wrap(&self, fail: bool) {
        self.fail_wrap.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_unwrap(&self, fail: bool) {
        self.fail_unwrap.store(fail, Ordering::SeqCst);
    }

    /// Makes wrapping fail only for secrets bound to `card_id`.
    pub fn fail_wrap_for(&self, card_id: CardId) {
        self.fail_for.lock().expect("lock").insert(card_id);
    }

    fn targeted(&self, aad: &[u8]) -> bool {
        self.fail_for
            .lock()
            .expect("lock")
            .iter()
            .any(|card_id| aad.ends_with(card_id.as_bytes()))
    }
}

impl KeyWrap for FlakyWrap {
    fn wrap(&self, plaintext: &[u8], aad: &[u8]) -> CardKitResult<Vec<u8>> {
        if self.fail_wrap.load(Ordering::SeqCst) || self.targeted(aad) {
            return Err(CardKitError::Crypto("key wrap unavailable".to_string()));
        }
        self.inner.wrap(plaintext, aad)
    }

    fn unwrap(&self, wrapped: &[u8], aad: &[u8]) -> CardKitResult<Zeroizing<Vec<u8>>> {
        if self.fail_unwrap.load(Ordering::SeqCst) {
            return Err(CardKitError::Crypto("key wrap unavailable".to_string()));
        }
        self.inner.unwrap(wrapped, aad)
    }
}

/// A central service over in-memory collaborators.
pub struct Harness {
    pub service: CardService,
    pub store: Arc<MemoryCredentialStore>,
    pub wrap: Arc<FlakyWrap>,
    pub audit: Arc<MemoryAuditSink>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryCredentialStore::new());
        let wrap = Arc::new(FlakyWrap::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let clock = Arc::new(ManualClock::new(START));
        let service = CardService::new(
            store.clone(),
            wrap.clone(),
            RolePolicy::default(),
            audit.clone(),
            clock.clone(),
        );
        Self {
            service,
            store,
            wrap,
            audit,
            clock,
        }
    }

    /// Snapshot entries for the given cards.
    pub fn snapshot(&self, cards: &[&IssuedCard]) -> Vec<CachedCard> {
        let ids: Vec<CardId> = cards.iter().map(|issued| issued.card.card_id).collect();
        self.service.cache_snapshot(&ids).expect("snapshot")
    }
}

/// Card-side generator with a volatile counter journal.
pub fn generator(issued: &IssuedCard) -> CodeGenerator {
    CodeGenerator::open(
        issued.card.card_id,
        issued.secret.clone(),
        issued.card.scheme,
        Arc::new(MemoryCounterJournal::new()),
    )
    .expect("open generator")
}

/// [`JournalStore`] whose appends can be switched off from the outside.
pub struct SwitchableJournalStore {
    inner: MemoryJournalStore,
    fail: Arc<AtomicBool>,
}

impl SwitchableJournalStore {
    pub fn new() -> (Self, Arc<AtomicBool>) {
        let fail = Arc::new(AtomicBool::new(false));
        (
            Self {
                inner: MemoryJournalStore::new(),
                fail: fail.clone(),
            },
            fail,
        )
    }
}

impl JournalStore for SwitchableJournalStore {
    fn load(&self) -> CardKitResult<Vec<JournalEntry>> {
        self.inner.load()
    }

    fn append(&mut self, entry: &JournalEntry) -> CardKitResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CardKitError::Storage("disk full".to_string()));
        }
        self.inner.append(entry)
    }

    fn rewrite(&mut self, entries: &[JournalEntry]) -> CardKitResult<()> {
        self.inner.rewrite(entries)
    }

    fn acknowledged(&self) -> CardKitResult<Option<u64>> {
        self.inner.acknowledged()
    }

    fn set_acknowledged(&mut self, seq: u64) -> CardKitResult<()> {
        self.inner.set_acknowledged(seq)
    }
}

pub fn controller_config(controller_id: &str) -> ControllerConfig {
    ControllerConfig {
        controller_id: controller_id.to_string(),
        ..ControllerConfig::default()
    }
}

/// Controller with an in-memory journal and no cache persistence.
pub fn controller(config: ControllerConfig, clock: Arc<ManualClock>) -> OfflineController {
    controller_with(
        config,
        Box::new(MemoryJournalStore::new()),
        Arc::new(KekWrap::generate()),
        None,
        clock,
    )
}

pub fn controller_with(
    config: ControllerConfig,
    journal_store: Box<dyn JournalStore>,
    wrap: Arc<dyn KeyWrap>,
    blobs: Option<Arc<dyn AtomicBlobStore>>,
    clock: Arc<ManualClock>,
) -> OfflineController {
    OfflineController::open(
        config,
        ControllerParts {
            journal_store,
            signing_secret: JOURNAL_SECRET,
            wrap,
            blobs,
            clock,
        },
    )
    .expect("open controller")
}
