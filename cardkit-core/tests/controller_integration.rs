mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cardkit_core::controller::{
    MemorySyncServer, OfflineController, QrPayload, SyncAck, SyncBatch, SyncTransport, TrustTier,
};
use cardkit_core::encoding::counter_to_le;
use cardkit_core::journal::{
    validate_entries, FileJournalStore, JournalEvent, JournalSigner, MemoryJournalStore,
};
use cardkit_core::storage::{AtomicBlobStore, KekWrap, MemoryBlobStore};
use cardkit_core::{CardKitError, CardKitResult, Clock, DenyReason, PresentedCode, Role};

fn events(controller: &cardkit_core::controller::OfflineController) -> Vec<JournalEvent> {
    controller
        .export_journal()
        .expect("journal")
        .iter()
        .map(|entry| entry.event_type)
        .collect()
}

#[test]
fn test_offline_admission_and_replay() {
    let harness = common::Harness::new();
    let issued = harness
        .service
        .issue("alice", Role::Permanent, None)
        .expect("issue");
    let controller = common::controller(common::controller_config("lobby"), harness.clock.clone());
    assert_eq!(
        controller
            .load_snapshot(harness.snapshot(&[&issued]))
            .expect("snapshot"),
        1
    );

    let code = common::generator(&issued).next_code().expect("code");
    let counter = counter_to_le(code.counter);
    let decision = controller.admit(&code.card_id, &counter, code.tag.as_bytes());
    assert!(decision.granted());
    assert_eq!(decision.trust, TrustTier::Counter);
    assert_eq!(decision.card_id, Some(issued.card.card_id));

    let replay = controller.admit(&code.card_id, &counter, code.tag.as_bytes());
    assert_eq!(replay.reason(), Some(DenyReason::ReplayedCounter));

    let unknown = controller.admit(&cardkit_core::CardId::random(), &counter, code.tag.as_bytes());
    assert_eq!(unknown.reason(), Some(DenyReason::NotFound));

    assert_eq!(
        events(&controller),
        vec![
            JournalEvent::Init,
            JournalEvent::CacheLoad,
            JournalEvent::AccessGranted,
            JournalEvent::AccessDenied,
            JournalEvent::AccessDenied,
        ]
    );
    let stats = controller.stats().expect("stats");
    assert_eq!(stats.granted, 1);
    assert_eq!(stats.denied, 2);
    assert_eq!(stats.cached_cards, 1);
    assert_eq!(stats.unsynced_entries, 5);
    assert!(controller.validate_journal().expect("validate").is_empty());
}

#[test]
fn test_offline_door_bound_admission() {
    let harness = common::Harness::new();
    let issued = harness
        .service
        .issue_with_scheme("bob", Role::Guest, None, cardkit_core::TagScheme::DoorBound)
        .expect("issue");
    let controller = common::controller(common::controller_config("east"), harness.clock.clone());
    controller
        .add_card(harness.snapshot(&[&issued]).remove(0))
        .expect("add");

    let code = common::generator(&issued).next_door_code(3).expect("code");
    let presented = PresentedCode::from(&code);
    let door = presented.door.clone().expect("door fields");

    let decision = controller.admit(&code.card_id, &presented.counter, &presented.tag);
    assert_eq!(decision.reason(), Some(DenyReason::InvalidInput));

    let decision = controller.admit_door(
        &code.card_id,
        &presented.counter,
        &presented.tag,
        &door.door_id,
        &door.nonce,
    );
    assert!(decision.granted());
}

#[test]
fn test_revoked_and_expired_cards_are_denied_offline() {
    let harness = common::Harness::new();
    let revoked = harness
        .service
        .issue("carol", Role::Guest, None)
        .expect("issue");
    let short = harness
        .service
        .issue("dave", Role::Guest, Some(30))
        .expect("issue");
    harness.service.revoke(&revoked.card.card_id).expect("revoke");

    let controller = common::controller(common::controller_config("west"), harness.clock.clone());
    controller
        .load_snapshot(harness.snapshot(&[&revoked, &short]))
        .expect("snapshot");

    let code = common::generator(&revoked).next_code().expect("code");
    let presented = PresentedCode::from(&code);
    assert_eq!(
        controller.admit_presented(&presented).reason(),
        Some(DenyReason::Inactive)
    );

    harness.clock.advance(31);
    let code = common::generator(&short).next_code().expect("code");
    assert_eq!(
        controller.admit_presented(&PresentedCode::from(&code)).reason(),
        Some(DenyReason::Expired)
    );
}

#[test]
fn test_journal_failure_denies_admission() {
    let harness = common::Harness::new();
    let issued = harness
        .service
        .issue("erin", Role::Admin, None)
        .expect("issue");
    let (store, fail) = common::SwitchableJournalStore::new();
    let controller = common::controller_with(
        common::controller_config("vault"),
        Box::new(store),
        Arc::new(KekWrap::generate()),
        None,
        harness.clock.clone(),
    );
    controller
        .load_snapshot(harness.snapshot(&[&issued]))
        .expect("snapshot");

    fail.store(true, Ordering::SeqCst);
    let generator = common::generator(&issued);
    let first = generator.next_code().expect("code");
    assert_eq!(
        controller.admit_presented(&PresentedCode::from(&first)).reason(),
        Some(DenyReason::Unavailable)
    );
    assert!(matches!(
        controller.add_card(harness.snapshot(&[&issued]).remove(0)),
        Err(CardKitError::Storage(_))
    ));

    fail.store(false, Ordering::SeqCst);
    let second = generator.next_code().expect("code");
    assert!(controller.admit_presented(&PresentedCode::from(&second)).granted());
}

#[test]
fn test_qr_admission_is_lower_trust() {
    let harness = common::Harness::new();
    let issued = harness
        .service
        .issue("Dr. Who: Ward 9", Role::Temporary, None)
        .expect("issue");
    let controller = common::controller(common::controller_config("ward"), harness.clock.clone());
    controller
        .load_snapshot(harness.snapshot(&[&issued]))
        .expect("snapshot");

    let payload = QrPayload {
        card_id: issued.card.card_id,
        owner: "Dr. Who: Ward 9".to_string(),
        role: Role::Temporary,
        timestamp_ms: common::START * 1000,
    };
    let decision = controller.admit_qr(&payload.to_string());
    assert!(decision.granted());
    assert_eq!(decision.trust, TrustTier::QrUnverified);

    // The same payload is accepted again: QR carries no freshness proof.
    assert!(controller.admit_qr(&payload.to_b64()).granted());

    let impostor = QrPayload {
        owner: "Mallory".to_string(),
        ..payload.clone()
    };
    assert_eq!(
        controller.admit_qr(&impostor.to_string()).reason(),
        Some(DenyReason::InvalidInput)
    );
    let garbage = controller.admit_qr("not a qr payload");
    assert_eq!(garbage.reason(), Some(DenyReason::InvalidInput));
    assert_eq!(garbage.card_id, None);

    let entries = controller.export_journal().expect("journal");
    let last = entries.last().expect("entry");
    assert_eq!(last.event_type, JournalEvent::AccessDenied);
    assert!(last.message.starts_with("qr "));
}

#[test]
fn test_cache_eviction_when_full() {
    let harness = common::Harness::new();
    let cards: Vec<_> = (0..3)
        .map(|i| {
            harness
                .service
                .issue(&format!("holder-{i}"), Role::Guest, None)
                .expect("issue")
        })
        .collect();
    let mut config = common::controller_config("small");
    config.cache_capacity = 2;
    let controller = common::controller(config, harness.clock.clone());

    for issued in &cards[..2] {
        controller
            .add_card(harness.snapshot(&[issued]).remove(0))
            .expect("add");
    }
    let code = common::generator(&cards[0]).next_code().expect("code");
    assert!(controller.admit_presented(&PresentedCode::from(&code)).granted());

    controller
        .add_card(harness.snapshot(&[&cards[2]]).remove(0))
        .expect("add");
    assert_eq!(controller.stats().expect("stats").cached_cards, 2);
    assert!(controller
        .cached_card(&cards[1].card.card_id)
        .expect("lookup")
        .is_none());
    assert!(controller
        .cached_card(&cards[0].card.card_id)
        .expect("lookup")
        .is_some());

    assert!(controller.remove_card(&cards[0].card.card_id).expect("remove"));
    assert!(!controller.remove_card(&cards[0].card.card_id).expect("remove"));
}

#[test]
fn test_cache_persists_sealed_across_restart() {
    let harness = common::Harness::new();
    let issued = harness
        .service
        .issue("frank", Role::Permanent, None)
        .expect("issue");
    let wrap = Arc::new(KekWrap::generate());
    let blobs: Arc<dyn AtomicBlobStore> = Arc::new(MemoryBlobStore::new());
    let open = |wrap: Arc<KekWrap>| {
        cardkit_core::controller::OfflineController::open(
            common::controller_config("garage"),
            cardkit_core::controller::ControllerParts {
                journal_store: Box::new(MemoryJournalStore::new()),
                signing_secret: common::JOURNAL_SECRET,
                wrap,
                blobs: Some(blobs.clone()),
                clock: harness.clock.clone(),
            },
        )
    };

    let controller = open(wrap.clone()).expect("open");
    controller
        .load_snapshot(harness.snapshot(&[&issued]))
        .expect("snapshot");
    let code = common::generator(&issued).next_code().expect("code");
    assert!(controller.admit_presented(&PresentedCode::from(&code)).granted());
    controller.persist_cache().expect("persist");
    drop(controller);

    let sealed = blobs.read("controller-cache.bin").expect("read").expect("blob");
    assert!(!sealed
        .windows(issued.secret.as_bytes().len())
        .any(|window| window == issued.secret.as_bytes()));

    let restarted = open(wrap).expect("reopen");
    let cached = restarted
        .cached_card(&issued.card.card_id)
        .expect("lookup")
        .expect("cached");
    assert_eq!(cached.last_counter, Some(1));
    assert_eq!(
        restarted.admit_presented(&PresentedCode::from(&code)).reason(),
        Some(DenyReason::ReplayedCounter)
    );

    assert!(matches!(
        open(Arc::new(KekWrap::generate())),
        Err(CardKitError::Crypto(_))
    ));
}

#[test]
fn test_grants_after_last_persist_survive_restart() {
    let harness = common::Harness::new();
    let issued = harness
        .service
        .issue("gina", Role::Permanent, None)
        .expect("issue");
    let wrap = Arc::new(KekWrap::generate());
    let blobs: Arc<dyn AtomicBlobStore> = Arc::new(MemoryBlobStore::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let open = || {
        common::controller_with(
            common::controller_config("vault"),
            Box::new(FileJournalStore::open(dir.path()).expect("journal")),
            wrap.clone(),
            Some(blobs.clone()),
            harness.clock.clone(),
        )
    };

    let controller = open();
    controller
        .load_snapshot(harness.snapshot(&[&issued]))
        .expect("snapshot");
    controller.persist_cache().expect("persist");
    let code = common::generator(&issued).next_code().expect("code");
    assert!(controller.admit_presented(&PresentedCode::from(&code)).granted());
    drop(controller);

    let restarted = open();
    assert_eq!(
        restarted
            .cached_card(&issued.card.card_id)
            .expect("lookup")
            .expect("cached")
            .last_counter,
        Some(1)
    );
    assert_eq!(
        restarted.admit_presented(&PresentedCode::from(&code)).reason(),
        Some(DenyReason::ReplayedCounter)
    );

    // A stale server snapshot does not lower the counter either.
    restarted
        .load_snapshot(harness.snapshot(&[&issued]))
        .expect("snapshot");
    assert_eq!(
        restarted.admit_presented(&PresentedCode::from(&code)).reason(),
        Some(DenyReason::ReplayedCounter)
    );
}

#[tokio::test]
async fn test_pruned_grants_stay_refused_after_restart() {
    let harness = common::Harness::new();
    let issued = harness
        .service
        .issue("hana", Role::Permanent, None)
        .expect("issue");
    let wrap = Arc::new(KekWrap::generate());
    let blobs: Arc<dyn AtomicBlobStore> = Arc::new(MemoryBlobStore::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let open = || {
        common::controller_with(
            common::controller_config("depot"),
            Box::new(FileJournalStore::open(dir.path()).expect("journal")),
            wrap.clone(),
            Some(blobs.clone()),
            harness.clock.clone(),
        )
    };

    let controller = open();
    controller
        .load_snapshot(harness.snapshot(&[&issued]))
        .expect("snapshot");
    let code = common::generator(&issued).next_code().expect("code");
    assert!(controller.admit_presented(&PresentedCode::from(&code)).granted());
    // The card leaves the cache before anything is persisted.
    assert!(controller.remove_card(&issued.card.card_id).expect("remove"));
    assert!(controller.sync(&MemorySyncServer::new()).await.success);
    harness.clock.advance(60);
    assert!(controller.prune_journal(harness.clock.now()).expect("prune") > 0);
    assert!(!events(&controller).contains(&JournalEvent::AccessGranted));
    drop(controller);

    let restarted = open();
    restarted
        .load_snapshot(harness.snapshot(&[&issued]))
        .expect("snapshot");
    assert_eq!(
        restarted.admit_presented(&PresentedCode::from(&code)).reason(),
        Some(DenyReason::ReplayedCounter)
    );
}

#[test]
fn test_evicted_card_keeps_its_counter() {
    let harness = common::Harness::new();
    let first = harness
        .service
        .issue("ida", Role::Permanent, None)
        .expect("issue");
    let second = harness
        .service
        .issue("jon", Role::Permanent, None)
        .expect("issue");
    let mut config = common::controller_config("kiosk");
    config.cache_capacity = 1;
    let controller = common::controller(config, harness.clock.clone());

    let stale = harness.snapshot(&[&first]).remove(0);
    controller.add_card(stale.clone()).expect("add");
    let code = common::generator(&first).next_code().expect("code");
    assert!(controller.admit_presented(&PresentedCode::from(&code)).granted());

    controller
        .add_card(harness.snapshot(&[&second]).remove(0))
        .expect("add");
    assert!(controller
        .cached_card(&first.card.card_id)
        .expect("lookup")
        .is_none());

    controller.add_card(stale.clone()).expect("re-add");
    assert_eq!(
        controller.admit_presented(&PresentedCode::from(&code)).reason(),
        Some(DenyReason::ReplayedCounter)
    );

    controller
        .load_snapshot(harness.snapshot(&[&second]))
        .expect("snapshot");
    controller.load_snapshot(vec![stale]).expect("snapshot");
    assert_eq!(
        controller.admit_presented(&PresentedCode::from(&code)).reason(),
        Some(DenyReason::ReplayedCounter)
    );
}

#[test]
fn test_persist_without_store_is_rejected() {
    let harness = common::Harness::new();
    let controller = common::controller(common::controller_config("plain"), harness.clock.clone());
    assert!(matches!(
        controller.persist_cache(),
        Err(CardKitError::InvalidInput(_))
    ));
}

/// Stores the batch, then loses the acknowledgement.
struct LostAckTransport {
    server: Arc<MemorySyncServer>,
}

#[async_trait]
impl SyncTransport for LostAckTransport {
    async fn push(&self, batch: SyncBatch) -> CardKitResult<SyncAck> {
        self.server.push(batch).await?;
        Err(CardKitError::SyncUnavailable("connection reset".to_string()))
    }
}

#[tokio::test]
async fn test_sync_acknowledges_and_is_idempotent() {
    let harness = common::Harness::new();
    let issued = harness
        .service
        .issue("grace", Role::Guest, None)
        .expect("issue");
    let controller = common::controller(common::controller_config("north"), harness.clock.clone());
    controller
        .load_snapshot(harness.snapshot(&[&issued]))
        .expect("snapshot");
    let code = common::generator(&issued).next_code().expect("code");
    assert!(controller.admit_presented(&PresentedCode::from(&code)).granted());

    let server = Arc::new(MemorySyncServer::new());
    let lost = controller
        .sync(&LostAckTransport {
            server: server.clone(),
        })
        .await;
    assert!(!lost.success);
    assert_eq!(lost.transmitted, 3);
    assert_eq!(lost.acknowledged_through, None);

    let result = controller.sync(server.as_ref()).await;
    assert!(result.success);
    // INIT, CACHE_LOAD, ACCESS_GRANTED and the SYNC_ERROR entry.
    assert_eq!(result.transmitted, 4);
    assert_eq!(result.acknowledged_through, Some(3));

    let stored = server.entries("north").expect("entries");
    let seqs: Vec<u64> = stored.iter().map(|entry| entry.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
    assert!(validate_entries(&JournalSigner::new(common::JOURNAL_SECRET), &stored)
        .expect("validate")
        .is_empty());

    // Only the SYNC entry written after the acknowledgement is left.
    assert_eq!(controller.stats().expect("stats").unsynced_entries, 1);
    let again = controller.sync(server.as_ref()).await;
    assert_eq!(again.transmitted, 1);
    assert_eq!(again.acknowledged_through, Some(4));
}

/// Admits a presentation while the batch is in flight, then acknowledges
/// everything.
struct OverAckTransport {
    controller: Arc<OfflineController>,
}

#[async_trait]
impl SyncTransport for OverAckTransport {
    async fn push(&self, _batch: SyncBatch) -> CardKitResult<SyncAck> {
        let decision = self
            .controller
            .admit(&cardkit_core::CardId::random(), &counter_to_le(1), &[0; 16]);
        assert_eq!(decision.reason(), Some(DenyReason::NotFound));
        Ok(SyncAck {
            acknowledged_through: Some(u64::MAX),
        })
    }
}

#[tokio::test]
async fn test_ack_beyond_batch_is_clamped_to_sent_entries() {
    let harness = common::Harness::new();
    let controller = Arc::new(common::controller(
        common::controller_config("west"),
        harness.clock.clone(),
    ));

    let result = controller
        .sync(&OverAckTransport {
            controller: controller.clone(),
        })
        .await;
    assert!(result.success);
    assert_eq!(result.transmitted, 1);
    assert_eq!(result.acknowledged_through, Some(0));

    // The denial appended mid-flight and the SYNC entry are still unsynced.
    assert_eq!(controller.stats().expect("stats").unsynced_entries, 2);
    harness.clock.advance(60);
    assert_eq!(
        controller
            .prune_journal(harness.clock.now())
            .expect("prune"),
        0
    );
    assert_eq!(
        events(&controller),
        vec![
            JournalEvent::Init,
            JournalEvent::AccessDenied,
            JournalEvent::Sync
        ]
    );
}

#[tokio::test]
async fn test_sync_failures_keep_entries_unsynced() {
    let harness = common::Harness::new();
    let controller = common::controller(common::controller_config("south"), harness.clock.clone());
    let server = MemorySyncServer::new();

    server.set_unavailable(true);
    let result = controller.sync(&server).await;
    assert!(!result.success);
    assert_eq!(result.acknowledged_through, None);
    assert_eq!(events(&controller).last(), Some(&JournalEvent::SyncError));
    assert_eq!(controller.stats().expect("stats").unsynced_entries, 2);

    server.set_unavailable(false);
    let result = controller.sync(&server).await;
    assert!(result.success);
    assert_eq!(server.entries("south").expect("entries").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sync_times_out() {
    let harness = common::Harness::new();
    let mut config = common::controller_config("slow");
    config.sync_timeout_secs = 2;
    let controller = common::controller(config, harness.clock.clone());
    let server = MemorySyncServer::new();
    server.set_delay(Some(Duration::from_secs(60)));

    let result = controller.sync(&server).await;
    assert!(!result.success);
    assert!(result.message.contains("timeout"));
    assert!(server.entries("slow").expect("entries").is_empty());
}

#[tokio::test]
async fn test_prune_keeps_init_after_sync() {
    let harness = common::Harness::new();
    let issued = harness
        .service
        .issue("heidi", Role::Guest, None)
        .expect("issue");
    let controller = common::controller(common::controller_config("east"), harness.clock.clone());
    controller
        .load_snapshot(harness.snapshot(&[&issued]))
        .expect("snapshot");
    let generator = common::generator(&issued);
    for _ in 0..3 {
        let code = generator.next_code().expect("code");
        assert!(controller.admit_presented(&PresentedCode::from(&code)).granted());
    }

    // Nothing is acknowledged yet, so nothing may be pruned.
    harness.clock.advance(60);
    assert_eq!(
        controller
            .prune_journal(harness.clock.now())
            .expect("prune"),
        0
    );

    let result = controller.sync(&MemorySyncServer::new()).await;
    assert!(result.success);
    let removed = controller
        .prune_journal(harness.clock.now())
        .expect("prune");
    assert_eq!(removed, 4);
    assert_eq!(
        events(&controller),
        vec![JournalEvent::Init, JournalEvent::Sync]
    );
    assert!(controller.validate_journal().expect("validate").is_empty());
    assert_eq!(controller.stats().expect("stats").granted, 3);
}

#[test]
fn test_file_journal_survives_restart_and_detects_tampering() {
    let harness = common::Harness::new();
    let issued = harness
        .service
        .issue("ivan", Role::Permanent, None)
        .expect("issue");
    let dir = tempfile::tempdir().expect("tempdir");
    let open = || {
        common::controller_with(
            common::controller_config("annex"),
            Box::new(FileJournalStore::open(dir.path()).expect("journal")),
            Arc::new(KekWrap::generate()),
            None,
            harness.clock.clone(),
        )
    };

    let controller = open();
    controller
        .load_snapshot(harness.snapshot(&[&issued]))
        .expect("snapshot");
    let code = common::generator(&issued).next_code().expect("code");
    assert!(controller.admit_presented(&PresentedCode::from(&code)).granted());
    drop(controller);

    let restarted = open();
    assert_eq!(
        events(&restarted),
        vec![
            JournalEvent::Init,
            JournalEvent::CacheLoad,
            JournalEvent::AccessGranted
        ]
    );
    assert_eq!(restarted.stats().expect("stats").granted, 1);
    assert!(restarted.validate_journal().expect("validate").is_empty());

    let mut exported = restarted.export_journal().expect("export");
    exported[2].message = "counter 99".to_string();
    let tampered = validate_entries(&JournalSigner::new(common::JOURNAL_SECRET), &exported)
        .expect("validate");
    assert_eq!(tampered, vec![2]);
}
