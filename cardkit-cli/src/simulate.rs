//! End-to-end walk through issuance, online verification, rotation and an
//! offline controller with journal sync.

use std::path::PathBuf;
use std::sync::Arc;

use cardkit_core::audit::LogAuditSink;
use cardkit_core::code::{CodeGenerator, MemoryCounterJournal, OneTimeCode};
use cardkit_core::controller::{
    ControllerParts, MemorySyncServer, OfflineController, QrPayload, SyncResult, SyncTransport,
};
use cardkit_core::journal::{FileJournalStore, JournalStore, MemoryJournalStore};
use cardkit_core::storage::{AtomicBlobStore, FsBlobStore, KekWrap, MemoryCredentialStore};
use cardkit_core::{
    CardKitConfig, CardService, Clock, HttpSyncTransport, IssuedCard, ManualClock,
    PresentedCode, Role, SystemClock, TagScheme,
};
use clap::Args;
use eyre::{eyre, Result, WrapErr};
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use strum::IntoEnumIterator;

const DOOR_ID: u32 = 1;

#[derive(Args)]
pub struct SimulateArgs {
    /// JSON configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only issue cards for this role
    #[arg(long)]
    role: Option<Role>,

    /// Card lifetime in seconds; the role default applies when omitted
    #[arg(long)]
    ttl: Option<u64>,

    /// Issue door-bound cards and present codes for door 1
    #[arg(long)]
    door_bound: bool,

    /// Cards issued per role
    #[arg(long, default_value_t = 2)]
    cards_per_role: usize,

    /// Codes presented per card, online and offline each
    #[arg(long, default_value_t = 3)]
    presentations: usize,

    /// Directory for the controller journal and sealed cache; in memory when omitted
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Sync server base URL; an in-memory server is used when omitted
    #[arg(long, env = "CARDKIT_SYNC_URL")]
    sync_url: Option<String>,

    /// Hex encoded 32-byte journal signing secret; random when omitted
    #[arg(long, env = "CARDKIT_JOURNAL_SECRET", hide_env_values = true)]
    journal_secret: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    issued: usize,
    online_granted: usize,
    online_denied: usize,
    replay_refused: bool,
    tamper_refused: bool,
    offline_granted: usize,
    offline_denied: usize,
    rotated: usize,
    rotation_failures: usize,
    journal_entries: usize,
    tampered_entries: usize,
    sync: Option<SyncResult>,
}

pub async fn run(args: &SimulateArgs) -> Result<()> {
    let config = load_config(args)?;
    let wrap = Arc::new(key_wrap(args)?);
    let clock = Arc::new(ManualClock::new(SystemClock.now()));
    let service = CardService::new(
        Arc::new(MemoryCredentialStore::new()),
        wrap.clone(),
        config.roles.clone(),
        Arc::new(LogAuditSink),
        clock.clone(),
    );
    let mut summary = Summary::default();

    let cards = issue_cards(&service, args)?;
    summary.issued = cards.len();
    tracing::info!("issued {} cards", cards.len());

    let generators = cards
        .iter()
        .map(generator)
        .collect::<Result<Vec<_>>>()?;
    present_online(&service, &generators, args, &mut summary)?;

    let controller = open_controller(args, &config, wrap, clock.clone())?;
    let card_ids: Vec<_> = cards.iter().map(|issued| issued.card.card_id).collect();
    controller.load_snapshot(service.cache_snapshot(&card_ids)?)?;
    present_offline(&controller, &cards, &generators, args, &mut summary)?;

    clock.advance(config.roles.rotation_interval(Role::Guest));
    let report = service.rotation().sweep()?;
    summary.rotated = report.rotated.len();
    summary.rotation_failures = report.failed.len();

    let result = match &args.sync_url {
        Some(url) => sync(&controller, &HttpSyncTransport::new(url)?).await,
        None => sync(&controller, &MemorySyncServer::new()).await,
    };
    summary.sync = Some(result);
    controller.apply_retention()?;
    if args.data_dir.is_some() {
        controller.persist_cache()?;
    }

    summary.journal_entries = controller.stats()?.total_events;
    summary.tampered_entries = controller.validate_journal()?.len();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn load_config(args: &SimulateArgs) -> Result<CardKitConfig> {
    let Some(path) = &args.config else {
        return Ok(CardKitConfig::default());
    };
    let json =
        std::fs::read_to_string(path).wrap_err_with(|| format!("reading {}", path.display()))?;
    Ok(CardKitConfig::from_json(&json)?)
}

fn key_wrap(args: &SimulateArgs) -> Result<KekWrap> {
    match KekWrap::from_env() {
        Ok(wrap) => Ok(wrap),
        // A persisted cache must be sealed with a key that outlives the run.
        Err(err) if args.data_dir.is_some() => {
            Err(err).wrap_err("--data-dir needs CARDKIT_KEK_B64")
        }
        Err(err) => {
            tracing::warn!("{err}; using an ephemeral key-encryption key");
            Ok(KekWrap::generate())
        }
    }
}

fn issue_cards(service: &CardService, args: &SimulateArgs) -> Result<Vec<IssuedCard>> {
    let scheme = if args.door_bound {
        TagScheme::DoorBound
    } else {
        TagScheme::Basic
    };
    let roles = match args.role {
        Some(role) => vec![role],
        None => Role::iter().collect(),
    };
    let mut cards = Vec::new();
    for role in roles {
        for i in 0..args.cards_per_role {
            let owner = format!("{role}-{i}");
            cards.push(service.issue_with_scheme(&owner, role, args.ttl, scheme)?);
        }
    }
    Ok(cards)
}

fn present_online(
    service: &CardService,
    generators: &[CodeGenerator],
    args: &SimulateArgs,
    summary: &mut Summary,
) -> Result<()> {
    for generator in generators {
        for _ in 0..args.presentations {
            let code = next_code(generator, args.door_bound)?;
            let verdict = service.verify(&PresentedCode::from(&code));
            tally(verdict.granted, &mut summary.online_granted, &mut summary.online_denied);
        }
    }

    let Some(generator) = generators.first() else {
        return Ok(());
    };
    let code = PresentedCode::from(&next_code(generator, args.door_bound)?);
    let first = service.verify(&code);
    let replay = service.verify(&code);
    summary.replay_refused = first.granted && !replay.granted;
    tracing::info!(reason = ?replay.reason, "replayed code");

    let mut tampered = PresentedCode::from(&next_code(generator, args.door_bound)?);
    if let Some(byte) = tampered.tag.first_mut() {
        *byte ^= 0x01;
    }
    let verdict = service.verify(&tampered);
    summary.tamper_refused = !verdict.granted;
    tracing::info!(reason = ?verdict.reason, "tampered code");
    Ok(())
}

fn present_offline(
    controller: &OfflineController,
    cards: &[IssuedCard],
    generators: &[CodeGenerator],
    args: &SimulateArgs,
    summary: &mut Summary,
) -> Result<()> {
    let now_ms = SystemClock.now().saturating_mul(1000);
    for (issued, generator) in cards.iter().zip(generators) {
        let mut last = None;
        for _ in 0..args.presentations {
            let code = next_code(generator, args.door_bound)?;
            let decision = controller.admit_presented(&PresentedCode::from(&code));
            tally(decision.granted(), &mut summary.offline_granted, &mut summary.offline_denied);
            last = Some(code);
        }
        if let Some(code) = last {
            // A replay of the last code must be refused.
            let decision = controller.admit_presented(&PresentedCode::from(&code));
            tally(decision.granted(), &mut summary.offline_granted, &mut summary.offline_denied);
        }
        let qr = QrPayload {
            card_id: issued.card.card_id,
            owner: issued.card.owner.clone(),
            role: issued.card.role,
            timestamp_ms: now_ms,
        };
        let decision = controller.admit_qr(&qr.to_b64());
        tally(decision.granted(), &mut summary.offline_granted, &mut summary.offline_denied);
    }
    Ok(())
}

fn generator(issued: &IssuedCard) -> Result<CodeGenerator> {
    Ok(CodeGenerator::open(
        issued.card.card_id,
        issued.secret.clone(),
        issued.card.scheme,
        Arc::new(MemoryCounterJournal::new()),
    )?)
}

fn next_code(generator: &CodeGenerator, door_bound: bool) -> Result<OneTimeCode> {
    let code = if door_bound {
        generator.next_door_code(DOOR_ID)?
    } else {
        generator.next_code()?
    };
    Ok(code)
}

fn open_controller(
    args: &SimulateArgs,
    config: &CardKitConfig,
    wrap: Arc<KekWrap>,
    clock: Arc<ManualClock>,
) -> Result<OfflineController> {
    let signing_secret: [u8; 32] = match &args.journal_secret {
        Some(encoded) => hex::decode(encoded.trim())
            .wrap_err("journal secret is not hex")?
            .try_into()
            .map_err(|_| eyre!("journal secret must be 32 bytes"))?,
        None => {
            let mut secret = [0u8; 32];
            OsRng.fill_bytes(&mut secret);
            tracing::info!("journal signing secret: {}", hex::encode(secret));
            secret
        }
    };

    let (journal_store, blobs): (Box<dyn JournalStore>, Option<Arc<dyn AtomicBlobStore>>) =
        match &args.data_dir {
            Some(dir) => (
                Box::new(FileJournalStore::open(dir.join("journal"))?),
                Some(Arc::new(FsBlobStore::new(dir.join("cache"))?)),
            ),
            None => (Box::new(MemoryJournalStore::new()), None),
        };
    Ok(OfflineController::open(
        config.controller.clone(),
        ControllerParts {
            journal_store,
            signing_secret,
            wrap,
            blobs,
            clock,
        },
    )?)
}

async fn sync(controller: &OfflineController, transport: &dyn SyncTransport) -> SyncResult {
    let result = controller.sync(transport).await;
    if result.success {
        tracing::info!("{}", result.message);
    } else {
        tracing::warn!("sync failed: {}", result.message);
    }
    result
}

fn tally(granted: bool, granted_count: &mut usize, denied_count: &mut usize) {
    if granted {
        *granted_count += 1;
    } else {
        *denied_count += 1;
    }
}
