use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use cardkit_core::code::{derive_tag, BlobCounterJournal, CodeGenerator, DoorBinding, OneTimeCode};
use cardkit_core::controller::QrPayload;
use cardkit_core::journal::{validate_entries, FileJournalStore, JournalSigner, JournalStore};
use cardkit_core::storage::FsBlobStore;
use cardkit_core::{CardId, CardSecret, Role, TagScheme};
use clap::Args;
use eyre::{bail, eyre, Result, WrapErr};
use rand::{rngs::OsRng, RngCore};

#[derive(Args)]
pub struct CodeArgs {
    /// Card identifier (base64url)
    #[arg(long)]
    card_id: String,

    /// Card secret (base64url, 32 bytes)
    #[arg(long, env = "CARDKIT_CARD_SECRET", hide_env_values = true)]
    secret: String,

    /// Compute the code for this counter instead of the next persisted one
    #[arg(long)]
    counter: Option<u64>,

    /// Directory persisting the card's counter high-water mark
    #[arg(long, default_value = ".cardkit/counters", conflicts_with = "counter")]
    counter_dir: PathBuf,

    /// Bind the code to this door (door-bound cards only)
    #[arg(long)]
    door_id: Option<u32>,

    /// Reader nonce (base64url, 12 bytes); random when omitted
    #[arg(long, requires = "door_id")]
    nonce: Option<String>,
}

#[derive(Args)]
pub struct QrArgs {
    /// Card identifier (base64url)
    #[arg(long)]
    card_id: String,

    /// Holder label as registered at issuance
    #[arg(long)]
    owner: String,

    /// Card role
    #[arg(long, default_value = "guest")]
    role: Role,
}

pub fn code(args: &CodeArgs) -> Result<()> {
    let card_id: CardId = args.card_id.parse().wrap_err("invalid --card-id")?;
    let secret = CardSecret::from_slice(&decode(&args.secret).wrap_err("invalid --secret")?)?;
    let nonce = match &args.nonce {
        Some(encoded) => Some(
            <[u8; 12]>::try_from(decode(encoded)?.as_slice())
                .map_err(|_| eyre!("nonce must be 12 bytes"))?,
        ),
        None => None,
    };

    let code = match args.counter {
        Some(0) => bail!("counter 0 is reserved and never accepted"),
        Some(counter) => {
            let binding = args.door_id.map(|door_id| DoorBinding {
                door_id,
                nonce: nonce.unwrap_or_else(random_nonce),
            });
            OneTimeCode {
                card_id,
                counter,
                tag: derive_tag(&secret, &card_id, counter, binding.as_ref()),
                binding,
            }
        }
        None => {
            let scheme = if args.door_id.is_some() {
                TagScheme::DoorBound
            } else {
                TagScheme::Basic
            };
            let blobs = FsBlobStore::new(&args.counter_dir)?;
            let generator = CodeGenerator::open(
                card_id,
                secret,
                scheme,
                Arc::new(BlobCounterJournal::new(Arc::new(blobs))),
            )?;
            match args.door_id {
                Some(door_id) => generator
                    .next_door_code_with_nonce(door_id, nonce.unwrap_or_else(random_nonce))?,
                None => generator.next_code()?,
            }
        }
    };
    tracing::debug!(counter = code.counter, "code generated");
    println!("{}", serde_json::to_string_pretty(&code.to_wire())?);
    Ok(())
}

fn decode(encoded: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(encoded.trim())
        .wrap_err("value is not base64url")
}

fn random_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn qr(args: &QrArgs) -> Result<()> {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .wrap_err("system clock before the Unix epoch")?;
    let payload = QrPayload {
        card_id: args.card_id.parse().wrap_err("invalid --card-id")?,
        owner: args.owner.clone(),
        role: args.role,
        timestamp_ms,
    };
    println!("{payload}");
    println!("{}", payload.to_b64());
    Ok(())
}

pub fn kek() {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    println!("{}", URL_SAFE_NO_PAD.encode(key));
}

pub fn verify_journal(dir: &Path, secret: &str) -> Result<()> {
    let secret: [u8; 32] = hex::decode(secret.trim())
        .wrap_err("journal secret is not hex")?
        .try_into()
        .map_err(|_| eyre!("journal secret must be 32 bytes"))?;

    let store = FileJournalStore::open(dir)
        .wrap_err_with(|| format!("opening journal in {}", dir.display()))?;
    let entries = store.load()?;
    let invalid = validate_entries(&JournalSigner::new(secret), &entries)?;
    if !invalid.is_empty() {
        bail!(
            "{} of {} entries failed validation: {invalid:?}",
            invalid.len(),
            entries.len()
        );
    }
    println!("{} entries verified", entries.len());
    Ok(())
}
