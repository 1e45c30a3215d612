//! Developer CLI for `CardKit`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::Result;
use tracing_subscriber::EnvFilter;

mod simulate;
mod tools;

#[derive(Parser)]
#[command(name = "cardkit", version)]
#[command(about = "CardKit developer tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging (overridden by `RUST_LOG`)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue cards, present codes online and offline, and sync the journal
    Simulate(simulate::SimulateArgs),

    /// Produce the next one-time code for a personalized card
    Code(tools::CodeArgs),

    /// Print a QR payload for a card
    Qr(tools::QrArgs),

    /// Generate a key-encryption key for `CARDKIT_KEK_B64`
    Kek,

    /// Journal maintenance
    Journal {
        #[command(subcommand)]
        command: JournalCommand,
    },
}

#[derive(Subcommand)]
enum JournalCommand {
    /// Check every entry signature of a file journal
    Verify {
        /// Directory holding `journal.log`
        #[arg(short, long)]
        path: PathBuf,

        /// Hex encoded 32-byte journal signing secret
        #[arg(long, env = "CARDKIT_JOURNAL_SECRET", hide_env_values = true)]
        signing_secret: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Simulate(args) => simulate::run(&args).await,
        Commands::Code(args) => tools::code(&args),
        Commands::Qr(args) => tools::qr(&args),
        Commands::Kek => {
            tools::kek();
            Ok(())
        }
        Commands::Journal {
            command:
                JournalCommand::Verify {
                    path,
                    signing_secret,
                },
        } => tools::verify_journal(&path, &signing_secret),
    }
}
