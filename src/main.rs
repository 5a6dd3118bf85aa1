//! # pod-migrate CLI
//!
//! Migrates contacts and their aspects from one Diaspora* pod to another.
//! Contacts must already be discoverable from the target pod; missing
//! aspects are created there.
//!
//! ## Usage
//!
//! ```bash
//! pod-migrate [OPTIONS] <SOURCE> <TARGET>
//! ```
//!
//! `SOURCE` and `TARGET` are `username:password@https://pod.tld`.
//!
//! ## Examples
//!
//! ```bash
//! # See what would happen
//! pod-migrate -n alice:pw@https://old.pod alice:pw@https://new.pod
//!
//! # Migrate, waiting for remote profiles to federate
//! pod-migrate --wait alice:pw@https://old.pod alice:pw@https://new.pod
//!
//! # Ignore the ledger and reprocess everyone
//! pod-migrate --full alice:pw@https://old.pod alice:pw@https://new.pod
//! ```
//!
//! Final counters are printed to stdout as one JSON object; progress and
//! logs go to stderr (`RUST_LOG` controls log verbosity).

use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pod_migrate::config;
use pod_migrate::progress::ProgressMode;
use pod_migrate::run::{run_migration, RunRequest};
use pod_migrate::session::NodeCredentials;

/// Move contacts and aspects between Diaspora* pods.
///
/// A ledger of already-migrated contacts is kept in the working directory
/// (`.diaspora-tools-migrate-user-cache` by default) so repeated runs only
/// process new contacts.
#[derive(Parser)]
#[command(
    name = "pod-migrate",
    about = "Migrate contacts and aspects from one Diaspora* pod to another",
    version
)]
struct Cli {
    /// Source pod: `username:password@https://sourcepod.tld`.
    source: NodeCredentials,

    /// Target pod: `username:password@https://targetpod.tld`.
    target: NodeCredentials,

    /// Don't do any changes, just print out what would happen.
    #[arg(short = 'n')]
    dry_run: bool,

    /// Sync all users in all aspects, ignoring the ledger file.
    #[arg(long)]
    full: bool,

    /// Wait for remote profile lookups to resolve, retrying with a fixed
    /// backoff.
    #[arg(long)]
    wait: bool,

    /// Path to configuration file (TOML). Missing file means defaults.
    #[arg(long, default_value = "./pod-migrate.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a TTY, `off`
    /// otherwise.
    #[arg(long, value_enum)]
    progress: Option<ProgressMode>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pod_migrate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping");
            on_interrupt.cancel();
        }
    });

    let request = RunRequest {
        source: cli.source,
        target: cli.target,
        dry_run: cli.dry_run,
        full: cli.full,
        wait: cli.wait,
        progress: cli.progress.unwrap_or_else(ProgressMode::detect),
    };

    let report = run_migration(&cfg, &request, cancel).await?;
    println!("{}", serde_json::to_string(&report.counters)?);

    Ok(())
}
