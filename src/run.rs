//! Migration run orchestration.
//!
//! Coordinates one full run: log in to both nodes → load the ledger → run
//! the reconciliation engine → log out of both nodes → flush the ledger.
//! Sessions are logged out on every path once they were logged in,
//! including cancellation and engine failure. Logins are raced against the
//! cancellation token too, so an interrupt during setup ends the run.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine::{guarded, MigrationOptions, MigrationReport, ReconciliationEngine};
use crate::ledger::ProcessedLedger;
use crate::models::MigrationCounters;
use crate::progress::{MigrationProgressReporter, ProgressMode};
use crate::resolve::ResolverOptions;
use crate::session::pod::PodSession;
use crate::session::{NodeCredentials, NodeSession};

/// Everything the CLI collects for one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source: NodeCredentials,
    pub target: NodeCredentials,
    pub dry_run: bool,
    pub full: bool,
    pub wait: bool,
    pub progress: ProgressMode,
}

impl RunRequest {
    /// Engine options for this request under `config`.
    pub fn options(&self, config: &Config) -> MigrationOptions {
        let resolver = if self.wait {
            ResolverOptions::waiting(config.resolve.wait_attempts, config.resolve.backoff())
        } else {
            ResolverOptions::fail_fast()
        };
        MigrationOptions {
            dry_run: self.dry_run,
            full_resync: self.full,
            resolver,
        }
    }
}

/// Run a migration between two Diaspora* pods.
pub async fn run_migration(
    config: &Config,
    request: &RunRequest,
    cancel: CancellationToken,
) -> Result<MigrationReport> {
    let source = PodSession::new(request.source.clone(), config)
        .context("Failed to build HTTP client for source node")?;
    let target = PodSession::new(request.target.clone(), config)
        .context("Failed to build HTTP client for target node")?;
    let progress = request.progress.reporter(request.dry_run);

    run_with_sessions(
        config,
        &source,
        &target,
        request.options(config),
        progress.as_ref(),
        cancel,
    )
    .await
}

/// Run a migration over already-constructed sessions.
///
/// The ledger at `config.ledger.path` is read unless `full_resync` is set,
/// and appended to afterwards unless `full_resync` or `dry_run` is set.
pub async fn run_with_sessions(
    config: &Config,
    source: &dyn NodeSession,
    target: &dyn NodeSession,
    options: MigrationOptions,
    progress: &dyn MigrationProgressReporter,
    cancel: CancellationToken,
) -> Result<MigrationReport> {
    let ledger = if options.full_resync {
        ProcessedLedger::new()
    } else {
        ProcessedLedger::load(&config.ledger.path)?
    };

    tracing::info!(host = source.host(), "connecting to source");
    match guarded(&cancel, source.login()).await {
        Ok(result) => result
            .with_context(|| format!("Failed to log in to source node {}", source.host()))?,
        Err(_) => return Ok(cancelled_before_start(ledger)),
    }

    tracing::info!(host = target.host(), "connecting to target");
    match guarded(&cancel, target.login()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            close_sessions(&[source]).await;
            return Err(e)
                .with_context(|| format!("Failed to log in to target node {}", target.host()));
        }
        Err(_) => {
            close_sessions(&[source]).await;
            return Ok(cancelled_before_start(ledger));
        }
    }

    let engine = ReconciliationEngine::new(source, target, options, cancel, progress);
    let result = engine.run(ledger).await;
    close_sessions(&[source, target]).await;

    let mut report = result.context("Migration aborted before reconciliation")?;

    if !options.full_resync && !options.dry_run {
        report.ledger.flush(&config.ledger.path)?;
    }

    tracing::info!(
        added = report.counters.added,
        exists = report.counters.already_exists,
        notfound = report.counters.not_found,
        unknownerrors = report.counters.unknown_error,
        cancelled = report.cancelled,
        "migration finished"
    );
    Ok(report)
}

/// Report for a run cancelled while logging in: nothing was reconciled.
fn cancelled_before_start(ledger: ProcessedLedger) -> MigrationReport {
    tracing::warn!("migration cancelled during login");
    MigrationReport {
        counters: MigrationCounters::default(),
        ledger,
        cancelled: true,
    }
}

/// Log out of every session, logging failures instead of propagating them.
async fn close_sessions(sessions: &[&dyn NodeSession]) {
    tracing::info!("logging out of nodes");
    for session in sessions {
        if let Err(e) = session.logout().await {
            tracing::warn!(host = session.host(), error = %e, "logout failed");
        }
    }
}
