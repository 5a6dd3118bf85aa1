//! Migration progress reporting.
//!
//! The engine emits one event per group and per contact outcome, plus one
//! for each discovery request and backoff wait. Progress goes to **stderr**
//! so stdout stays reserved for the final counters.

use std::io::Write;

use crate::models::ContactOutcome;

/// A single progress event from the reconciliation engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationProgressEvent {
    /// A source group is about to be processed.
    GroupStarted { group: String, members: usize },
    /// A source group was skipped without processing its contacts.
    GroupSkipped { group: String, reason: String },
    /// A discovery hint was sent to the target node.
    Discovery { handle: String },
    /// The resolver is pausing before attempt `attempt + 1` of `budget`.
    Waiting {
        handle: String,
        attempt: u32,
        budget: u32,
    },
    /// A (group, contact) pair reached its terminal state.
    ContactFinished {
        group: String,
        handle: String,
        guid: String,
        outcome: ContactOutcome,
    },
}

/// Receives progress events. Implementations must not block for long; they
/// are called inline from the engine loop.
pub trait MigrationProgressReporter: Send + Sync {
    fn report(&self, event: MigrationProgressEvent);
}

/// Human-friendly progress on stderr.
pub struct StderrProgress {
    dry_run: bool,
}

impl StderrProgress {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }
}

impl MigrationProgressReporter for StderrProgress {
    fn report(&self, event: MigrationProgressEvent) {
        let line = match &event {
            MigrationProgressEvent::GroupStarted { group, members } => {
                format!("**** {} ****  {} members\n", group, members)
            }
            MigrationProgressEvent::GroupSkipped { group, reason } => {
                format!("**** {} ****  skipped: {}\n", group, reason)
            }
            MigrationProgressEvent::Discovery { handle } => {
                format!("  lookup triggered for {}\n", handle)
            }
            MigrationProgressEvent::Waiting {
                handle,
                attempt,
                budget,
            } => format!("  waiting for {} ({}/{})\n", handle, attempt, budget),
            MigrationProgressEvent::ContactFinished {
                handle, outcome, ..
            } => {
                let prefix = if self.dry_run { "[dry-run] " } else { "" };
                match outcome {
                    ContactOutcome::Added { user_id } => {
                        format!("  {}ADDED {} ({})\n", prefix, handle, user_id)
                    }
                    ContactOutcome::UnknownError { message } => {
                        format!("  ERROR {}: {}\n", handle, message)
                    }
                    other => format!("  {} {}\n", other.label(), handle),
                }
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl MigrationProgressReporter for JsonProgress {
    fn report(&self, event: MigrationProgressEvent) {
        let ts = chrono::Utc::now().to_rfc3339();
        let obj = match &event {
            MigrationProgressEvent::GroupStarted { group, members } => serde_json::json!({
                "event": "group",
                "ts": ts,
                "group": group,
                "members": members
            }),
            MigrationProgressEvent::GroupSkipped { group, reason } => serde_json::json!({
                "event": "group_skipped",
                "ts": ts,
                "group": group,
                "reason": reason
            }),
            MigrationProgressEvent::Discovery { handle } => serde_json::json!({
                "event": "discovery",
                "ts": ts,
                "handle": handle
            }),
            MigrationProgressEvent::Waiting {
                handle,
                attempt,
                budget,
            } => serde_json::json!({
                "event": "waiting",
                "ts": ts,
                "handle": handle,
                "attempt": attempt,
                "budget": budget
            }),
            MigrationProgressEvent::ContactFinished {
                group,
                handle,
                guid,
                outcome,
            } => serde_json::json!({
                "event": "contact",
                "ts": ts,
                "group": group,
                "handle": handle,
                "guid": guid,
                "result": outcome
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// Swallows every event. Used with `--progress off` and in tests that only
/// care about the returned counters.
pub struct NoProgress;

impl MigrationProgressReporter for NoProgress {
    fn report(&self, _event: MigrationProgressEvent) {}
}

/// Value of `--progress`. Every mode writes to stderr only.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    /// No per-contact output; tracing logs still apply.
    Off,
    /// One line per group and per contact outcome.
    Human,
    /// One JSON object per event.
    Json,
}

impl ProgressMode {
    /// Mode used when `--progress` is not given: `human` if someone is
    /// watching stderr, `off` when it is piped or redirected.
    pub fn detect() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Reporter for this mode. `dry_run` marks would-be additions in human
    /// output.
    pub fn reporter(&self, dry_run: bool) -> Box<dyn MigrationProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress::new(dry_run)),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotFoundStage;

    #[test]
    fn outcome_serializes_tagged() {
        let v = serde_json::to_value(ContactOutcome::NotFound {
            stage: NotFoundStage::Resolve,
        })
        .unwrap();
        assert_eq!(
            v,
            serde_json::json!({ "outcome": "not_found", "stage": "resolve" })
        );
    }
}
