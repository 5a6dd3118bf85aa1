//! Reconciliation engine behaviour against in-memory nodes.
//!
//! Covers the engine's observable contract: counters, ledger contents,
//! group mapping, dry-run purity, and cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use pod_migrate::config::{Config, LedgerConfig};
use pod_migrate::engine::{MigrationOptions, ReconciliationEngine};
use pod_migrate::error::MembershipError;
use pod_migrate::ledger::ProcessedLedger;
use pod_migrate::models::{ContactOutcome, MigrationCounters, NotFoundStage};
use pod_migrate::progress::{MigrationProgressEvent, MigrationProgressReporter, NoProgress};
use pod_migrate::resolve::ResolverOptions;
use pod_migrate::run::run_with_sessions;
use pod_migrate::session::memory::InMemoryNode;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ─── Helpers ────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder(Mutex<Vec<MigrationProgressEvent>>);

impl MigrationProgressReporter for Recorder {
    fn report(&self, event: MigrationProgressEvent) {
        self.0.lock().unwrap().push(event);
    }
}

impl Recorder {
    fn outcomes(&self) -> Vec<(String, ContactOutcome)> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                MigrationProgressEvent::ContactFinished { guid, outcome, .. } => {
                    Some((guid.clone(), outcome.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

/// Cancels the token once `after` contacts have finished.
struct CancelAfter {
    token: CancellationToken,
    after: usize,
    seen: AtomicUsize,
}

impl MigrationProgressReporter for CancelAfter {
    fn report(&self, event: MigrationProgressEvent) {
        if let MigrationProgressEvent::ContactFinished { .. } = event {
            if self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
                self.token.cancel();
            }
        }
    }
}

fn options() -> MigrationOptions {
    MigrationOptions::default()
}

fn waiting(attempts: u32) -> MigrationOptions {
    MigrationOptions {
        resolver: ResolverOptions::waiting(attempts, Duration::ZERO),
        ..MigrationOptions::default()
    }
}

fn source_friends() -> InMemoryNode {
    InMemoryNode::new("source.example")
        .with_contact("one@remote.example", "g1")
        .with_contact("two@remote.example", "g2")
        .with_group(1, "Friends", &["g1", "g2"])
}

// ─── Engine ─────────────────────────────────────────────────────────

#[tokio::test]
async fn friends_example_scenario() {
    let source = source_friends();
    let target = InMemoryNode::new("target.example").with_user("one@remote.example", "g1", 42);

    let engine = ReconciliationEngine::new(
        &source,
        &target,
        waiting(3),
        CancellationToken::new(),
        &NoProgress,
    );
    let report = engine.run(ProcessedLedger::new()).await.unwrap();

    assert_eq!(
        report.counters,
        MigrationCounters {
            added: 1,
            already_exists: 0,
            not_found: 1,
            unknown_error: 0,
            total: 2,
            lookups_triggered: 2,
        }
    );
    assert!(!report.cancelled);
    assert_eq!(target.created_groups(), vec!["Friends"]);
    let friends = target
        .groups()
        .into_iter()
        .find(|g| g.name == "Friends")
        .unwrap();
    assert!(target.has_membership(friends.id.unwrap(), 42));
    assert_eq!(report.ledger.pending(), &["g1".to_string()]);
}

#[tokio::test]
async fn second_run_only_processes_new_contacts() {
    let target = InMemoryNode::new("target.example")
        .with_user("one@remote.example", "g1", 41)
        .with_user("two@remote.example", "g2", 42)
        .with_user("three@remote.example", "g3", 43);

    let first = ReconciliationEngine::new(
        &source_friends(),
        &target,
        options(),
        CancellationToken::new(),
        &NoProgress,
    )
    .run(ProcessedLedger::new())
    .await
    .unwrap();
    assert_eq!(first.counters.added, 2);

    let source = InMemoryNode::new("source.example")
        .with_contact("one@remote.example", "g1")
        .with_contact("two@remote.example", "g2")
        .with_contact("three@remote.example", "g3")
        .with_group(1, "Friends", &["g1", "g2", "g3"]);
    let recorder = Recorder::default();
    let second = ReconciliationEngine::new(
        &source,
        &target,
        options(),
        CancellationToken::new(),
        &recorder,
    )
    .run(ProcessedLedger::from_guids(first.ledger.pending().to_vec()))
    .await
    .unwrap();

    assert_eq!(second.counters.added + second.counters.already_exists, 1);
    assert_eq!(second.ledger.pending(), &["g3".to_string()]);
    let outcomes = recorder.outcomes();
    assert_eq!(outcomes[0], ("g1".to_string(), ContactOutcome::Skipped));
    assert_eq!(outcomes[1], ("g2".to_string(), ContactOutcome::Skipped));
    assert_eq!(target.membership_calls().len(), 3);
}

#[tokio::test]
async fn ledger_records_only_reconciled_contacts() {
    let source = InMemoryNode::new("source.example")
        .with_contact("a@r", "ga")
        .with_contact("b@r", "gb")
        .with_contact("c@r", "gc")
        .with_contact("d@r", "gd")
        .with_contact("e@r", "ge")
        .with_group(1, "Work", &["ga", "gb", "gc", "gd", "ge"]);
    let target = InMemoryNode::new("target.example")
        .with_group(10, "Work", &[])
        .with_user("a@r", "ga", 51)
        .with_user("b@r", "gb", 52)
        .with_membership(10, 52)
        .with_user("d@r", "gd", 54)
        .with_membership_error(54, MembershipError::NotFound)
        .with_user("e@r", "ge", 55)
        .with_membership_error(55, MembershipError::Other("status 500".into()));

    let recorder = Recorder::default();
    let report = ReconciliationEngine::new(
        &source,
        &target,
        options(),
        CancellationToken::new(),
        &recorder,
    )
    .run(ProcessedLedger::new())
    .await
    .unwrap();

    assert_eq!(report.counters.added, 1);
    assert_eq!(report.counters.already_exists, 1);
    assert_eq!(report.counters.not_found, 2);
    assert_eq!(report.counters.unknown_error, 1);
    assert_eq!(report.counters.lookups_triggered, 1);
    assert_eq!(
        report.ledger.pending(),
        &["ga".to_string(), "gb".to_string()]
    );
    assert!(target.created_groups().is_empty());

    let outcomes = recorder.outcomes();
    assert_eq!(
        outcomes[2].1,
        ContactOutcome::NotFound {
            stage: NotFoundStage::Resolve
        }
    );
    assert_eq!(
        outcomes[3].1,
        ContactOutcome::NotFound {
            stage: NotFoundStage::Mutate
        }
    );
}

#[tokio::test]
async fn full_resync_ignores_and_does_not_grow_ledger() {
    let target = InMemoryNode::new("target.example")
        .with_group(10, "Friends", &[])
        .with_user("one@remote.example", "g1", 41)
        .with_membership(10, 41)
        .with_user("two@remote.example", "g2", 42);

    let report = ReconciliationEngine::new(
        &source_friends(),
        &target,
        MigrationOptions {
            full_resync: true,
            ..options()
        },
        CancellationToken::new(),
        &NoProgress,
    )
    .run(ProcessedLedger::from_guids(["g1"]))
    .await
    .unwrap();

    assert_eq!(report.counters.already_exists, 1);
    assert_eq!(report.counters.added, 1);
    assert!(report.ledger.pending().is_empty());
}

#[tokio::test]
async fn dry_run_never_mutates_target() {
    let target = InMemoryNode::new("target.example")
        .with_user("one@remote.example", "g1", 41)
        .with_user("two@remote.example", "g2", 42);

    let report = ReconciliationEngine::new(
        &source_friends(),
        &target,
        MigrationOptions {
            dry_run: true,
            ..options()
        },
        CancellationToken::new(),
        &NoProgress,
    )
    .run(ProcessedLedger::new())
    .await
    .unwrap();

    assert_eq!(report.counters.added, 2);
    assert!(target.created_groups().is_empty());
    assert!(target.membership_calls().is_empty());
}

#[tokio::test]
async fn contact_in_two_groups_is_added_to_both() {
    let source = InMemoryNode::new("source.example")
        .with_contact("one@remote.example", "g1")
        .with_group(1, "Friends", &["g1"])
        .with_group(2, "Family", &["g1"]);
    let target = InMemoryNode::new("target.example").with_user("one@remote.example", "g1", 41);

    let report = ReconciliationEngine::new(
        &source,
        &target,
        options(),
        CancellationToken::new(),
        &NoProgress,
    )
    .run(ProcessedLedger::new())
    .await
    .unwrap();

    assert_eq!(report.counters.added, 2);
    assert_eq!(target.created_groups(), vec!["Friends", "Family"]);
    assert_eq!(report.ledger.pending(), &["g1".to_string()]);
}

#[tokio::test]
async fn unlistable_group_is_skipped() {
    let source = InMemoryNode::new("source.example")
        .with_contact("one@remote.example", "g1")
        .with_group(1, "Broken", &["g1"])
        .with_group(2, "Friends", &["g1"])
        .with_failing_member_list(1);
    let target = InMemoryNode::new("target.example").with_user("one@remote.example", "g1", 41);

    let recorder = Recorder::default();
    let report = ReconciliationEngine::new(
        &source,
        &target,
        options(),
        CancellationToken::new(),
        &recorder,
    )
    .run(ProcessedLedger::new())
    .await
    .unwrap();

    assert_eq!(report.counters.added, 1);
    assert_eq!(target.created_groups(), vec!["Friends"]);
    assert!(recorder.0.lock().unwrap().iter().any(|e| matches!(
        e,
        MigrationProgressEvent::GroupSkipped { group, .. } if group == "Broken"
    )));
}

#[tokio::test]
async fn cached_contacts_cause_no_network_calls() {
    let target = InMemoryNode::new("target.example");

    let report = ReconciliationEngine::new(
        &source_friends(),
        &target,
        options(),
        CancellationToken::new(),
        &NoProgress,
    )
    .run(ProcessedLedger::from_guids(["g1", "g2"]))
    .await
    .unwrap();

    assert_eq!(report.counters.added, 0);
    assert_eq!(report.counters.not_found, 0);
    assert_eq!(report.counters.total, 2);
    assert!(target.discovery_requests().is_empty());
    assert!(target.membership_calls().is_empty());
}

#[tokio::test]
async fn cancellation_keeps_exactly_the_reconciled_guids() {
    let source = InMemoryNode::new("source.example")
        .with_contact("a@r", "ga")
        .with_contact("b@r", "gb")
        .with_contact("c@r", "gc")
        .with_group(1, "Friends", &["ga", "gb", "gc"]);
    let target = InMemoryNode::new("target.example")
        .with_user("a@r", "ga", 1)
        .with_user("b@r", "gb", 2)
        .with_user("c@r", "gc", 3);

    let token = CancellationToken::new();
    let reporter = CancelAfter {
        token: token.clone(),
        after: 2,
        seen: AtomicUsize::new(0),
    };
    let report = ReconciliationEngine::new(&source, &target, options(), token, &reporter)
        .run(ProcessedLedger::new())
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.counters.added, 2);
    assert_eq!(
        report.ledger.pending(),
        &["ga".to_string(), "gb".to_string()]
    );
    assert_eq!(target.membership_calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_waiting_keeps_sent_lookups_counted() {
    let source = InMemoryNode::new("source.example")
        .with_contact("two@remote.example", "g2")
        .with_group(1, "Friends", &["g2"]);
    let target = InMemoryNode::new("target.example");
    let opts = MigrationOptions {
        resolver: ResolverOptions::waiting(5, Duration::from_secs(3)),
        ..options()
    };

    // Hints go out at t=0,3,6,9; the fourth backoff is interrupted at t=10.
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        trigger.cancel();
    });

    let report = ReconciliationEngine::new(&source, &target, opts, token, &NoProgress)
        .run(ProcessedLedger::new())
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(target.discovery_requests().len(), 4);
    assert_eq!(report.counters.lookups_triggered, 4);
    assert_eq!(report.counters.not_found, 0);
    assert!(report.ledger.pending().is_empty());
}

// ─── Orchestration ──────────────────────────────────────────────────

fn config_in(tmp: &TempDir) -> Config {
    Config {
        ledger: LedgerConfig {
            path: tmp.path().join("ledger"),
        },
        ..Config::default()
    }
}

#[tokio::test]
async fn run_flushes_ledger_and_logs_out() {
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);
    let source = source_friends();
    let target = InMemoryNode::new("target.example").with_user("one@remote.example", "g1", 41);

    let report = run_with_sessions(
        &cfg,
        &source,
        &target,
        options(),
        &NoProgress,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.counters.added, 1);
    assert_eq!(std::fs::read_to_string(&cfg.ledger.path).unwrap(), "g1\n");
    assert!(!source.is_logged_in());
    assert!(!target.is_logged_in());
    assert_eq!(source.logout_count(), 1);
    assert_eq!(target.logout_count(), 1);

    // Re-run reads the file back and skips g1.
    let again = run_with_sessions(
        &cfg,
        &source_friends(),
        &target,
        options(),
        &NoProgress,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(again.counters.added, 0);
    assert_eq!(target.membership_calls().len(), 1);
}

#[tokio::test]
async fn dry_run_and_full_leave_ledger_file_alone() {
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);
    let target = InMemoryNode::new("target.example").with_user("one@remote.example", "g1", 41);

    for opts in [
        MigrationOptions {
            dry_run: true,
            ..options()
        },
        MigrationOptions {
            full_resync: true,
            ..options()
        },
    ] {
        run_with_sessions(
            &cfg,
            &source_friends(),
            &target,
            opts,
            &NoProgress,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    }

    assert!(!cfg.ledger.path.exists());
}

#[tokio::test]
async fn target_login_failure_logs_out_source() {
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);
    let source = source_friends();
    let target = InMemoryNode::new("target.example").with_login_failure();

    let err = run_with_sessions(
        &cfg,
        &source,
        &target,
        options(),
        &NoProgress,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(format!("{:#}", err).contains("target.example"));
    assert_eq!(source.logout_count(), 1);
    assert_eq!(target.logout_count(), 0);
}

#[tokio::test]
async fn cancelled_run_still_flushes_pending_and_logs_out() {
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);
    let source = source_friends();
    let target = InMemoryNode::new("target.example")
        .with_user("one@remote.example", "g1", 41)
        .with_user("two@remote.example", "g2", 42);

    let token = CancellationToken::new();
    let reporter = CancelAfter {
        token: token.clone(),
        after: 1,
        seen: AtomicUsize::new(0),
    };
    let report = run_with_sessions(&cfg, &source, &target, options(), &reporter, token)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(std::fs::read_to_string(&cfg.ledger.path).unwrap(), "g1\n");
    assert_eq!(source.logout_count(), 1);
    assert_eq!(target.logout_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_source_login_returns_promptly() {
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);
    let source = source_friends().with_login_delay(Duration::from_secs(120));
    let target = InMemoryNode::new("target.example");

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let report = run_with_sessions(&cfg, &source, &target, options(), &NoProgress, token)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(120));
    assert!(report.cancelled);
    assert_eq!(report.counters, MigrationCounters::default());
    assert!(!source.is_logged_in());
    assert!(!target.is_logged_in());
    assert_eq!(target.logout_count(), 0);
    assert!(!cfg.ledger.path.exists());
}

#[tokio::test(start_paused = true)]
async fn cancel_during_target_login_logs_out_source() {
    let tmp = TempDir::new().unwrap();
    let cfg = config_in(&tmp);
    let source = source_friends();
    let target = InMemoryNode::new("target.example").with_login_delay(Duration::from_secs(120));

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let report = run_with_sessions(&cfg, &source, &target, options(), &NoProgress, token)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(120));
    assert!(report.cancelled);
    assert_eq!(source.logout_count(), 1);
    assert!(!source.is_logged_in());
    assert!(!target.is_logged_in());
    assert!(target.membership_calls().is_empty());
}
