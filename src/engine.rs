//! Contact reconciliation engine.
//!
//! Walks every source group in node order, maps it to a target group, and
//! runs each member contact through a small state machine:
//!
//! ```text
//!            ┌── in ledger ──────────────▶ Skipped
//! contact ───┤
//!            └─▶ Resolving ─┬─ budget exhausted ──▶ NotFound(resolve)
//!                           └─▶ Mutating ─┬─ ok ─────────▶ Added
//!                                         ├─ conflict ───▶ AlreadyExists
//!                                         ├─ not found ──▶ NotFound(mutate)
//!                                         └─ other ──────▶ UnknownError
//! ```
//!
//! `Added` and `AlreadyExists` mark the guid for the ledger (unless full
//! resync is on); every other outcome leaves it retryable. Per-contact
//! failures never escape the loop. Cancellation stops the loop at the next
//! await or contact boundary and returns what was accumulated, with
//! `cancelled` set.

use std::collections::HashSet;
use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, MembershipError};
use crate::groups::GroupMapper;
use crate::ledger::ProcessedLedger;
use crate::models::{Contact, ContactOutcome, Group, MigrationCounters, NotFoundStage};
use crate::progress::{MigrationProgressEvent, MigrationProgressReporter};
use crate::resolve::{IdentityResolver, ResolverOptions};
use crate::session::NodeSession;

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn guarded<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, EngineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        out = fut => Ok(out),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Perform no mutation on the target; outcomes are reported as if the
    /// mutation succeeded.
    pub dry_run: bool,
    /// Ignore the ledger and record nothing new in it.
    pub full_resync: bool,
    pub resolver: ResolverOptions,
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub counters: MigrationCounters,
    /// The ledger passed in, plus guids recorded during this run.
    pub ledger: ProcessedLedger,
    /// The run stopped early on a cancellation signal.
    pub cancelled: bool,
}

pub struct ReconciliationEngine<'a> {
    source: &'a dyn NodeSession,
    target: &'a dyn NodeSession,
    options: MigrationOptions,
    cancel: CancellationToken,
    progress: &'a dyn MigrationProgressReporter,
}

struct RunState {
    counters: MigrationCounters,
    ledger: ProcessedLedger,
}

impl<'a> ReconciliationEngine<'a> {
    pub fn new(
        source: &'a dyn NodeSession,
        target: &'a dyn NodeSession,
        options: MigrationOptions,
        cancel: CancellationToken,
        progress: &'a dyn MigrationProgressReporter,
    ) -> Self {
        Self {
            source,
            target,
            options,
            cancel,
            progress,
        }
    }

    /// Reconcile every source group onto the target.
    ///
    /// Returns `Err` only when the initial snapshot (source contacts and
    /// groups, target groups) cannot be fetched. Cancellation is reported
    /// through [`MigrationReport::cancelled`].
    pub async fn run(&self, ledger: ProcessedLedger) -> Result<MigrationReport, EngineError> {
        let mut state = RunState {
            counters: MigrationCounters::default(),
            ledger,
        };

        let cancelled = match self.reconcile(&mut state).await {
            Ok(()) => false,
            Err(EngineError::Cancelled) => {
                tracing::warn!(
                    pending = state.ledger.pending().len(),
                    "migration cancelled, returning partial results"
                );
                true
            }
            Err(e) => return Err(e),
        };

        Ok(MigrationReport {
            counters: state.counters,
            ledger: state.ledger,
            cancelled,
        })
    }

    async fn reconcile(&self, state: &mut RunState) -> Result<(), EngineError> {
        let contacts = guarded(&self.cancel, self.source.list_contacts())
            .await?
            .map_err(EngineError::Setup)?;
        state.counters.total = contacts.len() as u64;

        let groups = guarded(&self.cancel, self.source.list_groups())
            .await?
            .map_err(EngineError::Setup)?;
        tracing::info!(
            contacts = contacts.len(),
            groups = groups.len(),
            host = self.source.host(),
            "fetched source snapshot"
        );

        let mut mapper = GroupMapper::new(self.target, self.options.dry_run);
        guarded(&self.cancel, mapper.prime())
            .await?
            .map_err(EngineError::Setup)?;

        let resolver = IdentityResolver::new(
            self.target,
            self.options.resolver,
            &self.cancel,
            self.progress,
        );

        for group in &groups {
            self.check_cancelled()?;
            let Some(members) = self.members(group).await? else {
                continue;
            };
            let Some(target_group) = self.prepare_group(group, &mut mapper).await? else {
                continue;
            };
            self.progress.report(MigrationProgressEvent::GroupStarted {
                group: group.name.clone(),
                members: members.len(),
            });

            for contact in contacts.iter().filter(|c| members.contains(&c.guid)) {
                self.check_cancelled()?;
                let outcome = self
                    .reconcile_contact(contact, &target_group, &resolver, state)
                    .await?;

                state.counters.record(&outcome);
                if outcome.is_reconciled() && !self.options.full_resync {
                    state.ledger.record(&contact.guid);
                }
                self.progress.report(MigrationProgressEvent::ContactFinished {
                    group: group.name.clone(),
                    handle: contact.handle.clone(),
                    guid: contact.guid.clone(),
                    outcome,
                });
            }
        }

        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn skip_group(&self, group: &Group, reason: String) {
        tracing::warn!(group = %group.name, %reason, "skipping group");
        self.progress.report(MigrationProgressEvent::GroupSkipped {
            group: group.name.clone(),
            reason,
        });
    }

    async fn prepare_group(
        &self,
        group: &Group,
        mapper: &mut GroupMapper<'_>,
    ) -> Result<Option<Group>, EngineError> {
        match guarded(&self.cancel, mapper.map_group(group)).await? {
            Ok(target_group) => Ok(Some(target_group)),
            Err(e) => {
                tracing::error!(group = %group.name, error = %e, "could not map group on target");
                self.skip_group(group, format!("target group unavailable: {}", e));
                Ok(None)
            }
        }
    }

    async fn members(&self, group: &Group) -> Result<Option<HashSet<String>>, EngineError> {
        let Some(id) = group.id else {
            self.skip_group(group, "source group has no id".to_string());
            return Ok(None);
        };
        match guarded(&self.cancel, self.source.list_group_members(id)).await? {
            Ok(members) => Ok(Some(members)),
            Err(e) => {
                self.skip_group(group, format!("could not list members: {}", e));
                Ok(None)
            }
        }
    }

    async fn reconcile_contact(
        &self,
        contact: &Contact,
        target_group: &Group,
        resolver: &IdentityResolver<'_>,
        state: &mut RunState,
    ) -> Result<ContactOutcome, EngineError> {
        if !self.options.full_resync && state.ledger.was_processed_before(&contact.guid) {
            tracing::debug!(handle = %contact.handle, "in ledger, skipping");
            return Ok(ContactOutcome::Skipped);
        }

        tracing::info!(handle = %contact.handle, guid = %contact.guid, "checking");
        let resolution = resolver.resolve(contact, &mut state.counters).await?;

        let Some(identity) = resolution.identity else {
            return Ok(ContactOutcome::NotFound {
                stage: NotFoundStage::Resolve,
            });
        };
        let user_id = identity.target_user_id;

        if self.options.dry_run {
            tracing::info!(handle = %contact.handle, user_id, group = %target_group.name, "[dry-run] would add");
            return Ok(ContactOutcome::Added { user_id });
        }

        let Some(group_id) = target_group.id else {
            return Ok(ContactOutcome::UnknownError {
                message: format!("target group '{}' has no id", target_group.name),
            });
        };

        let outcome = match guarded(&self.cancel, self.target.add_membership(group_id, user_id))
            .await?
        {
            Ok(()) => {
                tracing::info!(handle = %contact.handle, user_id, group = %target_group.name, "added");
                ContactOutcome::Added { user_id }
            }
            Err(MembershipError::Conflict) => {
                tracing::info!(handle = %contact.handle, user_id, "already in group");
                ContactOutcome::AlreadyExists { user_id }
            }
            Err(MembershipError::NotFound) => {
                tracing::warn!(handle = %contact.handle, user_id, "target rejected user as not found");
                ContactOutcome::NotFound {
                    stage: NotFoundStage::Mutate,
                }
            }
            Err(MembershipError::Other(message)) => {
                tracing::warn!(handle = %contact.handle, user_id, error = %message, "adding to group failed");
                ContactOutcome::UnknownError { message }
            }
        };
        Ok(outcome)
    }
}
