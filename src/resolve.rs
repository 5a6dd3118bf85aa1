//! Identity resolution on the target node.
//!
//! Each attempt looks the contact up by handle, then by guid. Between
//! attempts the resolver sends a discovery hint so the target pod can
//! federate the remote profile, and in wait mode pauses for a fixed
//! interval. The pause is constant, not exponential.
//!
//! For an attempt budget `N`:
//!
//! | Budget | Discovery requests | Waits (wait mode) |
//! |--------|--------------------|-------------------|
//! | 1 | 1 | 0 |
//! | N > 1 | N - 1 | N - 1 |
//!
//! A budget of 1 still leaves one hint behind so a later run can succeed.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::engine::guarded;
use crate::error::EngineError;
use crate::models::{Contact, MigrationCounters, ResolvedIdentity, UserQuery};
use crate::progress::{MigrationProgressEvent, MigrationProgressReporter};
use crate::session::NodeSession;

/// Attempt budget and pacing for identity resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverOptions {
    /// Total lookup attempts per contact, at least 1.
    pub attempts: u32,
    /// Pause between attempts when `wait` is set.
    pub backoff: Duration,
    pub wait: bool,
}

impl ResolverOptions {
    /// One attempt, no waiting.
    pub fn fail_fast() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
            wait: false,
        }
    }

    /// `attempts` tries with a fixed `backoff` pause between them.
    pub fn waiting(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
            wait: true,
        }
    }
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self::fail_fast()
    }
}

/// Result of resolving one contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// `None` once the attempt budget is exhausted.
    pub identity: Option<ResolvedIdentity>,
    /// Discovery requests sent while resolving.
    pub discoveries: u32,
}

pub struct IdentityResolver<'a> {
    target: &'a dyn NodeSession,
    options: ResolverOptions,
    cancel: &'a CancellationToken,
    progress: &'a dyn MigrationProgressReporter,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(
        target: &'a dyn NodeSession,
        options: ResolverOptions,
        cancel: &'a CancellationToken,
        progress: &'a dyn MigrationProgressReporter,
    ) -> Self {
        Self {
            target,
            options,
            cancel,
            progress,
        }
    }

    /// Resolve `contact` on the target node within the attempt budget.
    ///
    /// Only cancellation is an error; an unresolvable contact is
    /// `Ok` with `identity: None`. Every discovery hint is counted into
    /// `counters.lookups_triggered` as soon as it is sent, so the tally
    /// stays exact when the run is cancelled mid-resolution.
    pub async fn resolve(
        &self,
        contact: &Contact,
        counters: &mut MigrationCounters,
    ) -> Result<Resolution, EngineError> {
        let budget = self.options.attempts.max(1);
        let mut discoveries = 0;

        for attempt in 1..=budget {
            if let Some(identity) = self.lookup_once(contact).await? {
                tracing::debug!(handle = %contact.handle, id = identity.target_user_id, attempt, "resolved");
                return Ok(Resolution {
                    identity: Some(identity),
                    discoveries,
                });
            }

            let last = attempt == budget;
            if !last || discoveries == 0 {
                self.discover(contact).await?;
                discoveries += 1;
                counters.lookups_triggered += 1;
            }
            if last {
                break;
            }
            if self.options.wait {
                self.progress.report(MigrationProgressEvent::Waiting {
                    handle: contact.handle.clone(),
                    attempt,
                    budget,
                });
                guarded(self.cancel, tokio::time::sleep(self.options.backoff)).await?;
            }
        }

        tracing::info!(handle = %contact.handle, guid = %contact.guid, budget, "could not find user on target");
        Ok(Resolution {
            identity: None,
            discoveries,
        })
    }

    /// One attempt: handle search, then guid lookup. Transport errors count
    /// as unresolved.
    async fn lookup_once(&self, contact: &Contact) -> Result<Option<ResolvedIdentity>, EngineError> {
        let queries = [
            UserQuery::Handle(&contact.handle),
            UserQuery::Guid(&contact.guid),
        ];
        for query in queries {
            match guarded(self.cancel, self.target.lookup_user(query)).await? {
                Ok(identity) if identity.is_found() => return Ok(Some(identity)),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(handle = %contact.handle, ?query, error = %e, "lookup failed");
                }
            }
        }
        Ok(None)
    }

    async fn discover(&self, contact: &Contact) -> Result<(), EngineError> {
        tracing::info!(handle = %contact.handle, "could not find user, triggering lookup");
        if let Err(e) = guarded(self.cancel, self.target.trigger_discovery(&contact.handle)).await? {
            tracing::warn!(handle = %contact.handle, error = %e, "discovery request failed");
        }
        self.progress.report(MigrationProgressEvent::Discovery {
            handle: contact.handle.clone(),
        });
        Ok(())
    }
}
