//! # pod-migrate
//!
//! **Migrate contacts between Diaspora\* pods, keeping their aspects.**
//!
//! pod-migrate reads the contacts and aspects of an account on a source pod
//! and recreates the aspect memberships on a target pod. Missing aspects
//! are created by name. A ledger of migrated contacts makes repeated runs
//! incremental.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐                           ┌──────────────┐
//! │  Source pod  │                           │  Target pod  │
//! │ (NodeSession)│                           │ (NodeSession)│
//! └──────┬───────┘                           └──────▲───────┘
//!        │ contacts, groups,                        │ lookup, discovery,
//!        │ members                                  │ create group, add
//!        ▼                                          │
//! ┌─────────────────────────────────────────────────┴──┐
//! │               ReconciliationEngine                  │
//! │   GroupMapper · IdentityResolver · ProcessedLedger  │
//! └─────────────────────────┬───────────────────────────┘
//!                           ▼
//!                  MigrationCounters (stdout)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types: `Contact`, `Group`, `ResolvedIdentity`, counters |
//! | [`error`] | Typed errors at the session and engine seams |
//! | [`session`] | `NodeSession` trait, credentials, HTTP and in-memory nodes |
//! | [`ledger`] | Plain-text ledger of migrated guids |
//! | [`resolve`] | Identity resolution with discovery hints and fixed backoff |
//! | [`groups`] | Source → target group mapping by name |
//! | [`engine`] | Per-group, per-contact reconciliation state machine |
//! | [`progress`] | Progress events and stderr reporters |
//! | [`run`] | Run orchestration: login, engine, logout, ledger flush |

pub mod config;
pub mod engine;
pub mod error;
pub mod groups;
pub mod ledger;
pub mod models;
pub mod progress;
pub mod resolve;
pub mod run;
pub mod session;

pub use engine::{MigrationOptions, MigrationReport, ReconciliationEngine};
pub use models::{Contact, Group, MigrationCounters};
pub use session::NodeSession;
