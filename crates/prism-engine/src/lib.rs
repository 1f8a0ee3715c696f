//! Governance engine for cloud research resources.
//!
//! This crate owns the lifecycle of every managed instance and volume: it
//! ingests idle heartbeats, applies hibernation policies, drives provider
//! calls through the lifecycle state machine, debits and credits the budget
//! ledger, gates over-quota launches behind approvals and reconciles local
//! state against the provider.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Daemon (HTTP API, tasks)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     GovernanceEngine                        │
//! │  ┌───────────┐ ┌───────────┐ ┌───────────┐ ┌────────────┐   │
//! │  │ Heartbeat │ │ Lifecycle │ │  Budget   │ │  Approval  │   │
//! │  │ + Policy  │ │  Machine  │ │  Ledger   │ │  Workflow  │   │
//! │  └───────────┘ └───────────┘ └───────────┘ └────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┴──────────────┐
//!               ▼                             ▼
//!        ┌──────────┐                  ┌────────────┐
//!        │  Store   │                  │  Provider  │
//!        │ (RocksDB)│                  │  (HTTP)    │
//!        └──────────┘                  └────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use prism_engine::{Governance, GovernanceEngine};
//! use prism_provider::{HttpProvider, ProviderConfig};
//! use prism_store::RocksStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(RocksStore::open("/tmp/prism")?);
//! let provider = Arc::new(HttpProvider::new(&ProviderConfig::from_env())?);
//! let engine = GovernanceEngine::with_defaults(store, provider);
//! engine.seed_policies()?;
//!
//! let summary = engine.startup().await?;
//! println!("reconciled {} resources", summary.checked);
//! # Ok(())
//! # }
//! ```
//!
//! # Lifecycle
//!
//! Every provider call runs through a transitional state:
//!
//! - `Provisioning` → `Running`
//! - `Running` / `PendingIdleAction` → `Hibernating` → `Hibernated`
//! - `Running` / `PendingIdleAction` → `Stopping` → `Stopped`
//! - `Hibernated` / `Stopped` → `Resuming` → `Running`
//! - any live state → `Terminating` → `Terminated`
//!
//! A failed call leaves the resource `Failed` until an operator recovers it.
//! See the [`lifecycle`] module for the full table.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod approval;
pub mod billing;
pub mod clock;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod ledger;
pub mod lifecycle;
mod machine;
pub mod notify;
pub mod policy;
pub mod reconciler;
pub mod schedule;
pub mod service;
pub mod tasks;
pub mod types;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use ledger::{Ledger, LedgerUpdate};
pub use notify::{ChannelNotifier, LogNotifier, Notification, Notifier};
pub use service::{Governance, GovernanceEngine};
pub use tasks::BackgroundTasks;
pub use types::{
    AccountStatus, ApprovalDecision, ApprovalVerdict, Authorization, BudgetDenial, ForceRequest,
    HeartbeatAck, IdleReport, LaunchOutcome, NewAccount, OperatorFlags, QuotaLimit,
    ReconcileSummary, ResourceFilter, SavingsReport, TriggeredAction,
};
