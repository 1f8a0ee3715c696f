//! HTTP daemon for the prism resource lifecycle and cost-governance engine.
//!
//! The daemon is the only writer of governance state. It exposes:
//!
//! - heartbeat ingestion for idle detection agents
//! - resource launches, listings and lifecycle actions
//! - idle policies, budget accounts, savings and cost events
//! - the approval workflow
//! - audited administrative overrides and the journal of cost,
//!   reconciliation and audit events
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐      ┌──────────────────────┐
//! │   Users / Operators  │      │  prism-agent (1/VM)  │
//! └──────────┬───────────┘      └──────────┬───────────┘
//!            │ REST                        │ POST /v1/heartbeats
//!            ▼                             ▼
//! ┌─────────────────────────────────────────────────────┐
//! │                    prism-daemon                      │
//! │   Caller extractors → Router + Handlers → ApiError   │
//! └──────────────────────────┬──────────────────────────┘
//!                            ▼
//! ┌─────────────────────────────────────────────────────┐
//! │        prism-engine (Governance + BackgroundTasks)   │
//! └──────────────┬──────────────────────────┬───────────┘
//!                ▼                          ▼
//!         ┌────────────┐             ┌────────────┐
//!         │ RocksStore │             │  Provider  │
//!         └────────────┘             └────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use prism_daemon::{create_router, DaemonConfig, DaemonState};
//! use prism_engine::GovernanceEngine;
//! use prism_provider::{HttpProvider, ProviderConfig};
//! use prism_store::RocksStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DaemonConfig::from_env();
//! let store = Arc::new(RocksStore::open(&config.data_dir)?);
//! let provider = Arc::new(HttpProvider::new(&ProviderConfig::from_env())?);
//! let engine = Arc::new(GovernanceEngine::with_defaults(store, provider));
//!
//! let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
//! let app = create_router(DaemonState::new(engine, config));
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod caller;
pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use caller::{Caller, Operator};
pub use config::DaemonConfig;
pub use error::ApiError;
pub use routes::create_router;
pub use state::DaemonState;
