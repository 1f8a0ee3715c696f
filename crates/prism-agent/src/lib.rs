//! Idle detection agent for prism-managed resources.
//!
//! The agent runs on each managed instance. It samples system activity from
//! the proc filesystem, scores it, and sends a sequenced [`IdleSignal`]
//! heartbeat to the daemon at a jittered interval. The daemon owns every
//! idle decision; the agent only reports.
//!
//! [`IdleSignal`]: prism_core::IdleSignal
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use prism_agent::{Agent, AgentConfig, HttpHeartbeatSink, ProcSampler, SequenceStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig::from_env()?;
//! let boot_id = prism_agent::sampler::read_boot_id(&config.proc_root).await?;
//! let sink = HttpHeartbeatSink::new(&config.daemon_url, config.request_timeout())?;
//! let agent = Agent::start(
//!     config.settings(),
//!     boot_id,
//!     Box::new(ProcSampler::new(&config.proc_root, &config.pts_dir)),
//!     Arc::new(sink),
//!     SequenceStore::new(&config.state_dir),
//! )
//! .await?;
//!
//! let (_shutdown, rx) = tokio::sync::broadcast::channel(1);
//! agent.run(rx).await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod agent;
pub mod config;
pub mod error;
pub mod idle;
pub mod sampler;
pub mod sink;
pub mod state;
pub mod update;

pub use agent::{Agent, AgentSettings};
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use idle::IdleAccumulator;
pub use sampler::{ActivitySampler, ProcSampler};
pub use sink::{HeartbeatReply, HeartbeatSink, HttpHeartbeatSink};
pub use state::{SequenceState, SequenceStore};
pub use update::{Manifest, ManifestUpdater, StagedUpdate, Updater};
