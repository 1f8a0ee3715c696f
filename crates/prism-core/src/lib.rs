//! Core types and utilities for prism.
//!
//! This crate provides the value types shared by the agent, the engine and the
//! daemon:
//!
//! - **Identifiers**: strongly-typed IDs for resources, users, projects,
//!   budget accounts and approval requests
//! - **Money**: exact fixed-point amounts and hourly cost rates
//! - **Periods**: calendar-month budget periods
//! - **Activity**: the heartbeat metric vector and the idle-score function
//! - **Signals**: the [`IdleSignal`] heartbeat sent by the agent
//!
//! # Example
//!
//! ```
//! use prism_core::{ActivityMetrics, CostRate, Money, ProjectId, ResourceId, ScoringProfile};
//!
//! let project = ProjectId::generate();
//! let resource = ResourceId::generate(&project, "analysis-ws");
//!
//! let rate = CostRate::per_day(Money::from_dollars(2.40));
//! assert_eq!(rate.hourly(), Money::from_dollars(0.10));
//!
//! let score = ScoringProfile::default().score(&ActivityMetrics::quiet());
//! assert!(score < 0.01);
//! # let _ = resource;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod activity;
pub mod error;
pub mod ids;
pub mod money;
pub mod period;
pub mod signal;

pub use activity::{ActivityMetrics, MetricSaturation, MetricWeights, ScoringProfile};
pub use error::{CoreError, Result};
pub use ids::{AccountId, ApprovalId, IdError, ProjectId, ResourceId, UserId};
pub use money::{CostRate, Money};
pub use period::BudgetPeriod;
pub use signal::IdleSignal;
