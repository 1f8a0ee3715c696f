//! Cloud provider control-plane abstraction for prism.
//!
//! This crate provides the [`Provider`] trait that the engine drives for every
//! lifecycle transition, along with:
//!
//! - [`HttpProvider`], a client for a provider adapter service
//! - [`RetryPolicy`], bounded exponential backoff with jitter and per-call
//!   timeouts
//! - [`StatusCache`], the last status observed per provider id
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              State Machine / Provider Reconciler                 │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        RetryPolicy                               │
//! │        (timeout per attempt, backoff 2s → 60s, jitter)           │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Provider (HttpProvider)                        │
//! │   start · stop · hibernate · resume · terminate · describe       │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Provider adapter / cloud API                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use prism_provider::{HttpProvider, Provider, ProviderConfig, RetryPolicy};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = HttpProvider::new(&ProviderConfig::from_env())?;
//! let retry = RetryPolicy::default();
//!
//! let status = retry
//!     .run("hibernate", || provider.hibernate("i-0abc"))
//!     .await?;
//! println!("provider reports {:?}", status.state);
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature to use [`MockProvider`], which keeps
//! instance states in memory and supports scripted failures.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod error;
pub mod http;
pub mod provider;
pub mod retry;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use cache::{Observed, StatusCache};
pub use error::{ProviderError, Result};
pub use http::HttpProvider;
pub use provider::{Provider, ProviderAction};
pub use retry::RetryPolicy;
pub use types::{ProviderConfig, ProviderStatus};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockProvider;
