//! HTTP request handlers.
//!
//! This module contains all the endpoint handlers for the daemon API.

pub mod accounts;
pub mod admin;
pub mod approvals;
pub mod health;
pub mod heartbeats;
pub mod policies;
pub mod resources;

use std::str::FromStr;

use chrono::Utc;
use prism_core::BudgetPeriod;
use serde::Deserialize;

use crate::error::ApiError;

/// Parse an identifier taken from the path.
pub(crate) fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid {what}: {raw}")))
}

/// `?period=YYYY-MM`; the current month when absent.
#[derive(Debug, Default, Deserialize)]
pub struct PeriodQuery {
    /// Budget period.
    #[serde(default)]
    pub period: Option<String>,
}

impl PeriodQuery {
    pub(crate) fn resolve(&self) -> Result<BudgetPeriod, ApiError> {
        match &self.period {
            Some(raw) => parse_id(raw, "period"),
            None => Ok(BudgetPeriod::containing(Utc::now())),
        }
    }
}
