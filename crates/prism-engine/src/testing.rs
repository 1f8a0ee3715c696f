//! Shared fixtures for engine tests.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use prism_core::{AccountId, ActivityMetrics, CostRate, IdleSignal, Money, ProjectId, ResourceId, UserId};
use prism_provider::{MockProvider, RetryPolicy};
use prism_store::{LaunchSpec, ResourceKind, ResourceSpec, RocksStore, RoleQuota};
use tempfile::TempDir;

use crate::clock::ManualClock;
use crate::config::EngineConfig;
use crate::notify::ChannelNotifier;
use crate::service::GovernanceEngine;
use crate::types::NewAccount;

pub(crate) type TestEngine = GovernanceEngine<RocksStore, MockProvider>;

pub(crate) struct Harness {
    pub engine: Arc<TestEngine>,
    pub provider: Arc<MockProvider>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<ChannelNotifier>,
    pub user: UserId,
    pub account_id: AccountId,
    pub dir: TempDir,
}

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy::immediate(3),
        ..EngineConfig::default()
    }
}

/// An engine over a fresh store with one root account of `limit` dollars.
pub(crate) fn harness(limit: f64) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(RocksStore::open(dir.path()).unwrap());
    harness_on(dir, store, Arc::new(MockProvider::new()), limit)
}

pub(crate) fn harness_on(
    dir: TempDir,
    store: Arc<RocksStore>,
    provider: Arc<MockProvider>,
    limit: f64,
) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let notifier = Arc::new(ChannelNotifier::new(256));
    let engine = GovernanceEngine::new(store, Arc::clone(&provider), test_config())
        .with_clock(clock.clone())
        .with_notifier(notifier.clone());
    engine.seed_policies().unwrap();

    let account = engine
        .ledger()
        .create_account(NewAccount {
            account_id: None,
            parent_id: None,
            name: "research".into(),
            monthly_limit: Money::from_dollars(limit),
            rollover_cap: Money::ZERO,
            hard_cap: false,
            role_quota: RoleQuota::default(),
            alert_thresholds: Vec::new(),
            auto_actions: Vec::new(),
        })
        .unwrap();

    Harness {
        engine: Arc::new(engine),
        provider,
        clock,
        notifier,
        user: UserId::generate(),
        account_id: account.account_id,
        dir,
    }
}

/// A compute launch on `account_id` at $2.40 a day ($0.10 an hour).
pub(crate) fn launch_spec(account_id: AccountId, name: &str) -> LaunchSpec {
    LaunchSpec {
        provider_id: format!("i-{name}"),
        name: name.to_string(),
        owner: UserId::generate(),
        project_id: ProjectId::generate(),
        account_id,
        spec: ResourceSpec {
            kind: ResourceKind::Compute,
            instance_class: "t3.medium".into(),
            cost_rate: CostRate::per_day(Money::from_dollars(2.40)),
        },
        policy_ref: None,
        policy_override: None,
    }
}

pub(crate) fn signal(resource_id: ResourceId, seq: u64, metrics: ActivityMetrics) -> IdleSignal {
    IdleSignal {
        resource_id,
        seq,
        boot_id: 1,
        sent_at: t0(),
        metrics,
        idle_score: 0.0,
        idle_for_secs: 0,
    }
}

pub(crate) fn busy() -> ActivityMetrics {
    ActivityMetrics {
        cpu_percent: 85.0,
        memory_pressure_percent: 40.0,
        disk_io_kbps: 800.0,
        network_io_kbps: 300.0,
        gpu_percent: None,
        interactive_session: true,
    }
}
