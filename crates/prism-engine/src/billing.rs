//! Billing windows and the cost postings they produce.
//!
//! A billing resource is debited one block of running time in advance. When it
//! leaves billing the unused part of the block is credited back, so the net
//! spend is exactly the time it ran. Prepaid time never runs past the end of
//! the budget period it is debited in, so a credit always lands in the period
//! that paid for the block. All functions here are pure; the ledger turns the
//! postings into cost events.

use chrono::{DateTime, Duration, Utc};
use prism_core::{AccountId, BudgetPeriod, CostRate, Money, ResourceId};
use prism_store::{BillingWindow, CostEventKind, LifecycleState};

/// A cost event before it is stamped with period, time and sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    /// Resource concerned, if any.
    pub resource_id: Option<ResourceId>,
    /// Account charged or credited.
    pub account_id: AccountId,
    /// Event kind.
    pub kind: CostEventKind,
    /// Signed amount.
    pub amount: Money,
    /// Context for the log.
    pub note: Option<String>,
}

impl Posting {
    /// A posting for a resource.
    #[must_use]
    pub const fn for_resource(
        resource_id: ResourceId,
        account_id: AccountId,
        kind: CostEventKind,
        amount: Money,
    ) -> Self {
        Self {
            resource_id: Some(resource_id),
            account_id,
            kind,
            amount,
            note: None,
        }
    }

    /// Attach a note.
    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Open a window at `start` and prepay until one block past `now`, or until
/// the end of the current budget period if that comes first.
///
/// `start` may lie in the past when the provider reports the instance came up
/// earlier than the daemon noticed; that time is included in the debit.
#[must_use]
pub fn open(rate: CostRate, start: DateTime<Utc>, now: DateTime<Utc>, block: Duration) -> (BillingWindow, Money) {
    let start = start.min(now);
    let billed_through = prepaid_until(now, now + block);
    let window = BillingWindow {
        opened_at: start,
        billed_through,
    };
    (window, rate.cost_for(billed_through - start))
}

/// Outcome of closing a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closing {
    /// Amount to post: negative for an unused-block credit, positive when the
    /// resource ran past its prepaid time.
    pub amount: Money,
    /// Kind of event to post.
    pub kind: CostEventKind,
}

/// Close a window at `at`, returning the posting that settles it.
///
/// `at` is clamped into `[opened_at, now]`. `target` decides between a
/// hibernate and a stop credit. Unused time debited in an earlier budget
/// period is not credited.
#[must_use]
pub fn close(
    rate: CostRate,
    window: &BillingWindow,
    at: DateTime<Utc>,
    now: DateTime<Utc>,
    target: LifecycleState,
) -> Closing {
    let at = at.max(window.opened_at).min(now);
    if at <= window.billed_through {
        let from = at.max(BudgetPeriod::containing(now).start());
        Closing {
            amount: -rate.cost_for(window.billed_through - from),
            kind: credit_kind(target),
        }
    } else {
        Closing {
            amount: rate.cost_for(at - window.billed_through),
            kind: CostEventKind::DebitRunning,
        }
    }
}

/// Credit kind for leaving billing towards `target`.
#[must_use]
pub const fn credit_kind(target: LifecycleState) -> CostEventKind {
    match target {
        LifecycleState::Hibernating | LifecycleState::Hibernated => CostEventKind::CreditHibernate,
        _ => CostEventKind::CreditStop,
    }
}

/// An extension of a window: the backfill for time already past the prepaid
/// end, plus the next block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extension {
    /// New end of the prepaid window.
    pub billed_through: DateTime<Utc>,
    /// Running time past the old prepaid end that had not been debited.
    pub backfill: Money,
    /// The next prepaid block.
    pub advance: Money,
}

/// Extend a window that has less than `refresh` left at `now`.
///
/// Returns `None` while enough prepaid time remains, or while the window
/// already reaches the end of the current budget period.
#[must_use]
pub fn extend(
    rate: CostRate,
    window: &BillingWindow,
    now: DateTime<Utc>,
    block: Duration,
    refresh: Duration,
) -> Option<Extension> {
    if window.billed_through - now > refresh {
        return None;
    }
    let from = window.billed_through.max(now);
    let billed_through = prepaid_until(now, from + block);
    if billed_through <= from {
        return None;
    }
    let backfill = rate.cost_for(now - window.billed_through);
    Some(Extension {
        billed_through,
        backfill,
        advance: rate.cost_for(billed_through - from),
    })
}

/// `until`, capped at the end of the budget period containing `now`.
fn prepaid_until(now: DateTime<Utc>, until: DateTime<Utc>) -> DateTime<Utc> {
    until.min(BudgetPeriod::containing(now).end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn rate() -> CostRate {
        // $2.40/day
        CostRate::per_day(Money::from_dollars(2.40))
    }

    #[test]
    fn open_prepays_one_block() {
        let (window, debit) = open(rate(), t0(), t0(), Duration::hours(1));
        assert_eq!(window.billed_through, t0() + Duration::hours(1));
        assert_eq!(debit, Money::from_dollars(0.10));
    }

    #[test]
    fn open_in_the_past_includes_elapsed_time() {
        let now = t0() + Duration::minutes(30);
        let (window, debit) = open(rate(), t0(), now, Duration::hours(1));
        assert_eq!(window.opened_at, t0());
        assert_eq!(debit, Money::from_dollars(0.15));
    }

    #[test]
    fn close_credits_unused_block() {
        let (window, debit) = open(rate(), t0(), t0(), Duration::hours(1));
        let at = t0() + Duration::minutes(16);
        let closing = close(rate(), &window, at, at, LifecycleState::Hibernated);

        assert_eq!(closing.kind, CostEventKind::CreditHibernate);
        // 16 minutes at $0.10/h
        assert_eq!(debit + closing.amount, Money::from_micros(26_667));
    }

    #[test]
    fn close_past_prepaid_end_debits_the_gap() {
        let (window, _) = open(rate(), t0(), t0(), Duration::hours(1));
        let at = t0() + Duration::hours(3);
        let closing = close(rate(), &window, at, at, LifecycleState::Stopped);
        assert_eq!(closing.kind, CostEventKind::DebitRunning);
        assert_eq!(closing.amount, Money::from_dollars(0.20));
    }

    #[test]
    fn close_clamps_future_instants() {
        let (window, _) = open(rate(), t0(), t0(), Duration::hours(1));
        let now = t0() + Duration::minutes(30);
        let closing = close(rate(), &window, now + Duration::hours(5), now, LifecycleState::Stopped);
        assert_eq!(closing.amount, -Money::from_dollars(0.05));
    }

    #[test]
    fn extend_only_near_the_end() {
        let (window, _) = open(rate(), t0(), t0(), Duration::hours(1));
        let block = Duration::hours(1);
        let refresh = Duration::minutes(10);

        assert!(extend(rate(), &window, t0() + Duration::minutes(30), block, refresh).is_none());

        let ext = extend(rate(), &window, t0() + Duration::minutes(55), block, refresh).unwrap();
        assert_eq!(ext.backfill, Money::ZERO);
        assert_eq!(ext.billed_through, t0() + Duration::hours(2));
        assert_eq!(ext.advance, Money::from_dollars(0.10));
    }

    #[test]
    fn extend_after_downtime_backfills() {
        let (window, _) = open(rate(), t0(), t0(), Duration::hours(1));
        let now = t0() + Duration::hours(4);
        let ext = extend(rate(), &window, now, Duration::hours(1), Duration::minutes(10)).unwrap();
        assert_eq!(ext.backfill, Money::from_dollars(0.30));
        assert_eq!(ext.billed_through, now + Duration::hours(1));
    }

    #[test]
    fn prepaid_block_stops_at_the_period_end() {
        let month_end = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        let launched = month_end - Duration::minutes(20);
        let (window, debit) = open(rate(), launched, launched, Duration::hours(1));
        assert_eq!(window.billed_through, month_end);
        assert_eq!(debit, rate().cost_for(Duration::minutes(20)));

        // No advance into April is bought from March.
        let before = month_end - Duration::minutes(5);
        assert!(extend(rate(), &window, before, Duration::hours(1), Duration::minutes(10)).is_none());

        // Stopped early in April: nothing of March's block is left to credit,
        // the 10 April minutes are debited in April.
        let at = month_end + Duration::minutes(10);
        let closing = close(rate(), &window, at, at, LifecycleState::Stopped);
        assert_eq!(closing.kind, CostEventKind::DebitRunning);
        assert_eq!(closing.amount, rate().cost_for(Duration::minutes(10)));
    }

    #[test]
    fn backdated_close_credits_only_the_current_period() {
        let month_end = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        let window = BillingWindow {
            opened_at: month_end - Duration::hours(2),
            billed_through: month_end + Duration::minutes(30),
        };
        let now = month_end + Duration::minutes(5);
        let closing = close(rate(), &window, month_end - Duration::minutes(30), now, LifecycleState::Stopped);
        assert_eq!(closing.kind, CostEventKind::CreditStop);
        assert_eq!(closing.amount, -rate().cost_for(Duration::minutes(30)));
    }
}
