//! Quota Records and Period Arithmetic
//!
//! Per-user usage records with independent daily and monthly periods.
//! Periods are anchored to UTC: the daily window resets at the next UTC
//! midnight, the monthly window on the 1st of the next month at 00:00 UTC.
//! Counters only ever grow within a period; rollover zeroes them exactly
//! when `now >= reset_at`.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// The four quota metrics, in their fixed evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaMetric {
    /// Requests in the current UTC day
    DailyRequests,
    /// Requests in the current calendar month
    MonthlyRequests,
    /// Spend in the current UTC day (USD)
    DailyCost,
    /// Spend in the current calendar month (USD)
    MonthlyCost,
}

impl QuotaMetric {
    /// Evaluation order for quota checks and alerts
    pub const ALL: [QuotaMetric; 4] = [
        QuotaMetric::DailyRequests,
        QuotaMetric::MonthlyRequests,
        QuotaMetric::DailyCost,
        QuotaMetric::MonthlyCost,
    ];

    /// Stable name used in logs and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaMetric::DailyRequests => "daily_requests",
            QuotaMetric::MonthlyRequests => "monthly_requests",
            QuotaMetric::DailyCost => "daily_cost",
            QuotaMetric::MonthlyCost => "monthly_cost",
        }
    }

    /// Whether this metric belongs to the daily period
    pub fn is_daily(&self) -> bool {
        matches!(self, QuotaMetric::DailyRequests | QuotaMetric::DailyCost)
    }
}

impl std::fmt::Display for QuotaMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage counters for one quota period
///
/// Limits of 0 mean unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodUsage {
    /// Requests recorded in the current period
    pub requests: u64,

    /// Spend recorded in the current period (USD)
    pub cost: f64,

    /// When the current period ends and counters reset
    pub reset_at: DateTime<Utc>,

    /// Request ceiling for the period (0 = unlimited)
    pub request_limit: u64,

    /// Spend ceiling for the period in USD (0 = unlimited)
    pub cost_limit: f64,
}

impl PeriodUsage {
    fn fresh(reset_at: DateTime<Utc>, request_limit: u64, cost_limit: f64) -> Self {
        Self {
            requests: 0,
            cost: 0.0,
            reset_at,
            request_limit,
            cost_limit,
        }
    }

    fn zero(&mut self) {
        self.requests = 0;
        self.cost = 0.0;
    }
}

/// Which periods rolled over during a reset check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rollover {
    pub daily: bool,
    pub monthly: bool,
}

impl Rollover {
    /// True if either period rolled over
    pub fn any(&self) -> bool {
        self.daily || self.monthly
    }
}

/// Per-user quota record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// User this record belongs to
    pub user_id: String,

    /// Tier the limits were initialized from
    pub tier: String,

    /// Daily usage window
    pub daily: PeriodUsage,

    /// Monthly usage window
    pub monthly: PeriodUsage,

    /// When the record was first created
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

impl QuotaRecord {
    /// Create a fresh record for `user_id` with limits taken from the tier.
    ///
    /// The tier's cost limit bounds daily spend; monthly spend starts
    /// unlimited and can be set through a quota override.
    pub fn new(
        user_id: &str,
        tier: &str,
        daily_quota: u64,
        monthly_quota: u64,
        cost_limit: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            tier: tier.to_string(),
            daily: PeriodUsage::fresh(next_utc_midnight(now), daily_quota, cost_limit),
            monthly: PeriodUsage::fresh(next_month_start(now), monthly_quota, 0.0),
            created_at: now,
            updated_at: now,
        }
    }

    /// Zero any period whose boundary has passed and advance its `reset_at`.
    ///
    /// Daily and monthly windows roll independently. The returned
    /// [`Rollover`] says which (if either) rolled, so the caller can clear
    /// the matching alert state.
    pub fn roll_over_if_due(&mut self, now: DateTime<Utc>) -> Rollover {
        let mut rollover = Rollover::default();

        if now >= self.daily.reset_at {
            self.daily.zero();
            self.daily.reset_at = next_utc_midnight(now);
            rollover.daily = true;
        }
        if now >= self.monthly.reset_at {
            self.monthly.zero();
            self.monthly.reset_at = next_month_start(now);
            rollover.monthly = true;
        }
        if rollover.any() {
            self.updated_at = now;
        }

        rollover
    }

    /// Record one admitted request with its cost against both periods.
    pub fn record(&mut self, cost: f64, now: DateTime<Utc>) {
        self.daily.requests += 1;
        self.monthly.requests += 1;
        self.daily.cost += cost;
        self.monthly.cost += cost;
        self.updated_at = now;
    }

    /// Zero both periods and restart them from `now`. Administrative reset,
    /// not a boundary rollover.
    pub fn reset_periods(&mut self, now: DateTime<Utc>) {
        self.daily.zero();
        self.monthly.zero();
        self.daily.reset_at = next_utc_midnight(now);
        self.monthly.reset_at = next_month_start(now);
        self.updated_at = now;
    }

    /// Current value, limit, and period end for one metric.
    pub fn metric(&self, metric: QuotaMetric) -> (f64, f64, DateTime<Utc>) {
        match metric {
            QuotaMetric::DailyRequests => (
                self.daily.requests as f64,
                self.daily.request_limit as f64,
                self.daily.reset_at,
            ),
            QuotaMetric::MonthlyRequests => (
                self.monthly.requests as f64,
                self.monthly.request_limit as f64,
                self.monthly.reset_at,
            ),
            QuotaMetric::DailyCost => (self.daily.cost, self.daily.cost_limit, self.daily.reset_at),
            QuotaMetric::MonthlyCost => (
                self.monthly.cost,
                self.monthly.cost_limit,
                self.monthly.reset_at,
            ),
        }
    }
}

/// Next UTC midnight strictly after `now`.
pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    (now.date_naive() + chrono::Days::new(1))
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc()
}

/// 00:00 UTC on the 1st of the month after `now`.
pub fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .expect("first of month is a valid timestamp")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_next_utc_midnight() {
        let now = utc(2025, 3, 15, 14, 30, 0);
        assert_eq!(next_utc_midnight(now), utc(2025, 3, 16, 0, 0, 0));
    }

    #[test]
    fn test_next_utc_midnight_at_exact_midnight_advances() {
        let now = utc(2025, 3, 15, 0, 0, 0);
        assert_eq!(next_utc_midnight(now), utc(2025, 3, 16, 0, 0, 0));
    }

    #[test]
    fn test_next_utc_midnight_across_month_end() {
        let now = utc(2025, 1, 31, 23, 59, 59);
        assert_eq!(next_utc_midnight(now), utc(2025, 2, 1, 0, 0, 0));
    }

    #[test]
    fn test_next_month_start() {
        let now = utc(2025, 3, 15, 14, 30, 0);
        assert_eq!(next_month_start(now), utc(2025, 4, 1, 0, 0, 0));
    }

    #[test]
    fn test_next_month_start_december_wraps_year() {
        let now = utc(2025, 12, 31, 23, 0, 0);
        assert_eq!(next_month_start(now), utc(2026, 1, 1, 0, 0, 0));
    }

    #[test]
    fn test_new_record_has_zero_usage_and_future_resets() {
        let now = utc(2025, 6, 10, 12, 0, 0);
        let record = QuotaRecord::new("alice", "free", 100, 2000, 5.0, now);

        assert_eq!(record.daily.requests, 0);
        assert_eq!(record.monthly.requests, 0);
        assert_eq!(record.daily.reset_at, utc(2025, 6, 11, 0, 0, 0));
        assert_eq!(record.monthly.reset_at, utc(2025, 7, 1, 0, 0, 0));
        assert_eq!(record.daily.request_limit, 100);
        assert_eq!(record.daily.cost_limit, 5.0);
        // Monthly spend starts unlimited
        assert_eq!(record.monthly.cost_limit, 0.0);
    }

    #[test]
    fn test_record_increments_both_periods() {
        let now = utc(2025, 6, 10, 12, 0, 0);
        let mut record = QuotaRecord::new("alice", "free", 100, 2000, 5.0, now);

        record.record(0.02, now);
        record.record(0.02, now);

        assert_eq!(record.daily.requests, 2);
        assert_eq!(record.monthly.requests, 2);
        assert!((record.daily.cost - 0.04).abs() < 1e-9);
        assert!((record.monthly.cost - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_rollover_zeroes_daily_only() {
        let created = utc(2025, 6, 10, 12, 0, 0);
        let mut record = QuotaRecord::new("alice", "free", 100, 2000, 5.0, created);
        record.record(1.0, created);

        // Past the daily boundary, before the monthly one
        let later = utc(2025, 6, 11, 0, 0, 1);
        let rollover = record.roll_over_if_due(later);

        assert!(rollover.daily);
        assert!(!rollover.monthly);
        assert_eq!(record.daily.requests, 0);
        assert_eq!(record.daily.cost, 0.0);
        assert_eq!(record.monthly.requests, 1);
        assert_eq!(record.daily.reset_at, utc(2025, 6, 12, 0, 0, 0));
        assert!(record.daily.reset_at > later);
    }

    #[test]
    fn test_rollover_zeroes_both_when_overdue() {
        let created = utc(2025, 6, 10, 12, 0, 0);
        let mut record = QuotaRecord::new("alice", "free", 100, 2000, 5.0, created);
        record.record(1.0, created);

        // Well past both boundaries (record untouched for weeks)
        let later = utc(2025, 8, 3, 9, 0, 0);
        let rollover = record.roll_over_if_due(later);

        assert!(rollover.daily && rollover.monthly);
        assert_eq!(record.daily.requests, 0);
        assert_eq!(record.monthly.requests, 0);
        assert_eq!(record.daily.reset_at, utc(2025, 8, 4, 0, 0, 0));
        assert_eq!(record.monthly.reset_at, utc(2025, 9, 1, 0, 0, 0));
    }

    #[test]
    fn test_rollover_noop_within_period() {
        let created = utc(2025, 6, 10, 12, 0, 0);
        let mut record = QuotaRecord::new("alice", "free", 100, 2000, 5.0, created);
        record.record(1.0, created);

        let rollover = record.roll_over_if_due(utc(2025, 6, 10, 23, 59, 59));
        assert!(!rollover.any());
        assert_eq!(record.daily.requests, 1);
    }

    #[test]
    fn test_metric_order_is_fixed() {
        assert_eq!(
            QuotaMetric::ALL,
            [
                QuotaMetric::DailyRequests,
                QuotaMetric::MonthlyRequests,
                QuotaMetric::DailyCost,
                QuotaMetric::MonthlyCost,
            ]
        );
    }

    #[test]
    fn test_metric_accessor() {
        let now = utc(2025, 6, 10, 12, 0, 0);
        let mut record = QuotaRecord::new("alice", "free", 100, 2000, 5.0, now);
        record.record(0.5, now);

        let (current, limit, reset_at) = record.metric(QuotaMetric::DailyRequests);
        assert_eq!(current, 1.0);
        assert_eq!(limit, 100.0);
        assert_eq!(reset_at, record.daily.reset_at);

        let (cost, cost_limit, _) = record.metric(QuotaMetric::DailyCost);
        assert_eq!(cost, 0.5);
        assert_eq!(cost_limit, 5.0);
    }
}
