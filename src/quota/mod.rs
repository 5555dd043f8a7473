//! Quota Tracking Module
//!
//! Per-user daily/monthly request and cost budgets with lazy and scheduled
//! period resets, threshold alerting, and a pluggable storage backend.

pub mod record;
pub mod store;
pub mod tracker;

pub use record::{next_month_start, next_utc_midnight, PeriodUsage, QuotaMetric, QuotaRecord};
pub use store::{InMemoryQuotaStore, QuotaStore};
pub use tracker::{
    QuotaAlert, QuotaAnalytics, QuotaBreach, QuotaCheck, QuotaOverride, QuotaTracker, SweepHandle,
    UserQuotaSnapshot, RESET_SWEEP_INTERVAL,
};
