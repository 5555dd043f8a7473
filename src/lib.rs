//! Multi-Tier Admission Control for Model Providers
//!
//! This library decides whether an outbound request to an external AI model
//! provider may proceed right now. Admission runs a cascade of token
//! buckets (global, provider, model, user tier) followed by the user's
//! daily/monthly request and cost quotas; requests that cannot be admitted
//! immediately can wait in a priority queue drained in the background.
//!
//! # Features
//!
//! - Continuous-refill token buckets with burst ceilings and capped release
//! - All-or-nothing cascade: a denial rolls back every consumed token
//! - Priority wait queue with deadlines, head-of-line draining, and a
//!   concurrency cap
//! - Per-user daily/monthly request and cost quotas with lazy UTC period
//!   resets and threshold alerting
//! - Pluggable quota storage (in-memory store bundled)
//! - JSON configuration with environment variable overrides
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                   Admission Controller                     │
//! ├────────────────────────────────────────────────────────────┤
//! │  ┌────────┐   ┌──────────┐   ┌────────┐   ┌────────────┐  │
//! │  │ Global │ → │ Provider │ → │ Model  │ → │ User Tier  │  │
//! │  │ bucket │   │ buckets  │   │ buckets│   │ buckets    │  │
//! │  └────────┘   └──────────┘   └────────┘   └────────────┘  │
//! ├────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────┐      ┌───────────────────────────┐ │
//! │  │    Wait Queue     │      │   Quota Tracker / Store   │ │
//! │  │ (priority, drain) │      │ (daily/monthly, alerts)   │ │
//! │  └───────────────────┘      └───────────────────────────┘ │
//! └────────────────────────────────────────────────────────────┘
//! ```

pub mod bucket;
pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod quota;
mod tiers;

pub use bucket::TokenBucket;
pub use config::{AdmissionConfig, GlobalConfig, ModelConfig, ProviderConfig, TierConfig};
pub use controller::{AdmissionController, Decision, LimitKind};
pub use error::{AdmissionError, StorageError};
pub use queue::{PendingAdmission, Priority, WaitQueue};
pub use quota::{
    InMemoryQuotaStore, QuotaAlert, QuotaAnalytics, QuotaBreach, QuotaCheck, QuotaMetric,
    QuotaOverride, QuotaRecord, QuotaStore, QuotaTracker, SweepHandle, UserQuotaSnapshot,
};
