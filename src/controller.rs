//! Admission Controller
//!
//! Coordinates the full admission cascade for one outbound model request:
//! the global bucket, then the provider, model, and user buckets, then the
//! user's daily/monthly quotas. Consumption is all-or-nothing: the first
//! stage that refuses rolls back every bucket consumed by the same call,
//! so a denied request leaves no net effect. Denials are data, not errors;
//! only infrastructure failures surface as `Err`.
//!
//! Bucket stages never cross an await. The async surface exists for the
//! pluggable quota store; the bundled in-memory store resolves instantly.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use crate::bucket::TokenBucket;
use crate::config::AdmissionConfig;
use crate::error::AdmissionError;
use crate::metrics;
use crate::queue::Priority;
use crate::quota::{
    InMemoryQuotaStore, QuotaBreach, QuotaCheck, QuotaMetric, QuotaRecord, QuotaStore,
    QuotaTracker, SweepHandle, RESET_SWEEP_INTERVAL,
};
use crate::tiers::TierRegistry;

/// Which tier of the cascade refused a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Global,
    Provider,
    Model,
    User,
    Quota,
}

impl LimitKind {
    /// Label value used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Global => "global",
            LimitKind::Provider => "provider",
            LimitKind::Model => "model",
            LimitKind::User => "user",
            LimitKind::Quota => "quota",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an admission check
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    /// Whether the request is admitted
    pub allowed: bool,

    /// Tier that refused (if not allowed)
    pub limit: Option<LimitKind>,

    /// Exhausted quota metric (quota denials only)
    pub metric: Option<QuotaMetric>,

    /// Time until the refusing bucket can cover the request
    pub retry_after: Option<Duration>,

    /// Whole tokens left on the deciding bucket
    pub remaining: Option<u32>,

    /// When the exhausted quota period resets (quota denials only)
    pub reset_at: Option<DateTime<Utc>>,
}

impl Decision {
    /// Create an admitted decision
    pub fn admitted(remaining: u32) -> Self {
        Self {
            allowed: true,
            limit: None,
            metric: None,
            retry_after: None,
            remaining: Some(remaining),
            reset_at: None,
        }
    }

    /// Create a decision denied by a bucket tier
    pub fn denied(limit: LimitKind, retry_after: Duration, remaining: u32) -> Self {
        Self {
            allowed: false,
            limit: Some(limit),
            metric: None,
            retry_after: Some(retry_after),
            remaining: Some(remaining),
            reset_at: None,
        }
    }

    /// Create a decision denied by an exhausted quota metric
    pub fn quota_denied(breach: &QuotaBreach) -> Self {
        Self {
            allowed: false,
            limit: Some(LimitKind::Quota),
            metric: Some(breach.metric),
            retry_after: None,
            remaining: None,
            reset_at: Some(breach.reset_at),
        }
    }
}

/// Multi-tier admission controller
///
/// Owns every bucket and the quota tracker. Independent controllers share
/// nothing, so several can coexist in one process.
pub struct AdmissionController {
    config: Arc<AdmissionConfig>,
    tiers: TierRegistry,
    quotas: QuotaTracker,
    sweep: StdMutex<Option<SweepHandle>>,
}

impl AdmissionController {
    /// Create a controller backed by the in-memory quota store
    pub fn new(config: AdmissionConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryQuotaStore::new()))
    }

    /// Create a controller over a custom quota storage backend
    pub fn with_store(config: AdmissionConfig, store: Arc<dyn QuotaStore>) -> Self {
        let config = Arc::new(config);
        let tiers = TierRegistry::new(config.clone());
        let quotas = QuotaTracker::new(config.clone(), store);
        Self {
            config,
            tiers,
            quotas,
            sweep: StdMutex::new(None),
        }
    }

    /// The configuration this controller was built from
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// The quota tracker, for usage tracking, overrides, and analytics
    pub fn quotas(&self) -> &QuotaTracker {
        &self.quotas
    }

    /// Run the admission cascade for one request.
    ///
    /// Stages run in fixed order: global bucket, provider bucket, model
    /// bucket, user bucket, then quota. Providers and models without
    /// configured limits are skipped. On any refusal every token consumed
    /// by this call is released before the decision is returned.
    ///
    /// # Errors
    ///
    /// Returns an error only when the quota store fails; rate-limit and
    /// quota denials come back as `Decision { allowed: false, .. }`.
    pub async fn check(
        &self,
        user_id: &str,
        provider: &str,
        model_id: &str,
        priority: Priority,
    ) -> Result<Decision, AdmissionError> {
        metrics::ADMISSION_CHECKS_TOTAL.inc();

        let binding = self.tiers.user_binding(user_id).await;

        let stages: [(LimitKind, Option<&Arc<TokenBucket>>); 4] = [
            (LimitKind::Global, Some(self.tiers.global())),
            (LimitKind::Provider, self.tiers.provider(provider)),
            (LimitKind::Model, self.tiers.model(model_id)),
            (LimitKind::User, Some(&binding.bucket)),
        ];

        let mut consumed: Vec<&Arc<TokenBucket>> = Vec::with_capacity(stages.len());
        for (kind, bucket) in stages {
            let Some(bucket) = bucket else { continue };
            if bucket.try_consume(1) {
                consumed.push(bucket);
                continue;
            }

            for held in &consumed {
                held.release(1);
            }
            metrics::ADMISSION_DENIED_TOTAL
                .with_label_values(&[kind.as_str()])
                .inc();
            tracing::debug!(
                user = %user_id,
                provider = %provider,
                model = %model_id,
                priority = %priority,
                limit = %kind,
                "Admission denied by bucket"
            );
            return Ok(Decision::denied(
                kind,
                bucket.time_until_available(1),
                bucket.available().floor() as u32,
            ));
        }

        // Buckets passed; quota is the final gate
        let cost = self.tiers.model_cost(model_id);
        let breach = match self.quotas.check_and_track(user_id, &binding.tier, cost).await {
            Ok(QuotaCheck::Within(_)) => None,
            Ok(QuotaCheck::Breached(breach)) => Some(breach),
            Err(e) => {
                for held in &consumed {
                    held.release(1);
                }
                return Err(e.into());
            }
        };

        if let Some(breach) = breach {
            for held in &consumed {
                held.release(1);
            }
            metrics::ADMISSION_DENIED_TOTAL
                .with_label_values(&[LimitKind::Quota.as_str()])
                .inc();
            tracing::debug!(
                user = %user_id,
                provider = %provider,
                model = %model_id,
                priority = %priority,
                metric = %breach.metric,
                "Admission denied by quota"
            );
            return Ok(Decision::quota_denied(&breach));
        }

        Ok(Decision::admitted(binding.bucket.available().floor() as u32))
    }

    /// Return the tokens an admitted check consumed when its request was
    /// abandoned before running (the queue admitted an entry that had
    /// already timed out or been cancelled). Recorded quota usage stands.
    pub(crate) async fn release_admission(&self, user_id: &str, provider: &str, model_id: &str) {
        self.tiers.global().release(1);
        if let Some(bucket) = self.tiers.provider(provider) {
            bucket.release(1);
        }
        if let Some(bucket) = self.tiers.model(model_id) {
            bucket.release(1);
        }
        let binding = self.tiers.user_binding(user_id).await;
        binding.bucket.release(1);
    }

    /// (Re)bind a user to a tier: fresh bucket from the tier template and
    /// the tier's quota limits applied to their record.
    ///
    /// # Errors
    ///
    /// Fails when the tier is not configured or the quota store fails.
    pub async fn set_user_tier(&self, user_id: &str, tier: &str) -> Result<(), AdmissionError> {
        self.tiers.set_user_tier(user_id, tier).await?;
        self.quotas.rebind_tier(user_id, tier).await?;
        Ok(())
    }

    /// The tier a user is bound to, if they have been seen
    pub async fn user_tier(&self, user_id: &str) -> Option<String> {
        self.tiers.user_tier(user_id).await
    }

    /// A user's quota record with lazy period resets applied
    pub async fn get_user_quota(
        &self,
        user_id: &str,
    ) -> Result<Option<QuotaRecord>, AdmissionError> {
        Ok(self.quotas.get_quota(user_id).await?)
    }

    /// Zero a user's quota counters and restart both periods
    pub async fn reset_user_quota(
        &self,
        user_id: &str,
    ) -> Result<Option<QuotaRecord>, AdmissionError> {
        Ok(self.quotas.reset_quota(user_id).await?)
    }

    /// Start the hourly background sweep that rolls overdue quota periods.
    ///
    /// Idempotent: a sweep that is already running is left alone.
    pub fn start_reset_sweep(&self) {
        let mut slot = self.sweep.lock().unwrap();
        if slot.is_none() {
            *slot = Some(self.quotas.spawn_reset_sweep(RESET_SWEEP_INTERVAL));
        }
    }

    /// Stop the reset sweep and close the quota store.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails to close.
    pub async fn shutdown(&self) -> Result<(), AdmissionError> {
        let sweep = self.sweep.lock().unwrap().take();
        if let Some(handle) = sweep {
            handle.stop().await;
        }
        self.quotas.close().await?;
        Ok(())
    }
}
