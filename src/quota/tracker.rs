//! Quota Tracking and Alerting
//!
//! The tracker owns the storage handle and is the only writer of quota
//! records. It applies lazy period resets on every access, enforces the
//! four quota metrics in a fixed order, fires threshold alerts at most once
//! per (metric, threshold) per period over a broadcast channel, and runs an
//! hourly sweep that rolls records for users who went quiet across a
//! period boundary.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{AdmissionConfig, DEFAULT_TIER};
use crate::error::StorageError;
use crate::metrics;
use crate::quota::record::{QuotaMetric, QuotaRecord, Rollover};
use crate::quota::store::QuotaStore;

/// How often the background sweep revisits every stored record
pub const RESET_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Capacity of the alert broadcast channel
const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Details of an exhausted quota metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaBreach {
    /// Which metric ran out
    pub metric: QuotaMetric,

    /// Configured ceiling for the metric
    pub limit: f64,

    /// Usage at the time of the breach
    pub current: f64,

    /// When the metric's period resets
    pub reset_at: DateTime<Utc>,
}

/// Threshold-crossing notification delivered to alert subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaAlert {
    /// User whose usage crossed the threshold
    pub user_id: String,

    /// Metric that crossed
    pub metric: QuotaMetric,

    /// Threshold fraction that was crossed (e.g. 0.8)
    pub threshold: f64,

    /// Usage when the alert fired
    pub current: f64,

    /// Configured ceiling for the metric
    pub limit: f64,

    /// When the alert fired
    pub at: DateTime<Utc>,
}

/// Outcome of evaluating a request against a user's quota
#[derive(Debug, Clone)]
pub enum QuotaCheck {
    /// Usage recorded; the updated record is returned
    Within(QuotaRecord),
    /// A metric is exhausted; nothing was recorded
    Breached(QuotaBreach),
}

/// Administrative limit adjustments; `None` leaves a limit unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaOverride {
    pub daily_quota: Option<u64>,
    pub monthly_quota: Option<u64>,
    pub daily_cost_limit: Option<f64>,
    pub monthly_cost_limit: Option<f64>,
}

/// Aggregate usage snapshot across all users
#[derive(Debug, Clone, Serialize)]
pub struct QuotaAnalytics {
    pub generated_at: DateTime<Utc>,
    pub total_users: usize,
    pub total_daily_requests: u64,
    pub total_monthly_requests: u64,
    pub total_daily_cost: f64,
    pub total_monthly_cost: f64,
    /// Per-user snapshots, busiest (by daily requests) first
    pub users: Vec<UserQuotaSnapshot>,
}

/// One user's row in [`QuotaAnalytics`]
#[derive(Debug, Clone, Serialize)]
pub struct UserQuotaSnapshot {
    pub user_id: String,
    pub tier: String,
    pub daily_requests: u64,
    pub daily_request_limit: u64,
    pub daily_utilization_percent: f64,
    pub monthly_requests: u64,
    pub monthly_request_limit: u64,
    pub monthly_utilization_percent: f64,
    pub daily_cost: f64,
    pub monthly_cost: f64,
}

/// Alert dedup key: metric plus threshold in per-mille
type FiredAlerts = HashSet<(QuotaMetric, u32)>;

fn threshold_key(threshold: f64) -> u32 {
    (threshold * 1000.0).round() as u32
}

fn utilization_percent(current: f64, limit: f64) -> f64 {
    if limit > 0.0 {
        (current / limit) * 100.0
    } else {
        0.0
    }
}

/// Tracks per-user daily/monthly usage against tier quotas
#[derive(Clone)]
pub struct QuotaTracker {
    config: Arc<AdmissionConfig>,
    store: Arc<dyn QuotaStore>,
    fired: Arc<Mutex<HashMap<String, FiredAlerts>>>,
    alert_tx: broadcast::Sender<QuotaAlert>,
    // Serializes evaluate-then-record so concurrent checks cannot both pass
    // on the last unit of quota
    update_lock: Arc<Mutex<()>>,
}

impl QuotaTracker {
    /// Create a tracker over the given store
    pub fn new(config: Arc<AdmissionConfig>, store: Arc<dyn QuotaStore>) -> Self {
        let (alert_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            config,
            store,
            fired: Arc::new(Mutex::new(HashMap::new())),
            alert_tx,
            update_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Subscribe to quota threshold alerts.
    ///
    /// Delivery is best-effort: a receiver that falls behind the channel
    /// capacity drops the oldest alerts.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<QuotaAlert> {
        self.alert_tx.subscribe()
    }

    /// Fetch (or lazily create) the record for `user_id`, initialized from
    /// the named tier's limits. Any overdue period is rolled before the
    /// record is returned.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        tier: &str,
    ) -> Result<QuotaRecord, StorageError> {
        let _guard = self.update_lock.lock().await;
        self.load_or_init(user_id, tier).await
    }

    /// Fetch the record for `user_id` with lazy reset applied, or `None` if
    /// the user has never been tracked.
    pub async fn get_quota(&self, user_id: &str) -> Result<Option<QuotaRecord>, StorageError> {
        let _guard = self.update_lock.lock().await;

        let Some(mut record) = self.store.get(user_id).await? else {
            return Ok(None);
        };
        let rollover = record.roll_over_if_due(Utc::now());
        if rollover.any() {
            self.clear_fired_for(user_id, rollover).await;
            self.store.set(&record).await?;
        }
        Ok(Some(record))
    }

    /// Evaluate the user's quota and, if within limits, record one request
    /// of the given cost. Breaches leave the record untouched.
    pub async fn check_and_track(
        &self,
        user_id: &str,
        tier: &str,
        cost: f64,
    ) -> Result<QuotaCheck, StorageError> {
        let _guard = self.update_lock.lock().await;

        let mut record = self.load_or_init(user_id, tier).await?;
        if let Some(breach) = self.is_exceeded(&record) {
            tracing::debug!(
                user = %user_id,
                metric = %breach.metric,
                current = breach.current,
                limit = breach.limit,
                "Quota exhausted"
            );
            return Ok(QuotaCheck::Breached(breach));
        }

        record.record(cost, Utc::now());
        self.store.set(&record).await?;
        self.check_alerts(&record).await;

        Ok(QuotaCheck::Within(record))
    }

    /// Record usage without an admission check (post-hoc adjustments,
    /// token-metered top-ups). Creates the record from the default tier if
    /// the user is unknown.
    pub async fn track_usage(
        &self,
        user_id: &str,
        cost: f64,
    ) -> Result<QuotaRecord, StorageError> {
        let _guard = self.update_lock.lock().await;

        let mut record = self.load_or_init(user_id, DEFAULT_TIER).await?;
        record.record(cost, Utc::now());
        self.store.set(&record).await?;
        self.check_alerts(&record).await;

        Ok(record)
    }

    /// First exhausted metric in the fixed evaluation order, if any.
    ///
    /// Limits of 0 are unlimited and never trigger.
    pub fn is_exceeded(&self, record: &QuotaRecord) -> Option<QuotaBreach> {
        for metric in QuotaMetric::ALL {
            let (current, limit, reset_at) = record.metric(metric);
            if limit > 0.0 && current >= limit {
                return Some(QuotaBreach {
                    metric,
                    limit,
                    current,
                    reset_at,
                });
            }
        }
        None
    }

    /// Adjust a user's limits in place, creating the record from the
    /// default tier if needed. Alert state for every changed metric is
    /// cleared so thresholds re-arm against the new limit.
    pub async fn override_quota(
        &self,
        user_id: &str,
        overrides: QuotaOverride,
    ) -> Result<QuotaRecord, StorageError> {
        let _guard = self.update_lock.lock().await;

        let mut record = self.load_or_init(user_id, DEFAULT_TIER).await?;
        let mut changed = Vec::new();

        if let Some(limit) = overrides.daily_quota {
            record.daily.request_limit = limit;
            changed.push(QuotaMetric::DailyRequests);
        }
        if let Some(limit) = overrides.monthly_quota {
            record.monthly.request_limit = limit;
            changed.push(QuotaMetric::MonthlyRequests);
        }
        if let Some(limit) = overrides.daily_cost_limit {
            record.daily.cost_limit = limit;
            changed.push(QuotaMetric::DailyCost);
        }
        if let Some(limit) = overrides.monthly_cost_limit {
            record.monthly.cost_limit = limit;
            changed.push(QuotaMetric::MonthlyCost);
        }

        record.updated_at = Utc::now();
        self.store.set(&record).await?;

        if !changed.is_empty() {
            let mut fired = self.fired.lock().await;
            if let Some(set) = fired.get_mut(user_id) {
                set.retain(|(metric, _)| !changed.contains(metric));
            }
            tracing::info!("Quota override applied for {}: {:?}", user_id, changed);
        }

        Ok(record)
    }

    /// Move a user onto a different tier's limits.
    ///
    /// Usage counters carry over; the tier's daily/monthly request limits
    /// and daily cost limit replace the old ones, and alert state for those
    /// metrics re-arms. The monthly cost limit is override-only and stays
    /// untouched. Unknown users get a fresh record on the new tier.
    pub async fn rebind_tier(
        &self,
        user_id: &str,
        tier: &str,
    ) -> Result<QuotaRecord, StorageError> {
        let _guard = self.update_lock.lock().await;

        let mut record = self.load_or_init(user_id, tier).await?;
        let limits = self.config.tier(tier).cloned().unwrap_or_default();

        record.tier = tier.to_string();
        record.daily.request_limit = limits.daily_quota;
        record.monthly.request_limit = limits.monthly_quota;
        record.daily.cost_limit = limits.cost_limit;
        record.updated_at = Utc::now();
        self.store.set(&record).await?;

        let changed = [
            QuotaMetric::DailyRequests,
            QuotaMetric::MonthlyRequests,
            QuotaMetric::DailyCost,
        ];
        let mut fired = self.fired.lock().await;
        if let Some(set) = fired.get_mut(user_id) {
            set.retain(|(metric, _)| !changed.contains(metric));
        }
        tracing::info!("Rebound {} to tier '{}'", user_id, tier);

        Ok(record)
    }

    /// Zero a user's counters and restart both periods from now. Returns
    /// `None` if the user has never been tracked.
    pub async fn reset_quota(&self, user_id: &str) -> Result<Option<QuotaRecord>, StorageError> {
        let _guard = self.update_lock.lock().await;

        let Some(mut record) = self.store.get(user_id).await? else {
            return Ok(None);
        };
        record.reset_periods(Utc::now());
        self.store.set(&record).await?;
        self.fired.lock().await.remove(user_id);

        tracing::info!("Quota reset for {}", user_id);
        Ok(Some(record))
    }

    /// Aggregate usage snapshot across all stored records.
    ///
    /// Overdue periods are rolled in the returned view (display only; the
    /// sweep persists rollovers).
    pub async fn analytics(&self) -> Result<QuotaAnalytics, StorageError> {
        let now = Utc::now();
        let mut records = self.store.get_all().await?;

        let mut users = Vec::with_capacity(records.len());
        let mut totals = (0u64, 0u64, 0.0f64, 0.0f64);

        for record in &mut records {
            record.roll_over_if_due(now);

            totals.0 += record.daily.requests;
            totals.1 += record.monthly.requests;
            totals.2 += record.daily.cost;
            totals.3 += record.monthly.cost;

            users.push(UserQuotaSnapshot {
                user_id: record.user_id.clone(),
                tier: record.tier.clone(),
                daily_requests: record.daily.requests,
                daily_request_limit: record.daily.request_limit,
                daily_utilization_percent: utilization_percent(
                    record.daily.requests as f64,
                    record.daily.request_limit as f64,
                ),
                monthly_requests: record.monthly.requests,
                monthly_request_limit: record.monthly.request_limit,
                monthly_utilization_percent: utilization_percent(
                    record.monthly.requests as f64,
                    record.monthly.request_limit as f64,
                ),
                daily_cost: record.daily.cost,
                monthly_cost: record.monthly.cost,
            });
        }

        users.sort_by(|a, b| {
            b.daily_requests
                .cmp(&a.daily_requests)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });

        Ok(QuotaAnalytics {
            generated_at: now,
            total_users: users.len(),
            total_daily_requests: totals.0,
            total_monthly_requests: totals.1,
            total_daily_cost: totals.2,
            total_monthly_cost: totals.3,
            users,
        })
    }

    /// Spawn the hourly sweep that rolls overdue periods for every record.
    ///
    /// The task ticks immediately on start (self-heal after restarts) and
    /// stops when the returned handle is awaited via [`SweepHandle::stop`].
    pub fn spawn_reset_sweep(&self, interval: Duration) -> SweepHandle {
        let tracker = self.clone();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        tracing::debug!("Quota reset sweep stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = tracker.sweep_once().await {
                            tracing::error!("Quota reset sweep failed: {}", e);
                        }
                    }
                }
            }
        });

        SweepHandle {
            shutdown_tx,
            handle,
        }
    }

    /// Roll every stored record whose period boundary has passed.
    pub async fn sweep_once(&self) -> Result<usize, StorageError> {
        // Holding the update lock keeps the sweep from writing a rolled
        // copy over a concurrent usage increment
        let _guard = self.update_lock.lock().await;

        let now = Utc::now();
        let records = self.store.get_all().await?;
        let mut rolled = 0usize;

        for mut record in records {
            let rollover = record.roll_over_if_due(now);
            if rollover.any() {
                self.clear_fired_for(&record.user_id, rollover).await;
                self.store.set(&record).await?;
                rolled += 1;
            }
        }

        if rolled > 0 {
            tracing::debug!("Quota sweep rolled {} record(s)", rolled);
        }
        Ok(rolled)
    }

    /// Close the underlying store.
    pub async fn close(&self) -> Result<(), StorageError> {
        self.store.close().await
    }

    /// Load the record, applying lazy rollover, or create it from the named
    /// tier. Callers hold `update_lock`.
    async fn load_or_init(&self, user_id: &str, tier: &str) -> Result<QuotaRecord, StorageError> {
        if let Some(mut record) = self.store.get(user_id).await? {
            let rollover = record.roll_over_if_due(Utc::now());
            if rollover.any() {
                self.clear_fired_for(user_id, rollover).await;
                self.store.set(&record).await?;
                tracing::debug!(
                    "Rolled quota period(s) for {} (daily: {}, monthly: {})",
                    user_id,
                    rollover.daily,
                    rollover.monthly
                );
            }
            return Ok(record);
        }

        let limits = self.config.tier(tier).cloned().unwrap_or_default();
        let record = QuotaRecord::new(
            user_id,
            tier,
            limits.daily_quota,
            limits.monthly_quota,
            limits.cost_limit,
            Utc::now(),
        );
        self.store.set(&record).await?;
        tracing::debug!("Created quota record for {} on tier '{}'", user_id, tier);
        Ok(record)
    }

    /// Fire any newly crossed thresholds for the record's metrics.
    async fn check_alerts(&self, record: &QuotaRecord) {
        let now = Utc::now();
        let mut fired = self.fired.lock().await;
        let user_fired = fired.entry(record.user_id.clone()).or_default();

        for metric in QuotaMetric::ALL {
            let (current, limit, _) = record.metric(metric);
            if limit <= 0.0 {
                continue;
            }

            for &threshold in self.config.alert_thresholds.iter() {
                let key = (metric, threshold_key(threshold));
                if user_fired.contains(&key) || current / limit < threshold {
                    continue;
                }
                user_fired.insert(key);

                let alert = QuotaAlert {
                    user_id: record.user_id.clone(),
                    metric,
                    threshold,
                    current,
                    limit,
                    at: now,
                };
                tracing::warn!(
                    user = %alert.user_id,
                    metric = %alert.metric,
                    threshold = alert.threshold,
                    current = alert.current,
                    limit = alert.limit,
                    "Quota threshold crossed"
                );
                metrics::QUOTA_ALERTS_TOTAL
                    .with_label_values(&[metric.as_str()])
                    .inc();
                let _ = self.alert_tx.send(alert);
            }
        }
    }

    /// Drop fired-alert state for the periods that rolled over.
    async fn clear_fired_for(&self, user_id: &str, rollover: Rollover) {
        let mut fired = self.fired.lock().await;
        if let Some(set) = fired.get_mut(user_id) {
            set.retain(|(metric, _)| {
                if metric.is_daily() {
                    !rollover.daily
                } else {
                    !rollover.monthly
                }
            });
        }
    }
}

/// Handle for the background reset sweep task
pub struct SweepHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweepHandle {
    /// Signal the sweep to stop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierConfig;
    use crate::quota::record::next_utc_midnight;
    use crate::quota::store::InMemoryQuotaStore;
    use chrono::TimeZone;

    fn test_config() -> Arc<AdmissionConfig> {
        let mut config = AdmissionConfig::default();
        config.user_tiers.insert(
            "tiny".to_string(),
            TierConfig {
                requests_per_second: 100.0,
                burst_capacity: 100.0,
                daily_quota: 3,
                monthly_quota: 100,
                cost_limit: 1.0,
            },
        );
        Arc::new(config)
    }

    fn tracker_with_store() -> (QuotaTracker, Arc<InMemoryQuotaStore>) {
        let store = Arc::new(InMemoryQuotaStore::new());
        let tracker = QuotaTracker::new(test_config(), store.clone());
        (tracker, store)
    }

    #[tokio::test]
    async fn test_get_or_create_initializes_from_tier() {
        let (tracker, _store) = tracker_with_store();

        let record = tracker.get_or_create("alice", "tiny").await.unwrap();
        assert_eq!(record.tier, "tiny");
        assert_eq!(record.daily.request_limit, 3);
        assert_eq!(record.monthly.request_limit, 100);
        assert_eq!(record.daily.cost_limit, 1.0);
        assert_eq!(record.daily.requests, 0);
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (tracker, _store) = tracker_with_store();

        tracker.get_or_create("alice", "tiny").await.unwrap();
        tracker.track_usage("alice", 0.1).await.unwrap();

        // Second call returns the existing record, not a fresh one
        let record = tracker.get_or_create("alice", "tiny").await.unwrap();
        assert_eq!(record.daily.requests, 1);
    }

    #[tokio::test]
    async fn test_lazy_reset_on_get_or_create() {
        let (tracker, store) = tracker_with_store();

        // Record created in the past: both reset boundaries are long gone
        let past = Utc.with_ymd_and_hms(2020, 1, 15, 10, 0, 0).unwrap();
        let mut stale = QuotaRecord::new("alice", "tiny", 3, 100, 1.0, past);
        stale.record(0.5, past);
        stale.record(0.5, past);
        store.set(&stale).await.unwrap();

        let record = tracker.get_or_create("alice", "tiny").await.unwrap();
        assert_eq!(record.daily.requests, 0);
        assert_eq!(record.monthly.requests, 0);
        assert_eq!(record.daily.cost, 0.0);
        let now = Utc::now();
        assert!(record.daily.reset_at > now);
        assert_eq!(record.daily.reset_at, next_utc_midnight(now));

        // The rolled record was persisted
        let stored = store.get("alice").await.unwrap().unwrap();
        assert_eq!(stored.daily.requests, 0);
    }

    #[tokio::test]
    async fn test_check_and_track_breaches_daily_limit() {
        let (tracker, _store) = tracker_with_store();

        for _ in 0..3 {
            match tracker.check_and_track("alice", "tiny", 0.0).await.unwrap() {
                QuotaCheck::Within(_) => {}
                QuotaCheck::Breached(b) => panic!("unexpected breach: {b:?}"),
            }
        }

        match tracker.check_and_track("alice", "tiny", 0.0).await.unwrap() {
            QuotaCheck::Breached(breach) => {
                assert_eq!(breach.metric, QuotaMetric::DailyRequests);
                assert_eq!(breach.limit, 3.0);
                assert_eq!(breach.current, 3.0);
                assert!(breach.reset_at > Utc::now());
            }
            QuotaCheck::Within(_) => panic!("expected breach"),
        }

        // Breach did not record anything
        let record = tracker.get_quota("alice").await.unwrap().unwrap();
        assert_eq!(record.daily.requests, 3);
    }

    #[tokio::test]
    async fn test_cost_limit_breach() {
        let (tracker, _store) = tracker_with_store();

        // tiny tier: daily cost limit 1.0, request limit 3 not yet reached
        // after 2 requests
        tracker.check_and_track("alice", "tiny", 0.6).await.unwrap();
        tracker.check_and_track("alice", "tiny", 0.4).await.unwrap();

        match tracker.check_and_track("alice", "tiny", 0.1).await.unwrap() {
            QuotaCheck::Breached(breach) => {
                assert_eq!(breach.metric, QuotaMetric::DailyCost);
            }
            QuotaCheck::Within(_) => panic!("expected cost breach"),
        }
    }

    #[tokio::test]
    async fn test_zero_limits_are_unlimited() {
        let (tracker, _store) = tracker_with_store();

        // enterprise defaults: all quota limits 0
        for _ in 0..50 {
            match tracker
                .check_and_track("bigco", "enterprise", 10.0)
                .await
                .unwrap()
            {
                QuotaCheck::Within(_) => {}
                QuotaCheck::Breached(b) => panic!("unlimited tier breached: {b:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_counters_are_monotonic_within_period() {
        let (tracker, _store) = tracker_with_store();

        let mut last = 0;
        for _ in 0..3 {
            let record = tracker.track_usage("alice", 0.1).await.unwrap();
            assert!(record.daily.requests > last);
            last = record.daily.requests;
        }
        assert_eq!(last, 3);
    }

    #[tokio::test]
    async fn test_alert_fires_once_per_threshold() {
        let (tracker, _store) = tracker_with_store();
        let mut alerts = tracker.subscribe_alerts();

        // daily limit 3: first request crosses 0 -> 1/3, no threshold;
        // second crosses 2/3 >= 0.5; third crosses 3/3 >= 0.8, 0.9, 0.95
        tracker.check_and_track("alice", "tiny", 0.0).await.unwrap();
        assert!(alerts.try_recv().is_err());

        tracker.check_and_track("alice", "tiny", 0.0).await.unwrap();
        let alert = alerts.try_recv().unwrap();
        assert_eq!(alert.metric, QuotaMetric::DailyRequests);
        assert_eq!(alert.threshold, 0.5);
        assert!(alerts.try_recv().is_err());

        tracker.check_and_track("alice", "tiny", 0.0).await.unwrap();
        let thresholds: Vec<f64> = std::iter::from_fn(|| alerts.try_recv().ok())
            .filter(|a| a.metric == QuotaMetric::DailyRequests)
            .map(|a| a.threshold)
            .collect();
        assert_eq!(thresholds, vec![0.8, 0.9, 0.95]);
    }

    #[tokio::test]
    async fn test_alert_state_clears_on_rollover() {
        let (tracker, store) = tracker_with_store();
        let mut alerts = tracker.subscribe_alerts();

        tracker.check_and_track("alice", "tiny", 0.0).await.unwrap();
        tracker.check_and_track("alice", "tiny", 0.0).await.unwrap();
        assert_eq!(alerts.try_recv().unwrap().threshold, 0.5);

        // Force the daily boundary into the past
        let mut record = store.get("alice").await.unwrap().unwrap();
        record.daily.reset_at = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        store.set(&record).await.unwrap();

        // Fresh period: crossing 0.5 again fires again
        tracker.check_and_track("alice", "tiny", 0.0).await.unwrap();
        tracker.check_and_track("alice", "tiny", 0.0).await.unwrap();
        let refired: Vec<f64> = std::iter::from_fn(|| alerts.try_recv().ok())
            .filter(|a| a.metric == QuotaMetric::DailyRequests)
            .map(|a| a.threshold)
            .collect();
        assert!(refired.contains(&0.5), "0.5 did not refire: {refired:?}");
    }

    #[tokio::test]
    async fn test_override_quota_changes_limits_and_rearms_alerts() {
        let (tracker, _store) = tracker_with_store();
        let mut alerts = tracker.subscribe_alerts();

        tracker.check_and_track("alice", "tiny", 0.0).await.unwrap();
        tracker.check_and_track("alice", "tiny", 0.0).await.unwrap();
        assert_eq!(alerts.try_recv().unwrap().threshold, 0.5);

        let record = tracker
            .override_quota(
                "alice",
                QuotaOverride {
                    daily_quota: Some(100),
                    monthly_cost_limit: Some(50.0),
                    ..QuotaOverride::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(record.daily.request_limit, 100);
        assert_eq!(record.monthly.cost_limit, 50.0);
        // Usage carries over
        assert_eq!(record.daily.requests, 2);

        // 0.5 re-arms against the new limit: 51/100 crosses it again
        for _ in 0..49 {
            tracker.check_and_track("alice", "tiny", 0.0).await.unwrap();
        }
        let refired: Vec<f64> = std::iter::from_fn(|| alerts.try_recv().ok())
            .filter(|a| a.metric == QuotaMetric::DailyRequests)
            .map(|a| a.threshold)
            .collect();
        assert!(refired.contains(&0.5), "expected re-armed 0.5: {refired:?}");
    }

    #[tokio::test]
    async fn test_rebind_tier_swaps_limits_and_keeps_usage() {
        let (tracker, _store) = tracker_with_store();

        tracker.check_and_track("alice", "tiny", 0.2).await.unwrap();
        tracker.check_and_track("alice", "tiny", 0.2).await.unwrap();

        let record = tracker.rebind_tier("alice", "pro").await.unwrap();
        assert_eq!(record.tier, "pro");
        assert_eq!(record.daily.request_limit, 5000);
        assert_eq!(record.monthly.request_limit, 100_000);
        assert_eq!(record.daily.cost_limit, 100.0);
        // Usage carries over, monthly cost limit stays override-only
        assert_eq!(record.daily.requests, 2);
        assert_eq!(record.monthly.cost_limit, 0.0);

        // Unknown users land directly on the new tier
        let fresh = tracker.rebind_tier("bob", "pro").await.unwrap();
        assert_eq!(fresh.tier, "pro");
        assert_eq!(fresh.daily.requests, 0);
    }

    #[tokio::test]
    async fn test_reset_quota_zeroes_counters() {
        let (tracker, _store) = tracker_with_store();

        tracker.check_and_track("alice", "tiny", 0.5).await.unwrap();
        let record = tracker.reset_quota("alice").await.unwrap().unwrap();
        assert_eq!(record.daily.requests, 0);
        assert_eq!(record.daily.cost, 0.0);
        assert!(record.daily.reset_at > Utc::now());

        assert!(tracker.reset_quota("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_analytics_totals() {
        let (tracker, _store) = tracker_with_store();

        tracker.check_and_track("alice", "tiny", 0.2).await.unwrap();
        tracker.check_and_track("alice", "tiny", 0.2).await.unwrap();
        tracker.check_and_track("bob", "tiny", 0.1).await.unwrap();

        let analytics = tracker.analytics().await.unwrap();
        assert_eq!(analytics.total_users, 2);
        assert_eq!(analytics.total_daily_requests, 3);
        assert!((analytics.total_daily_cost - 0.5).abs() < 1e-9);
        // Busiest user first
        assert_eq!(analytics.users[0].user_id, "alice");
        assert!((analytics.users[0].daily_utilization_percent - 66.666).abs() < 0.1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_rolls_stale_records() {
        let (tracker, store) = tracker_with_store();

        let past = Utc.with_ymd_and_hms(2020, 1, 15, 10, 0, 0).unwrap();
        let mut stale = QuotaRecord::new("dormant", "tiny", 3, 100, 1.0, past);
        stale.record(0.9, past);
        store.set(&stale).await.unwrap();

        let handle = tracker.spawn_reset_sweep(RESET_SWEEP_INTERVAL);
        // First tick fires immediately; give the task a chance to run it
        tokio::time::sleep(Duration::from_millis(10)).await;

        let record = store.get("dormant").await.unwrap().unwrap();
        assert_eq!(record.daily.requests, 0);
        assert_eq!(record.monthly.requests, 0);
        assert!(record.daily.reset_at > Utc::now());

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_sweep_once_reports_rolled_count() {
        let (tracker, store) = tracker_with_store();

        let past = Utc.with_ymd_and_hms(2020, 1, 15, 10, 0, 0).unwrap();
        store
            .set(&QuotaRecord::new("a", "tiny", 3, 100, 1.0, past))
            .await
            .unwrap();
        store
            .set(&QuotaRecord::new("b", "tiny", 3, 100, 1.0, Utc::now()))
            .await
            .unwrap();

        assert_eq!(tracker.sweep_once().await.unwrap(), 1);
        assert_eq!(tracker.sweep_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_store_propagates_error() {
        let (tracker, store) = tracker_with_store();
        store.close().await.unwrap();

        assert!(tracker.get_or_create("alice", "tiny").await.is_err());
        assert!(tracker.track_usage("alice", 0.1).await.is_err());
    }
}
