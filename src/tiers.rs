//! Tier Registry
//!
//! Owns every token bucket in the admission cascade: the global bucket,
//! one per configured provider, one per configured model, and per-user
//! buckets created lazily from the user's tier template on first sighting.
//! Registries are instance state on the controller, so independent
//! controllers never share buckets.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::bucket::TokenBucket;
use crate::config::{AdmissionConfig, DEFAULT_TIER};
use crate::error::AdmissionError;

/// A user's current tier binding
#[derive(Clone)]
pub(crate) struct UserBinding {
    pub bucket: Arc<TokenBucket>,
    pub tier: String,
}

struct ModelEntry {
    bucket: Arc<TokenBucket>,
    cost_per_request: f64,
}

/// Bucket registry for all tiers of the cascade
pub struct TierRegistry {
    config: Arc<AdmissionConfig>,
    global: Arc<TokenBucket>,
    providers: HashMap<String, Arc<TokenBucket>>,
    models: HashMap<String, ModelEntry>,
    users: RwLock<HashMap<String, UserBinding>>,
}

/// One second's worth of refill is the post-reset balance; burst is the
/// idle ceiling.
fn bucket_from(requests_per_second: f64, burst_capacity: f64) -> TokenBucket {
    TokenBucket::new(requests_per_second, requests_per_second, burst_capacity)
}

impl TierRegistry {
    /// Build the registry from configuration. Provider and model buckets
    /// are fixed at construction; user buckets appear on first sighting.
    pub fn new(config: Arc<AdmissionConfig>) -> Self {
        let global = Arc::new(bucket_from(
            config.global.requests_per_second,
            config.global.burst_capacity,
        ));

        let providers = config
            .providers
            .iter()
            .map(|p| {
                (
                    p.provider.clone(),
                    Arc::new(bucket_from(p.requests_per_second, p.burst_capacity)),
                )
            })
            .collect();

        let models = config
            .models
            .iter()
            .map(|m| {
                (
                    m.model_id.clone(),
                    ModelEntry {
                        bucket: Arc::new(bucket_from(m.requests_per_second, m.burst_capacity)),
                        cost_per_request: m.cost_per_request.unwrap_or(0.0),
                    },
                )
            })
            .collect();

        Self {
            config,
            global,
            providers,
            models,
            users: RwLock::new(HashMap::new()),
        }
    }

    /// The global throughput bucket
    pub fn global(&self) -> &Arc<TokenBucket> {
        &self.global
    }

    /// Bucket for a provider, if one is configured
    pub fn provider(&self, provider: &str) -> Option<&Arc<TokenBucket>> {
        self.providers.get(provider)
    }

    /// Bucket for a model, if one is configured
    pub fn model(&self, model_id: &str) -> Option<&Arc<TokenBucket>> {
        self.models.get(model_id).map(|entry| &entry.bucket)
    }

    /// Flat quota cost for one request to the model (0.0 when unconfigured)
    pub fn model_cost(&self, model_id: &str) -> f64 {
        self.models
            .get(model_id)
            .map(|entry| entry.cost_per_request)
            .unwrap_or(0.0)
    }

    /// The user's bucket and tier, binding unseen users to the default
    /// tier on the way.
    pub(crate) async fn user_binding(&self, user_id: &str) -> UserBinding {
        {
            let users = self.users.read().await;
            if let Some(binding) = users.get(user_id) {
                return binding.clone();
            }
        }

        let mut users = self.users.write().await;
        // Re-check: another task may have bound the user while we waited
        if let Some(binding) = users.get(user_id) {
            return binding.clone();
        }

        let tier = self
            .config
            .tier(DEFAULT_TIER)
            .cloned()
            .unwrap_or_default();
        let binding = UserBinding {
            bucket: Arc::new(bucket_from(tier.requests_per_second, tier.burst_capacity)),
            tier: DEFAULT_TIER.to_string(),
        };
        users.insert(user_id.to_string(), binding.clone());
        tracing::debug!("Bound new user {} to tier '{}'", user_id, DEFAULT_TIER);
        binding
    }

    /// (Re)bind a user to a tier with a fresh bucket built from the tier
    /// template.
    pub async fn set_user_tier(&self, user_id: &str, tier: &str) -> Result<(), AdmissionError> {
        let Some(limits) = self.config.tier(tier) else {
            return Err(AdmissionError::UnknownTier(tier.to_string()));
        };

        let binding = UserBinding {
            bucket: Arc::new(bucket_from(
                limits.requests_per_second,
                limits.burst_capacity,
            )),
            tier: tier.to_string(),
        };
        self.users
            .write()
            .await
            .insert(user_id.to_string(), binding);

        tracing::info!("User {} bound to tier '{}'", user_id, tier);
        Ok(())
    }

    /// The tier a user is currently bound to, if they have been seen
    pub async fn user_tier(&self, user_id: &str) -> Option<String> {
        let users = self.users.read().await;
        users.get(user_id).map(|binding| binding.tier.clone())
    }
}
