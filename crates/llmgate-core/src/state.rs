use std::sync::Arc;
use std::time::Duration;

use llmgate_common::GlobalConfig;
use llmgate_credential::{CoolingPeriods, CredentialPool};

use crate::auth::AuthKeys;
use crate::cache::ResponseCache;
use crate::dispatch::Dispatcher;
use crate::upstream_client::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};

/// Everything a request handler needs, built once at startup and shared
/// behind an `Arc` — no ambient singletons.
pub struct AppState {
    pub config: GlobalConfig,
    pub pool: Arc<CredentialPool>,
    pub cache: Arc<ResponseCache>,
    pub dispatcher: Arc<Dispatcher>,
    pub auth: AuthKeys,
}

impl AppState {
    pub fn build(config: GlobalConfig) -> Result<Self, wreq::Error> {
        let cooling = CoolingPeriods {
            auth_rejected: Duration::from_secs(config.cooling_period.auth_s),
            quota_exceeded: Duration::from_secs(config.cooling_period.quota_s),
            transient_upstream: Duration::from_secs(config.cooling_period.transient_s),
        };
        let pool = Arc::new(CredentialPool::new(config.max_failures_before_cool, cooling));
        for secret in &config.credentials {
            pool.add(secret.clone());
        }

        let cache = Arc::new(ResponseCache::new(config.cache_max_size, config.cache_ttl_s));

        let upstream_config = UpstreamClientConfig::from_global(&config);
        let client: Arc<dyn UpstreamClient> = Arc::new(WreqUpstreamClient::new(upstream_config)?);

        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            client,
            config.upstream_base_url.clone(),
            config.max_attempts,
            Duration::from_secs(config.per_attempt_timeout_s),
            Duration::from_secs(config.overall_deadline_s),
        ));

        let auth = AuthKeys::new(config.client_keys.clone(), config.admin_keys.clone());

        Ok(Self {
            config,
            pool,
            cache,
            dispatcher,
            auth,
        })
    }
}
