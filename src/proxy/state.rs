use crate::proxy::config::ProxyConfig;
use crate::proxy::session_manager::SessionTracker;
use crate::proxy::signature_cache::SignatureCache;
use crate::proxy::token::{build_selector, AccountSelector, AccountPool};
use crate::proxy::upstream::auth::AuthManager;
use crate::proxy::upstream::UpstreamClient;
use crate::proxy::usage_stats::UsageStats;
use std::sync::Arc;
use tracing::info;

// Everything a request needs, constructed once at startup and cloned
// (reference-counted) into each request scope.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub pool: Arc<AccountPool>,
    pub sessions: Arc<SessionTracker>,
    pub selector: Arc<dyn AccountSelector>,
    pub signature_cache: Arc<SignatureCache>,
    pub upstream: Arc<UpstreamClient>,
    pub auth: Arc<AuthManager>,
    pub usage: Arc<UsageStats>,
}

impl AppState {
    pub async fn initialize(config: ProxyConfig) -> Result<Self, String> {
        let data_dir = crate::constants::data_dir();
        let pool = Arc::new(AccountPool::with_persistence(
            config.max_concurrent_requests,
            config.account_selection.quota.low_threshold,
            data_dir.join("accounts.json"),
        ));
        if pool.is_empty() {
            info!("Account pool is empty; enroll accounts into accounts.json");
        }

        let signature_cache = Arc::new(SignatureCache::with_persistence(
            data_dir.join("signature-cache.json"),
        ));
        let usage = Arc::new(UsageStats::with_persistence(
            data_dir.join("usage-history.json"),
        ));

        let upstream = Arc::new(UpstreamClient::new(config.header_mode));
        let auth = Arc::new(AuthManager::new(upstream.http()));
        let selector = build_selector(&config.account_selection);

        Ok(Self {
            config: Arc::new(config),
            pool,
            sessions: Arc::new(SessionTracker::new()),
            selector,
            signature_cache,
            upstream,
            auth,
            usage,
        })
    }

    #[cfg(test)]
    pub fn for_test_with_upstream(config: ProxyConfig, upstream_base: &str) -> Self {
        let mut state = Self::for_test(config);
        state.upstream = Arc::new(UpstreamClient::new_for_test(upstream_base));
        state.auth = Arc::new(AuthManager::new(state.upstream.http()));
        state
    }

    #[cfg(test)]
    pub fn for_test(config: ProxyConfig) -> Self {
        let pool = Arc::new(AccountPool::new(
            config.max_concurrent_requests,
            config.account_selection.quota.low_threshold,
        ));
        let selector = build_selector(&config.account_selection);
        let upstream = Arc::new(UpstreamClient::new(config.header_mode));
        let auth = Arc::new(AuthManager::new(upstream.http()));
        Self {
            config: Arc::new(config),
            pool,
            sessions: Arc::new(SessionTracker::new()),
            selector,
            signature_cache: Arc::new(SignatureCache::new()),
            upstream,
            auth,
            usage: Arc::new(UsageStats::new()),
        }
    }
}
