use crate::models::Account;
use crate::proxy::config::AccountSelectionConfig;
use crate::proxy::session_manager::SessionTracker;
use crate::proxy::token::pool::AccountPool;
use crate::proxy::token::selection::{
    should_rotate_session, AccountSelector, SelectCtx, Selection,
};
use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
struct HealthState {
    score: i32,
    updated_ms: i64,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    updated_ms: i64,
}

// Weighted scoring over health, a per-account token bucket, quota headroom
// and idle time. Degrades through three tiers before giving up: ignore
// quota, then ignore health, then ignore the token bucket.
pub struct HybridSelector {
    config: AccountSelectionConfig,
    health: DashMap<String, HealthState>,
    buckets: DashMap<String, BucketState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Normal,
    IgnoreQuota,
    IgnoreHealth,
    IgnoreTokens,
}

impl HybridSelector {
    pub fn new(config: AccountSelectionConfig) -> Self {
        Self {
            config,
            health: DashMap::new(),
            buckets: DashMap::new(),
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    // Health with passive recovery applied lazily since the last update.
    fn health_score(&self, email: &str) -> i32 {
        let hs = &self.config.health_score;
        let now = Self::now_ms();
        let mut entry = self.health.entry(email.to_string()).or_insert(HealthState {
            score: hs.initial,
            updated_ms: now,
        });
        let hours_idle = (now - entry.updated_ms) / 3_600_000;
        if hours_idle > 0 {
            entry.score = (entry.score + hours_idle as i32 * hs.recovery_per_hour).min(hs.max);
            entry.updated_ms = now;
        }
        entry.score.clamp(hs.min, hs.max)
    }

    fn adjust_health(&self, email: &str, delta: i32) {
        let hs = &self.config.health_score;
        let now = Self::now_ms();
        let mut entry = self.health.entry(email.to_string()).or_insert(HealthState {
            score: hs.initial,
            updated_ms: now,
        });
        entry.score = (entry.score + delta).clamp(hs.min, hs.max);
        entry.updated_ms = now;
    }

    // Current bucket level with lazy refill; does not consume.
    fn bucket_level(&self, email: &str) -> f64 {
        let tb = &self.config.token_bucket;
        let now = Self::now_ms();
        let mut entry = self.buckets.entry(email.to_string()).or_insert(BucketState {
            tokens: tb.capacity,
            updated_ms: now,
        });
        let minutes = (now - entry.updated_ms) as f64 / 60_000.0;
        if minutes > 0.0 {
            entry.tokens = (entry.tokens + minutes * tb.refill_per_minute).min(tb.capacity);
            entry.updated_ms = now;
        }
        entry.tokens
    }

    fn consume_token(&self, email: &str) {
        if let Some(mut entry) = self.buckets.get_mut(email) {
            entry.tokens = (entry.tokens - 1.0).max(0.0);
        }
    }

    fn quota_fraction(account: &Account, model: &str) -> Option<f64> {
        account
            .quota_snapshot
            .get(model)
            .map(|q| q.remaining_fraction)
    }

    fn score(&self, account: &Account, model: &str, tier: Tier) -> f64 {
        let health = if tier == Tier::IgnoreHealth {
            0.0
        } else {
            self.health_score(&account.email) as f64
        };
        let tokens = if tier == Tier::IgnoreTokens {
            self.config.token_bucket.capacity
        } else {
            self.bucket_level(&account.email)
        };
        // Absent snapshots score neutrally rather than best or worst.
        let quota_score = Self::quota_fraction(account, model)
            .map(|f| f * 100.0)
            .unwrap_or(50.0);
        let idle_secs =
            ((Self::now_ms() - account.last_used).max(0) as f64 / 1000.0).min(86_400.0);

        2.0 * health + 5.0 * (tokens / self.config.token_bucket.capacity) * 100.0
            + 3.0 * quota_score
            + 0.1 * idle_secs
    }

    fn candidates_for_tier<'a>(
        &self,
        pool: &AccountPool,
        accounts: &'a [Account],
        model: &str,
        quota_key: &str,
        tier: Tier,
    ) -> Vec<&'a Account> {
        accounts
            .iter()
            .filter(|a| match tier {
                Tier::Normal => {
                    pool.is_usable(a, model, quota_key)
                        && Self::quota_fraction(a, model)
                            .map(|f| f >= self.config.quota.critical_threshold)
                            .unwrap_or(true)
                        && self.bucket_level(&a.email) >= 1.0
                }
                Tier::IgnoreQuota => {
                    pool.is_selectable(a, model, quota_key) && self.bucket_level(&a.email) >= 1.0
                }
                Tier::IgnoreHealth => pool.is_selectable(a, model, quota_key),
                Tier::IgnoreTokens => pool.is_selectable(a, model, quota_key),
            })
            .collect()
    }
}

impl AccountSelector for HybridSelector {
    fn select(
        &self,
        pool: &AccountPool,
        sessions: &SessionTracker,
        model: &str,
        quota_key: &str,
        ctx: &SelectCtx<'_>,
    ) -> Selection {
        let accounts = pool.snapshot();

        // Session affinity first: a pinned, still-usable account wins unless
        // a rotation trigger fires.
        if let Some(sid) = ctx.session_id {
            if let Some(pinned_email) = sessions.pinned_account(sid) {
                let pinned = accounts.iter().find(|a| a.email == pinned_email);
                if let Some(pinned) = pinned {
                    if pool.is_usable(pinned, model, quota_key)
                        && !ctx.attempted.contains(&pinned_email)
                    {
                        let usable = pool.usable_accounts(model, quota_key);
                        if !should_rotate_session(
                            sessions,
                            sid,
                            pinned,
                            &usable,
                            model,
                            &self.config,
                        ) {
                            self.consume_token(&pinned_email);
                            return Selection::pick(pinned_email);
                        }
                        sessions.unpin(sid);
                    } else {
                        sessions.unpin(sid);
                    }
                } else {
                    sessions.unpin(sid);
                }
            }
        }

        for tier in [
            Tier::Normal,
            Tier::IgnoreQuota,
            Tier::IgnoreHealth,
            Tier::IgnoreTokens,
        ] {
            let candidates: Vec<&Account> = self
                .candidates_for_tier(pool, &accounts, model, quota_key, tier)
                .into_iter()
                .filter(|a| !ctx.attempted.contains(&a.email))
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let best = candidates
                .iter()
                .max_by(|a, b| {
                    self.score(a, model, tier)
                        .partial_cmp(&self.score(b, model, tier))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|a| a.email.clone());

            if let Some(email) = best {
                if tier != Tier::Normal {
                    info!(
                        "[Hybrid] Degraded selection tier {:?} chose {}",
                        tier, email
                    );
                }
                self.consume_token(&email);
                if let Some(sid) = ctx.session_id {
                    sessions.pin(sid, &email);
                }
                // The two deepest tiers throttle the pool a little.
                let wait_ms = match tier {
                    Tier::IgnoreHealth | Tier::IgnoreTokens => {
                        rand::thread_rng().gen_range(250..=500)
                    }
                    _ => 0,
                };
                return Selection {
                    account: Some(email),
                    wait_ms,
                };
            }
        }

        debug!("[Hybrid] No candidate in any tier for {}", quota_key);
        Selection::none()
    }

    fn record_success(&self, email: &str) {
        self.adjust_health(email, self.config.health_score.success_delta);
    }

    fn record_rate_limit(&self, email: &str) {
        self.adjust_health(email, -self.config.health_score.rate_limit_penalty);
    }

    fn record_failure(&self, email: &str) {
        self.adjust_health(email, -self.config.health_score.failure_penalty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuotaSnapshot;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn pool_with(emails: &[&str]) -> Arc<AccountPool> {
        let pool = Arc::new(AccountPool::new(5, 0.1));
        for email in emails {
            let mut account = Account::new(email.to_string());
            account.refresh_token = Some("refresh".to_string());
            pool.add(account);
        }
        pool
    }

    fn set_quota(pool: &Arc<AccountPool>, email: &str, model: &str, fraction: f64) {
        let mut snap = std::collections::HashMap::new();
        snap.insert(
            model.to_string(),
            QuotaSnapshot {
                remaining_fraction: fraction,
                reset_time: None,
            },
        );
        pool.update_quota_snapshot(email, snap, None);
    }

    fn ctx<'a>(attempted: &'a HashSet<String>) -> SelectCtx<'a> {
        SelectCtx {
            session_id: None,
            attempted,
            max_wait_before_error_ms: 600_000,
        }
    }

    #[tokio::test]
    async fn prefers_account_with_more_quota() {
        let pool = pool_with(&["low@x", "high@x"]);
        set_quota(&pool, "low@x", "m", 0.2);
        set_quota(&pool, "high@x", "m", 0.9);

        let selector = HybridSelector::new(AccountSelectionConfig::default());
        let attempted = HashSet::new();
        let sessions = SessionTracker::new();

        let sel = selector.select(&pool, &sessions, "m", "m:cli", &ctx(&attempted));
        assert_eq!(sel.account.as_deref(), Some("high@x"));
    }

    #[tokio::test]
    async fn critical_quota_is_excluded_until_fallback() {
        let pool = pool_with(&["crit@x", "ok@x"]);
        set_quota(&pool, "crit@x", "m", 0.01);
        set_quota(&pool, "ok@x", "m", 0.5);

        let selector = HybridSelector::new(AccountSelectionConfig::default());
        let attempted = HashSet::new();
        let sessions = SessionTracker::new();

        let sel = selector.select(&pool, &sessions, "m", "m:cli", &ctx(&attempted));
        assert_eq!(sel.account.as_deref(), Some("ok@x"));
    }

    #[tokio::test]
    async fn degraded_tier_serves_critical_account_with_throttle() {
        let pool = pool_with(&["crit@x"]);
        set_quota(&pool, "crit@x", "m", 0.01);

        let selector = HybridSelector::new(AccountSelectionConfig::default());
        let attempted = HashSet::new();
        let sessions = SessionTracker::new();

        let sel = selector.select(&pool, &sessions, "m", "m:cli", &ctx(&attempted));
        // Only candidate sits below the critical threshold, so the quota
        // tier is skipped and the account is still served.
        assert_eq!(sel.account.as_deref(), Some("crit@x"));
    }

    #[tokio::test]
    async fn health_penalties_steer_selection_away() {
        let pool = pool_with(&["bad@x", "good@x"]);
        let selector = HybridSelector::new(AccountSelectionConfig::default());

        for _ in 0..3 {
            selector.record_failure("bad@x");
        }
        // Both quota-less; health difference decides.
        let attempted = HashSet::new();
        let sessions = SessionTracker::new();
        let sel = selector.select(&pool, &sessions, "m", "m:cli", &ctx(&attempted));
        assert_eq!(sel.account.as_deref(), Some("good@x"));
    }

    #[tokio::test]
    async fn health_clamps_to_configured_band() {
        let selector = HybridSelector::new(AccountSelectionConfig::default());
        for _ in 0..20 {
            selector.record_failure("a@x");
        }
        assert_eq!(selector.health_score("a@x"), 50);
        for _ in 0..200 {
            selector.record_success("a@x");
        }
        assert_eq!(selector.health_score("a@x"), 100);
    }

    #[tokio::test]
    async fn token_bucket_depletes_with_selections() {
        let pool = pool_with(&["a@x"]);
        let selector = HybridSelector::new(AccountSelectionConfig::default());
        let attempted = HashSet::new();
        let sessions = SessionTracker::new();

        let initial = selector.bucket_level("a@x");
        selector.select(&pool, &sessions, "m", "m:cli", &ctx(&attempted));
        assert!(selector.bucket_level("a@x") < initial);
    }
}
