use crate::models::Account;
use crate::proxy::config::{AccountSelectionConfig, SelectionStrategy};
use crate::proxy::session_manager::SessionTracker;
use crate::proxy::token::pool::AccountPool;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub struct SelectCtx<'a> {
    pub session_id: Option<&'a str>,
    // Accounts already tried during this request; never handed out again.
    pub attempted: &'a HashSet<String>,
    pub max_wait_before_error_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub account: Option<String>,
    pub wait_ms: u64,
}

impl Selection {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn pick(email: String) -> Self {
        Self {
            account: Some(email),
            wait_ms: 0,
        }
    }

    pub fn wait(wait_ms: u64) -> Self {
        Self {
            account: None,
            wait_ms,
        }
    }
}

// Common contract for account selection. The dispatcher feeds request
// outcomes back so scoring policies can adjust.
pub trait AccountSelector: Send + Sync {
    fn select(
        &self,
        pool: &AccountPool,
        sessions: &SessionTracker,
        model: &str,
        quota_key: &str,
        ctx: &SelectCtx<'_>,
    ) -> Selection;

    fn record_success(&self, _email: &str) {}
    fn record_rate_limit(&self, _email: &str) {}
    fn record_failure(&self, _email: &str) {}
}

pub fn build_selector(config: &AccountSelectionConfig) -> Arc<dyn AccountSelector> {
    match config.strategy {
        SelectionStrategy::Sticky => Arc::new(StickySelector::new(config.clone())),
        SelectionStrategy::RoundRobin => Arc::new(RoundRobinSelector),
        SelectionStrategy::Hybrid => {
            Arc::new(crate::proxy::token::hybrid::HybridSelector::new(config.clone()))
        }
    }
}

fn sorted_usable(pool: &AccountPool, model: &str, quota_key: &str) -> Vec<Account> {
    let mut usable = pool.usable_accounts(model, quota_key);
    usable.sort_by(|a, b| a.email.cmp(&b.email));
    usable
}

// Whether a pinned session should rotate off its current account.
pub(super) fn should_rotate_session(
    sessions: &SessionTracker,
    session_id: &str,
    pinned: &Account,
    candidates: &[Account],
    model: &str,
    config: &AccountSelectionConfig,
) -> bool {
    let Some(info) = sessions.get(session_id) else {
        return false;
    };
    if info.message_count > config.session.max_messages {
        debug!(
            "[Selection] Session {} rotating: {} messages exceeds cap",
            session_id, info.message_count
        );
        return true;
    }
    if info.tokens_consumed > config.session.max_tokens {
        debug!(
            "[Selection] Session {} rotating: {} tokens consumed exceeds cap",
            session_id, info.tokens_consumed
        );
        return true;
    }

    let pinned_remaining = pinned
        .quota_snapshot
        .get(model)
        .map(|q| q.remaining_fraction);
    if let Some(remaining) = pinned_remaining {
        if remaining < config.quota.rotation_threshold {
            let better_exists = candidates.iter().any(|c| {
                c.email != pinned.email
                    && c.quota_snapshot
                        .get(model)
                        .map(|q| q.remaining_fraction >= remaining + 0.2)
                        .unwrap_or(false)
            });
            if better_exists {
                debug!(
                    "[Selection] Session {} rotating: pinned quota {:.0}% with a better candidate available",
                    session_id,
                    remaining * 100.0
                );
                return true;
            }
        }
    }
    false
}

// Session-affine selection: reuse the pinned account while it stays usable,
// otherwise advance a round-robin cursor over the usable set. When nothing
// is usable but the pinned account resets soon, ask the caller to wait.
pub struct StickySelector {
    config: AccountSelectionConfig,
}

impl StickySelector {
    pub fn new(config: AccountSelectionConfig) -> Self {
        Self { config }
    }
}

impl AccountSelector for StickySelector {
    fn select(
        &self,
        pool: &AccountPool,
        sessions: &SessionTracker,
        model: &str,
        quota_key: &str,
        ctx: &SelectCtx<'_>,
    ) -> Selection {
        let usable = sorted_usable(pool, model, quota_key);

        if let Some(sid) = ctx.session_id {
            if let Some(pinned_email) = sessions.pinned_account(sid) {
                if let Some(pinned) = usable.iter().find(|a| a.email == pinned_email) {
                    let rotate = should_rotate_session(
                        sessions,
                        sid,
                        pinned,
                        &usable,
                        model,
                        &self.config,
                    );
                    if !rotate && !ctx.attempted.contains(&pinned_email) {
                        debug!(
                            "[Sticky] Session {} reusing bound account {}",
                            sid, pinned_email
                        );
                        return Selection::pick(pinned_email);
                    }
                    if rotate {
                        sessions.unpin(sid);
                    }
                } else if let Some(account) = pool.get(&pinned_email) {
                    // Pinned but unusable right now. If the limit resets
                    // within the wait cap, waiting keeps the cache warm.
                    let now = chrono::Utc::now().timestamp_millis();
                    if usable.is_empty() {
                        if let Some(limit) = account.model_rate_limits.get(quota_key) {
                            if limit.is_active(now) {
                                let wait = (limit.reset_at - now).max(0) as u64;
                                if wait <= ctx.max_wait_before_error_ms {
                                    debug!(
                                        "[Sticky] Session {} waiting {}ms for bound account {}",
                                        sid, wait, pinned_email
                                    );
                                    return Selection::wait(wait);
                                }
                            }
                        }
                    }
                    sessions.unpin(sid);
                } else {
                    sessions.unpin(sid);
                }
            }
        }

        let candidates: Vec<&Account> = usable
            .iter()
            .filter(|a| !ctx.attempted.contains(&a.email))
            .collect();
        if candidates.is_empty() {
            return Selection::none();
        }

        let index = pool.next_round_robin() % candidates.len();
        let chosen = candidates[index].email.clone();
        if let Some(sid) = ctx.session_id {
            sessions.pin(sid, &chosen);
            debug!("[Sticky] Session {} bound to account {}", sid, chosen);
        }
        Selection::pick(chosen)
    }
}

// Stateless rotation across all usable accounts; sessions are ignored.
pub struct RoundRobinSelector;

impl AccountSelector for RoundRobinSelector {
    fn select(
        &self,
        pool: &AccountPool,
        _sessions: &SessionTracker,
        model: &str,
        quota_key: &str,
        ctx: &SelectCtx<'_>,
    ) -> Selection {
        let usable = sorted_usable(pool, model, quota_key);
        let candidates: Vec<&Account> = usable
            .iter()
            .filter(|a| !ctx.attempted.contains(&a.email))
            .collect();
        if candidates.is_empty() {
            return Selection::none();
        }
        let index = pool.next_round_robin() % candidates.len();
        Selection::pick(candidates[index].email.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuotaSnapshot;
    use crate::proxy::token::rate::LimitType;

    fn pool_with(emails: &[&str]) -> Arc<AccountPool> {
        let pool = Arc::new(AccountPool::new(5, 0.1));
        for email in emails {
            let mut account = Account::new(email.to_string());
            account.refresh_token = Some("refresh".to_string());
            pool.add(account);
        }
        pool
    }

    fn ctx<'a>(attempted: &'a HashSet<String>, session_id: Option<&'a str>) -> SelectCtx<'a> {
        SelectCtx {
            session_id,
            attempted,
            max_wait_before_error_ms: 600_000,
        }
    }

    #[tokio::test]
    async fn sticky_reuses_pinned_account() {
        let pool = pool_with(&["a@x", "b@x"]);
        let sessions = SessionTracker::new();
        sessions.touch("sid-1", 1);
        let selector = StickySelector::new(AccountSelectionConfig::default());
        let attempted = HashSet::new();

        let first = selector.select(&pool, &sessions, "m", "m:cli", &ctx(&attempted, Some("sid-1")));
        let chosen = first.account.expect("account");

        for _ in 0..5 {
            let again =
                selector.select(&pool, &sessions, "m", "m:cli", &ctx(&attempted, Some("sid-1")));
            assert_eq!(again.account.as_deref(), Some(chosen.as_str()));
        }
    }

    #[tokio::test]
    async fn sticky_waits_for_pinned_account_resetting_soon() {
        let pool = pool_with(&["a@x"]);
        let sessions = SessionTracker::new();
        sessions.touch("sid-1", 1);
        let selector = StickySelector::new(AccountSelectionConfig::default());
        let attempted = HashSet::new();

        let first = selector.select(&pool, &sessions, "m", "m:cli", &ctx(&attempted, Some("sid-1")));
        assert_eq!(first.account.as_deref(), Some("a@x"));

        pool.mark_rate_limited("a@x", "m:cli", Some(5_000), LimitType::UserQuota, 60_000, 1_800_000);
        let second =
            selector.select(&pool, &sessions, "m", "m:cli", &ctx(&attempted, Some("sid-1")));
        assert!(second.account.is_none());
        assert!(second.wait_ms > 0 && second.wait_ms <= 5_000);
    }

    #[tokio::test]
    async fn sticky_skips_attempted_accounts() {
        let pool = pool_with(&["a@x", "b@x"]);
        let sessions = SessionTracker::new();
        sessions.touch("sid-1", 1);
        let selector = StickySelector::new(AccountSelectionConfig::default());

        let attempted = HashSet::new();
        let first = selector.select(&pool, &sessions, "m", "m:cli", &ctx(&attempted, Some("sid-1")));
        let chosen = first.account.expect("account");

        let mut attempted = HashSet::new();
        attempted.insert(chosen.clone());
        let second =
            selector.select(&pool, &sessions, "m", "m:cli", &ctx(&attempted, Some("sid-1")));
        let other = second.account.expect("other account");
        assert_ne!(other, chosen);
    }

    #[tokio::test]
    async fn round_robin_cycles_through_accounts() {
        let pool = pool_with(&["a@x", "b@x", "c@x"]);
        let sessions = SessionTracker::new();
        let selector = RoundRobinSelector;
        let attempted = HashSet::new();

        let mut seen = HashSet::new();
        for _ in 0..3 {
            let sel = selector.select(&pool, &sessions, "m", "m:cli", &ctx(&attempted, None));
            seen.insert(sel.account.expect("account"));
        }
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn rotation_triggers_on_low_quota_with_better_candidate() {
        let pool = pool_with(&["a@x", "b@x"]);
        let sessions = SessionTracker::new();
        sessions.touch("sid-1", 1);
        sessions.pin("sid-1", "a@x");

        let mut snap_a = std::collections::HashMap::new();
        snap_a.insert(
            "m".to_string(),
            QuotaSnapshot {
                remaining_fraction: 0.15,
                reset_time: None,
            },
        );
        pool.update_quota_snapshot("a@x", snap_a, None);

        let mut snap_b = std::collections::HashMap::new();
        snap_b.insert(
            "m".to_string(),
            QuotaSnapshot {
                remaining_fraction: 0.9,
                reset_time: None,
            },
        );
        pool.update_quota_snapshot("b@x", snap_b, None);

        let config = AccountSelectionConfig::default();
        let pinned = pool.get("a@x").unwrap();
        let candidates = vec![pool.get("a@x").unwrap(), pool.get("b@x").unwrap()];
        assert!(should_rotate_session(
            &sessions, "sid-1", &pinned, &candidates, "m", &config
        ));
    }

    #[tokio::test]
    async fn rotation_triggers_on_message_cap() {
        let pool = pool_with(&["a@x"]);
        let sessions = SessionTracker::new();
        sessions.touch("sid-1", 500);

        let config = AccountSelectionConfig::default();
        let pinned = pool.get("a@x").unwrap();
        assert!(should_rotate_session(
            &sessions,
            "sid-1",
            &pinned,
            &[pinned.clone()],
            "m",
            &config
        ));
    }
}
