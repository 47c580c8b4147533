use dashmap::DashMap;
use tracing::{debug, warn};

// Failure streaks reset after an hour without a new failure.
const STREAK_EXPIRY_MS: i64 = 3_600_000;
const DAILY_FLOOR_MS: u64 = 3_600_000;
const MAX_STREAK_MULTIPLIER: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitType {
    UserQuota,
    Daily,
    Capacity,
}

// Tracks consecutive rate-limit failures per (account, quota key) and turns
// them into cooldown durations with exponential escalation.
pub struct CooldownTracker {
    streaks: DashMap<String, (u32, i64)>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self {
            streaks: DashMap::new(),
        }
    }

    fn streak_key(account: &str, quota_key: &str) -> String {
        format!("{}|{}", account, quota_key)
    }

    fn bump_streak(&self, account: &str, quota_key: &str) -> u32 {
        let now = chrono::Utc::now().timestamp_millis();
        let mut entry = self
            .streaks
            .entry(Self::streak_key(account, quota_key))
            .or_insert((0, now));
        if now - entry.1 > STREAK_EXPIRY_MS {
            debug!(
                "Failure streak for {}|{} expired, resetting",
                account, quota_key
            );
            *entry = (0, now);
        }
        entry.0 += 1;
        entry.1 = now;
        entry.0
    }

    pub fn record_success(&self, account: &str, quota_key: &str) {
        if self
            .streaks
            .remove(&Self::streak_key(account, quota_key))
            .is_some()
        {
            debug!(
                "Account {} request successful for {}, failure streak reset",
                account, quota_key
            );
        }
    }

    // Cooldown for a fresh rate-limit hit.
    //
    // Daily limits get a one-hour floor. Other limits honour the server
    // reset hint when it is under the configured cap, otherwise fall back to
    // the configured default. Consecutive failures for the same key multiply
    // the base by 2^(failures-1), capped at 30x.
    pub fn next_cooldown_ms(
        &self,
        account: &str,
        quota_key: &str,
        server_reset_ms: Option<u64>,
        limit_type: LimitType,
        default_cooldown_ms: u64,
        max_cooldown_ms: u64,
    ) -> u64 {
        let base = match limit_type {
            LimitType::Daily => server_reset_ms.unwrap_or(0).max(DAILY_FLOOR_MS),
            LimitType::UserQuota | LimitType::Capacity => match server_reset_ms {
                Some(ms) if ms <= max_cooldown_ms => ms,
                _ => default_cooldown_ms,
            },
        };

        let failures = self.bump_streak(account, quota_key);
        let multiplier = 2u64
            .saturating_pow(failures.saturating_sub(1))
            .min(MAX_STREAK_MULTIPLIER);
        let cooldown = base.saturating_mul(multiplier);

        if multiplier > 1 {
            warn!(
                "Account {} [{}]: {} consecutive rate limits, cooldown escalated to {}ms ({}x)",
                account, quota_key, failures, cooldown, multiplier
            );
        }
        cooldown
    }
}

impl Default for CooldownTracker {
    fn default() -> Self {
        Self::new()
    }
}
