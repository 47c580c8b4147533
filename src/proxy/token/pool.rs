use crate::models::{Account, ModelRateLimit, QuotaSnapshot, SubscriptionTier};
use crate::proxy::token::rate::{CooldownTracker, LimitType};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

// Holds every enrolled identity and its runtime state. DashMap entry locks
// give per-account critical sections; the map itself covers insert/remove.
pub struct AccountPool {
    accounts: DashMap<String, Account>,
    cooldowns: CooldownTracker,
    rr_cursor: AtomicUsize,
    max_concurrent: u32,
    min_quota_fraction: f64,
    path: Option<PathBuf>,
    save_in_flight: Arc<AtomicBool>,
    save_pending: Arc<AtomicBool>,
}

// RAII slot borrowed from an account; dropping it releases the slot, so the
// counter returns to its pre-request value on every exit path.
pub struct SlotGuard {
    pool: Arc<AccountPool>,
    email: String,
    released: bool,
}

impl SlotGuard {
    pub fn email(&self) -> &str {
        &self.email
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.released {
            self.pool.release(&self.email);
            self.released = true;
        }
    }
}

impl AccountPool {
    pub fn new(max_concurrent: u32, min_quota_fraction: f64) -> Self {
        Self {
            accounts: DashMap::new(),
            cooldowns: CooldownTracker::new(),
            rr_cursor: AtomicUsize::new(0),
            max_concurrent,
            min_quota_fraction,
            path: None,
            save_in_flight: Arc::new(AtomicBool::new(false)),
            save_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_persistence(
        max_concurrent: u32,
        min_quota_fraction: f64,
        path: PathBuf,
    ) -> Self {
        let mut pool = Self::new(max_concurrent, min_quota_fraction);
        pool.path = Some(path.clone());

        if path.exists() {
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|s| serde_json::from_str::<Vec<Account>>(&s).map_err(|e| e.to_string()))
            {
                Ok(accounts) => {
                    let count = accounts.len();
                    for account in accounts {
                        pool.accounts.insert(account.email.clone(), account);
                    }
                    info!("Loaded {} account(s) from {:?}", count, path);
                }
                Err(e) => warn!("[W-ACCOUNTS-LOAD] failed_to_load_accounts: {} ({:?})", e, path),
            }
        }
        pool
    }

    // Upsert by email. Re-enrolling an invalid account clears the invalid
    // flag; the original enrollment timestamp is preserved.
    pub fn add(self: &Arc<Self>, mut account: Account) {
        if let Some(existing) = self.accounts.get(&account.email) {
            account.added_at = existing.added_at;
        }
        account.invalid = false;
        account.invalid_reason = None;
        info!("Account {} enrolled", account.email);
        self.accounts.insert(account.email.clone(), account);
        self.schedule_save();
    }

    pub fn remove(self: &Arc<Self>, email: &str) -> bool {
        let removed = self.accounts.remove(email).is_some();
        if removed {
            // Keep the cursor inside the shrunken ring.
            let len = self.accounts.len().max(1);
            let cursor = self.rr_cursor.load(Ordering::Relaxed);
            self.rr_cursor.store(cursor % len, Ordering::Relaxed);
            info!("Account {} removed", email);
            self.schedule_save();
        }
        removed
    }

    pub fn set_enabled(self: &Arc<Self>, email: &str, enabled: bool) -> bool {
        let found = self
            .accounts
            .get_mut(email)
            .map(|mut account| account.enabled = enabled)
            .is_some();
        if found {
            info!("Account {} enabled={}", email, enabled);
            self.schedule_save();
        }
        found
    }

    pub fn borrow(self: &Arc<Self>, email: &str) -> Option<SlotGuard> {
        let mut account = self.accounts.get_mut(email)?;
        if account.active_requests >= self.max_concurrent {
            return None;
        }
        account.active_requests += 1;
        account.update_last_used();
        drop(account);
        self.schedule_save();
        Some(SlotGuard {
            pool: self.clone(),
            email: email.to_string(),
            released: false,
        })
    }

    // Idempotent at zero: releasing an unborrowed slot logs and stays at 0.
    pub fn release(&self, email: &str) {
        if let Some(mut account) = self.accounts.get_mut(email) {
            if account.active_requests == 0 {
                warn!(
                    "[W-SLOT-UNDERFLOW] release_called_with_zero_active_requests: {}",
                    email
                );
                return;
            }
            account.active_requests -= 1;
        }
    }

    pub fn mark_rate_limited(
        self: &Arc<Self>,
        email: &str,
        quota_key: &str,
        server_reset_ms: Option<u64>,
        limit_type: LimitType,
        default_cooldown_ms: u64,
        max_cooldown_ms: u64,
    ) {
        let cooldown = self.cooldowns.next_cooldown_ms(
            email,
            quota_key,
            server_reset_ms,
            limit_type,
            default_cooldown_ms,
            max_cooldown_ms,
        );
        let reset_at = chrono::Utc::now().timestamp_millis() + cooldown as i64;
        if let Some(mut account) = self.accounts.get_mut(email) {
            account.model_rate_limits.insert(
                quota_key.to_string(),
                ModelRateLimit {
                    limited: true,
                    reset_at,
                },
            );
            info!(
                "Account {} rate-limited for {} ({:?}), cooldown {}s",
                email,
                quota_key,
                limit_type,
                cooldown / 1000
            );
        }
        self.schedule_save();
    }

    // Permanent: no self-recovery, only re-enrollment clears it.
    pub fn mark_invalid(self: &Arc<Self>, email: &str, reason: &str) {
        if let Some(mut account) = self.accounts.get_mut(email) {
            account.invalid = true;
            account.invalid_reason = Some(reason.to_string());
            warn!("Account {} marked invalid: {}", email, reason);
        }
        self.schedule_save();
    }

    pub fn mark_success(self: &Arc<Self>, email: &str, quota_key: &str) {
        self.cooldowns.record_success(email, quota_key);
        if let Some(mut account) = self.accounts.get_mut(email) {
            account.update_last_used();
        }
        self.schedule_save();
    }

    pub fn clear_expired(&self) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let mut cleared = 0;
        for mut entry in self.accounts.iter_mut() {
            let before = entry.model_rate_limits.len();
            entry.model_rate_limits.retain(|_, l| l.is_active(now));
            cleared += before - entry.model_rate_limits.len();
        }
        if cleared > 0 {
            debug!("Cleared {} expired rate-limit record(s)", cleared);
        }
        cleared
    }

    // Optimistic unblock: the recorded reset times are upper bounds and
    // often wrong, so when every account is limited we clear the limits for
    // this quota key once and probe again.
    pub fn reset_all_for(self: &Arc<Self>, quota_key: &str) {
        let mut cleared = 0;
        for mut entry in self.accounts.iter_mut() {
            if entry.model_rate_limits.remove(quota_key).is_some() {
                cleared += 1;
            }
        }
        warn!(
            "🔄 Optimistic reset: cleared rate limits for {} on {} account(s)",
            quota_key, cleared
        );
        self.schedule_save();
    }

    // Usability minus the quota-snapshot clause; the hybrid policy's
    // degraded tiers need this weaker form.
    pub fn is_selectable(&self, account: &Account, model: &str, quota_key: &str) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        if account.invalid || !account.enabled {
            return false;
        }
        if account.active_requests >= self.max_concurrent {
            return false;
        }
        if account
            .model_rate_limits
            .get(quota_key)
            .map(|l| l.is_active(now))
            .unwrap_or(false)
        {
            return false;
        }
        !account.disabled_models.contains(model)
    }

    // The single usability predicate shared by selection, availability checks
    // and the dispatcher's all-limited decision.
    pub fn is_usable(&self, account: &Account, model: &str, quota_key: &str) -> bool {
        if !self.is_selectable(account, model, quota_key) {
            return false;
        }
        let now = chrono::Utc::now().timestamp_millis();
        match account.quota_snapshot.get(model) {
            None => true,
            Some(snapshot) => {
                snapshot.remaining_fraction >= self.min_quota_fraction
                    || snapshot.reset_passed(now)
            }
        }
    }

    pub fn usable_accounts(&self, model: &str, quota_key: &str) -> Vec<Account> {
        self.accounts
            .iter()
            .filter(|e| self.is_usable(e.value(), model, quota_key))
            .map(|e| e.value().clone())
            .collect()
    }

    // True when the pool holds accounts but every one is permanently invalid
    // or disabled; only re-enrollment can recover from this state.
    pub fn all_invalid(&self) -> bool {
        !self.accounts.is_empty()
            && self
                .accounts
                .iter()
                .all(|e| e.invalid || !e.enabled)
    }

    // True when at least one selectable account exists but every one of them
    // is blocked by an active rate limit for this quota key.
    pub fn all_limited(&self, quota_key: &str) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        let mut any = false;
        for entry in self.accounts.iter() {
            let account = entry.value();
            if account.invalid || !account.enabled {
                continue;
            }
            any = true;
            let limited = account
                .model_rate_limits
                .get(quota_key)
                .map(|l| l.is_active(now))
                .unwrap_or(false);
            if !limited {
                return false;
            }
        }
        any
    }

    // Smallest remaining wait among the active limits for this quota key.
    pub fn min_wait_ms(&self, quota_key: &str) -> Option<u64> {
        let now = chrono::Utc::now().timestamp_millis();
        self.accounts
            .iter()
            .filter(|e| !e.invalid && e.enabled)
            .filter_map(|e| {
                e.model_rate_limits
                    .get(quota_key)
                    .filter(|l| l.is_active(now))
                    .map(|l| (l.reset_at - now).max(0) as u64)
            })
            .min()
    }

    pub fn get(&self, email: &str) -> Option<Account> {
        self.accounts.get(email).map(|e| e.value().clone())
    }

    pub fn snapshot(&self) -> Vec<Account> {
        self.accounts.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn next_round_robin(&self) -> usize {
        self.rr_cursor.fetch_add(1, Ordering::Relaxed)
    }

    pub fn set_project_id(self: &Arc<Self>, email: &str, project_id: &str) {
        if let Some(mut account) = self.accounts.get_mut(email) {
            account.project_id = Some(project_id.to_string());
        }
        self.schedule_save();
    }

    pub fn set_subscription_tier(self: &Arc<Self>, email: &str, tier: SubscriptionTier) {
        if let Some(mut account) = self.accounts.get_mut(email) {
            account.subscription_tier = tier;
        }
        self.schedule_save();
    }

    pub fn update_quota_snapshot(
        self: &Arc<Self>,
        email: &str,
        snapshot: std::collections::HashMap<String, QuotaSnapshot>,
        tier: Option<SubscriptionTier>,
    ) {
        if let Some(mut account) = self.accounts.get_mut(email) {
            account.quota_snapshot = snapshot;
            account.quota_updated_at = Some(chrono::Utc::now().timestamp_millis());
            if let Some(tier) = tier {
                account.subscription_tier = tier;
            }
        }
        self.schedule_save();
    }

    // Coalescing async save: at most one write in flight plus one pending.
    pub fn schedule_save(self: &Arc<Self>) {
        let Some(_) = &self.path else {
            return;
        };
        if self
            .save_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.save_pending.store(true, Ordering::SeqCst);
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                pool.write_to_disk();
                if !pool.save_pending.swap(false, Ordering::SeqCst) {
                    break;
                }
            }
            pool.save_in_flight.store(false, Ordering::SeqCst);
            // A save requested between the pending check and the flag reset
            // must not be lost.
            if pool.save_pending.swap(false, Ordering::SeqCst) {
                pool.schedule_save();
            }
        });
    }

    fn write_to_disk(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let accounts = self.snapshot();
        let result = serde_json::to_string_pretty(&accounts)
            .map_err(|e| e.to_string())
            .and_then(|json| {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let tmp = path.with_extension("json.tmp");
                std::fs::write(&tmp, json)
                    .and_then(|_| std::fs::rename(&tmp, path))
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            warn!("[W-ACCOUNTS-SAVE] failed_to_save_accounts: {}", e);
        }
    }
}
