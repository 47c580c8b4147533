use crate::proxy::common::model_mapping;
use crate::proxy::config::fallback_models;
use crate::proxy::mappers::claude::models::ClaudeRequest;
use crate::proxy::mappers::claude::{transform_request, TransformOptions};
use crate::proxy::mappers::error_classifier::{classify_status, ErrorKind};
use crate::proxy::state::AppState;
use crate::proxy::token::rate::LimitType;
use crate::proxy::token::{quota_key, SelectCtx, SlotGuard};
use crate::proxy::upstream::auth::AuthError;
use std::collections::HashSet;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum DispatchError {
    // All accounts exhausted for the model; carries the earliest reset.
    RateLimited {
        message: String,
        reset_ms: Option<u64>,
    },
    NoAccounts(String),
    // Upstream rejected the request; not retryable.
    Fatal { status: u16, message: String },
    Transform(String),
    MaxRetries(String),
}

pub struct DispatchSuccess {
    pub response: reqwest::Response,
    pub email: String,
    pub mapped_model: String,
    pub slot: SlotGuard,
    pub used_sse: bool,
}

fn thinking_requested(request: &ClaudeRequest) -> bool {
    request
        .thinking
        .as_ref()
        .map(|t| t.type_ == "enabled")
        .unwrap_or(false)
}

// The outer retry loop: pick account -> translate -> call -> classify ->
// retry / switch / wait / fall back.
pub async fn dispatch(
    state: &AppState,
    request: &ClaudeRequest,
    session_id: &str,
    trace_id: &str,
    want_stream: bool,
) -> Result<DispatchSuccess, DispatchError> {
    let config = &state.config;
    let requested_model =
        model_mapping::resolve_model_route(&request.model, &config.model_mapping);
    let chain = fallback_models(config, &requested_model);
    let quota_class = config.header_mode.quota_class();
    let started = Instant::now();

    for (chain_idx, model) in chain.iter().enumerate() {
        if chain_idx > 0 {
            info!(
                "[{}] Descending fallback chain: {} -> {}",
                trace_id, requested_model, model
            );
        }
        match dispatch_one_model(
            state,
            request,
            session_id,
            trace_id,
            want_stream,
            model,
            quota_class,
            &started,
        )
        .await
        {
            Ok(success) => return Ok(success),
            // Fatal outcomes stop the chain; exhaustion descends it.
            Err(e @ DispatchError::Fatal { .. }) | Err(e @ DispatchError::Transform(_)) => {
                return Err(e)
            }
            Err(e) => {
                let is_last = chain_idx + 1 == chain.len();
                if is_last {
                    return Err(e);
                }
                warn!(
                    "[{}] Model {} exhausted ({:?}), trying fallback",
                    trace_id, model, e
                );
            }
        }
    }

    Err(DispatchError::MaxRetries(
        "fallback chain exhausted".to_string(),
    ))
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_one_model(
    state: &AppState,
    request: &ClaudeRequest,
    session_id: &str,
    trace_id: &str,
    want_stream: bool,
    model: &str,
    quota_class: &str,
    started: &Instant,
) -> Result<DispatchSuccess, DispatchError> {
    let config = &state.config;
    let key = quota_key(model, Some(quota_class));
    let max_attempts = (config.max_retries as usize).max(state.pool.len() + 1);
    let mut attempted: HashSet<String> = HashSet::new();
    let mut attempt = 0usize;

    while attempt < max_attempts {
        if started.elapsed().as_millis() as u64 > config.max_wait_before_error_ms
            && !config.infinite_retry_mode
        {
            return Err(DispatchError::MaxRetries(format!(
                "request exceeded {}ms budget",
                config.max_wait_before_error_ms
            )));
        }

        let selection = state.selector.select(
            &state.pool,
            &state.sessions,
            model,
            &key,
            &SelectCtx {
                session_id: Some(session_id),
                attempted: &attempted,
                max_wait_before_error_ms: config.max_wait_before_error_ms,
            },
        );

        let Some(email) = selection.account else {
            if state.pool.is_empty() {
                return Err(DispatchError::NoAccounts(
                    "no accounts enrolled".to_string(),
                ));
            }
            if state.pool.all_invalid() {
                return Err(DispatchError::Fatal {
                    status: 401,
                    message: "every enrolled account is invalid or disabled; re-enroll to restore service"
                        .to_string(),
                });
            }
            if state.pool.all_limited(&key) {
                let wait = state
                    .pool
                    .min_wait_ms(&key)
                    .or(if selection.wait_ms > 0 {
                        Some(selection.wait_ms)
                    } else {
                        None
                    })
                    .unwrap_or(config.default_cooldown_ms);
                if wait > config.max_wait_before_error_ms && !config.infinite_retry_mode {
                    return Err(DispatchError::RateLimited {
                        message: format!(
                            "all accounts rate-limited for {}; earliest reset in {}s",
                            model,
                            wait / 1000
                        ),
                        reset_ms: Some(wait),
                    });
                }
                wait_with_progress(wait, trace_id, config.wait_progress_updates).await;
                state.pool.clear_expired();
                if state.pool.all_limited(&key) {
                    // Recorded reset times are upper bounds; probe anyway.
                    state.pool.reset_all_for(&key);
                }
                continue;
            }
            // Accounts exist but none selectable this instant (e.g. all at
            // their concurrency cap). Brief pause, no attempt consumed.
            debug!("[{}] No selectable account, pausing before reselect", trace_id);
            sleep(Duration::from_millis(selection.wait_ms.max(2_000))).await;
            continue;
        };

        if selection.wait_ms > 0 {
            sleep(Duration::from_millis(selection.wait_ms)).await;
        }

        let Some(slot) = state.pool.borrow(&email) else {
            attempted.insert(email);
            continue;
        };

        match attempt_account(
            state, request, session_id, trace_id, want_stream, model, &key, &email, slot,
        )
        .await?
        {
            AccountOutcome::Success(success) => return Ok(success),
            AccountOutcome::Switch => {
                attempted.insert(email);
                attempt += 1;
            }
            AccountOutcome::SwitchWithoutAttempt => {
                attempted.insert(email);
            }
        }
    }

    Err(DispatchError::MaxRetries(format!(
        "exhausted {} attempt(s) for {}",
        max_attempts, model
    )))
}

enum AccountOutcome {
    Success(DispatchSuccess),
    Switch,
    SwitchWithoutAttempt,
}

#[allow(clippy::too_many_arguments)]
async fn attempt_account(
    state: &AppState,
    request: &ClaudeRequest,
    session_id: &str,
    trace_id: &str,
    want_stream: bool,
    model: &str,
    key: &str,
    email: &str,
    slot: SlotGuard,
) -> Result<AccountOutcome, DispatchError> {
    let config = &state.config;
    let Some(mut account) = state.pool.get(email) else {
        return Ok(AccountOutcome::SwitchWithoutAttempt);
    };

    let mut access_token = match state.auth.get_token(&account).await {
        Ok(token) => token,
        Err(AuthError::Permanent(reason)) => {
            state.pool.mark_invalid(email, &reason);
            state.selector.record_failure(email);
            return Ok(AccountOutcome::Switch);
        }
        Err(AuthError::Transient(reason)) => {
            warn!("[{}] Token refresh failed for {}: {}", trace_id, email, reason);
            sleep(Duration::from_secs(1)).await;
            return Ok(AccountOutcome::Switch);
        }
    };

    // Project id is derived from upstream once and cached on the account.
    if account.project_id.is_none() {
        match state.upstream.load_code_assist(&access_token).await {
            Ok((Some(project), tier)) => {
                state.pool.set_project_id(email, &project);
                state.pool.set_subscription_tier(email, tier);
                account.project_id = Some(project);
            }
            Ok((None, _)) => {
                account.project_id = Some("default".to_string());
            }
            Err(e) => {
                debug!("[{}] Project discovery failed for {}: {}", trace_id, email, e);
                account.project_id = Some("default".to_string());
            }
        }
    }
    let project_id = account.project_id.clone().unwrap_or_default();

    // Quota snapshots refresh lazily in the background once stale.
    let now_ms = chrono::Utc::now().timestamp_millis();
    let snapshot_stale = account
        .quota_updated_at
        .map(|t| now_ms - t > config.account_selection.quota.stale_ms)
        .unwrap_or(true);
    if snapshot_stale {
        let refresh_state = state.clone();
        let refresh_email = email.to_string();
        let refresh_token = access_token.clone();
        let refresh_project = project_id.clone();
        tokio::spawn(async move {
            match refresh_state
                .upstream
                .fetch_quota_snapshot(&refresh_token, &refresh_project)
                .await
            {
                Ok(snapshot) if !snapshot.is_empty() => {
                    refresh_state
                        .pool
                        .update_quota_snapshot(&refresh_email, snapshot, None);
                    debug!("Quota snapshot refreshed for {}", refresh_email);
                }
                Ok(_) => {}
                Err(e) => debug!("Quota refresh failed for {}: {}", refresh_email, e),
            }
        });
    }

    let payload = transform_request(
        request,
        &TransformOptions {
            project_id: &project_id,
            session_id,
            mapped_model: model,
            cache: &state.signature_cache,
            config,
        },
    )
    .map_err(DispatchError::Transform)?;

    // SSE is preferred for thinking-capable targets even on unary requests;
    // the unary endpoint is known to hang on long reasoning turns.
    let use_sse = want_stream
        || thinking_requested(request)
        || model_mapping::model_supports_thinking(model);
    let (method, query) = if use_sse {
        ("streamGenerateContent", Some("alt=sse"))
    } else {
        ("generateContent", None)
    };

    info!(
        "[{}] ✓ Using account: {} | model: {} | method: {}",
        trace_id, email, model, method
    );

    let mut min_reset_ms: Option<u64> = None;
    let mut saw_rate_limit = false;
    let mut limit_type = LimitType::UserQuota;
    let hosts: Vec<String> = state.upstream.hosts().to_vec();

    let mut host_idx = 0;
    let mut auth_retried = false;
    let mut capacity_retried = false;
    while host_idx < hosts.len() {
        let host = &hosts[host_idx];
        let response = match state
            .upstream
            .call_host(host, method, &access_token, &payload, query)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("[{}] Network failure at {}: {}", trace_id, host, e);
                state.selector.record_failure(email);
                sleep(Duration::from_secs(1)).await;
                return Ok(AccountOutcome::Switch);
            }
        };

        let status = response.status();
        if status.is_success() {
            state.pool.mark_success(email, key);
            state.selector.record_success(email);
            state.usage.record(model);
            return Ok(AccountOutcome::Success(DispatchSuccess {
                response,
                email: email.to_string(),
                mapped_model: model.to_string(),
                slot,
                used_sse: use_sse,
            }));
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.text().await.unwrap_or_default();
        let classified = classify_status(status.as_u16(), &body, retry_after.as_deref());
        debug!(
            "[{}] Upstream {} at {} classified as {:?}",
            trace_id, status, host, classified.kind
        );

        match classified.kind {
            ErrorKind::AuthExpired => {
                state.auth.invalidate(email);
                if !auth_retried {
                    auth_retried = true;
                    // One refresh-and-retry on the same endpoint.
                    match state.auth.get_token(&account).await {
                        Ok(token) => {
                            access_token = token;
                            continue;
                        }
                        Err(AuthError::Permanent(reason)) => {
                            state.pool.mark_invalid(email, &reason);
                            state.selector.record_failure(email);
                            return Ok(AccountOutcome::Switch);
                        }
                        Err(AuthError::Transient(_)) => {}
                    }
                }
                host_idx += 1;
            }
            ErrorKind::AuthPermanentlyInvalid => {
                state.pool.mark_invalid(email, &classified.message);
                state.selector.record_failure(email);
                return Ok(AccountOutcome::Switch);
            }
            ErrorKind::RateLimitedCapacity => {
                // Server-wide pressure: short backoff, same account, no
                // account-level penalty.
                if !capacity_retried {
                    capacity_retried = true;
                    sleep(Duration::from_secs(5)).await;
                    continue;
                }
                saw_rate_limit = true;
                limit_type = LimitType::Capacity;
                min_reset_ms = min_opt(min_reset_ms, classified.retry_after_ms);
                host_idx += 1;
            }
            ErrorKind::RateLimitedUserQuota => {
                saw_rate_limit = true;
                limit_type = LimitType::UserQuota;
                min_reset_ms = min_opt(min_reset_ms, classified.retry_after_ms);
                host_idx += 1;
            }
            ErrorKind::RateLimitedDaily => {
                saw_rate_limit = true;
                limit_type = LimitType::Daily;
                min_reset_ms = min_opt(min_reset_ms, classified.retry_after_ms);
                host_idx += 1;
            }
            ErrorKind::ServerTransient => {
                // Exponential band from config: base, 2x base, ... capped.
                let backoff = config
                    .retry_base_ms
                    .saturating_mul(1u64 << (host_idx.min(5) as u32))
                    .min(config.retry_max_ms);
                sleep(Duration::from_millis(backoff)).await;
                host_idx += 1;
            }
            ErrorKind::BadRequest => {
                return Err(DispatchError::Fatal {
                    status: status.as_u16(),
                    message: classified.message,
                });
            }
            ErrorKind::NetworkTransient | ErrorKind::Unknown => {
                state.selector.record_failure(email);
                let backoff = if classified.kind == ErrorKind::Unknown {
                    Duration::from_millis(config.retry_max_ms.min(30_000))
                } else {
                    Duration::from_secs(1)
                };
                sleep(backoff).await;
                return Ok(AccountOutcome::Switch);
            }
            ErrorKind::ContentFiltered => {
                // Filtered content is a success-path outcome; the translator
                // already surfaced an explanatory block, so this kind never
                // reaches the dispatcher as an error status.
                host_idx += 1;
            }
        }
    }

    drop(slot);
    if saw_rate_limit {
        state.pool.mark_rate_limited(
            email,
            key,
            min_reset_ms,
            limit_type,
            config.default_cooldown_ms,
            config.max_cooldown_ms,
        );
        state.selector.record_rate_limit(email);
    } else {
        state.selector.record_failure(email);
    }
    Ok(AccountOutcome::Switch)
}

fn min_opt(current: Option<u64>, incoming: Option<u64>) -> Option<u64> {
    match (current, incoming) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

// Sleep in 10-second chunks, logging progress so long waits stay visible.
async fn wait_with_progress(total_ms: u64, trace_id: &str, progress: bool) {
    let mut remaining = total_ms;
    while remaining > 0 {
        let chunk = remaining.min(10_000);
        sleep(Duration::from_millis(chunk)).await;
        remaining -= chunk;
        if progress && remaining > 0 {
            info!(
                "[{}] Waiting for rate-limit reset, {}s remaining",
                trace_id,
                remaining / 1000
            );
        }
    }
}
