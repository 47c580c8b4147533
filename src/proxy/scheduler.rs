use crate::proxy::state::AppState;
use tokio::time::{interval, Duration};
use tracing::debug;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

// Periodic maintenance: TTL sweeps for caches and sessions, expired
// rate-limit cleanup, and persistence flushes.
pub fn start_scheduler(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = interval(SWEEP_INTERVAL);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;

            let swept_signatures = state.signature_cache.sweep_expired();
            let swept_sessions = state.sessions.sweep_idle();
            let cleared_limits = state.pool.clear_expired();
            debug!(
                "Sweep: {} signature(s), {} session(s), {} rate limit(s)",
                swept_signatures, swept_sessions, cleared_limits
            );

            state.signature_cache.save();
            state.usage.save();
        }
    });
}
