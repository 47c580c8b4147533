pub mod constants;
pub mod error;
pub mod logging;
pub mod models;
pub mod proxy;

use tracing::{error, info, warn};

fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn apply_env_overrides(config: &mut proxy::config::ProxyConfig) {
    if let Ok(port) = std::env::var("PORT") {
        let trimmed = port.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u16>() {
                Ok(p) if p > 0 => {
                    config.port = p;
                    info!("Using proxy port from environment: {}", p);
                }
                _ => warn!("[W-PORT-INVALID] ignoring_invalid_port_value: {}", port),
            }
        }
    }

    if let Ok(key) = std::env::var("API_KEY") {
        if !key.trim().is_empty() {
            info!("Using API key from environment");
            config.api_key = Some(key);
        }
    }

    if let Ok(val) = std::env::var("TRESTLE_INFINITE_RETRY") {
        match parse_env_bool(&val) {
            Some(parsed) => config.infinite_retry_mode = parsed,
            None => warn!(
                "[W-INFINITE-RETRY-INVALID] ignoring_invalid_infinite_retry_value: {}",
                val
            ),
        }
    }

    if let Ok(val) = std::env::var("TRESTLE_AUTO_FALLBACK") {
        match parse_env_bool(&val) {
            Some(parsed) => config.auto_fallback = parsed,
            None => warn!(
                "[W-AUTO-FALLBACK-INVALID] ignoring_invalid_auto_fallback_value: {}",
                val
            ),
        }
    }

    if let Ok(val) = std::env::var("TRESTLE_MAX_RETRIES") {
        match val.trim().parse::<u32>() {
            Ok(n) if (1..=20).contains(&n) => config.max_retries = n,
            _ => warn!(
                "[W-MAX-RETRIES-INVALID] ignoring_invalid_max_retries_value: {}",
                val
            ),
        }
    }

    if let Ok(val) = std::env::var("TRESTLE_HEADER_MODE") {
        match proxy::config::HeaderMode::parse(&val) {
            Some(mode) => config.header_mode = mode,
            None => warn!(
                "[W-HEADER-MODE-INVALID] ignoring_invalid_header_mode_value: {}",
                val
            ),
        }
    }
}

pub fn run() {
    logging::init_logger();

    let mut config = match proxy::config::load_config() {
        Ok(c) => c,
        Err(e) => {
            error!("[E-CONFIG-LOAD] failed_to_load_config: {}", e);
            std::process::exit(1);
        }
    };

    apply_env_overrides(&mut config);

    if let Err(errors) = proxy::config::validate_config(&config) {
        error!(
            "[E-CONFIG-INVALID] configuration_validation_failed:\n{}",
            errors.join("\n")
        );
        std::process::exit(1);
    }

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        let state = match proxy::state::AppState::initialize(config).await {
            Ok(s) => s,
            Err(e) => {
                error!("[E-RUNTIME-STARTUP] {}", e);
                std::process::exit(1);
            }
        };

        proxy::scheduler::start_scheduler(state.clone());

        if let Err(e) = proxy::server::serve(state).await {
            error!("[E-SERVER] proxy_server_exited_with_error: {}", e);
            std::process::exit(1);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::config::{HeaderMode, ProxyConfig};
    use std::sync::{Mutex, OnceLock};

    static LIB_TEST_ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    #[test]
    fn parse_env_bool_accepts_common_forms() {
        assert_eq!(parse_env_bool("yes"), Some(true));
        assert_eq!(parse_env_bool("OFF"), Some(false));
        assert_eq!(parse_env_bool("maybe"), None);
    }

    #[test]
    fn env_port_overrides_config_port() {
        let _guard = LIB_TEST_ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("env test lock");
        std::env::set_var("PORT", "8045");

        let mut config = ProxyConfig::default();
        config.port = 8145;
        apply_env_overrides(&mut config);
        std::env::remove_var("PORT");

        assert_eq!(config.port, 8045);
    }

    #[test]
    fn env_header_mode_overrides_config() {
        let _guard = LIB_TEST_ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("env test lock");
        std::env::set_var("TRESTLE_HEADER_MODE", "cli");

        let mut config = ProxyConfig::default();
        config.header_mode = HeaderMode::Antigravity;
        apply_env_overrides(&mut config);
        std::env::remove_var("TRESTLE_HEADER_MODE");

        assert!(matches!(config.header_mode, HeaderMode::Cli));
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let _guard = LIB_TEST_ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("env test lock");
        std::env::set_var("TRESTLE_MAX_RETRIES", "99");

        let mut config = ProxyConfig::default();
        let original = config.max_retries;
        apply_env_overrides(&mut config);
        std::env::remove_var("TRESTLE_MAX_RETRIES");

        assert_eq!(config.max_retries, original);
    }
}
