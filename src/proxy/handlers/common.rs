use crate::proxy::dispatcher::DispatchError;
use crate::proxy::state::AppState;
use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

// Client-facing auth: when an API key is configured, `x-api-key` or a bearer
// token must match it.
pub fn check_client_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.config.api_key else {
        return Ok(());
    };

    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });

    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "type": "error",
                "error": {
                    "type": "authentication_error",
                    "message": "Invalid API key"
                }
            })),
        )
            .into_response())
    }
}

pub fn error_payload(error_type: &str, message: &str) -> serde_json::Value {
    json!({
        "type": "error",
        "error": {
            "type": error_type,
            "message": message
        }
    })
}

// Client status mirrors the classification. Exhausted-model responses use
// 400 rather than 429: 429 triggers client-side auto-retry storms against a
// pool that is already drained.
pub fn dispatch_error_response(error: DispatchError) -> Response {
    match error {
        DispatchError::RateLimited { message, reset_ms } => {
            let mut payload = error_payload("invalid_request_error", &message);
            if let Some(reset) = reset_ms {
                payload["error"]["reset_in_seconds"] = json!(reset / 1000);
            }
            (StatusCode::BAD_REQUEST, Json(payload)).into_response()
        }
        DispatchError::NoAccounts(message) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(error_payload(
                "overloaded_error",
                &format!("No available accounts: {}", message),
            )),
        )
            .into_response(),
        DispatchError::Fatal { status, message } => {
            let status_code = match status {
                401 => StatusCode::UNAUTHORIZED,
                403 => StatusCode::FORBIDDEN,
                _ => StatusCode::BAD_REQUEST,
            };
            let error_type = match status {
                401 => "authentication_error",
                403 => "permission_error",
                _ => "invalid_request_error",
            };
            (status_code, Json(error_payload(error_type, &message))).into_response()
        }
        DispatchError::Transform(message) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(error_payload(
                "api_error",
                &format!("Transform error: {}", message),
            )),
        )
            .into_response(),
        DispatchError::MaxRetries(message) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(error_payload("overloaded_error", &message)),
        )
            .into_response(),
    }
}

pub fn build_sse_response(body: Body, account_email: &str, mapped_model: &str) -> Response {
    Response::builder()
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no")
        .header("X-Account-Email", account_email)
        .header("X-Mapped-Model", mapped_model)
        .body(body)
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::config::ProxyConfig;

    fn state_with_key(key: Option<&str>) -> AppState {
        let mut config = ProxyConfig::default();
        config.api_key = key.map(String::from);
        AppState::for_test(config)
    }

    #[test]
    fn auth_passes_without_configured_key() {
        let state = state_with_key(None);
        assert!(check_client_auth(&state, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn auth_accepts_x_api_key_and_bearer() {
        let state = state_with_key(Some("secret"));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "secret".parse().unwrap());
        assert!(check_client_auth(&state, &headers).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        assert!(check_client_auth(&state, &headers).is_ok());
    }

    #[test]
    fn auth_rejects_missing_or_wrong_key() {
        let state = state_with_key(Some("secret"));
        assert!(check_client_auth(&state, &HeaderMap::new()).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "wrong".parse().unwrap());
        assert!(check_client_auth(&state, &headers).is_err());
    }

    #[test]
    fn rate_limited_errors_use_400_not_429() {
        let response = dispatch_error_response(DispatchError::RateLimited {
            message: "all accounts rate-limited".to_string(),
            reset_ms: Some(30_000),
        });
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn fatal_auth_errors_keep_their_status() {
        let response = dispatch_error_response(DispatchError::Fatal {
            status: 401,
            message: "bad token".to_string(),
        });
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = dispatch_error_response(DispatchError::Fatal {
            status: 403,
            message: "no permission".to_string(),
        });
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
