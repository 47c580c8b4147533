use super::common::{build_sse_response, check_client_auth, dispatch_error_response, error_payload};
use crate::proxy::dispatcher::dispatch;
use crate::proxy::mappers::claude::models::ClaudeRequest;
use crate::proxy::mappers::claude::{
    collect_stream_to_response, create_claude_sse_stream, transform_response, ClaudeSseStreamInput,
};
use crate::proxy::mappers::context_window::estimate_request_tokens;
use crate::proxy::mappers::gemini::GeminiResponse;
use crate::proxy::session_manager::SessionTracker;
use crate::proxy::state::AppState;
use axum::{
    body::Body,
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub async fn handle_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = check_client_auth(&state, &headers) {
        return response;
    }

    let trace_id = crate::proxy::common::utils::generate_trace_id();
    let request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(error_payload(
                    "invalid_request_error",
                    &format!("Invalid request body: {}", e),
                )),
            )
                .into_response();
        }
    };

    let session_id = SessionTracker::extract_session_id(&request);
    state.sessions.touch(&session_id, request.messages.len());

    info!(
        "[{}] Request | Model: {} | Stream: {} | Messages: {} | Tools: {} | Session: {}",
        trace_id,
        request.model,
        request.stream,
        request.messages.len(),
        request.tools.as_ref().map(|t| t.len()).unwrap_or(0),
        session_id
    );

    let estimated_tokens = estimate_request_tokens(&request) as u64;
    state.sessions.record_tokens(&session_id, estimated_tokens);

    let success = match dispatch(&state, &request, &session_id, &trace_id, request.stream).await {
        Ok(s) => s,
        Err(e) => {
            warn!("[{}] Dispatch failed: {:?}", trace_id, e);
            return dispatch_error_response(e);
        }
    };

    let email = success.email.clone();
    let mapped_model = success.mapped_model.clone();

    if request.stream {
        let relay = create_claude_sse_stream(ClaudeSseStreamInput {
            upstream: Box::pin(success.response.bytes_stream()),
            trace_id: trace_id.clone(),
            email: email.clone(),
            session_id: Some(session_id),
            cache: state.signature_cache.clone(),
            slot: Some(success.slot),
        });
        return build_sse_response(Body::from_stream(relay), &email, &mapped_model);
    }

    // Unary client. The upstream call may still have gone over SSE (thinking
    // models prefer it); collapse the stream into one response first.
    let gemini_response = if success.used_sse {
        match collect_stream_to_response(Box::pin(success.response.bytes_stream())).await {
            Ok(r) => r,
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(error_payload("api_error", &format!("Stream collect error: {}", e))),
                )
                    .into_response();
            }
        }
    } else {
        match read_unary_response(success.response).await {
            Ok(r) => r,
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(error_payload("api_error", &e)),
                )
                    .into_response();
            }
        }
    };
    drop(success.slot);

    let claude_response = transform_response(
        &gemini_response,
        Some(&session_id),
        &mapped_model,
        &state.signature_cache,
    );
    state
        .sessions
        .record_tokens(&session_id, claude_response.usage.output_tokens as u64);
    debug!(
        "[{}] ✓ Completed | Account: {} | In: {} | Out: {}",
        trace_id, email, claude_response.usage.input_tokens, claude_response.usage.output_tokens
    );

    let mut response = Json(claude_response).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = email.parse() {
        headers.insert("X-Account-Email", value);
    }
    if let Ok(value) = mapped_model.parse() {
        headers.insert("X-Mapped-Model", value);
    }
    response
}

async fn read_unary_response(response: reqwest::Response) -> Result<GeminiResponse, String> {
    let value: Value = response
        .json()
        .await
        .map_err(|e| format!("Unary response unreadable: {}", e))?;
    // The unary endpoint wraps the payload in a `response` envelope.
    let inner = value.get("response").cloned().unwrap_or(value);
    serde_json::from_value(inner).map_err(|e| format!("Unary response malformed: {}", e))
}

pub async fn handle_count_tokens(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = check_client_auth(&state, &headers) {
        return response;
    }
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({
            "type": "error",
            "error": {
                "type": "not_implemented",
                "message": "count_tokens is not supported by this proxy"
            }
        })),
    )
        .into_response()
}
