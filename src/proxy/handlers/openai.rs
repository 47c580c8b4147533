use super::common::{build_sse_response, check_client_auth, dispatch_error_response, error_payload};
use crate::proxy::dispatcher::dispatch;
use crate::proxy::mappers::claude::{collect_stream_to_response, transform_response};
use crate::proxy::mappers::openai::models::OpenAIRequest;
use crate::proxy::mappers::openai::streaming::{create_openai_sse_stream, OpenAISseStreamInput};
use crate::proxy::mappers::openai::{claude_to_openai_response, openai_to_claude_request};
use crate::proxy::session_manager::SessionTracker;
use crate::proxy::state::AppState;
use axum::{
    body::Body,
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{json, Value};
use tracing::{info, warn};

pub async fn handle_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = check_client_auth(&state, &headers) {
        return response;
    }

    let trace_id = crate::proxy::common::utils::generate_trace_id();
    let openai_request: OpenAIRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": {
                        "message": format!("Invalid request body: {}", e),
                        "type": "invalid_request_error"
                    }
                })),
            )
                .into_response();
        }
    };

    let claude_request = openai_to_claude_request(&openai_request);
    let session_id = SessionTracker::extract_session_id(&claude_request);
    state
        .sessions
        .touch(&session_id, claude_request.messages.len());

    info!(
        "[{}] Compat request | Model: {} | Stream: {} | Messages: {}",
        trace_id,
        openai_request.model,
        openai_request.stream,
        claude_request.messages.len()
    );

    let success = match dispatch(
        &state,
        &claude_request,
        &session_id,
        &trace_id,
        openai_request.stream,
    )
    .await
    {
        Ok(s) => s,
        Err(e) => {
            warn!("[{}] Compat dispatch failed: {:?}", trace_id, e);
            return dispatch_error_response(e);
        }
    };

    let email = success.email.clone();
    let mapped_model = success.mapped_model.clone();

    if openai_request.stream {
        let relay = create_openai_sse_stream(OpenAISseStreamInput {
            upstream: Box::pin(success.response.bytes_stream()),
            trace_id,
            slot: Some(success.slot),
        });
        return build_sse_response(Body::from_stream(relay), &email, &mapped_model);
    }

    let gemini_response =
        match collect_stream_to_response(Box::pin(success.response.bytes_stream())).await {
            Ok(r) => r,
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(error_payload("api_error", &e)),
                )
                    .into_response();
            }
        };
    drop(success.slot);

    let claude_response = transform_response(
        &gemini_response,
        Some(&session_id),
        &mapped_model,
        &state.signature_cache,
    );
    let openai_response = claude_to_openai_response(&claude_response, &openai_request.model);
    Json(openai_response).into_response()
}

// O-format model list. Prefers live upstream discovery through a usable
// account; serves the static route table when discovery is unavailable.
pub async fn handle_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = check_client_auth(&state, &headers) {
        return response;
    }

    let mut model_ids: Option<Vec<String>> = None;
    for account in state.pool.snapshot() {
        if account.invalid || !account.enabled {
            continue;
        }
        let Ok(token) = state.auth.get_token(&account).await else {
            continue;
        };
        let project = account.project_id.as_deref().unwrap_or("default");
        match state.upstream.fetch_quota_snapshot(&token, project).await {
            Ok(snapshot) if !snapshot.is_empty() => {
                let mut ids: Vec<String> = snapshot
                    .keys()
                    .filter(|id| {
                        crate::proxy::common::model_mapping::is_gemini_model(id)
                            || crate::proxy::common::model_mapping::is_claude_model(id)
                    })
                    .cloned()
                    .collect();
                ids.sort();
                model_ids = Some(ids);
                break;
            }
            _ => continue,
        }
    }

    let ids = model_ids
        .unwrap_or_else(|| crate::proxy::common::model_mapping::listed_models(&state.config));
    let created = chrono::Utc::now().timestamp();
    let data: Vec<Value> = ids
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "trestle"
            })
        })
        .collect();

    Json(json!({"object": "list", "data": data})).into_response()
}
