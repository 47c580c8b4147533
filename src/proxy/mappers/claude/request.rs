use super::models::ClaudeRequest;
use super::request_content::{
    build_contents, merge_consecutive_messages, reorder_assistant_blocks,
    rewrite_orphaned_tool_results, ContentsOptions,
};
use super::request_generation::{
    build_generation_config, build_system_instruction, build_tool_config, build_tools,
};
use super::thinking::{close_tool_loop_for_thinking, filter_invalid_thinking_blocks, restore_signatures};
use crate::proxy::common::model_mapping;
use crate::proxy::config::ProxyConfig;
use crate::proxy::mappers::context_window::truncate_history;
use crate::proxy::signature_cache::SignatureCache;
use serde_json::{json, Value};
use tracing::debug;

pub struct TransformOptions<'a> {
    pub project_id: &'a str,
    pub session_id: &'a str,
    pub mapped_model: &'a str,
    pub cache: &'a SignatureCache,
    pub config: &'a ProxyConfig,
}

fn thinking_requested(claude_req: &ClaudeRequest, config: &ProxyConfig) -> bool {
    match &claude_req.thinking {
        Some(t) => t.type_ == "enabled",
        None => config.default_thinking_level.is_some() || config.default_thinking_budget.is_some(),
    }
}

// Turn an A-format request into the upstream payload envelope. The passes
// run in a fixed order; each one assumes the previous pass's invariants.
pub fn transform_request(
    claude_req: &ClaudeRequest,
    opts: &TransformOptions<'_>,
) -> Result<Value, String> {
    let mut messages = claude_req.messages.clone();
    let is_thinking_enabled = thinking_requested(claude_req, opts.config)
        && model_mapping::model_supports_thinking(opts.mapped_model);

    merge_consecutive_messages(&mut messages);

    if is_thinking_enabled {
        close_tool_loop_for_thinking(&mut messages);
    }

    truncate_history(&mut messages, opts.config.max_context_tokens);
    rewrite_orphaned_tool_results(&mut messages);

    restore_signatures(&mut messages, opts.session_id, opts.cache);
    reorder_assistant_blocks(&mut messages);

    // Reasoning whose signature is missing or was minted for the other model
    // family must never be replayed upstream.
    filter_invalid_thinking_blocks(&mut messages, opts.mapped_model, opts.cache);

    let has_tools = claude_req
        .tools
        .as_ref()
        .map(|t| !t.is_empty())
        .unwrap_or(false);

    let contents = build_contents(
        &messages,
        &ContentsOptions {
            is_thinking_enabled,
            session_id: opts.session_id,
            cache: opts.cache,
        },
    )?;

    let mut inner_request = json!({ "contents": contents });

    if let Some(system_instruction) = build_system_instruction(
        &claude_req.system,
        opts.mapped_model,
        is_thinking_enabled,
        has_tools,
    ) {
        inner_request["systemInstruction"] = system_instruction;
    }

    let generation_config =
        build_generation_config(claude_req, opts.mapped_model, is_thinking_enabled, opts.config);
    if generation_config
        .as_object()
        .map(|o| !o.is_empty())
        .unwrap_or(false)
    {
        inner_request["generationConfig"] = generation_config;
    }

    if let Some(tools) = build_tools(&claude_req.tools) {
        inner_request["tools"] = tools;
        inner_request["toolConfig"] = build_tool_config(&claude_req.tool_choice);
    }

    // Upstream prompt caching keys off the session id.
    inner_request["sessionId"] = json!(opts.session_id);

    let request_id = format!("agent-{}", uuid::Uuid::new_v4());
    debug!(
        "[Transform] Built payload for {} (requestId: {})",
        opts.mapped_model, request_id
    );

    Ok(json!({
        "project": opts.project_id,
        "requestId": request_id,
        "request": inner_request,
        "model": opts.mapped_model,
        "userAgent": "trestle",
        "requestType": opts.config.header_mode.quota_class(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options<'a>(cache: &'a SignatureCache, config: &'a ProxyConfig) -> TransformOptions<'a> {
        TransformOptions {
            project_id: "proj-1",
            session_id: "sid-test",
            mapped_model: "gemini-3-pro-high",
            cache,
            config,
        }
    }

    fn request(value: serde_json::Value) -> ClaudeRequest {
        serde_json::from_value(value).expect("request")
    }

    #[test]
    fn envelope_carries_project_model_and_session() {
        let cache = SignatureCache::new();
        let config = ProxyConfig::default();
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}]
        }));

        let payload = transform_request(&req, &options(&cache, &config)).expect("payload");
        assert_eq!(payload["project"], "proj-1");
        assert_eq!(payload["model"], "gemini-3-pro-high");
        assert_eq!(payload["requestType"], "antigravity");
        assert_eq!(payload["request"]["sessionId"], "sid-test");
        assert!(payload["requestId"].as_str().unwrap().starts_with("agent-"));
        assert_eq!(payload["request"]["contents"][0]["role"], "user");
        assert_eq!(payload["request"]["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn system_prompt_and_tools_are_attached() {
        let cache = SignatureCache::new();
        let config = ProxyConfig::default();
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "system": "Be terse.",
            "tools": [{"name": "t", "input_schema": {"type": "object", "properties": {"q": {"type": "string"}}}}]
        }));

        let payload = transform_request(&req, &options(&cache, &config)).expect("payload");
        let system_parts = payload["request"]["systemInstruction"]["parts"]
            .as_array()
            .unwrap();
        assert!(system_parts.iter().any(|p| p["text"] == "Be terse."));
        assert_eq!(
            payload["request"]["tools"][0]["functionDeclarations"][0]["name"],
            "t"
        );
        assert_eq!(
            payload["request"]["toolConfig"]["functionCallingConfig"]["mode"],
            "VALIDATED"
        );
    }

    #[test]
    fn thinking_request_gets_thinking_config() {
        let cache = SignatureCache::new();
        let config = ProxyConfig::default();
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}],
            "thinking": {"type": "enabled", "budget_tokens": 4096}
        }));

        let payload = transform_request(&req, &options(&cache, &config)).expect("payload");
        let thinking = &payload["request"]["generationConfig"]["thinkingConfig"];
        assert_eq!(thinking["includeThoughts"], true);
        assert_eq!(thinking["thinkingBudget"], 4096);
    }

    #[test]
    fn round_trip_of_plain_text_history_is_structural() {
        let cache = SignatureCache::new();
        let config = ProxyConfig::default();
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "question one"},
                {"role": "assistant", "content": [{"type": "text", "text": "answer one"}]},
                {"role": "user", "content": "question two"}
            ]
        }));

        let payload = transform_request(&req, &options(&cache, &config)).expect("payload");
        let contents = payload["request"]["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["parts"][0]["text"], "question one");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["text"], "answer one");
        assert_eq!(contents[2]["parts"][0]["text"], "question two");
    }

    #[test]
    fn orphaned_tool_result_payload_has_no_function_response() {
        let cache = SignatureCache::new();
        let config = ProxyConfig::default();
        let req = request(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "user", "content": "go"},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "T", "content": "done"}
                ]}
            ]
        }));

        let payload = transform_request(&req, &options(&cache, &config)).expect("payload");
        let contents = payload["request"]["contents"].as_array().unwrap();
        let as_text = serde_json::to_string(contents).unwrap();
        assert!(!as_text.contains("functionResponse"));
        assert!(as_text.contains("[Orphaned Tool Result: T]"));
    }
}
