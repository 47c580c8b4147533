use super::models::{ContentBlock, Message, MessageContent};
use crate::constants::MIN_SIGNATURE_LENGTH;
use crate::proxy::signature_cache::SignatureCache;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

const MAX_TOOL_RESULT_CHARS: usize = 200_000;

// Merge runs of same-role messages into one message so the outbound
// conversation alternates strictly.
pub fn merge_consecutive_messages(messages: &mut Vec<Message>) {
    if messages.len() < 2 {
        return;
    }
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());
    for msg in messages.drain(..) {
        match merged.last_mut() {
            Some(last) if last.role == msg.role => {
                let mut last_blocks = match std::mem::replace(
                    &mut last.content,
                    MessageContent::Array(Vec::new()),
                ) {
                    MessageContent::Array(blocks) => blocks,
                    MessageContent::String(s) => vec![ContentBlock::Text { text: s }],
                };
                match msg.content {
                    MessageContent::Array(blocks) => last_blocks.extend(blocks),
                    MessageContent::String(s) => last_blocks.push(ContentBlock::Text { text: s }),
                }
                last.content = MessageContent::Array(last_blocks);
            }
            _ => merged.push(msg),
        }
    }
    *messages = merged;
}

// Rewrite any tool-result whose preceding message lacks the matching
// tool-call into a plain text block; embedded images are preserved as
// standalone image blocks.
pub fn rewrite_orphaned_tool_results(messages: &mut [Message]) {
    let mut preceding_tool_ids: HashSet<String> = HashSet::new();
    for msg in messages.iter_mut() {
        let current_tool_ids: HashSet<String> = msg
            .blocks()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        if let MessageContent::Array(blocks) = &mut msg.content {
            let mut rewritten: Vec<ContentBlock> = Vec::with_capacity(blocks.len());
            for block in blocks.drain(..) {
                match block {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } if !preceding_tool_ids.contains(&tool_use_id) => {
                        warn!(
                            "[Orphan-Rewrite] Tool result {} has no preceding tool call, downgrading to text",
                            tool_use_id
                        );
                        let (text, images) = flatten_tool_result(&content, is_error.unwrap_or(false));
                        rewritten.push(ContentBlock::Text {
                            text: format!("[Orphaned Tool Result: {}] {}", tool_use_id, text),
                        });
                        rewritten.extend(images);
                    }
                    other => rewritten.push(other),
                }
            }
            *blocks = rewritten;
        }

        preceding_tool_ids = current_tool_ids;
    }
}

// Within each assistant message, order blocks reasoning -> text -> tool-call.
pub fn reorder_assistant_blocks(messages: &mut [Message]) {
    for msg in messages.iter_mut() {
        if msg.role != "assistant" {
            continue;
        }
        if let MessageContent::Array(blocks) = &mut msg.content {
            let rank = |b: &ContentBlock| match b {
                ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => 0u8,
                ContentBlock::ToolUse { .. } => 2,
                _ => 1,
            };
            blocks.sort_by_key(rank);
        }
    }
}

// Flatten a tool-result body into a single result string, carrying embedded
// images out separately.
fn flatten_tool_result(content: &Value, is_error: bool) -> (String, Vec<ContentBlock>) {
    let mut images = Vec::new();
    let mut merged = match content {
        Value::String(s) => s.clone(),
        Value::Array(arr) => arr
            .iter()
            .filter_map(|block| {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    Some(text.to_string())
                } else if block.get("type").and_then(|v| v.as_str()) == Some("image") {
                    if let Ok(image_block) =
                        serde_json::from_value::<ContentBlock>(block.clone())
                    {
                        images.push(image_block);
                    }
                    None
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    };

    if merged.len() > MAX_TOOL_RESULT_CHARS {
        warn!(
            "Truncating tool result from {} chars to {}",
            merged.len(),
            MAX_TOOL_RESULT_CHARS
        );
        let mut truncated = merged.chars().take(MAX_TOOL_RESULT_CHARS).collect::<String>();
        truncated.push_str("\n...[truncated output]");
        merged = truncated;
    }
    if merged.trim().is_empty() {
        merged = if is_error {
            "Tool execution failed with no output.".to_string()
        } else {
            "Command executed successfully.".to_string()
        };
    }
    (merged, images)
}

pub struct ContentsOptions<'a> {
    pub is_thinking_enabled: bool,
    pub session_id: &'a str,
    pub cache: &'a SignatureCache,
}

struct BuildState {
    tool_id_to_name: HashMap<String, String>,
    pending_tool_use_ids: Vec<String>,
    last_thought_signature: Option<String>,
}

fn block_to_parts(
    block: &ContentBlock,
    is_assistant: bool,
    options: &ContentsOptions<'_>,
    state: &mut BuildState,
) -> Vec<Value> {
    match block {
        ContentBlock::Text { text } => {
            if text.trim().is_empty() || text == "(no content)" {
                vec![]
            } else {
                vec![json!({"text": text})]
            }
        }
        ContentBlock::Thinking {
            thinking,
            signature,
        } => {
            if !options.is_thinking_enabled {
                if thinking.is_empty() {
                    return vec![];
                }
                return vec![json!({"text": thinking})];
            }
            match signature {
                Some(sig) if sig.len() >= MIN_SIGNATURE_LENGTH => {
                    state.last_thought_signature = Some(sig.clone());
                    vec![json!({
                        "text": thinking,
                        "thought": true,
                        "thoughtSignature": sig
                    })]
                }
                _ => {
                    // Unsigned reasoning never crosses to the signed upstream
                    // in thinking mode; downgrade it to visible text.
                    if thinking.is_empty() {
                        return vec![];
                    }
                    debug!("[Contents] Downgrading unsigned reasoning to text");
                    vec![json!({"text": thinking})]
                }
            }
        }
        ContentBlock::RedactedThinking { data } => {
            vec![json!({"text": format!("[Redacted Thinking: {}]", data)})]
        }
        ContentBlock::Image { source } | ContentBlock::Document { source } => {
            if source.source_type == "base64" {
                vec![json!({
                    "inlineData": {
                        "mimeType": source.media_type,
                        "data": source.data
                    }
                })]
            } else {
                vec![]
            }
        }
        ContentBlock::ToolUse {
            id,
            name,
            input,
            signature,
        } => {
            if is_assistant {
                state.pending_tool_use_ids.push(id.clone());
            }
            state.tool_id_to_name.insert(id.clone(), name.clone());

            let mut part = json!({
                "functionCall": {
                    "name": crate::proxy::common::json_schema::sanitize_tool_name(name),
                    "args": input,
                    "id": id
                }
            });
            let effective_sig = signature
                .clone()
                .filter(|s| s.len() >= MIN_SIGNATURE_LENGTH)
                .or_else(|| state.last_thought_signature.clone())
                .or_else(|| options.cache.get_tool_signature(id))
                .or_else(|| options.cache.get_session_signature(options.session_id));
            if let Some(sig) = effective_sig {
                part["thoughtSignature"] = json!(sig);
            } else if options.is_thinking_enabled {
                debug!("[Contents] No signature for tool_use {}, marking skip", id);
                part["thoughtSignature"] = json!("skip_thought_signature_validator");
            }
            vec![part]
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            state.pending_tool_use_ids.retain(|id| id != tool_use_id);
            let func_name = state
                .tool_id_to_name
                .get(tool_use_id)
                .cloned()
                .unwrap_or_else(|| tool_use_id.clone());
            let (merged, images) = flatten_tool_result(content, is_error.unwrap_or(false));

            let mut parts = vec![json!({
                "functionResponse": {
                    "name": func_name,
                    "response": {"result": merged},
                    "id": tool_use_id
                }
            })];
            for image in images {
                parts.extend(block_to_parts(&image, is_assistant, options, state));
            }
            parts
        }
    }
}

// Build the outbound G-format `contents` array. Guarantees: no message with
// empty parts, the first message is user-role, and every tool call left
// dangling by the client is closed with a synthetic result.
pub fn build_contents(
    messages: &[Message],
    options: &ContentsOptions<'_>,
) -> Result<Vec<Value>, String> {
    let mut contents: Vec<Value> = Vec::with_capacity(messages.len());
    let mut state = BuildState {
        tool_id_to_name: HashMap::new(),
        pending_tool_use_ids: Vec::new(),
        last_thought_signature: None,
    };

    for msg in messages {
        let is_assistant = msg.role == "assistant";
        let role = if is_assistant { "model" } else { "user" };

        // An assistant turn arriving while tool calls are still unanswered
        // means the loop was cut; close it with synthetic results first.
        if is_assistant && !state.pending_tool_use_ids.is_empty() {
            info!(
                "[Contents] Interrupted tool chain, injecting {} synthetic result(s)",
                state.pending_tool_use_ids.len()
            );
            let synthetic: Vec<Value> = state
                .pending_tool_use_ids
                .drain(..)
                .map(|id| {
                    let name = state.tool_id_to_name.get(&id).cloned().unwrap_or(id.clone());
                    json!({
                        "functionResponse": {
                            "name": name,
                            "response": {"result": "Tool execution interrupted. No result provided."},
                            "id": id
                        }
                    })
                })
                .collect();
            contents.push(json!({"role": "user", "parts": synthetic}));
        }

        let mut parts = Vec::new();
        match &msg.content {
            MessageContent::String(text) => {
                if !text.trim().is_empty() && text != "(no content)" {
                    parts.push(json!({"text": text.trim()}));
                }
            }
            MessageContent::Array(blocks) => {
                for block in blocks {
                    parts.extend(block_to_parts(block, is_assistant, options, &mut state));
                }
            }
        }

        if parts.is_empty() {
            // Empty text parts are rejected upstream; a period placeholder
            // keeps the turn in place.
            parts.push(json!({"text": "."}));
        }
        contents.push(json!({"role": role, "parts": parts}));
    }

    if contents
        .first()
        .and_then(|c| c.get("role"))
        .and_then(|r| r.as_str())
        == Some("model")
    {
        contents.insert(0, json!({"role": "user", "parts": [{"text": "."}]}));
    }

    Ok(contents)
}
