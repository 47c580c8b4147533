use super::models::{ContentBlock, Message, MessageContent};
use crate::constants::MIN_SIGNATURE_LENGTH;
use crate::proxy::signature_cache::SignatureCache;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct ConversationState {
    pub in_tool_loop: bool,
    pub interrupted_tool: bool,
    pub last_assistant_idx: Option<usize>,
}

pub fn analyze_conversation_state(messages: &[Message]) -> ConversationState {
    let mut state = ConversationState::default();
    if messages.is_empty() {
        return state;
    }

    for (i, msg) in messages.iter().enumerate().rev() {
        if msg.role == "assistant" {
            state.last_assistant_idx = Some(i);
            break;
        }
    }

    let has_tool_use = state
        .last_assistant_idx
        .and_then(|idx| messages.get(idx))
        .map(Message::has_tool_use)
        .unwrap_or(false);
    if !has_tool_use {
        return state;
    }

    if let Some(last_msg) = messages.last() {
        if last_msg.role == "user" {
            if last_msg.has_tool_result() {
                state.in_tool_loop = true;
                debug!("[Thinking-Recovery] Active tool loop (last msg is ToolResult)");
            } else {
                state.interrupted_tool = true;
                debug!("[Thinking-Recovery] Interrupted tool (last msg is plain user)");
            }
        }
    }
    state
}

fn has_valid_signed_thinking(msg: &Message) -> bool {
    msg.blocks()
        .map(|blocks| {
            blocks.iter().any(|b| match b {
                ContentBlock::Thinking {
                    thinking,
                    signature,
                } => {
                    !thinking.is_empty()
                        && signature
                            .as_ref()
                            .map(|s| s.len() >= MIN_SIGNATURE_LENGTH)
                            .unwrap_or(false)
                }
                _ => false,
            })
        })
        .unwrap_or(false)
}

// Thinking-capable targets reject a replayed tool loop whose last assistant
// turn carries no valid signed reasoning. Inject a synthetic closing turn so
// the conversation reads as a completed loop before it goes upstream.
pub fn close_tool_loop_for_thinking(messages: &mut Vec<Message>) {
    let state = analyze_conversation_state(messages);
    if !state.in_tool_loop && !state.interrupted_tool {
        return;
    }

    let has_valid_thinking = state
        .last_assistant_idx
        .and_then(|idx| messages.get(idx))
        .map(has_valid_signed_thinking)
        .unwrap_or(false);
    if has_valid_thinking {
        return;
    }

    if state.in_tool_loop {
        info!("[Thinking-Recovery] Closing broken tool loop with synthetic turns");
        messages.push(Message::assistant_blocks(vec![ContentBlock::Text {
            text: "[Tool execution completed. Proceeding to final response.]".to_string(),
        }]));
        messages.push(Message::user_text(
            "Please provide the final result based on the tool output above.".to_string(),
        ));
    } else if state.interrupted_tool {
        info!("[Thinking-Recovery] Injecting synthetic closure after interrupted tool call");
        if let Some(idx) = state.last_assistant_idx {
            messages.insert(
                idx + 1,
                Message::assistant_blocks(vec![ContentBlock::Text {
                    text: "[Tool call was interrupted by user.]".to_string(),
                }]),
            );
        }
    }
}

// Cross-family signature audit. Reasoning blocks whose signature belongs to
// another model family (or is too short to validate) are dropped; a message
// emptied by the filter gets a period placeholder.
pub fn filter_invalid_thinking_blocks(
    messages: &mut [Message],
    target_model: &str,
    cache: &SignatureCache,
) {
    let mut stripped = 0;

    for msg in messages.iter_mut() {
        if msg.role != "assistant" {
            continue;
        }
        let MessageContent::Array(blocks) = &mut msg.content else {
            continue;
        };
        let original_len = blocks.len();
        blocks.retain(|block| {
            let ContentBlock::Thinking { signature, .. } = block else {
                return true;
            };
            let Some(sig) = signature else {
                // Unsigned reasoning cannot be replayed to a signature-checking
                // upstream in any position that validates; drop it here.
                stripped += 1;
                return false;
            };
            if sig.len() < MIN_SIGNATURE_LENGTH {
                stripped += 1;
                return false;
            }
            match cache.get_signature_family(sig) {
                Some(origin) => {
                    if crate::proxy::common::model_mapping::is_signature_family_compatible(
                        &origin,
                        target_model,
                    ) {
                        true
                    } else {
                        warn!(
                            "[Thinking-Sanitizer] Dropping signature from '{}' for target '{}'",
                            origin, target_model
                        );
                        stripped += 1;
                        false
                    }
                }
                // Unknown origin with plausible length: let upstream validate.
                None => true,
            }
        });
        if blocks.is_empty() && original_len > 0 {
            blocks.push(ContentBlock::Text {
                text: ".".to_string(),
            });
        }
    }

    if stripped > 0 {
        info!(
            "[Thinking-Sanitizer] Stripped {} invalid or incompatible thinking block(s)",
            stripped
        );
    }
}

// Drop trailing unsigned reasoning blocks from each assistant message and
// restore missing signatures from the cache (session store first, then the
// tool-call store via any adjacent tool-use id).
pub fn restore_signatures(messages: &mut [Message], session_id: &str, cache: &SignatureCache) {
    for msg in messages.iter_mut() {
        if msg.role != "assistant" {
            continue;
        }
        let MessageContent::Array(blocks) = &mut msg.content else {
            continue;
        };

        let tool_ids: Vec<String> = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect();

        for block in blocks.iter_mut() {
            if let ContentBlock::Thinking {
                thinking,
                signature,
            } = block
            {
                let missing = signature
                    .as_ref()
                    .map(|s| s.len() < MIN_SIGNATURE_LENGTH)
                    .unwrap_or(true);
                if !missing || thinking.is_empty() {
                    continue;
                }
                let recovered = cache
                    .get_session_signature(session_id)
                    .or_else(|| tool_ids.iter().find_map(|id| cache.get_tool_signature(id)));
                if let Some(sig) = recovered {
                    info!(
                        "[Signature-Restore] Recovered signature for unsigned reasoning (len: {})",
                        sig.len()
                    );
                    *signature = Some(sig);
                }
            }
        }

        // Trailing unsigned reasoning is dead weight upstream.
        while let Some(ContentBlock::Thinking { signature, .. }) = blocks.last() {
            let unsigned = signature
                .as_ref()
                .map(|s| s.len() < MIN_SIGNATURE_LENGTH)
                .unwrap_or(true);
            if unsigned {
                debug!("[Signature-Restore] Removing trailing unsigned reasoning block");
                blocks.pop();
            } else {
                break;
            }
        }
    }
}
