use crate::proxy::mappers::claude::models::{ClaudeRequest, ContentBlock, MessageContent};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::debug;

const SESSION_IDLE_MS: i64 = 60 * 60 * 1000;
const MAX_SESSIONS: usize = 500;

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub message_count: usize,
    pub last_seen: i64,
    pub tokens_consumed: u64,
    pub pinned_account: Option<String>,
}

// Tracks derived conversation sessions and their account pins. Sessions are
// never persisted; they exist to keep a conversation on one account while it
// continues, so upstream prompt caching stays warm.
pub struct SessionTracker {
    sessions: DashMap<String, SessionInfo>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    // Derive a stable session fingerprint from a request.
    //
    // Only the first meaningful user message is hashed; model names and
    // timestamps never participate, so every turn of the same conversation
    // produces the same id. An explicit metadata.user_id wins when present.
    pub fn extract_session_id(request: &ClaudeRequest) -> String {
        if let Some(metadata) = &request.metadata {
            if let Some(user_id) = &metadata.user_id {
                if !user_id.is_empty() && !user_id.contains("session-") {
                    debug!("[Session] Using explicit user_id: {}", user_id);
                    return user_id.clone();
                }
            }
        }

        let mut hasher = Sha256::new();
        let mut content_found = false;
        for msg in &request.messages {
            if msg.role != "user" {
                continue;
            }
            let text = match &msg.content {
                MessageContent::String(s) => s.clone(),
                MessageContent::Array(blocks) => blocks
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            };

            let clean_text = text.trim();
            // Skip probe-sized messages and injected reminder wrappers.
            if clean_text.len() > 10 && !clean_text.contains("<system-reminder>") {
                hasher.update(clean_text.as_bytes());
                content_found = true;
                break;
            }
        }

        if !content_found {
            if let Some(last_msg) = request.messages.last() {
                hasher.update(format!("{:?}", last_msg.content).as_bytes());
            }
        }

        let hash = format!("{:x}", hasher.finalize());
        format!("sid-{}", &hash[..16])
    }

    // Register a sighting of the session. A session "continues" while it is
    // touched within the idle window and its message count does not shrink;
    // a shrink means the client rewound, so the pin is dropped.
    pub fn touch(&self, session_id: &str, message_count: usize) {
        let now = chrono::Utc::now().timestamp_millis();
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionInfo {
                message_count: 0,
                last_seen: now,
                tokens_consumed: 0,
                pinned_account: None,
            });

        let expired = now - entry.last_seen > SESSION_IDLE_MS;
        let rewound = message_count < entry.message_count;
        if expired || rewound {
            debug!(
                "[Session] {} reset (expired: {}, rewound: {})",
                session_id, expired, rewound
            );
            entry.pinned_account = None;
            entry.tokens_consumed = 0;
        }
        entry.message_count = message_count;
        entry.last_seen = now;
        drop(entry);

        self.evict_if_needed();
    }

    pub fn record_tokens(&self, session_id: &str, tokens: u64) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.tokens_consumed = entry.tokens_consumed.saturating_add(tokens);
        }
    }

    pub fn pinned_account(&self, session_id: &str) -> Option<String> {
        let entry = self.sessions.get(session_id)?;
        let now = chrono::Utc::now().timestamp_millis();
        if now - entry.last_seen > SESSION_IDLE_MS {
            return None;
        }
        entry.pinned_account.clone()
    }

    pub fn pin(&self, session_id: &str, account: &str) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.pinned_account = Some(account.to_string());
        }
    }

    pub fn unpin(&self, session_id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.pinned_account = None;
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.get(session_id).map(|e| e.clone())
    }

    fn evict_if_needed(&self) {
        if self.sessions.len() <= MAX_SESSIONS {
            return;
        }
        // Copy keys first; DashMap iteration must not hold locks across removal.
        let mut entries: Vec<(String, i64)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.last_seen))
            .collect();
        entries.sort_by_key(|(_, last_seen)| *last_seen);
        let excess = entries.len().saturating_sub(MAX_SESSIONS);
        for (key, _) in entries.into_iter().take(excess) {
            self.sessions.remove(&key);
        }
    }

    // Drop sessions past the idle window.
    pub fn sweep_idle(&self) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, info| now - info.last_seen <= SESSION_IDLE_MS);
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}
