use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const SIGNATURE_TTL: Duration = Duration::from_secs(60 * 60);
const TOOL_CACHE_LIMIT: usize = 10_000;
const FAMILY_CACHE_LIMIT: usize = 5_000;
const SESSION_CACHE_LIMIT: usize = 1_000;

use crate::constants::MIN_SIGNATURE_LENGTH;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CacheEntry {
    value: String,
    timestamp: u64,
}

impl CacheEntry {
    fn new(value: String) -> Self {
        Self {
            value,
            timestamp: now_millis(),
        }
    }

    fn is_expired(&self) -> bool {
        now_millis().saturating_sub(self.timestamp) > SIGNATURE_TTL.as_millis() as u64
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

#[derive(Default, Serialize, Deserialize)]
struct PersistedCaches {
    #[serde(default)]
    tool_signatures: HashMap<String, CacheEntry>,
    #[serde(default)]
    thinking_families: HashMap<String, CacheEntry>,
    #[serde(default)]
    session_signatures: HashMap<String, CacheEntry>,
}

// Three keyed stores for opaque reasoning signatures:
//   tool-use id -> signature, signature -> model family, session -> latest signature.
// Each store is size-bounded with oldest-first eviction and a shared TTL.
pub struct SignatureCache {
    tool_signatures: Mutex<HashMap<String, CacheEntry>>,
    thinking_families: Mutex<HashMap<String, CacheEntry>>,
    session_signatures: Mutex<HashMap<String, CacheEntry>>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
    save_in_flight: AtomicBool,
}

impl SignatureCache {
    pub fn new() -> Self {
        Self {
            tool_signatures: Mutex::new(HashMap::new()),
            thinking_families: Mutex::new(HashMap::new()),
            session_signatures: Mutex::new(HashMap::new()),
            path: None,
            dirty: AtomicBool::new(false),
            save_in_flight: AtomicBool::new(false),
        }
    }

    pub fn with_persistence(path: PathBuf) -> Self {
        let mut cache = Self::new();
        cache.path = Some(path.clone());

        if path.exists() {
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|s| serde_json::from_str::<PersistedCaches>(&s).map_err(|e| e.to_string()))
            {
                Ok(persisted) => {
                    let loaded = persisted.tool_signatures.len()
                        + persisted.thinking_families.len()
                        + persisted.session_signatures.len();
                    *cache.tool_signatures.lock().unwrap() = persisted.tool_signatures;
                    *cache.thinking_families.lock().unwrap() = persisted.thinking_families;
                    *cache.session_signatures.lock().unwrap() = persisted.session_signatures;
                    info!("[SignatureCache] Loaded {} entries from {:?}", loaded, path);
                }
                Err(e) => warn!(
                    "[W-SIGCACHE-LOAD] failed_to_load_signature_cache: {} ({:?})",
                    e, path
                ),
            }
        }
        cache
    }

    fn evict_oldest(store: &mut HashMap<String, CacheEntry>, limit: usize, label: &str) {
        if store.len() <= limit {
            return;
        }
        let before = store.len();
        store.retain(|_, v| !v.is_expired());
        while store.len() > limit {
            let oldest = store
                .iter()
                .min_by_key(|(_, v)| v.timestamp)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    store.remove(&key);
                }
                None => break,
            }
        }
        debug!(
            "[SignatureCache] {} cache eviction: {} -> {} entries",
            label,
            before,
            store.len()
        );
    }

    pub fn cache_tool_signature(&self, tool_use_id: &str, signature: String) {
        if signature.len() < MIN_SIGNATURE_LENGTH {
            return;
        }
        if let Ok(mut cache) = self.tool_signatures.lock() {
            debug!(
                "[SignatureCache] Caching tool signature for id: {}",
                tool_use_id
            );
            cache.insert(tool_use_id.to_string(), CacheEntry::new(signature));
            Self::evict_oldest(&mut cache, TOOL_CACHE_LIMIT, "tool");
        }
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn get_tool_signature(&self, tool_use_id: &str) -> Option<String> {
        if let Ok(cache) = self.tool_signatures.lock() {
            if let Some(entry) = cache.get(tool_use_id) {
                if !entry.is_expired() {
                    debug!(
                        "[SignatureCache] Hit tool signature for id: {}",
                        tool_use_id
                    );
                    return Some(entry.value.clone());
                }
            }
        }
        None
    }

    pub fn cache_thinking_family(&self, signature: String, family: String) {
        if signature.len() < MIN_SIGNATURE_LENGTH {
            return;
        }
        if let Ok(mut cache) = self.thinking_families.lock() {
            cache.insert(signature, CacheEntry::new(family));
            Self::evict_oldest(&mut cache, FAMILY_CACHE_LIMIT, "family");
        }
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn get_signature_family(&self, signature: &str) -> Option<String> {
        if let Ok(cache) = self.thinking_families.lock() {
            if let Some(entry) = cache.get(signature) {
                if !entry.is_expired() {
                    return Some(entry.value.clone());
                }
                debug!("[SignatureCache] Signature family entry expired");
            }
        }
        None
    }

    pub fn cache_session_signature(&self, session_id: &str, signature: String) {
        if signature.len() < MIN_SIGNATURE_LENGTH {
            return;
        }
        if let Ok(mut cache) = self.session_signatures.lock() {
            debug!(
                "[SignatureCache] Session {} -> storing signature (len={})",
                session_id,
                signature.len()
            );
            cache.insert(session_id.to_string(), CacheEntry::new(signature));
            Self::evict_oldest(&mut cache, SESSION_CACHE_LIMIT, "session");
        }
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn get_session_signature(&self, session_id: &str) -> Option<String> {
        if let Ok(cache) = self.session_signatures.lock() {
            if let Some(entry) = cache.get(session_id) {
                if !entry.is_expired() {
                    return Some(entry.value.clone());
                }
                debug!("[SignatureCache] Session {} -> EXPIRED", session_id);
            }
        }
        None
    }

    // Drop expired entries from all three stores. Called from the periodic
    // sweep; safe to call at any time.
    pub fn sweep_expired(&self) -> usize {
        let mut removed = 0;
        for store in [
            &self.tool_signatures,
            &self.thinking_families,
            &self.session_signatures,
        ] {
            if let Ok(mut cache) = store.lock() {
                let before = cache.len();
                cache.retain(|_, v| !v.is_expired());
                removed += before - cache.len();
            }
        }
        if removed > 0 {
            info!("[SignatureCache] Sweep removed {} expired entries", removed);
            self.dirty.store(true, Ordering::Relaxed);
        }
        removed
    }

    // Write the caches to disk. No-op when nothing changed or another save
    // is already in flight.
    pub fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };
        if !self.dirty.load(Ordering::Relaxed) {
            return;
        }
        if self
            .save_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.dirty.store(false, Ordering::Relaxed);

        let persisted = PersistedCaches {
            tool_signatures: self.tool_signatures.lock().map(|c| c.clone()).unwrap_or_default(),
            thinking_families: self
                .thinking_families
                .lock()
                .map(|c| c.clone())
                .unwrap_or_default(),
            session_signatures: self
                .session_signatures
                .lock()
                .map(|c| c.clone())
                .unwrap_or_default(),
        };

        let result = serde_json::to_string(&persisted)
            .map_err(|e| e.to_string())
            .and_then(|json| {
                let tmp = path.with_extension("json.tmp");
                std::fs::write(&tmp, json)
                    .and_then(|_| std::fs::rename(&tmp, path))
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            warn!("[W-SIGCACHE-SAVE] failed_to_save_signature_cache: {}", e);
            self.dirty.store(true, Ordering::Relaxed);
        }
        self.save_in_flight.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn entry_counts(&self) -> (usize, usize, usize) {
        (
            self.tool_signatures.lock().unwrap().len(),
            self.thinking_families.lock().unwrap().len(),
            self.session_signatures.lock().unwrap().len(),
        )
    }
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new()
    }
}
