use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::warn;

// Usage history is hour-bucketed and capped at 30 days of buckets.
const MAX_BUCKETS: usize = 30 * 24;

// Per-hour request counters: {bucket: {family: {model: count, _subtotal}, _total}}.
pub struct UsageStats {
    buckets: Mutex<Map<String, Value>>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
    save_in_flight: AtomicBool,
}

impl UsageStats {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(Map::new()),
            path: None,
            dirty: AtomicBool::new(false),
            save_in_flight: AtomicBool::new(false),
        }
    }

    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.path = Some(path.clone());
        if path.exists() {
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|s| {
                    serde_json::from_str::<Map<String, Value>>(&s).map_err(|e| e.to_string())
                }) {
                Ok(buckets) => *stats.buckets.lock().unwrap() = buckets,
                Err(e) => warn!("[W-USAGE-LOAD] failed_to_load_usage_history: {}", e),
            }
        }
        stats
    }

    fn bucket_key() -> String {
        chrono::Utc::now().format("%Y-%m-%dT%H").to_string()
    }

    fn family_of(model: &str) -> &'static str {
        crate::proxy::common::model_mapping::signature_family(model)
    }

    pub fn record(&self, model: &str) {
        let bucket_key = Self::bucket_key();
        let family = Self::family_of(model);

        let Ok(mut buckets) = self.buckets.lock() else {
            return;
        };
        let bucket = buckets
            .entry(bucket_key)
            .or_insert_with(|| json!({"_total": 0}));
        if let Some(obj) = bucket.as_object_mut() {
            let total = obj.get("_total").and_then(|v| v.as_u64()).unwrap_or(0);
            obj.insert("_total".to_string(), json!(total + 1));

            let family_entry = obj
                .entry(family.to_string())
                .or_insert_with(|| json!({"_subtotal": 0}));
            if let Some(family_obj) = family_entry.as_object_mut() {
                let subtotal = family_obj
                    .get("_subtotal")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                family_obj.insert("_subtotal".to_string(), json!(subtotal + 1));
                let count = family_obj.get(model).and_then(|v| v.as_u64()).unwrap_or(0);
                family_obj.insert(model.to_string(), json!(count + 1));
            }
        }

        // Oldest buckets fall off once the 30-day window is full. Keys sort
        // chronologically by construction.
        if buckets.len() > MAX_BUCKETS {
            let mut keys: Vec<String> = buckets.keys().cloned().collect();
            keys.sort();
            let excess = keys.len() - MAX_BUCKETS;
            for key in keys.into_iter().take(excess) {
                buckets.remove(&key);
            }
        }
        drop(buckets);
        self.dirty.store(true, Ordering::Relaxed);
    }

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

        let snapshot = self.buckets.lock().map(|b| b.clone()).unwrap_or_default();
        let result = serde_json::to_string(&Value::Object(snapshot))
            .map_err(|e| e.to_string())
            .and_then(|json_str| {
                let tmp = path.with_extension("json.tmp");
                std::fs::write(&tmp, json_str)
                    .and_then(|_| std::fs::rename(&tmp, path))
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            warn!("[W-USAGE-SAVE] failed_to_save_usage_history: {}", e);
            self.dirty.store(true, Ordering::Relaxed);
        }
        self.save_in_flight.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Map<String, Value> {
        self.buckets.lock().unwrap().clone()
    }
}

impl Default for UsageStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_counts_model_family_and_total() {
        let stats = UsageStats::new();
        stats.record("gemini-3-flash");
        stats.record("gemini-3-flash");
        stats.record("gemini-3-pro-high");

        let snapshot = stats.snapshot();
        let (_, bucket) = snapshot.iter().next().expect("bucket");
        assert_eq!(bucket["_total"], 3);
        assert_eq!(bucket["gemini"]["_subtotal"], 3);
        assert_eq!(bucket["gemini"]["gemini-3-flash"], 2);
        assert_eq!(bucket["gemini"]["gemini-3-pro-high"], 1);
    }

    #[test]
    fn persistence_round_trip() {
        let dir = std::env::temp_dir().join(format!(
            "trestle-usage-{}",
            crate::proxy::common::utils::generate_random_id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("usage-history.json");

        let stats = UsageStats::with_persistence(path.clone());
        stats.record("gemini-3-flash");
        stats.save();

        let reloaded = UsageStats::with_persistence(path);
        let snapshot = reloaded.snapshot();
        assert_eq!(snapshot.len(), 1);
        let _ = std::fs::remove_dir_all(dir);
    }
}
