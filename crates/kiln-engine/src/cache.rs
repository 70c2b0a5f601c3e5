//! Result cache for synchronous image generation.

use std::sync::Mutex;

use indexmap::IndexMap;
use kiln_contracts::content::ContentRequest;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::dispatcher::MediaResult;

/// Option that forces a fresh generation for an otherwise cached request.
pub const REGENERATE_OPTION: &str = "regenerate";

/// Default number of image results kept per dispatcher.
pub const DEFAULT_CAPACITY: usize = 512;

/// Least-recently-used result cache. Entries are kept in use order, oldest
/// first; a capacity of 0 disables caching.
#[derive(Debug)]
pub struct ResultCache {
    capacity: usize,
    entries: Mutex<IndexMap<String, MediaResult>>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(IndexMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A hit moves the entry to the most recently used end.
    pub fn get(&self, key: &str) -> Option<MediaResult> {
        let mut entries = self.entries.lock().ok()?;
        let index = entries.get_index_of(key)?;
        let last = entries.len() - 1;
        entries.move_index(index, last);
        entries.get_index(last).map(|(_, result)| result.clone())
    }

    pub fn set(&self, key: String, result: &MediaResult) {
        if self.capacity == 0 {
            return;
        }
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        entries.shift_remove(&key);
        while entries.len() >= self.capacity {
            entries.shift_remove_index(0);
        }
        entries.insert(key, result.clone());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache key for an image request, or `None` when the caller asked to
/// regenerate. The draft id is not part of the key.
pub fn cache_key(request: &ContentRequest) -> Option<String> {
    let regenerate = request
        .options
        .get(REGENERATE_OPTION)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if regenerate {
        return None;
    }
    Some(stable_hash(&json!({
        "content_type": request.content_type,
        "prompt": request.prompt.trim(),
        "options": request.options,
        "tone": request.tone,
        "goal": request.goal,
        "engine_override": request.engine_override,
        "priority": request.priority,
    })))
}

pub fn stable_hash(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
