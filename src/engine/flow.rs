//! Flow Variable Store - per-(source, item) variables with LRU eviction
//!
//! `@put:{...}` side-effects land here and `{{@get:...}}` reads them back,
//! possibly in a later operation (book vars feeding chapter requests,
//! chapter vars feeding content requests). Scopes are keyed by
//! `(sourceId, itemId)` so sources never see each other's variables; a cap
//! on live scopes bounds memory across long sessions.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const DEFAULT_CAPACITY: usize = 5000;

type ScopeKey = (String, String);

#[derive(Default)]
struct FlowInner {
    scopes: HashMap<ScopeKey, HashMap<String, String>>,
    /// Access order, least-recently-used at the front
    order: VecDeque<ScopeKey>,
}

pub struct FlowStore {
    inner: Mutex<FlowInner>,
    capacity: usize,
}

impl Default for FlowStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl FlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(FlowInner::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn put(&self, source_id: &str, item_id: &str, key: &str, value: &str) {
        let mut inner = self.inner.lock().unwrap();
        let scope_key = (source_id.to_string(), item_id.to_string());
        Self::touch(&mut inner, &scope_key, self.capacity);
        inner
            .scopes
            .entry(scope_key)
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn set_all(&self, source_id: &str, item_id: &str, vars: HashMap<String, String>) {
        if vars.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let scope_key = (source_id.to_string(), item_id.to_string());
        Self::touch(&mut inner, &scope_key, self.capacity);
        inner.scopes.entry(scope_key).or_default().extend(vars);
    }

    pub fn get(&self, source_id: &str, item_id: &str, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        let scope_key = (source_id.to_string(), item_id.to_string());
        if !inner.scopes.contains_key(&scope_key) {
            return None;
        }
        Self::touch(&mut inner, &scope_key, self.capacity);
        inner
            .scopes
            .get(&scope_key)
            .and_then(|scope| scope.get(key))
            .cloned()
    }

    /// A copy of the scope's variables; empty when the scope is unknown.
    pub fn snapshot(&self, source_id: &str, item_id: &str) -> HashMap<String, String> {
        let mut inner = self.inner.lock().unwrap();
        let scope_key = (source_id.to_string(), item_id.to_string());
        if !inner.scopes.contains_key(&scope_key) {
            return HashMap::new();
        }
        Self::touch(&mut inner, &scope_key, self.capacity);
        inner.scopes.get(&scope_key).cloned().unwrap_or_default()
    }

    /// Copy the parent scope's variables into the child, keeping any key
    /// the child already set.
    pub fn inherit(&self, source_id: &str, child_id: &str, parent_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let parent_key = (source_id.to_string(), parent_id.to_string());
        let Some(parent) = inner.scopes.get(&parent_key).cloned() else {
            return;
        };
        let child_key = (source_id.to_string(), child_id.to_string());
        Self::touch(&mut inner, &child_key, self.capacity);
        let child = inner.scopes.entry(child_key).or_default();
        for (key, value) in parent {
            child.entry(key).or_insert(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the scope most-recently-used, evicting from the cold end when
    /// a new scope would exceed capacity.
    fn touch(inner: &mut FlowInner, key: &ScopeKey, capacity: usize) {
        if inner.scopes.contains_key(key) {
            if let Some(pos) = inner.order.iter().position(|k| k == key) {
                inner.order.remove(pos);
            }
        } else {
            while inner.scopes.len() >= capacity {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                tracing::debug!(source_id = %oldest.0, item_id = %oldest.1, "evicting flow scope");
                inner.scopes.remove(&oldest);
            }
        }
        inner.order.push_back(key.clone());
    }
}
