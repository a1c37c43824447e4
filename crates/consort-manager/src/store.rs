//! Per-run, per-client outputs waiting to be consumed.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Outputs keyed by run id, then client id.
#[derive(Debug, Default)]
pub struct IoStore {
    runs: HashMap<String, BTreeMap<String, Value>>,
}

impl IoStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `value` for `client_id` in `run_id`, replacing any previous one.
    pub fn put(&mut self, run_id: &str, client_id: &str, value: Value) {
        self.runs
            .entry(run_id.to_string())
            .or_default()
            .insert(client_id.to_string(), value);
    }

    /// Whether an unconsumed output is held for the pair.
    #[must_use]
    pub fn has(&self, run_id: &str, client_id: &str) -> bool {
        self.runs
            .get(run_id)
            .is_some_and(|clients| clients.contains_key(client_id))
    }

    /// Remove every output of `run_id` as a `{clientId: output}` object.
    pub fn take_run(&mut self, run_id: &str) -> Map<String, Value> {
        self.runs
            .remove(run_id)
            .map(|clients| clients.into_iter().collect())
            .unwrap_or_default()
    }

    /// Drop every output of `run_id`.
    pub fn remove_run(&mut self, run_id: &str) {
        self.runs.remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_take_run_collects_by_client() {
        let mut store = IoStore::new();
        store.put("run-1", "site-b", json!({"n": 2}));
        store.put("run-1", "site-a", json!({"n": 1}));
        store.put("run-2", "site-a", json!({"n": 9}));

        assert!(store.has("run-1", "site-a"));
        let outputs = store.take_run("run-1");

        assert_eq!(Value::Object(outputs), json!({"site-a": {"n": 1}, "site-b": {"n": 2}}));
        assert!(!store.has("run-1", "site-a"));
        assert!(store.has("run-2", "site-a"));
    }

    #[test]
    fn test_remove_run_leaves_other_runs() {
        let mut store = IoStore::new();
        store.put("run-1", "site-a", json!(1));
        store.put("run-2", "site-a", json!(2));

        store.remove_run("run-1");
        store.remove_run("never-started");

        assert!(!store.has("run-1", "site-a"));
        assert!(store.take_run("run-1").is_empty());
        assert_eq!(Value::Object(store.take_run("run-2")), json!({"site-a": 2}));
    }
}
