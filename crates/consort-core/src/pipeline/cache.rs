//! Values carried forward between steps.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::PipelineError;
use crate::types::{InputSource, Mode};

/// Final outputs of the steps run so far, plus the running cache their
/// controllers accumulated.
#[derive(Debug, Clone, Default)]
pub struct PipelineCache {
    steps: Vec<Value>,
    merged: Map<String, Value>,
}

impl PipelineCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the final output of the next step and merge the cache its
    /// controller accumulated into the running cache. Later keys win; the
    /// merge does not descend into nested objects.
    pub fn record(&mut self, output: Value, step_cache: &Map<String, Value>) {
        self.merged
            .extend(step_cache.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.steps.push(output);
    }

    /// Output of step `step`, if it has run.
    #[must_use]
    pub fn step_output(&self, step: usize) -> Option<&Value> {
        self.steps.get(step)
    }

    /// Running cache handed to the next step's computations.
    #[must_use]
    pub fn merged(&self) -> &Map<String, Value> {
        &self.merged
    }

    /// Resolve a step's input map into its input document.
    ///
    /// On the remote node static entries that are not fulfilled are left
    /// out: they describe client-side data the remote never sees.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MappingIncomplete`] for an unfulfilled entry
    /// or a reference to a variable no earlier step produced.
    pub fn resolve(
        &self,
        input_map: &BTreeMap<String, InputSource>,
        mode: Mode,
    ) -> Result<Value, PipelineError> {
        let mut input = Map::new();

        for (key, source) in input_map {
            match source {
                InputSource::Value { value, fulfilled } => {
                    if !fulfilled {
                        if mode == Mode::Remote {
                            continue;
                        }
                        return Err(PipelineError::MappingIncomplete(format!(
                            "input '{key}' is not fulfilled"
                        )));
                    }
                    input.insert(key.clone(), value.clone());
                }
                InputSource::FromCache { from_cache } => {
                    let value = self
                        .step_output(from_cache.step)
                        .and_then(|out| out.get(&from_cache.variable))
                        .ok_or_else(|| {
                            PipelineError::MappingIncomplete(format!(
                                "input '{key}' references '{}' of step {}, which is not available",
                                from_cache.variable, from_cache.step
                            ))
                        })?;
                    input.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(Value::Object(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(entries: &[(&str, InputSource)]) -> BTreeMap<String, InputSource> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_from_cache_resolves_earlier_output() {
        let mut cache = PipelineCache::new();
        cache.record(json!({"a": 1}), &Map::new());

        let input = cache
            .resolve(&map(&[("a_in", InputSource::from_cache(0, "a"))]), Mode::Local)
            .unwrap();

        assert_eq!(input["a_in"], json!(1));
    }

    #[test]
    fn test_missing_variable_is_incomplete() {
        let mut cache = PipelineCache::new();
        cache.record(json!({"a": 1}), &Map::new());

        let result = cache.resolve(&map(&[("b", InputSource::from_cache(0, "b"))]), Mode::Local);
        assert!(matches!(result, Err(PipelineError::MappingIncomplete(_))));
    }

    #[test]
    fn test_unfulfilled_value() {
        let cache = PipelineCache::new();
        let pending = map(&[(
            "covariates",
            InputSource::Value {
                value: Value::Null,
                fulfilled: false,
            },
        )]);

        assert!(matches!(
            cache.resolve(&pending, Mode::Local),
            Err(PipelineError::MappingIncomplete(_))
        ));
        assert_eq!(cache.resolve(&pending, Mode::Remote).unwrap(), json!({}));
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_step_caches_merge_shallow() {
        let mut cache = PipelineCache::new();
        cache.record(json!({"out": 1}), &object(json!({"a": {"x": 1}, "b": 2})));
        cache.record(json!("not an object"), &object(json!({"a": {"y": 3}})));

        assert_eq!(cache.merged()["a"], json!({"y": 3}));
        assert_eq!(cache.merged()["b"], json!(2));
        assert!(!cache.merged().contains_key("out"));
        assert_eq!(cache.step_output(1), Some(&json!("not an object")));
    }
}
