use std::collections::{BTreeMap, BTreeSet};

use weft_core::template;
use weft_core::{NodeId, RuntimeError};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    value: String,
    /// `None` for seeds and condition bindings.
    producer: Option<NodeId>,
}

/// Workflow-scoped variables.
///
/// A name is created once, by its producer. The same producer may overwrite
/// it when it runs again (retry or loop); any other node may only read it.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    values: BTreeMap<String, Binding>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values that exist before the run starts.
    pub fn with_seeds(seeds: BTreeMap<String, String>) -> Self {
        let values = seeds
            .into_iter()
            .map(|(name, value)| {
                (
                    name,
                    Binding {
                        value,
                        producer: None,
                    },
                )
            })
            .collect();
        Self { values }
    }

    /// Store a node's output under `name`.
    pub fn bind(
        &mut self,
        name: &str,
        value: impl Into<String>,
        producer: NodeId,
    ) -> Result<(), RuntimeError> {
        if let Some(Binding {
            producer: Some(owner),
            ..
        }) = self.values.get(name)
        {
            if *owner != producer {
                return Err(RuntimeError::VariableAlreadyBound {
                    node: producer,
                    name: name.to_string(),
                    owner: *owner,
                });
            }
        }
        self.values.insert(
            name.to_string(),
            Binding {
                value: value.into(),
                producer: Some(producer),
            },
        );
        Ok(())
    }

    /// Store a condition outcome as `"true"` / `"false"`.
    pub fn bind_condition(&mut self, name: &str, outcome: bool) {
        self.values.insert(
            name.to_string(),
            Binding {
                value: outcome.to_string(),
                producer: None,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|b| b.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn producer(&self, name: &str) -> Option<NodeId> {
        self.values.get(name).and_then(|b| b.producer)
    }

    /// `None` when the variable does not exist.
    pub fn is_truthy(&self, name: &str) -> Option<bool> {
        self.get(name).map(is_truthy)
    }

    /// Substitute `{name}` references for `node`.
    pub fn render(&self, template: &str, node: NodeId) -> Result<String, RuntimeError> {
        template::render(template, |name| self.get(name))
            .map_err(|name| RuntimeError::VariableUnavailable { node, name })
    }

    /// Drop every variable `keep` rejects.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.values.retain(|name, _| keep(name));
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.values.keys().cloned().collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(k, b)| (k.clone(), b.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Truthiness of a stored value: anything but empty, `false`, `0` or `no`.
pub fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "false" | "0" | "no"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_read() {
        let mut vars = VariableStore::new();
        vars.bind("plan", "step 1", NodeId(0)).unwrap();
        assert_eq!(vars.get("plan"), Some("step 1"));
        assert_eq!(vars.producer("plan"), Some(NodeId(0)));
    }

    #[test]
    fn test_same_producer_may_overwrite() {
        let mut vars = VariableStore::new();
        vars.bind("plan", "v1", NodeId(2)).unwrap();
        vars.bind("plan", "v2", NodeId(2)).unwrap();
        assert_eq!(vars.get("plan"), Some("v2"));
    }

    #[test]
    fn test_other_producer_rejected() {
        let mut vars = VariableStore::new();
        vars.bind("plan", "v1", NodeId(2)).unwrap();
        let err = vars.bind("plan", "v2", NodeId(3)).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::VariableAlreadyBound {
                node: NodeId(3),
                name: "plan".into(),
                owner: NodeId(2)
            }
        );
        assert_eq!(vars.get("plan"), Some("v1"));
    }

    #[test]
    fn test_render_missing_variable() {
        let vars = VariableStore::new();
        let err = vars.render("fix {bugs}", NodeId(5)).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::VariableUnavailable {
                node: NodeId(5),
                name: "bugs".into()
            }
        );
    }

    #[test]
    fn test_condition_bindings_and_truthiness() {
        let mut vars = VariableStore::with_seeds(BTreeMap::from([(
            "mode".to_string(),
            "no".to_string(),
        )]));
        vars.bind_condition("ok", true);
        assert_eq!(vars.is_truthy("ok"), Some(true));
        assert_eq!(vars.is_truthy("mode"), Some(false));
        assert_eq!(vars.is_truthy("missing"), None);
        vars.bind_condition("ok", false);
        assert_eq!(vars.get("ok"), Some("false"));
    }

    #[test]
    fn test_retain() {
        let mut vars = VariableStore::new();
        vars.bind("a", "1", NodeId(0)).unwrap();
        vars.bind("b", "2", NodeId(1)).unwrap();
        vars.retain(|name| name == "b");
        assert_eq!(vars.names(), BTreeSet::from(["b".to_string()]));
    }
}
