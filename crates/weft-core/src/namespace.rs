use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::AgentKind;

/// Agent names a workflow may reference, and the namespace applied to
/// everything that is not built in.
///
/// Passed explicitly to the graph builder and validator; there is no global
/// registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    plugin_namespace: String,
    builtins: BTreeSet<String>,
    agents: BTreeSet<String>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new("weft")
    }
}

impl Registry {
    /// A registry with the standard agent kinds as builtins.
    pub fn new(plugin_namespace: impl Into<String>) -> Self {
        Self {
            plugin_namespace: plugin_namespace.into(),
            builtins: AgentKind::ALL
                .iter()
                .map(|k| k.as_str().to_string())
                .collect(),
            agents: BTreeSet::new(),
        }
    }

    /// Replace the builtin set.
    pub fn with_builtins(mut self, builtins: impl IntoIterator<Item = String>) -> Self {
        self.builtins = builtins.into_iter().collect();
        self
    }

    pub fn with_agents(mut self, agents: impl IntoIterator<Item = String>) -> Self {
        self.agents.extend(agents);
        self
    }

    pub fn plugin_namespace(&self) -> &str {
        &self.plugin_namespace
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtins.contains(name)
    }

    /// Canonical identifier for an agent name as written in a workflow.
    ///
    /// Builtins and already-namespaced names are returned unchanged. A
    /// `$name` always lands in the plugin namespace, as does any other bare
    /// name.
    pub fn resolve(&self, name: &str) -> String {
        if let Some(temp) = name.strip_prefix('$') {
            return self.namespaced(temp);
        }
        if self.is_builtin(name) || name.contains(':') {
            return name.to_string();
        }
        self.namespaced(name)
    }

    /// Whether a canonical agent identifier is callable.
    pub fn is_known(&self, agent_ref: &str) -> bool {
        self.builtins.contains(agent_ref) || self.agents.contains(agent_ref)
    }

    pub fn known_agents(&self) -> impl Iterator<Item = &str> {
        self.builtins.iter().chain(self.agents.iter()).map(String::as_str)
    }

    fn namespaced(&self, name: &str) -> String {
        format!("{}:{}", self.plugin_namespace, name)
    }
}
