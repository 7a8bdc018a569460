use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::namespace::Registry;
use crate::types::AgentKind;

/// Top-level weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Commands backing each agent, keyed by canonical agent id.
    #[serde(default)]
    pub agents: HashMap<String, AgentCommandConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// Which agent names a workflow may reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Namespace applied to temp agents and bare non-builtin names.
    #[serde(default = "default_plugin_namespace")]
    pub plugin_namespace: String,
    #[serde(default = "default_builtins")]
    pub builtins: Vec<String>,
    /// Additional known agents, usually `namespace:name`.
    #[serde(default)]
    pub agents: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            plugin_namespace: default_plugin_namespace(),
            builtins: default_builtins(),
            agents: Vec::new(),
        }
    }
}

fn default_plugin_namespace() -> String {
    "weft".to_string()
}

fn default_builtins() -> Vec<String> {
    AgentKind::ALL.iter().map(|k| k.as_str().to_string()).collect()
}

/// Scheduler limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum agent nodes running at once within a wave. 0 (the default)
    /// runs the whole wave at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// How many times a single back-edge may be taken in one run.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,
    /// Automatic retries before a failure is handed to the operator.
    #[serde(default)]
    pub max_auto_retries: u32,
    /// Per-node executor timeout.
    #[serde(default)]
    pub node_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_loop_iterations: default_max_loop_iterations(),
            max_auto_retries: 0,
            node_timeout_secs: None,
        }
    }
}

fn default_max_concurrency() -> usize {
    0
}

fn default_max_loop_iterations() -> u32 {
    5
}

/// External command that performs an agent's work.
///
/// `{instruction}`, `{agent}` and `{model}` in `args` are substituted per node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// JSONL run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = run summary and steering, 2 = node lifecycle, 3 = node outputs.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> String {
    ".weft/logs".to_string()
}

fn default_log_level() -> u8 {
    2
}

impl LogConfig {
    /// Resolve the log directory (expand ~).
    pub fn dir(&self) -> PathBuf {
        if let Some(rest) = self.log_dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.log_dir)
    }
}

impl RegistryConfig {
    pub fn to_registry(&self) -> Registry {
        Registry::new(&self.plugin_namespace)
            .with_builtins(self.builtins.iter().cloned())
            .with_agents(self.agents.iter().cloned())
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))
    }

    /// Registry of agents a workflow may call. Agents with a configured
    /// command are known in addition to the `[registry]` section.
    pub fn to_registry(&self) -> Registry {
        self.registry
            .to_registry()
            .with_agents(self.agents.keys().cloned())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
