use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Agent configuration, loaded from TOML. Every section has defaults, so an
/// empty file is a valid configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub destination: DestinationConfig,
    pub backend: BackendConfig,
    pub detection: DetectionConfig,
    pub execution: ExecutionConfig,
    pub automation: AutomationConfig,
    pub heartbeat: HeartbeatConfig,
    pub schedule: ScheduleConfig,
    pub status_api: StatusApiConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    /// Stable identity. A random UUID when omitted.
    pub id: Option<String>,
    pub name: String,
    /// Owners whose tasks this destination may run.
    pub owner_ids: Vec<String>,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            id: None,
            name: "relay-agent".to_string(),
            owner_ids: vec![],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// `memory`, `surrealkv://<dir>` or `ws://<host:port>`.
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "surrealkv://.relay/db".to_string(),
            namespace: "relay".to_string(),
            database: "main".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub push_enabled: bool,
    pub poll_interval_seconds: u64,
    pub poll_limit: usize,
    /// How long a decided claim suppresses repeat attempts. Defaults to the poll interval.
    pub seen_ttl_seconds: Option<u64>,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            push_enabled: true,
            poll_interval_seconds: 30,
            poll_limit: 50,
            seen_ttl_seconds: None,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl DetectionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }

    pub fn seen_ttl(&self) -> Duration {
        Duration::from_secs(self.seen_ttl_seconds.unwrap_or(self.poll_interval_seconds))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Bound on concurrently running items. Unbounded when omitted.
    pub max_concurrent: Option<usize>,
    /// Shell used as `<shell> -c <line>`.
    pub shell: String,
    /// Launcher prefix for terminal-spawned commands.
    pub terminal_command: Vec<String>,
    /// Send every interactive command to a terminal window.
    pub spawn_interactive_in_terminal: bool,
    /// Default working directory for commands without one.
    pub working_dir: Option<String>,
    /// Per-stream cap on captured output.
    pub max_output_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            shell: default_shell().to_string(),
            terminal_command: vec!["x-terminal-emulator".to_string(), "-e".to_string()],
            spawn_interactive_in_terminal: false,
            working_dir: None,
            max_output_bytes: 64 * 1024,
        }
    }
}

fn default_shell() -> &'static str {
    if cfg!(windows) {
        "cmd"
    } else {
        "sh"
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// Pattern matching for triggers. When off, scripted commands run as raw passthrough.
    pub patterns_enabled: bool,
    pub bootstrap_ms: u64,
    pub close_grace_ms: u64,
    pub kill_after_ms: u64,
    /// Mirror the child's output to the agent's own stdout/stderr.
    pub echo_output: bool,
    /// Keep collecting output after the last rule fired.
    pub collect_after_rules: bool,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            patterns_enabled: true,
            bootstrap_ms: 3_000,
            close_grace_ms: 500,
            kill_after_ms: 5_000,
            echo_output: false,
            collect_after_rules: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_seconds: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_seconds: 30 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub check_interval_seconds: u64,
    pub batch_limit: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_seconds: 60,
            batch_limit: 20,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusApiConfig {
    pub listen: Option<SocketAddr>,
}

impl AgentConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: AgentConfig =
            toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    }

    /// Fill the destination id if the file left it out.
    pub fn resolve_destination_id(&mut self) -> String {
        self.destination
            .id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }
}
