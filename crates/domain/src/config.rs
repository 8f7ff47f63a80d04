//! Workspace configuration.
//!
//! All timing constants the actors use are exposed here so test harnesses
//! can tighten them. Every field has a serde default; a missing or partial
//! TOML file yields a fully usable config.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LabConfig {
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub msgrpc: MsgRpcConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
    #[serde(default)]
    pub container: ContainerConfig,
}

impl LabConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing keys.
    pub fn load(path: &str) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Load from file if it exists and parses, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!(path, error = %e, "config not loaded, using defaults");
                Self::default()
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Docker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How sandbox containers are reached from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Containers share the host network; the labeled port on localhost.
    Host,
    /// Bridge network with dynamically mapped host ports.
    PortMapping,
    /// A user-defined network where container names resolve as hosts.
    UserNetwork,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Docker daemon address. Unix socket by default, `tcp://` supported.
    #[serde(default = "d_docker_host")]
    pub host: String,
    #[serde(default = "d_network_mode")]
    pub network_mode: NetworkMode,
    /// Network name used when `network_mode` is `user_network`.
    #[serde(default = "d_prefix")]
    pub network: String,
    /// Sandbox image run for every managed container.
    #[serde(default = "d_image")]
    pub image: String,
    /// Prefix of every managed container's external name.
    #[serde(default = "d_prefix")]
    pub name_prefix: String,
    #[serde(default = "d_port_min")]
    pub port_range_start: u16,
    #[serde(default = "d_port_max")]
    pub port_range_end: u16,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: d_docker_host(),
            network_mode: d_network_mode(),
            network: d_prefix(),
            image: d_image(),
            name_prefix: d_prefix(),
            port_range_start: d_port_min(),
            port_range_end: d_port_max(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MSGRPC
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgRpcConfig {
    #[serde(default = "d_rpc_user")]
    pub user: String,
    #[serde(default = "d_rpc_password")]
    pub password: String,
    /// HTTP timeout per RPC call.
    #[serde(default = "d_8000")]
    pub timeout_ms: u64,
    /// Delay before the first login attempt after a container starts
    /// (msfrpcd needs a moment to bind its listener).
    #[serde(default = "d_500")]
    pub initial_delay_ms: u64,
    #[serde(default = "d_10")]
    pub max_connect_attempts: u32,
    /// Backoff cap between login attempts; base is `initial_delay_ms`.
    #[serde(default = "d_10000")]
    pub backoff_max_ms: u64,
}

impl Default for MsgRpcConfig {
    fn default() -> Self {
        Self {
            user: d_rpc_user(),
            password: d_rpc_password(),
            timeout_ms: 8000,
            initial_delay_ms: 500,
            max_connect_attempts: 10,
            backoff_max_ms: 10_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Console actor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default = "d_100")]
    pub poll_interval_ms: u64,
    /// Single-shot read issued after this long in `ready`, to detect a
    /// silently dead session before the next command hits it.
    #[serde(default = "d_60000")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "d_3")]
    pub max_read_retries: u32,
    /// Per-attempt delays between read retries.
    #[serde(default = "d_read_retry_delays")]
    pub read_retry_delays_ms: Vec<u64>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            keepalive_interval_ms: 60_000,
            max_read_retries: 3,
            read_retry_delays_ms: d_read_retry_delays(),
        }
    }
}

impl ConsoleConfig {
    /// Delay before retry number `attempt` (1-based). Falls back to the
    /// last configured delay when attempts exceed the table.
    pub fn read_retry_delay_ms(&self, attempt: u32) -> u64 {
        let idx = (attempt.max(1) as usize - 1).min(self.read_retry_delays_ms.len().saturating_sub(1));
        self.read_retry_delays_ms.get(idx).copied().unwrap_or(100)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Container actor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Base of the exponential backoff between console respawns.
    #[serde(default = "d_1000")]
    pub restart_backoff_base_ms: u64,
    #[serde(default = "d_60000")]
    pub restart_backoff_max_ms: u64,
    #[serde(default = "d_10")]
    pub console_max_restart_attempts: u32,
    /// A console must stay `ready` this long before its restart counter
    /// resets; prevents a crash loop from looking healthy.
    #[serde(default = "d_30000")]
    pub console_restart_cooldown_ms: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            restart_backoff_base_ms: 1000,
            restart_backoff_max_ms: 60_000,
            console_max_restart_attempts: 10,
            console_restart_cooldown_ms: 30_000,
        }
    }
}

// ── serde defaults ─────────────────────────────────────────────────

fn d_docker_host() -> String {
    "unix:///var/run/docker.sock".into()
}
fn d_network_mode() -> NetworkMode {
    NetworkMode::PortMapping
}
fn d_image() -> String {
    "redlab/msf-sandbox:latest".into()
}
fn d_prefix() -> String {
    "redlab".into()
}
fn d_port_min() -> u16 {
    50_000
}
fn d_port_max() -> u16 {
    60_000
}
fn d_rpc_user() -> String {
    "msf".into()
}
fn d_rpc_password() -> String {
    "msf".into()
}
fn d_read_retry_delays() -> Vec<u64> {
    vec![100, 200, 400]
}
fn d_3() -> u32 {
    3
}
fn d_10() -> u32 {
    10
}
fn d_100() -> u64 {
    100
}
fn d_500() -> u64 {
    500
}
fn d_1000() -> u64 {
    1000
}
fn d_8000() -> u64 {
    8000
}
fn d_10000() -> u64 {
    10_000
}
fn d_30000() -> u64 {
    30_000
}
fn d_60000() -> u64 {
    60_000
}
