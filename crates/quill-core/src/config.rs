//! Orchestrator configuration.
//!
//! Every knob has a default; `KernelConfig::from_env` layers `QUILL_*`
//! environment variables on top of those defaults.

use std::path::PathBuf;
use std::time::Duration;

/// What to do when a kernel never signals readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadinessPolicy {
    /// Mark the kernel idle anyway and log a warning.
    #[default]
    Optimistic,
    /// Kill the process and fail the start with `ReadinessTimeout`.
    Strict,
}

/// Configuration for the kernel lifecycle manager.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Parent directory for per-kernel working areas.
    pub runtime_dir: PathBuf,
    /// How long `start` waits for the first message from a new kernel.
    pub ready_timeout: Duration,
    /// Behaviour when `ready_timeout` elapses.
    pub readiness_policy: ReadinessPolicy,
    /// How long `stop` waits after the shutdown directive before killing.
    pub stop_grace: Duration,
    /// Capacity used when a caller asks the manager for a fresh sink.
    pub sink_capacity: usize,
    /// Command used to discover externally installed kernel specs.
    /// `None` disables discovery.
    pub discovery_command: Option<Vec<String>>,
    /// Upper bound on the discovery command.
    pub discovery_timeout: Duration,
    /// Working directory for spawned kernels. Inherited when `None`.
    pub working_dir: Option<PathBuf>,
    /// Remote gateway settings. Local-only when `None`.
    pub gateway: Option<GatewayConfig>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        let runtime_root = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            runtime_dir: runtime_root.join("quill"),
            ready_timeout: Duration::from_secs(10),
            readiness_policy: ReadinessPolicy::Optimistic,
            stop_grace: Duration::from_secs(5),
            sink_capacity: 256,
            discovery_command: Some(vec![
                "jupyter".to_string(),
                "kernelspec".to_string(),
                "list".to_string(),
                "--json".to_string(),
            ]),
            discovery_timeout: Duration::from_secs(5),
            working_dir: None,
            gateway: None,
        }
    }
}

impl KernelConfig {
    /// Build a config from defaults overridden by `QUILL_*` variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(dir) = env_var("QUILL_RUNTIME_DIR") {
            config.runtime_dir = PathBuf::from(dir);
        }
        if let Some(ms) = env_var("QUILL_READY_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            config.ready_timeout = Duration::from_millis(ms);
        }
        if env_var("QUILL_READINESS_STRICT").is_some_and(|v| v == "1" || v == "true") {
            config.readiness_policy = ReadinessPolicy::Strict;
        }
        if let Ok(cmd) = std::env::var("QUILL_DISCOVERY_CMD") {
            let argv: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
            config.discovery_command = if argv.is_empty() { None } else { Some(argv) };
        }
        if let Some(dir) = env_var("QUILL_KERNEL_CWD") {
            config.working_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = env_var("QUILL_GATEWAY_URL") {
            let mut gateway = GatewayConfig::new(url);
            gateway.auth_token = env_var("QUILL_GATEWAY_TOKEN");
            config.gateway = Some(gateway);
        }

        config
    }
}

/// Configuration for delegating kernels to a remote gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the gateway, e.g. `http://127.0.0.1:8888`.
    pub url: String,
    /// Optional token sent as `Authorization: token <t>`.
    pub auth_token: Option<String>,
    /// Upper bound on the startup reachability ping.
    pub ping_timeout: Duration,
    /// Upper bound on individual lifecycle requests.
    pub request_timeout: Duration,
    /// Capacity of the per-subscription remote message queue.
    pub message_queue_capacity: usize,
}

impl GatewayConfig {
    /// Gateway settings with default timeouts.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            auth_token: None,
            ping_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            message_queue_capacity: 256,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KernelConfig::default();
        assert!(config.runtime_dir.ends_with("quill"));
        assert_eq!(config.stop_grace, Duration::from_secs(5));
        assert_eq!(config.readiness_policy, ReadinessPolicy::Optimistic);
        assert!(config.gateway.is_none());
    }

    #[test]
    fn test_gateway_url_trailing_slash() {
        let gateway = GatewayConfig::new("http://localhost:8888/");
        assert_eq!(gateway.url, "http://localhost:8888");
        assert_eq!(gateway.ping_timeout, Duration::from_secs(2));
    }
}
