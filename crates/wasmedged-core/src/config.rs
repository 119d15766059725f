//! Server and runtime configuration types.
//!
//! `ServerConfig` expresses what a caller wants started; `RuntimeConfig`
//! carries everything the supervisor needs about its environment. Both are
//! explicit values passed into the supervisor at construction or call time,
//! never ambient global state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default model file shipped with the staged assets.
pub const DEFAULT_MODEL_FILE: &str = "gemma-3-1b-it-Q4_K_M.gguf";

/// Default prompt template matching the default model.
pub const DEFAULT_TEMPLATE_TYPE: &str = "gemma-3";

/// Default context size in tokens.
pub const DEFAULT_CONTEXT_SIZE: u64 = 1024;

/// Default port the API server listens on.
pub const DEFAULT_PORT: u16 = 8080;

/// Name of the wasm module that implements the API server.
pub const DEFAULT_SERVER_MODULE: &str = "llama-api-server.wasm";

/// Parameters for one server start request.
///
/// Retained verbatim as the supervisor's last-start parameters after a
/// successful start, and reused byte-for-byte on a monitor-triggered restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Model file name, resolved relative to the staging directory.
    pub model_file: String,
    /// Prompt template type passed to the server.
    pub template_type: String,
    /// Context size in tokens.
    pub context_size: u64,
    /// Port to listen on.
    pub port: u16,
}

impl ServerConfig {
    /// Create a configuration with explicit parameters.
    #[must_use]
    pub fn new(
        model_file: impl Into<String>,
        template_type: impl Into<String>,
        context_size: u64,
        port: u16,
    ) -> Self {
        Self {
            model_file: model_file.into(),
            template_type: template_type.into(),
            context_size,
            port,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(
            DEFAULT_MODEL_FILE,
            DEFAULT_TEMPLATE_TYPE,
            DEFAULT_CONTEXT_SIZE,
            DEFAULT_PORT,
        )
    }
}

/// Policy for monitor-triggered restarts.
///
/// The original behavior retried forever with a fixed delay; this caps the
/// attempts and backs off exponentially from `base_delay`. The attempt
/// counter resets once a restarted server passes a responsiveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Maximum consecutive restart attempts before parking in `Failed`.
    pub max_attempts: u32,
    /// Delay before the first restart attempt; doubles per attempt.
    pub base_delay: Duration,
}

impl RestartPolicy {
    /// Delay before the given 1-based attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
        }
    }
}

/// Environment and tuning for the supervisor.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding the staged wasmedge binary, plugins, wasm module,
    /// and model files. Also used as the child's working directory.
    pub staging_dir: PathBuf,
    /// Path to the wasmedge binary.
    pub binary: PathBuf,
    /// Wasm module file name for the API server.
    pub server_module: String,
    /// Interval between health-monitor probes.
    pub monitor_interval: Duration,
    /// Wait after terminating the child so the OS can release the port.
    pub port_release_grace: Duration,
    /// Declare readiness after this many output lines without the ready
    /// marker, so monitoring is never indefinitely deferred.
    pub ready_line_limit: usize,
    /// Restart policy for monitor-detected process death.
    pub restart: RestartPolicy,
    /// Start the default server as soon as the daemon is up.
    pub auto_start: bool,
    /// Unix socket path for the control channel.
    pub socket_path: PathBuf,
    /// Path of the persisted session flags file.
    pub session_path: PathBuf,
}

impl RuntimeConfig {
    /// Build a configuration rooted at a staging directory, with the binary
    /// and state files resolved inside it.
    #[must_use]
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        let staging_dir = staging_dir.into();
        let binary = staging_dir.join("wasmedge");
        let socket_path = staging_dir.join("wasmedged.sock");
        let session_path = staging_dir.join("session.json");
        Self {
            staging_dir,
            binary,
            server_module: DEFAULT_SERVER_MODULE.to_string(),
            monitor_interval: Duration::from_secs(5),
            port_release_grace: Duration::from_millis(500),
            ready_line_limit: 100,
            restart: RestartPolicy::default(),
            auto_start: false,
            socket_path,
            session_path,
        }
    }

    /// Override the binary path.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Override the control socket path.
    #[must_use]
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Override the monitor probe interval.
    #[must_use]
    pub const fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Override the restart policy.
    #[must_use]
    pub const fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_shipped_assets() {
        let config = ServerConfig::default();
        assert_eq!(config.model_file, DEFAULT_MODEL_FILE);
        assert_eq!(config.template_type, DEFAULT_TEMPLATE_TYPE);
        assert_eq!(config.context_size, 1024);
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn restart_delay_doubles_per_attempt() {
        let policy = RestartPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(16));
    }

    #[test]
    fn runtime_config_resolves_paths_in_staging_dir() {
        let config = RuntimeConfig::new("/tmp/llamaedge");
        assert_eq!(config.binary, PathBuf::from("/tmp/llamaedge/wasmedge"));
        assert_eq!(
            config.socket_path,
            PathBuf::from("/tmp/llamaedge/wasmedged.sock")
        );
        assert_eq!(config.server_module, DEFAULT_SERVER_MODULE);
    }
}
