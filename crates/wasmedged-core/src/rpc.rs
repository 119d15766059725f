//! Control-channel wire protocol.
//!
//! Newline-delimited JSON over a local Unix socket. Each request line gets
//! exactly one response line. Failures are encoded in the payload (false /
//! -1 / message string), never as a protocol-level error, so a caller can
//! treat any transport fault as "service not connected".

use crate::config::ServerConfig;
use serde::{Deserialize, Serialize};

/// Requests accepted by the supervisor's control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Start the server with the built-in default parameters.
    StartDefault,
    /// Start the server with explicit parameters.
    StartWithParams { config: ServerConfig },
    /// Stop the server.
    Stop,
    /// Whether a server session is active.
    IsRunning,
    /// Human-readable status message.
    Status,
    /// Listening port, or -1 when not running.
    Port,
    /// Flip the persisted keep-host-awake flag.
    ToggleKeepAwake,
    /// Explicit-stop signal: stop the server and exit the daemon.
    Shutdown,
}

/// Responses produced by the control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    /// Boolean outcome for start/stop/is-running/toggle/shutdown.
    Ack { ok: bool },
    /// Status message payload.
    Status { status: String },
    /// Port payload (-1 when not running).
    Port { port: i32 },
}

impl ControlResponse {
    /// Boolean view used by callers that only care about success.
    #[must_use]
    pub fn as_bool(&self) -> bool {
        match self {
            Self::Ack { ok } => *ok,
            Self::Status { .. } | Self::Port { .. } => true,
        }
    }
}
