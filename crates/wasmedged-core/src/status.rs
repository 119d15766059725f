//! Process-wide server status record.
//!
//! All status mutations are routed through a single writer (the supervisor);
//! the runner and the health monitor report what they observe and never write
//! here directly. Readers take immutable snapshots through a watch channel.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// Wire value reported for the port when the server is not up.
pub const UNSET_PORT: i32 = -1;

/// Lifecycle state of the managed server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// No child process exists.
    Stopped,
    /// A start was accepted and the spawn is in flight.
    Starting,
    /// The child is up but has not yet printed the ready marker.
    Running,
    /// The ready marker was seen; the server accepts requests.
    Listening,
    /// The child died or could not be spawned.
    Failed,
    /// A monitor-triggered restart is waiting out its delay.
    Restarting,
}

impl ServerState {
    /// Whether a live child process is expected in this state.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running | Self::Listening)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Listening => "Listening",
            Self::Failed => "Failed",
            Self::Restarting => "Restarting",
        };
        f.write_str(name)
    }
}

/// Immutable snapshot of the server status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Current lifecycle state.
    pub state: ServerState,
    /// Listening port, meaningful only while `Running`/`Listening`.
    pub port: Option<u16>,
    /// Human-readable status message.
    pub message: String,
}

impl StatusSnapshot {
    /// Snapshot for a freshly constructed supervisor.
    #[must_use]
    pub fn stopped() -> Self {
        Self {
            state: ServerState::Stopped,
            port: None,
            message: "Stopped".to_string(),
        }
    }

    /// Port for the control surface: the real port while the server is up,
    /// `-1` otherwise.
    #[must_use]
    pub fn port_or_unset(&self) -> i32 {
        if self.state.is_running() {
            self.port.map_or(UNSET_PORT, i32::from)
        } else {
            UNSET_PORT
        }
    }
}

/// Single-writer status record with snapshot reads.
///
/// Backed by a watch channel so interested tasks (control connections, the
/// CLI daemon loop) can also await changes instead of polling.
#[derive(Debug)]
pub struct StatusStore {
    tx: watch::Sender<StatusSnapshot>,
}

impl StatusStore {
    /// Create a store in the `Stopped` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(StatusSnapshot::stopped());
        Self { tx }
    }

    /// Publish a new status snapshot.
    pub fn publish(&self, state: ServerState, port: Option<u16>, message: impl Into<String>) {
        let snapshot = StatusSnapshot {
            state,
            port,
            message: message.into(),
        };
        // send_replace never fails even with no subscribers
        self.tx.send_replace(snapshot);
    }

    /// Take an immutable snapshot of the current status.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}
