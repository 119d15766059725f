//! Process runtime for the wasmedged supervisor.
//!
//! Spawns the WasmEdge-hosted API server as a managed subprocess, watches its
//! output for the ready marker, probes its health on an interval, restarts it
//! on confirmed death, and serves the cross-process control socket.

pub mod control;
pub mod health;
pub mod monitor;
pub mod session;
mod shutdown;
pub mod spawn;
pub mod supervisor;

pub use control::ControlServer;
pub use health::{check_http_health, check_port_open, check_responsiveness};
pub use monitor::{MonitorHandle, SessionEvent};
pub use session::{KeepAwake, SessionFlags, SessionStore};
pub use spawn::{READY_MARKER, SpawnedServer, spawn_server};
pub use supervisor::Supervisor;
