//! Domain types and ports for the wasmedged supervisor.
//!
//! This crate is infrastructure-free: configuration and status types, the
//! error taxonomy, the control-channel wire protocol, and the ports that the
//! runtime crate implements. All IO lives in `wasmedged-runtime`.

pub mod config;
pub mod error;
pub mod ports;
pub mod rpc;
pub mod status;

pub use config::{RestartPolicy, RuntimeConfig, ServerConfig};
pub use error::SupervisorError;
pub use rpc::{ControlRequest, ControlResponse};
pub use status::{ServerState, StatusSnapshot, StatusStore, UNSET_PORT};
