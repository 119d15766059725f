//! Caller-side proxy for the wasmedged control socket.
//!
//! The wrapper tracks its own connection state, independent of the daemon's.
//! While disconnected every forwarded operation returns a safe default
//! instead of attempting the call: `false` for booleans, `-1` for the port,
//! `"Service not connected"` for the status. Nothing queues across a
//! disconnect; callers re-issue queries after the on-connect callback fires.

use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use wasmedged_core::config::ServerConfig;
use wasmedged_core::rpc::{ControlRequest, ControlResponse};
use wasmedged_core::status::UNSET_PORT;

/// Status string reported while the wrapper is disconnected.
pub const NOT_CONNECTED_STATUS: &str = "Service not connected";

type Callback = Box<dyn Fn() + Send + Sync>;

struct Channel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Connection wrapper for the control socket.
pub struct ServiceConnection {
    socket_path: PathBuf,
    channel: Mutex<Option<Channel>>,
    connected: AtomicBool,
    on_connect: StdMutex<Option<Callback>>,
    on_disconnect: StdMutex<Option<Callback>>,
}

impl ServiceConnection {
    /// Create a wrapper for the given socket path. Starts disconnected.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            channel: Mutex::new(None),
            connected: AtomicBool::new(false),
            on_connect: StdMutex::new(None),
            on_disconnect: StdMutex::new(None),
        }
    }

    /// Register a callback fired when the channel is established.
    pub fn on_connect(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_connect.lock().expect("callback lock") = Some(Box::new(callback));
    }

    /// Register a callback fired when the channel is lost or torn down.
    pub fn on_disconnect(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_disconnect.lock().expect("callback lock") = Some(Box::new(callback));
    }

    /// Whether the wrapper believes it is connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Establish the channel. Idempotent; returns the connection state.
    pub async fn connect(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                *self.channel.lock().await = Some(Channel {
                    reader: BufReader::new(read_half),
                    writer: write_half,
                });
                self.connected.store(true, Ordering::SeqCst);
                debug!(path = %self.socket_path.display(), "Control channel connected");
                self.fire(&self.on_connect);
                true
            }
            Err(e) => {
                warn!(path = %self.socket_path.display(), error = %e, "Control channel connect failed");
                false
            }
        }
    }

    /// Tear down the channel. Idempotent.
    pub async fn disconnect(&self) {
        self.channel.lock().await.take();
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!("Control channel disconnected");
            self.fire(&self.on_disconnect);
        }
    }

    /// Start the server with default parameters.
    pub async fn start_api_server(&self) -> bool {
        self.call_bool(ControlRequest::StartDefault).await
    }

    /// Start the server with explicit parameters.
    pub async fn start_api_server_with_params(&self, config: ServerConfig) -> bool {
        self.call_bool(ControlRequest::StartWithParams { config })
            .await
    }

    /// Stop the server.
    pub async fn stop_api_server(&self) -> bool {
        self.call_bool(ControlRequest::Stop).await
    }

    /// Whether a server session is active.
    pub async fn is_api_server_running(&self) -> bool {
        self.call_bool(ControlRequest::IsRunning).await
    }

    /// Human-readable server status.
    pub async fn get_api_server_status(&self) -> String {
        match self.call(ControlRequest::Status).await {
            Some(ControlResponse::Status { status }) => status,
            Some(_) | None => NOT_CONNECTED_STATUS.to_string(),
        }
    }

    /// Listening port, or -1 when not running (or not connected).
    pub async fn get_server_port(&self) -> i32 {
        match self.call(ControlRequest::Port).await {
            Some(ControlResponse::Port { port }) => port,
            Some(_) | None => UNSET_PORT,
        }
    }

    /// Flip the daemon's keep-awake flag; returns the new state.
    pub async fn toggle_keep_awake(&self) -> bool {
        self.call_bool(ControlRequest::ToggleKeepAwake).await
    }

    /// Stop the server and ask the daemon to exit.
    pub async fn shutdown_service(&self) -> bool {
        let ok = self.call_bool(ControlRequest::Shutdown).await;
        // The daemon goes away after acknowledging; drop the channel
        self.disconnect().await;
        ok
    }

    async fn call_bool(&self, request: ControlRequest) -> bool {
        match self.call(request).await {
            Some(response) => response.as_bool(),
            None => false,
        }
    }

    /// One request/response exchange. `None` means disconnected, either
    /// before the call or because the transport failed during it; the
    /// failure is resolved here, never surfaced to the caller.
    async fn call(&self, request: ControlRequest) -> Option<ControlResponse> {
        if !self.is_connected() {
            return None;
        }

        let mut guard = self.channel.lock().await;
        let channel = guard.as_mut()?;

        match exchange(channel, &request).await {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(error = %e, "Control call failed; marking disconnected");
                guard.take();
                drop(guard);
                if self.connected.swap(false, Ordering::SeqCst) {
                    self.fire(&self.on_disconnect);
                }
                None
            }
        }
    }

    fn fire(&self, slot: &StdMutex<Option<Callback>>) {
        if let Some(callback) = slot.lock().expect("callback lock").as_ref() {
            callback();
        }
    }
}

async fn exchange(
    channel: &mut Channel,
    request: &ControlRequest,
) -> std::io::Result<ControlResponse> {
    let mut payload = serde_json::to_string(request).map_err(std::io::Error::other)?;
    payload.push('\n');
    channel.writer.write_all(payload.as_bytes()).await?;

    let mut line = String::new();
    let read = channel.reader.read_line(&mut line).await?;
    if read == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "control socket closed",
        ));
    }
    serde_json::from_str(&line).map_err(std::io::Error::other)
}
