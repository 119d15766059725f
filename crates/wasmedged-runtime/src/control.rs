//! Cross-process control channel over a Unix domain socket.
//!
//! Newline-delimited JSON, one response line per request line. Every
//! operation delegates to the supervisor and folds failures into the
//! boolean/string/int result contract; nothing is raised across the channel.
//! Operations only touch already-computed state or trigger bounded state
//! transitions, so a synchronous caller is never blocked indefinitely.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wasmedged_core::rpc::{ControlRequest, ControlResponse};

use crate::supervisor::Supervisor;

/// Control socket server for one supervisor instance.
pub struct ControlServer {
    supervisor: Arc<Supervisor>,
    socket_path: PathBuf,
}

impl ControlServer {
    /// Create a server that will listen on the supervisor's configured
    /// socket path.
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        let socket_path = supervisor.runtime().socket_path.clone();
        Self {
            supervisor,
            socket_path,
        }
    }

    /// Accept loop. Ends when `shutdown` is cancelled, which a `Shutdown`
    /// request also triggers after stopping the server.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        // A stale socket file from a previous run would fail the bind
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("failed to bind {}", self.socket_path.display()))?;
        info!(path = %self.socket_path.display(), "Control socket listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let supervisor = Arc::clone(&self.supervisor);
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, supervisor, shutdown).await {
                                    debug!(error = %e, "Control connection ended with error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
                () = shutdown.cancelled() => break,
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        info!("Control socket closed");
        Ok(())
    }
}

async fn handle_connection(
    stream: UnixStream,
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: ControlRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Malformed control request");
                let response = ControlResponse::Ack { ok: false };
                write_response(&mut write_half, &response).await?;
                continue;
            }
        };

        debug!(?request, "Control request");
        let is_shutdown = matches!(request, ControlRequest::Shutdown);
        let response = dispatch(&supervisor, request).await;
        write_response(&mut write_half, &response).await?;

        if is_shutdown {
            shutdown.cancel();
            break;
        }
    }

    Ok(())
}

/// Map one request to one response. All failures become `ok: false` or the
/// documented default payloads.
async fn dispatch(supervisor: &Arc<Supervisor>, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::StartDefault => ControlResponse::Ack {
            ok: supervisor.start_default().await.is_ok(),
        },
        ControlRequest::StartWithParams { config } => ControlResponse::Ack {
            ok: supervisor.start(config).await.is_ok(),
        },
        ControlRequest::Stop => ControlResponse::Ack {
            ok: supervisor.stop().await.is_ok(),
        },
        ControlRequest::IsRunning => ControlResponse::Ack {
            ok: supervisor.is_running(),
        },
        ControlRequest::Status => ControlResponse::Status {
            status: supervisor.status().message,
        },
        ControlRequest::Port => ControlResponse::Port {
            port: supervisor.port(),
        },
        ControlRequest::ToggleKeepAwake => ControlResponse::Ack {
            ok: supervisor.keep_awake().toggle(),
        },
        ControlRequest::Shutdown => {
            supervisor.shutdown().await;
            ControlResponse::Ack { ok: true }
        }
    }
}

async fn write_response(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    response: &ControlResponse,
) -> Result<()> {
    let mut payload = serde_json::to_string(response)?;
    payload.push('\n');
    write_half.write_all(payload.as_bytes()).await?;
    Ok(())
}
