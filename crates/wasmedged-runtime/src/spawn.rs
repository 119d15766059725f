//! Subprocess runner for the WasmEdge API server.
//!
//! Builds the child environment and argv, spawns the binary, and drains its
//! output line-by-line. Readiness is declared when a line contains the ready
//! marker, or after a bounded number of lines without it so monitoring is
//! never indefinitely deferred.
//!
//! The drain tasks hold no cancellation handle: a blocking line read is only
//! unblocked by the child closing its output stream, which is exactly what
//! killing the child does.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use wasmedged_core::config::{RuntimeConfig, ServerConfig};
use wasmedged_core::error::SupervisorError;
use wasmedged_core::ports::ServerLogSink;

/// Substring in child output taken as proof the server has begun listening.
pub const READY_MARKER: &str = "Server listening on";

/// A live child process with its readiness and output-closed signals.
pub struct SpawnedServer {
    /// OS-level child handle. Exclusively owned by the caller; at most one
    /// exists at a time.
    pub child: Child,
    /// Child process id, when the OS reported one.
    pub pid: Option<u32>,
    /// Flips to `true` exactly once when readiness is declared.
    pub ready: watch::Receiver<bool>,
    /// Resolves when the child's stdout closes (child exited or was killed).
    pub output_closed: oneshot::Receiver<()>,
}

/// Build the server command: environment, argv, working directory.
///
/// argv order is fixed by the server contract:
/// `--dir .:. --nn-preload default:GGML:AUTO:<model> <module>
/// --prompt-template <t> --ctx-size <n> --port <p>`.
#[must_use]
pub fn build_command(runtime: &RuntimeConfig, config: &ServerConfig) -> Command {
    let staging = runtime.staging_dir.as_os_str();
    let mut cmd = Command::new(&runtime.binary);
    cmd.arg("--dir")
        .arg(".:.")
        .arg("--nn-preload")
        .arg(format!("default:GGML:AUTO:{}", config.model_file))
        .arg(&runtime.server_module)
        .arg("--prompt-template")
        .arg(&config.template_type)
        .arg("--ctx-size")
        .arg(config.context_size.to_string())
        .arg("--port")
        .arg(config.port.to_string())
        .env("LD_LIBRARY_PATH", staging)
        .env("WASMEDGE_PLUGIN_PATH", staging)
        .current_dir(&runtime.staging_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

/// Spawn the server and start draining its output.
///
/// Fails with `SpawnFailure` when the binary is missing or cannot be
/// executed. On success the child is already being drained; the caller owns
/// the returned handle and is responsible for terminating the child.
pub fn spawn_server(
    runtime: &RuntimeConfig,
    config: &ServerConfig,
    log_sink: Arc<dyn ServerLogSink>,
) -> Result<SpawnedServer, SupervisorError> {
    if !runtime.binary.exists() {
        return Err(SupervisorError::SpawnFailure(format!(
            "wasmedge binary not found at {}",
            runtime.binary.display()
        )));
    }

    let mut child = build_command(runtime, config)
        .spawn()
        .map_err(|e| SupervisorError::SpawnFailure(e.to_string()))?;

    let pid = child.id();
    debug!(pid, port = config.port, "Spawned wasmedge server");

    let (ready_tx, ready_rx) = watch::channel(false);
    let (closed_tx, closed_rx) = oneshot::channel();

    if let Some(stdout) = child.stdout.take() {
        let sink = Arc::clone(&log_sink);
        let line_limit = runtime.ready_line_limit;
        tokio::spawn(async move {
            drain_stdout(stdout, &sink, &ready_tx, line_limit).await;
            let _ = closed_tx.send(());
        });
    } else {
        warn!("Child has no stdout; readiness will rely on the line fallback");
    }

    if let Some(stderr) = child.stderr.take() {
        let sink = Arc::clone(&log_sink);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "wasmedged::server", "{line}");
                sink.on_line("stderr", &line);
            }
            debug!("stderr drain task exiting");
        });
    }

    Ok(SpawnedServer {
        child,
        pid,
        ready: ready_rx,
        output_closed: closed_rx,
    })
}

/// Drain stdout to the sink, declaring readiness on the marker or after the
/// line-count fallback. Ends when the stream closes.
async fn drain_stdout(
    stdout: impl AsyncRead + Unpin,
    sink: &Arc<dyn ServerLogSink>,
    ready_tx: &watch::Sender<bool>,
    line_limit: usize,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut line_count = 0usize;
    let mut ready = false;

    while let Ok(Some(line)) = lines.next_line().await {
        line_count += 1;
        debug!(target: "wasmedged::server", "{line}");
        sink.on_line("stdout", &line);

        if !ready {
            if line.contains(READY_MARKER) {
                debug!("Ready marker seen; server is listening");
                ready = true;
                let _ = ready_tx.send(true);
            } else if line_count > line_limit {
                // The server may be up without printing the expected message
                debug!(line_count, "No ready marker; declaring readiness anyway");
                ready = true;
                let _ = ready_tx.send(true);
            }
        }
    }

    debug!(line_count, "stdout drain task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::path::Path;

    fn argv_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn command_argv_follows_server_contract() {
        let runtime = RuntimeConfig::new("/srv/llamaedge");
        let config = ServerConfig::new("m.gguf", "t1", 1024, 8080);
        let cmd = build_command(&runtime, &config);

        assert_eq!(cmd.as_std().get_program(), Path::new("/srv/llamaedge/wasmedge"));
        assert_eq!(
            argv_of(&cmd),
            vec![
                "--dir",
                ".:.",
                "--nn-preload",
                "default:GGML:AUTO:m.gguf",
                "llama-api-server.wasm",
                "--prompt-template",
                "t1",
                "--ctx-size",
                "1024",
                "--port",
                "8080",
            ]
        );
    }

    #[test]
    fn command_env_points_at_staging_dir() {
        let runtime = RuntimeConfig::new("/srv/llamaedge");
        let config = ServerConfig::default();
        let cmd = build_command(&runtime, &config);

        let envs: Vec<(&OsStr, Option<&OsStr>)> = cmd.as_std().get_envs().collect();
        let staging = OsStr::new("/srv/llamaedge");
        assert!(envs.contains(&(OsStr::new("LD_LIBRARY_PATH"), Some(staging))));
        assert!(envs.contains(&(OsStr::new("WASMEDGE_PLUGIN_PATH"), Some(staging))));
        assert_eq!(cmd.as_std().get_current_dir(), Some(Path::new("/srv/llamaedge")));
    }

    #[test]
    fn missing_binary_is_a_spawn_failure() {
        let runtime = RuntimeConfig::new("/nonexistent/staging");
        let config = ServerConfig::default();
        let result = spawn_server(&runtime, &config, Arc::new(wasmedged_core::ports::NoopLogSink));
        assert!(matches!(result, Err(SupervisorError::SpawnFailure(_))));
    }

    #[tokio::test]
    async fn ready_marker_flips_readiness() {
        let output: &[u8] = b"loading model\nServer listening on 0.0.0.0:8080\nmore output\n";
        let (ready_tx, mut ready_rx) = watch::channel(false);
        let sink: Arc<dyn ServerLogSink> = Arc::new(wasmedged_core::ports::NoopLogSink);

        drain_stdout(output, &sink, &ready_tx, 100).await;

        assert!(ready_rx.has_changed().expect("sender alive"));
        assert!(*ready_rx.borrow_and_update());
    }

    #[tokio::test]
    async fn line_fallback_declares_readiness_without_marker() {
        let output = "noise\n".repeat(150);
        let (ready_tx, ready_rx) = watch::channel(false);
        let sink: Arc<dyn ServerLogSink> = Arc::new(wasmedged_core::ports::NoopLogSink);

        drain_stdout(output.as_bytes(), &sink, &ready_tx, 100).await;

        assert!(*ready_rx.borrow());
    }

    #[tokio::test]
    async fn short_output_without_marker_stays_unready() {
        let output: &[u8] = b"one line\n";
        let (ready_tx, ready_rx) = watch::channel(false);
        let sink: Arc<dyn ServerLogSink> = Arc::new(wasmedged_core::ports::NoopLogSink);

        drain_stdout(output, &sink, &ready_tx, 100).await;

        assert!(!*ready_rx.borrow());
    }
}
