//! CLI entry point: daemon mode plus client subcommands.
//!
//! `wasmedged daemon` runs the supervisor and its control socket; every
//! other subcommand is a thin client over the connection wrapper.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use wasmedged_client::ServiceConnection;
use wasmedged_core::config::{
    DEFAULT_CONTEXT_SIZE, DEFAULT_MODEL_FILE, DEFAULT_PORT, DEFAULT_TEMPLATE_TYPE, RuntimeConfig,
    ServerConfig,
};
use wasmedged_core::ports::{NoopInhibitor, NoopLogSink};
use wasmedged_runtime::{ControlServer, SessionStore, Supervisor};

#[derive(Parser)]
#[command(name = "wasmedged", about = "Supervised WasmEdge llama API server")]
struct Cli {
    /// Control socket path (defaults to the staging directory)
    #[arg(long, global = true, env = "WASMEDGED_SOCKET")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor daemon
    Daemon(DaemonArgs),
    /// Start the API server
    Start(StartArgs),
    /// Stop the API server
    Stop,
    /// Print whether the API server is running
    Running,
    /// Print the server status message
    Status,
    /// Print the server port (-1 when not running)
    Port,
    /// Flip the keep-host-awake flag
    KeepAwake,
    /// Stop the server and exit the daemon
    Shutdown,
}

#[derive(Args)]
struct DaemonArgs {
    /// Staging directory with the wasmedge binary, plugins, and models
    #[arg(long, env = "WASMEDGED_STAGING_DIR")]
    staging_dir: Option<PathBuf>,

    /// Path to the wasmedge binary (defaults to <staging-dir>/wasmedge)
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Start the default server immediately
    #[arg(long)]
    auto_start: bool,
}

#[derive(Args)]
struct StartArgs {
    /// Model file name inside the staging directory
    #[arg(long, default_value = DEFAULT_MODEL_FILE)]
    model: String,

    /// Prompt template type
    #[arg(long, default_value = DEFAULT_TEMPLATE_TYPE)]
    template: String,

    /// Context size in tokens
    #[arg(long, default_value_t = DEFAULT_CONTEXT_SIZE)]
    ctx_size: u64,

    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

fn default_staging_dir() -> PathBuf {
    dirs::data_local_dir()
        .map_or_else(|| PathBuf::from("."), |d| d.join("wasmedged"))
        .join("llamaedge")
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(args) => {
            run_daemon(args, cli.socket).await?;
            Ok(ExitCode::SUCCESS)
        }
        command => run_client(command, cli.socket).await,
    }
}

async fn run_daemon(args: DaemonArgs, socket: Option<PathBuf>) -> Result<()> {
    let staging_dir = args.staging_dir.unwrap_or_else(default_staging_dir);
    let mut runtime = RuntimeConfig::new(staging_dir);
    if let Some(binary) = args.binary {
        runtime = runtime.with_binary(binary);
    }
    if let Some(socket) = socket {
        runtime = runtime.with_socket_path(socket);
    }
    // Persisted auto-start flag, overridable from the command line
    runtime.auto_start = args.auto_start || SessionStore::new(&runtime.session_path).load().auto_start;

    let supervisor = Supervisor::spawn(runtime, Arc::new(NoopInhibitor), Arc::new(NoopLogSink));

    if supervisor.runtime().auto_start {
        info!("Auto-start enabled; starting default server");
        if let Err(e) = supervisor.start_default().await {
            warn!(error = %e, "Auto-start failed");
        }
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let server = ControlServer::new(Arc::clone(&supervisor));
    server.run(shutdown).await?;

    // Stops the server if one is up and releases keep-awake, regardless of
    // how the accept loop ended
    supervisor.shutdown().await;
    info!("Daemon exited");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Interrupt received");
        }
        shutdown.cancel();
    });
}

async fn run_client(command: Commands, socket: Option<PathBuf>) -> Result<ExitCode> {
    let socket_path =
        socket.unwrap_or_else(|| RuntimeConfig::new(default_staging_dir()).socket_path);
    let connection = ServiceConnection::new(socket_path);
    connection.connect().await;

    let ok = match command {
        Commands::Start(args) => {
            let config = ServerConfig::new(args.model, args.template, args.ctx_size, args.port);
            let started = connection.start_api_server_with_params(config).await;
            println!("{}", if started { "started" } else { "start failed" });
            started
        }
        Commands::Stop => {
            let stopped = connection.stop_api_server().await;
            println!("{}", if stopped { "stopped" } else { "stop failed" });
            stopped
        }
        Commands::Running => {
            let running = connection.is_api_server_running().await;
            println!("{running}");
            true
        }
        Commands::Status => {
            println!("{}", connection.get_api_server_status().await);
            true
        }
        Commands::Port => {
            println!("{}", connection.get_server_port().await);
            true
        }
        Commands::KeepAwake => {
            let held = connection.toggle_keep_awake().await;
            println!("keep-awake {}", if held { "on" } else { "off" });
            connection.is_connected()
        }
        Commands::Shutdown => {
            let ok = connection.shutdown_service().await;
            println!("{}", if ok { "daemon shutting down" } else { "shutdown failed" });
            ok
        }
        Commands::Daemon(_) => unreachable!("handled in main"),
    };

    connection.disconnect().await;
    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
