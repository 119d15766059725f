//! Client-to-daemon round trips over a real Unix socket.
//!
//! Runs a supervisor plus control server against a temp staging directory
//! and exercises the wrapper's forwarding and disconnect semantics.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use wasmedged_client::{NOT_CONNECTED_STATUS, ServiceConnection};
use wasmedged_core::config::{RuntimeConfig, ServerConfig};
use wasmedged_core::ports::{NoopInhibitor, NoopLogSink};
use wasmedged_runtime::{ControlServer, Supervisor};

const LISTENING_SCRIPT: &str = "#!/bin/sh\necho 'Server listening on 0.0.0.0:8080'\nexec sleep 300\n";

struct Daemon {
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
    _dir: TempDir,
}

async fn start_daemon() -> Daemon {
    let dir = TempDir::new().expect("tempdir");
    let binary = dir.path().join("wasmedge");
    std::fs::write(&binary, LISTENING_SCRIPT).expect("write stub");
    let mut perms = std::fs::metadata(&binary).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&binary, perms).expect("chmod");

    let mut runtime = RuntimeConfig::new(dir.path());
    runtime.monitor_interval = Duration::from_millis(100);
    runtime.port_release_grace = Duration::from_millis(50);

    let supervisor = Supervisor::spawn(runtime, Arc::new(NoopInhibitor), Arc::new(NoopLogSink));
    let shutdown = CancellationToken::new();
    let server = ControlServer::new(Arc::clone(&supervisor));
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        server.run(server_shutdown).await.expect("control server");
    });
    wait_for_socket(&supervisor.runtime().socket_path).await;

    Daemon {
        supervisor,
        shutdown,
        _dir: dir,
    }
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..100 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("control socket never appeared at {}", path.display());
}

#[tokio::test]
async fn full_lifecycle_through_the_wrapper() {
    let daemon = start_daemon().await;
    let connection = ServiceConnection::new(&daemon.supervisor.runtime().socket_path);

    assert!(connection.connect().await);
    assert!(connection.is_connected());

    // Nothing running yet
    assert!(!connection.is_api_server_running().await);
    assert_eq!(connection.get_api_server_status().await, "Stopped");
    assert_eq!(connection.get_server_port().await, -1);
    assert!(!connection.stop_api_server().await);

    // Start with explicit parameters
    let config = ServerConfig::new("m.gguf", "t1", 1024, 39476);
    assert!(
        connection
            .start_api_server_with_params(config.clone())
            .await
    );
    assert!(connection.is_api_server_running().await);
    assert_eq!(connection.get_server_port().await, 39476);

    // A second start is refused without disturbing the session
    assert!(!connection.start_api_server().await);
    assert_eq!(connection.get_server_port().await, 39476);
    assert_eq!(
        daemon.supervisor.last_start_params().await,
        Some(config)
    );

    // Stop and verify the defaults come back
    assert!(connection.stop_api_server().await);
    assert!(!connection.is_api_server_running().await);
    assert_eq!(connection.get_server_port().await, -1);
    assert_eq!(connection.get_api_server_status().await, "Stopped");

    connection.disconnect().await;
    daemon.shutdown.cancel();
}

#[tokio::test]
async fn keep_awake_toggles_across_the_wire() {
    let daemon = start_daemon().await;
    let connection = ServiceConnection::new(&daemon.supervisor.runtime().socket_path);
    assert!(connection.connect().await);

    assert!(connection.toggle_keep_awake().await);
    assert!(daemon.supervisor.keep_awake().is_held());
    assert!(!connection.toggle_keep_awake().await);
    assert!(!daemon.supervisor.keep_awake().is_held());

    daemon.shutdown.cancel();
}

#[tokio::test]
async fn connect_callbacks_fire_and_defaults_return_after_disconnect() {
    let daemon = start_daemon().await;
    let connection = ServiceConnection::new(&daemon.supervisor.runtime().socket_path);

    let connects = Arc::new(AtomicU32::new(0));
    let disconnects = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&connects);
    connection.on_connect(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    let d = Arc::clone(&disconnects);
    connection.on_disconnect(move || {
        d.fetch_add(1, Ordering::SeqCst);
    });

    assert!(connection.connect().await);
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    connection.disconnect().await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert!(!connection.is_connected());
    assert_eq!(
        connection.get_api_server_status().await,
        NOT_CONNECTED_STATUS
    );
    assert_eq!(connection.get_server_port().await, -1);

    daemon.shutdown.cancel();
}

#[tokio::test]
async fn shutdown_request_stops_daemon_and_disconnects() {
    let daemon = start_daemon().await;
    let socket_path = daemon.supervisor.runtime().socket_path.clone();
    let connection = ServiceConnection::new(&socket_path);
    assert!(connection.connect().await);

    assert!(connection.start_api_server().await);
    assert!(connection.shutdown_service().await);
    assert!(!connection.is_connected());

    // The daemon stopped the server and removed the socket
    for _ in 0..100 {
        if !socket_path.exists() && !daemon.supervisor.is_running() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("daemon did not shut down cleanly");
}
