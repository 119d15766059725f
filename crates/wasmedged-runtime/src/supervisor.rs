//! Process supervisor: lifecycle state machine and restart policy.
//!
//! Owns the single server session (at most one child process at a time), the
//! last-known start parameters, and every status publication. The runner and
//! the monitor report what they observe as [`SessionEvent`]s; this module is
//! the only writer of the status store, so concurrent sessions' tasks can
//! never race on shared status fields.
//!
//! State machine: `Stopped → Starting → Running → Listening`, with
//! `Running`/`Listening → Failed → Restarting → Starting` on monitor-detected
//! death, and any non-`Stopped` state reaching `Stopped` through an explicit
//! stop.

use std::sync::Arc;

use tokio::process::Child;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use wasmedged_core::config::{RuntimeConfig, ServerConfig};
use wasmedged_core::error::SupervisorError;
use wasmedged_core::ports::{ServerLogSink, SleepInhibitor};
use wasmedged_core::status::{ServerState, StatusSnapshot, StatusStore};

use crate::monitor::{MonitorHandle, SessionEvent, start_monitor};
use crate::session::{KeepAwake, SessionStore};
use crate::shutdown::terminate_child;
use crate::spawn::spawn_server;

/// One live server session: the period between a successful spawn and the
/// corresponding teardown. A restart creates a new session with a new
/// generation.
struct ServerSession {
    generation: u64,
    port: u16,
    pid: Option<u32>,
    child: Arc<Mutex<Child>>,
    monitor: Option<MonitorHandle>,
}

struct Inner {
    state: ServerState,
    session: Option<ServerSession>,
    last_start_params: Option<ServerConfig>,
    restart_attempts: u32,
    generation: u64,
}

/// Supervisor for the managed API server process.
///
/// Single instance per host process. All lifecycle operations are serialized
/// on an internal lock; queries read status snapshots and never block.
pub struct Supervisor {
    runtime: RuntimeConfig,
    status: StatusStore,
    keep_awake: KeepAwake,
    log_sink: Arc<dyn ServerLogSink>,
    inner: Mutex<Inner>,
    events_tx: UnboundedSender<SessionEvent>,
}

impl Supervisor {
    /// Create the supervisor and start its event loop.
    ///
    /// Consults the persisted session flags: a previously held keep-awake
    /// hold is re-acquired here.
    pub fn spawn(
        runtime: RuntimeConfig,
        inhibitor: Arc<dyn SleepInhibitor>,
        log_sink: Arc<dyn ServerLogSink>,
    ) -> Arc<Self> {
        let store = SessionStore::new(&runtime.session_path);
        let keep_awake = KeepAwake::new(inhibitor, store);
        keep_awake.restore();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            runtime,
            status: StatusStore::new(),
            keep_awake,
            log_sink,
            inner: Mutex::new(Inner {
                state: ServerState::Stopped,
                session: None,
                last_start_params: None,
                restart_attempts: 0,
                generation: 0,
            }),
            events_tx,
        });

        tokio::spawn(Arc::clone(&supervisor).run_events(events_rx));
        supervisor
    }

    /// Runtime configuration this supervisor was built with.
    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Keep-awake handle shared with the control surface.
    pub fn keep_awake(&self) -> &KeepAwake {
        &self.keep_awake
    }

    /// Start the server with default parameters.
    pub async fn start_default(&self) -> Result<(), SupervisorError> {
        self.start(ServerConfig::default()).await
    }

    /// Start the server.
    ///
    /// Fails with `AlreadyRunning` unless the state is `Stopped`. A spawn
    /// failure parks the supervisor in `Failed` with a descriptive message
    /// and is not retried.
    pub async fn start(&self, config: ServerConfig) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().await;
        if inner.state != ServerState::Stopped {
            warn!(state = %inner.state, "Start rejected: server session already active");
            return Err(SupervisorError::AlreadyRunning);
        }
        self.begin_session(&mut inner, config)
    }

    /// Stop the server and clear the cached start parameters.
    ///
    /// Fails with `NotRunning` when already `Stopped`. Monitoring is stopped
    /// first, then the child is terminated (direct signal by pid, generic
    /// kill as fallback), then a fixed grace period lets the OS release the
    /// listening port.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().await;
        if inner.state == ServerState::Stopped {
            warn!("Stop rejected: server is not running");
            return Err(SupervisorError::NotRunning);
        }

        self.teardown_session(&mut inner).await;
        inner.last_start_params = None;
        inner.restart_attempts = 0;
        inner.state = ServerState::Stopped;
        self.status.publish(ServerState::Stopped, None, "Stopped");
        info!("API server stopped");
        Ok(())
    }

    /// Explicit daemon teardown: stop the server if one is up and release
    /// the keep-awake hold regardless of how teardown was triggered.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop().await {
            debug!(error = %e, "Shutdown with no active server session");
        }
        self.keep_awake.release();
    }

    /// Whether a server session is active (`Running` or `Listening`).
    pub fn is_running(&self) -> bool {
        self.status.snapshot().state.is_running()
    }

    /// Current status snapshot.
    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// Await status changes.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    /// Listening port, or -1 when the server is not up.
    pub fn port(&self) -> i32 {
        self.status.snapshot().port_or_unset()
    }

    /// Parameters of the last successful start, kept until an explicit stop.
    pub async fn last_start_params(&self) -> Option<ServerConfig> {
        self.inner.lock().await.last_start_params.clone()
    }

    /// OS process id of the current child, when one is alive.
    pub async fn server_pid(&self) -> Option<u32> {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .and_then(|s| s.pid)
    }

    /// Spawn a new session and wire its ready/output-closed signals into the
    /// event loop. Caller has validated the state transition.
    fn begin_session(
        &self,
        inner: &mut Inner,
        config: ServerConfig,
    ) -> Result<(), SupervisorError> {
        inner.state = ServerState::Starting;
        self.status.publish(
            ServerState::Starting,
            None,
            format!("Starting server on port {}", config.port),
        );

        let spawned = match spawn_server(&self.runtime, &config, Arc::clone(&self.log_sink)) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(error = %e, "Spawn failed");
                inner.state = ServerState::Failed;
                inner.session = None;
                self.status
                    .publish(ServerState::Failed, None, e.to_string());
                return Err(e);
            }
        };

        inner.generation += 1;
        let generation = inner.generation;
        let port = config.port;

        let session = ServerSession {
            generation,
            port,
            pid: spawned.pid,
            child: Arc::new(Mutex::new(spawned.child)),
            monitor: None,
        };
        debug!(generation, port, pid = session.pid, "Server session started");

        // Ready waiter: forwards the runner's readiness signal
        let events = self.events_tx.clone();
        let mut ready = spawned.ready;
        tokio::spawn(async move {
            while ready.changed().await.is_ok() {
                if *ready.borrow() {
                    let _ = events.send(SessionEvent::Ready { generation });
                    break;
                }
            }
        });

        // Output-closed waiter: catches a child that dies before readiness
        let events = self.events_tx.clone();
        let closed = spawned.output_closed;
        tokio::spawn(async move {
            if closed.await.is_ok() {
                let _ = events.send(SessionEvent::OutputClosed { generation });
            }
        });

        inner.last_start_params = Some(config);
        inner.session = Some(session);
        inner.state = ServerState::Running;
        self.status.publish(
            ServerState::Running,
            Some(port),
            format!("Running on port {port}"),
        );
        Ok(())
    }

    /// Stop monitoring, terminate the child, wait out the port grace period.
    async fn teardown_session(&self, inner: &mut Inner) {
        let Some(session) = inner.session.take() else {
            return;
        };

        if let Some(monitor) = &session.monitor {
            monitor.stop();
        }

        {
            let mut child = session.child.lock().await;
            if let Err(e) = terminate_child(&mut child).await {
                warn!(pid = session.pid, error = %e, "Failed to terminate child");
            }
        }

        // Let the OS release the listening port before reporting Stopped
        sleep(self.runtime.port_release_grace).await;
    }

    /// Event loop: the single consumer of session events and the only writer
    /// of the status store beyond the lifecycle entry points.
    async fn run_events(self: Arc<Self>, mut events: UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Ready { generation } => self.on_ready(generation).await,
                SessionEvent::OutputClosed { generation } => {
                    self.on_output_closed(generation).await;
                }
                SessionEvent::ProcessDied {
                    generation,
                    exit_code,
                } => self.on_process_died(generation, exit_code).await,
                SessionEvent::Unresponsive { generation } => {
                    self.on_probe_result(generation, false).await;
                }
                SessionEvent::Healthy { generation } => {
                    self.on_probe_result(generation, true).await;
                }
            }
        }
        debug!("Supervisor event loop ended");
    }

    /// Readiness confirmed: enter `Listening` and start monitoring. The
    /// monitor is activated exactly once per session, here.
    async fn on_ready(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.session.as_mut() else {
            return;
        };
        if session.generation != generation || session.monitor.is_some() {
            return;
        }

        let port = session.port;
        info!(port, "Server is ready; starting health monitor");
        session.monitor = Some(start_monitor(
            Arc::clone(&session.child),
            port,
            generation,
            self.runtime.monitor_interval,
            self.events_tx.clone(),
        ));
        inner.state = ServerState::Listening;
        self.status.publish(
            ServerState::Listening,
            Some(port),
            format!("Server listening on port {port}"),
        );
    }

    /// The child's output closed before monitoring started: it exited during
    /// startup. Reported as `Failed` without an automatic restart, matching
    /// the no-retry rule for startup failures.
    async fn on_output_closed(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        let stale = inner
            .session
            .as_ref()
            .is_none_or(|s| s.generation != generation || s.monitor.is_some());
        if stale {
            return;
        }

        warn!("Server exited before becoming ready");
        if let Some(session) = inner.session.take() {
            // Reap the dead child; nothing to signal
            let _ = session.child.lock().await.wait().await;
        }
        inner.state = ServerState::Failed;
        self.status.publish(
            ServerState::Failed,
            None,
            "Server exited before becoming ready",
        );
    }

    /// Confirmed death while monitored: restart with the cached parameters,
    /// bounded by the restart policy. The cached parameters are reused
    /// verbatim and never cleared here.
    async fn on_process_died(&self, generation: u64, exit_code: Option<i32>) {
        let mut inner = self.inner.lock().await;
        let stale = inner
            .session
            .as_ref()
            .is_none_or(|s| s.generation != generation);
        if stale || !inner.state.is_running() {
            return;
        }

        warn!(?exit_code, "Server process died unexpectedly");
        if let Some(session) = inner.session.take() {
            if let Some(monitor) = &session.monitor {
                monitor.stop();
            }
            // try_wait in the monitor already reaped the child; this is a
            // no-op reap for the fallback paths
            let _ = session.child.lock().await.try_wait();
        }

        inner.state = ServerState::Failed;
        self.status.publish(
            ServerState::Failed,
            None,
            "Server process died unexpectedly",
        );

        if inner.restart_attempts >= self.runtime.restart.max_attempts {
            warn!(
                attempts = inner.restart_attempts,
                "Restart limit reached; not restarting"
            );
            self.status.publish(
                ServerState::Failed,
                None,
                format!(
                    "Server process died; restart limit ({}) reached",
                    self.runtime.restart.max_attempts
                ),
            );
            return;
        }

        let Some(config) = inner.last_start_params.clone() else {
            return;
        };

        inner.restart_attempts += 1;
        let attempt = inner.restart_attempts;
        inner.state = ServerState::Restarting;
        self.status.publish(
            ServerState::Restarting,
            None,
            format!("Server died; restarting (attempt {attempt})"),
        );

        let delay = self.runtime.restart.delay_for_attempt(attempt);
        drop(inner);
        sleep(delay).await;

        let mut inner = self.inner.lock().await;
        if inner.state != ServerState::Restarting {
            // An explicit stop intervened during the delay
            debug!(state = %inner.state, "Restart abandoned");
            return;
        }
        info!(attempt, "Restarting server with previous parameters");
        let _ = self.begin_session(&mut inner, config);
    }

    /// Responsiveness verdict from the monitor. Degraded responsiveness is
    /// informational only; transient load or startup is assumed, not failure.
    /// Only a confirmed-healthy probe resets the restart counter.
    async fn on_probe_result(&self, generation: u64, responsive: bool) {
        let mut inner = self.inner.lock().await;
        let stale = inner
            .session
            .as_ref()
            .is_none_or(|s| s.generation != generation);
        if stale || !inner.state.is_running() {
            return;
        }
        if responsive {
            inner.restart_attempts = 0;
        }
        let port = inner.session.as_ref().map_or(0, |s| s.port);

        let message = if responsive {
            format!("Server listening on port {port}")
        } else {
            format!("Server not responding (port {port})")
        };
        // Published while still holding the lock: a concurrent stop must not
        // be able to slot its Stopped publication between the state check
        // above and this write.
        if self.status.snapshot().message != message {
            self.status.publish(inner.state, Some(port), message);
        }
    }
}
