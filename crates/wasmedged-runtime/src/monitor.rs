//! Periodic liveness and responsiveness monitoring.
//!
//! Started exactly once per session, only after readiness is confirmed. Each
//! iteration first asks the child for its exit status without blocking; only
//! a confirmed exit code means dead; "still running" and "probe errored"
//! both count as alive. If the child is alive, the two-tier responsiveness
//! probe runs; its failure is informational and never triggers a restart.
//!
//! The monitor is policy-free: it reports what it observed as session events
//! and lets the supervisor decide. It is cancellable between iterations, not
//! mid-probe.

use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::health::check_responsiveness;

/// Events reported to the supervisor by a server session's tasks.
///
/// `generation` identifies the session that produced the event so a stale
/// task can never act on its successor's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The runner saw the ready marker (or hit the line fallback).
    Ready { generation: u64 },
    /// The child's output stream closed before monitoring started.
    OutputClosed { generation: u64 },
    /// The monitor confirmed a child exit code.
    ProcessDied {
        generation: u64,
        exit_code: Option<i32>,
    },
    /// Child alive, endpoint not answering. Informational.
    Unresponsive { generation: u64 },
    /// Child alive and endpoint answering.
    Healthy { generation: u64 },
}

/// Handle to one monitoring session.
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Cancel the monitoring loop. Takes effect between iterations.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Start the monitoring loop for a session.
///
/// The loop ends when cancelled or after reporting a confirmed death.
pub fn start_monitor(
    child: Arc<Mutex<Child>>,
    port: u16,
    generation: u64,
    probe_interval: Duration,
    events: UnboundedSender<SessionEvent>,
) -> MonitorHandle {
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();

    let task = tokio::spawn(async move {
        // First probe waits one full interval; the server may still be
        // binding its port when readiness is declared
        let mut ticker = interval_at(Instant::now() + probe_interval, probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(port, generation, "Starting health monitor");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let liveness = probe_liveness(&child).await;

                    match liveness {
                        Liveness::Exited(code) => {
                            warn!(port, generation, ?code, "Process is dead");
                            let _ = events.send(SessionEvent::ProcessDied {
                                generation,
                                exit_code: code,
                            });
                            break;
                        }
                        Liveness::Alive => {
                            let responsive = check_responsiveness(port).await;
                            let event = if responsive {
                                SessionEvent::Healthy { generation }
                            } else {
                                warn!(port, generation, "Process alive but server not responsive");
                                SessionEvent::Unresponsive { generation }
                            };
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                    }
                }
                () = loop_cancel.cancelled() => {
                    debug!(port, generation, "Health monitor cancelled");
                    break;
                }
            }
        }

        debug!(port, generation, "Health monitor loop ended");
    });

    MonitorHandle { cancel, task }
}

enum Liveness {
    Alive,
    Exited(Option<i32>),
}

/// Query the child's exit status without blocking.
async fn probe_liveness(child: &Arc<Mutex<Child>>) -> Liveness {
    let mut guard = child.lock().await;
    match guard.try_wait() {
        Ok(Some(status)) => Liveness::Exited(status.code()),
        Ok(None) => Liveness::Alive,
        Err(e) => {
            // Probe errored; not proof of death
            warn!(error = %e, "Liveness probe errored; treating as alive");
            Liveness::Alive
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn spawn_sleep(secs: u32) -> Child {
        Command::new("sleep")
            .arg(secs.to_string())
            .spawn()
            .expect("failed to spawn sleep")
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn confirmed_exit_is_reported_as_process_died() {
        let mut child = spawn_sleep(30);
        child.start_kill().expect("kill");
        let child = Arc::new(Mutex::new(child));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = start_monitor(child, 65429, 7, Duration::from_millis(20), tx);

        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("monitor reports")
            .expect("channel open");
        assert!(matches!(
            event,
            SessionEvent::ProcessDied { generation: 7, .. }
        ));
        // Loop ends by itself after reporting death
        timeout(Duration::from_secs(1), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("loop ended");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn unresponsive_endpoint_does_not_end_the_loop() {
        let child = Arc::new(Mutex::new(spawn_sleep(30)));

        let (tx, mut rx) = mpsc::unbounded_channel();
        // Port with nothing listening: alive but unresponsive
        let handle = start_monitor(Arc::clone(&child), 65428, 1, Duration::from_millis(20), tx);

        let first = timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("event")
            .expect("channel open");
        assert_eq!(first, SessionEvent::Unresponsive { generation: 1 });

        let second = timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("event")
            .expect("channel open");
        assert_eq!(second, SessionEvent::Unresponsive { generation: 1 });

        handle.stop();
        child.lock().await.kill().await.expect("cleanup");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn first_probe_waits_one_full_interval() {
        let child = Arc::new(Mutex::new(spawn_sleep(30)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = start_monitor(Arc::clone(&child), 65426, 3, Duration::from_millis(300), tx);

        // The server may still be binding its port right after readiness;
        // nothing must be probed until the interval has elapsed
        assert!(
            timeout(Duration::from_millis(150), rx.recv()).await.is_err(),
            "probed before the interval elapsed"
        );

        let event = timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("event")
            .expect("channel open");
        assert_eq!(event, SessionEvent::Unresponsive { generation: 3 });

        handle.stop();
        child.lock().await.kill().await.expect("cleanup");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn cancellation_ends_the_loop() {
        let child = Arc::new(Mutex::new(spawn_sleep(30)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = start_monitor(Arc::clone(&child), 65427, 2, Duration::from_millis(20), tx);

        handle.stop();
        timeout(Duration::from_secs(1), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("loop ended");
        child.lock().await.kill().await.expect("cleanup");
    }
}
