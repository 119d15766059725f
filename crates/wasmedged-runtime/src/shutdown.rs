//! Child termination with SIGTERM → SIGKILL escalation.
//!
//! Prefers a direct signal to the child's OS process id; falls back to the
//! generic `Child::kill` when no pid is available (already-reaped child, or
//! non-Unix platform).

use std::io;
use std::time::Duration;

use tokio::process::Child;

/// How long to wait for a graceful exit after SIGTERM.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Terminate a child process and reap it.
///
/// Unix: SIGTERM by pid, wait up to the grace period, then SIGKILL.
/// Elsewhere: immediate kill.
pub async fn terminate_child(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    {
        terminate_unix(child).await
    }

    #[cfg(not(unix))]
    {
        child.kill().await?;
        child.wait().await.map(|_| ())
    }
}

#[cfg(unix)]
async fn terminate_unix(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    use tokio::time::timeout;

    let Some(pid) = child.id() else {
        // Already reaped or pid unavailable: generic terminate
        child.kill().await?;
        child.wait().await?;
        return Ok(());
    };

    #[allow(clippy::cast_possible_wrap)]
    let nix_pid = Pid::from_raw(pid as i32);
    if let Err(e) = signal::kill(nix_pid, Signal::SIGTERM) {
        if e == nix::errno::Errno::ESRCH {
            child.wait().await?;
            return Ok(());
        }
        return Err(io::Error::other(e));
    }

    if timeout(TERM_GRACE, child.wait()).await.is_ok() {
        return Ok(());
    }

    // Grace period expired: escalate
    child.kill().await?;
    child.wait().await?;
    Ok(())
}
