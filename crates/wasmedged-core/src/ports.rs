//! Ports implemented by the runtime or by platform adapters.

/// Observer for child-process output lines.
///
/// The runner forwards every line of the child's combined output here.
/// Implementations must be thread-safe and should not block: the runner's
/// drain task calls this inline between reads.
pub trait ServerLogSink: Send + Sync {
    /// Receive one output line (without trailing newline).
    ///
    /// `stream` is either `"stdout"` or `"stderr"`.
    fn on_line(&self, stream: &str, line: &str);
}

/// Log sink that discards output after tracing already logged it.
pub struct NoopLogSink;

impl ServerLogSink for NoopLogSink {
    fn on_line(&self, _stream: &str, _line: &str) {}
}

/// Platform capability: prevent the host from suspending while a session is
/// active.
///
/// The concrete platform mechanism (wake lock, inhibitor socket, assertion)
/// is an external collaborator; the supervisor only needs idempotent
/// acquire/release semantics. Both calls must tolerate repeats.
pub trait SleepInhibitor: Send + Sync {
    /// Ask the platform to keep the host awake.
    fn acquire(&self) -> std::io::Result<()>;

    /// Release the hold. Called on every teardown path.
    fn release(&self) -> std::io::Result<()>;
}

/// Inhibitor for platforms without a suspend-prevention hook.
pub struct NoopInhibitor;

impl SleepInhibitor for NoopInhibitor {
    fn acquire(&self) -> std::io::Result<()> {
        Ok(())
    }

    fn release(&self) -> std::io::Result<()> {
        Ok(())
    }
}
