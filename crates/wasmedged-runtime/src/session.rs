//! Session persistence and the keep-host-awake capability.
//!
//! Flags that must survive a supervisor restart live in a small JSON file
//! written atomically (temp file + rename). The keep-awake hold itself is
//! delegated to a [`SleepInhibitor`] port; this module owns idempotence,
//! persistence, and the guaranteed-release invariant.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use wasmedged_core::ports::SleepInhibitor;

/// Flags persisted across supervisor restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionFlags {
    /// Keep the host awake while the daemon runs.
    pub keep_awake: bool,
    /// Start the default server when the daemon comes up.
    pub auto_start: bool,
}

/// JSON-file-backed store for session flags.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Create a store at the given path. The file need not exist yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load persisted flags; a missing or malformed file yields defaults.
    #[must_use]
    pub fn load(&self) -> SessionFlags {
        match fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "Malformed session file; using defaults");
                SessionFlags::default()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => SessionFlags::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read session file");
                SessionFlags::default()
            }
        }
    }

    /// Persist flags atomically via temp file + rename.
    pub fn save(&self, flags: SessionFlags) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = temp_path_for(&self.path);
        let content = serde_json::to_string_pretty(&flags).map_err(io::Error::other)?;
        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, &self.path)?;
        debug!(path = %self.path.display(), ?flags, "Session flags saved");
        Ok(())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map_or_else(
        || std::ffi::OsString::from("session.json"),
        std::ffi::OsStr::to_os_string,
    );
    name.push(".tmp");
    path.with_file_name(name)
}

/// Idempotent keep-awake hold with persistence.
///
/// Acquiring twice is observably identical to acquiring once, and release is
/// safe on every teardown path regardless of the current state.
pub struct KeepAwake {
    inhibitor: Arc<dyn SleepInhibitor>,
    store: SessionStore,
    held: AtomicBool,
}

impl KeepAwake {
    /// Create an unheld keep-awake handle.
    pub fn new(inhibitor: Arc<dyn SleepInhibitor>, store: SessionStore) -> Self {
        Self {
            inhibitor,
            store,
            held: AtomicBool::new(false),
        }
    }

    /// Re-acquire at startup when the persisted flag says the hold was set.
    pub fn restore(&self) {
        if self.store.load().keep_awake {
            info!("Keep-awake flag persisted from previous session; re-acquiring");
            self.acquire();
        }
    }

    /// Acquire the hold and persist the flag. Idempotent.
    pub fn acquire(&self) {
        if self.held.swap(true, Ordering::SeqCst) {
            debug!("Keep-awake already held");
            return;
        }
        if let Err(e) = self.inhibitor.acquire() {
            warn!(error = %e, "Failed to acquire keep-awake hold");
            self.held.store(false, Ordering::SeqCst);
            return;
        }
        self.persist(true);
        info!("Keep-awake hold acquired");
    }

    /// Release the hold and persist the flag. Idempotent; called on every
    /// teardown path.
    pub fn release(&self) {
        if !self.held.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.inhibitor.release() {
            warn!(error = %e, "Failed to release keep-awake hold");
        }
        self.persist(false);
        info!("Keep-awake hold released");
    }

    /// Flip the hold; returns the new state.
    pub fn toggle(&self) -> bool {
        if self.is_held() {
            self.release();
            false
        } else {
            self.acquire();
            self.is_held()
        }
    }

    /// Whether the hold is currently set.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    fn persist(&self, keep_awake: bool) {
        let mut flags = self.store.load();
        flags.keep_awake = keep_awake;
        if let Err(e) = self.store.save(flags) {
            warn!(error = %e, "Failed to persist keep-awake flag");
        }
    }
}

impl Drop for KeepAwake {
    fn drop(&mut self) {
        // Guaranteed release even on abnormal teardown
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;
    use wasmedged_core::ports::NoopInhibitor;

    struct CountingInhibitor {
        acquires: AtomicU32,
        releases: AtomicU32,
    }

    impl CountingInhibitor {
        fn new() -> Self {
            Self {
                acquires: AtomicU32::new(0),
                releases: AtomicU32::new(0),
            }
        }
    }

    impl SleepInhibitor for CountingInhibitor {
        fn acquire(&self) -> io::Result<()> {
            self.acquires.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&self) -> io::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn store_in(dir: &TempDir) -> SessionStore {
        SessionStore::new(dir.path().join("session.json"))
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        assert_eq!(store.load(), SessionFlags::default());
    }

    #[test]
    fn flags_round_trip_through_the_file() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        let flags = SessionFlags {
            keep_awake: true,
            auto_start: true,
        };
        store.save(flags).expect("save");
        assert_eq!(store.load(), flags);
    }

    #[test]
    fn double_acquire_is_observably_single() {
        let dir = TempDir::new().expect("tempdir");
        let inhibitor = Arc::new(CountingInhibitor::new());
        let keep_awake = KeepAwake::new(Arc::clone(&inhibitor) as _, store_in(&dir));

        keep_awake.acquire();
        keep_awake.acquire();

        assert!(keep_awake.is_held());
        assert_eq!(inhibitor.acquires.load(Ordering::SeqCst), 1);

        keep_awake.release();
        keep_awake.release();
        assert_eq!(inhibitor.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn persisted_hold_is_reacquired_on_restore() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        store
            .save(SessionFlags {
                keep_awake: true,
                auto_start: false,
            })
            .expect("save");

        let keep_awake = KeepAwake::new(Arc::new(NoopInhibitor), store);
        assert!(!keep_awake.is_held());
        keep_awake.restore();
        assert!(keep_awake.is_held());
    }

    #[test]
    fn drop_releases_the_hold() {
        let dir = TempDir::new().expect("tempdir");
        let store = store_in(&dir);
        {
            let keep_awake = KeepAwake::new(Arc::new(NoopInhibitor), store.clone());
            keep_awake.acquire();
            assert!(store.load().keep_awake);
        }
        assert!(!store.load().keep_awake);
    }

    #[test]
    fn toggle_flips_state() {
        let dir = TempDir::new().expect("tempdir");
        let keep_awake = KeepAwake::new(Arc::new(NoopInhibitor), store_in(&dir));
        assert!(keep_awake.toggle());
        assert!(!keep_awake.toggle());
    }
}
