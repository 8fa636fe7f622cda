//! Port representation.

use crate::launcher::Companion;
use crate::pty::PtyPair;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// One emulated serial endpoint.
pub struct Port {
    /// 1-based ordinal.
    pub id: usize,
    /// The PTY pair backing this port.
    pub pty: PtyPair,
    /// Companion process bound to this port's device path.
    pub companion: Option<Companion>,
}

impl Port {
    /// Create a port from an allocated PTY pair.
    #[must_use]
    pub const fn new(id: usize, pty: PtyPair) -> Self {
        Self {
            id,
            pty,
            companion: None,
        }
    }

    /// Path of the secondary device external programs open.
    #[must_use]
    pub fn device_path(&self) -> &Path {
        self.pty.path()
    }

    /// The control (primary) descriptor.
    #[must_use]
    pub fn control_fd(&self) -> BorrowedFd<'_> {
        self.pty.master_fd()
    }

    /// Reap the companion if it exited since the last check.
    /// Returns the exit code the first time an exit is observed.
    pub fn reap_companion(&mut self) -> Option<i32> {
        let companion = self.companion.as_mut().filter(|c| c.is_running())?;
        match companion.try_wait() {
            Ok(Some(code)) => {
                info!(port = self.id, %code, "Companion exited");
                Some(code)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(port = self.id, %e, "Companion wait failed");
                None
            }
        }
    }

    /// Stop a still-running companion.
    pub fn stop_companion(&mut self, grace: Duration) {
        let Some(companion) = self.companion.as_mut().filter(|c| c.is_running()) else {
            return;
        };
        match companion.terminate(grace) {
            Ok(code) => info!(port = self.id, %code, "Companion stopped"),
            Err(e) => warn!(port = self.id, %e, "Failed to stop companion"),
        }
    }
}
