//! The broadcast bus.
//!
//! Owns every port and relays each byte read from one port's primary side to
//! the primary side of every other port. Runs on one thread, blocked in
//! `poll(2)` between readiness events.

mod manager;
mod port;

pub use manager::PortManager;
pub use port::Port;

use crate::config::{BusConfig, ConfigError};
use crate::launcher::LaunchError;
use crate::pty::PtyError;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe;
use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur building or running the bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("port {id}: {source}")]
    Port {
        id: usize,
        #[source]
        source: PtyError,
    },

    #[error("port {id}: failed to launch companion: {source}")]
    Launch {
        id: usize,
        #[source]
        source: LaunchError,
    },

    #[error("failed to create wake pipe: {0}")]
    Wake(#[source] nix::Error),

    #[error("poll failed: {0}")]
    Poll(#[source] nix::Error),
}

/// Requests the broadcast loop to return.
///
/// Triggering sets a flag and writes to a pipe the loop polls alongside the
/// ports, so an idle loop with no poll timeout still wakes up.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<ShutdownState>);

#[derive(Debug)]
struct ShutdownState {
    requested: AtomicBool,
    wake: OwnedFd,
}

impl ShutdownHandle {
    /// Create a handle and the read end of its wake pipe.
    fn new() -> nix::Result<(Self, OwnedFd)> {
        let (read_end, write_end) = pipe()?;
        for fd in [&read_end, &write_end] {
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
            fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        }
        let state = ShutdownState {
            requested: AtomicBool::new(false),
            wake: write_end,
        };
        Ok((Self(Arc::new(state)), read_end))
    }

    /// Ask the loop to stop.
    pub fn trigger(&self) {
        self.0.requested.store(true, Ordering::SeqCst);
        // A full pipe already holds a wake-up
        match nix::unistd::write(&self.0.wake, &[1]) {
            Ok(_) | Err(nix::Error::EAGAIN) => {}
            Err(e) => warn!(%e, "Failed to wake bus loop"),
        }
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.0.requested.load(Ordering::SeqCst)
    }
}

/// Outcome of relaying one chunk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Relayed {
    /// Bytes read from the source.
    bytes: usize,
    /// Destinations that took the whole chunk.
    delivered: usize,
    /// Destinations whose write failed or came up short.
    failed: usize,
}

/// An emulated shared serial bus.
pub struct Bus {
    ports: PortManager,
    poll_timeout: PollTimeout,
    chunk_size: usize,
    companion_grace: Duration,
    shutdown: ShutdownHandle,
    wake: OwnedFd,
}

impl Bus {
    /// Allocate all ports and launch their companions.
    pub fn open(config: &BusConfig) -> Result<Self, BusError> {
        config.validate()?;
        let poll_timeout = match config.poll_timeout {
            None => PollTimeout::NONE,
            Some(timeout) => {
                PollTimeout::try_from(timeout).map_err(|_| ConfigError::PollTimeoutTooLong)?
            }
        };
        let (shutdown, wake) = ShutdownHandle::new().map_err(BusError::Wake)?;
        let ports = PortManager::build(config)?;

        Ok(Self {
            ports,
            poll_timeout,
            chunk_size: config.chunk_size,
            companion_grace: config.companion_grace,
            shutdown,
            wake,
        })
    }

    /// The ports on this bus.
    #[must_use]
    pub const fn ports(&self) -> &PortManager {
        &self.ports
    }

    /// Device paths in ordinal order.
    #[must_use]
    pub fn device_paths(&self) -> Vec<PathBuf> {
        self.ports.device_paths()
    }

    /// A handle that stops `run` from another thread.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Relay bytes between ports until shutdown is requested or `poll` fails.
    pub fn run(&mut self) -> Result<(), BusError> {
        let events = PollFlags::POLLIN | PollFlags::POLLHUP;
        let mut buf = vec![0u8; self.chunk_size];

        while !self.shutdown.is_triggered() {
            // Ports first, in ordinal order; the wake pipe is last
            let ready: Vec<PollFlags> = {
                let mut fds: Vec<PollFd<'_>> = self
                    .ports
                    .ports()
                    .iter()
                    .map(|port| PollFd::new(port.control_fd(), events))
                    .chain(std::iter::once(PollFd::new(self.wake.as_fd(), PollFlags::POLLIN)))
                    .collect();

                match poll(&mut fds, self.poll_timeout) {
                    Ok(_) => fds
                        .iter()
                        .map(|fd| fd.revents().unwrap_or_else(PollFlags::empty))
                        .collect(),
                    Err(nix::Error::EINTR) => continue,
                    Err(e) => return Err(BusError::Poll(e)),
                }
            };

            if ready.last().is_some_and(|wake| wake.contains(PollFlags::POLLIN)) {
                break;
            }

            for (idx, revents) in ready.iter().take(self.ports.len()).enumerate() {
                if revents.contains(PollFlags::POLLIN) {
                    self.forward(idx, &mut buf);
                }
                if revents.contains(PollFlags::POLLHUP) {
                    // Nobody but the keepalive holds the secondary; routine
                    debug!(port = idx + 1, "Hang-up");
                }
            }

            for port in self.ports.ports_mut() {
                port.reap_companion();
            }
        }

        info!("Bus shut down");
        Ok(())
    }

    /// Read one chunk from port `source` and write it to every other port.
    fn forward(&self, source: usize, buf: &mut [u8]) -> Relayed {
        let ports = self.ports.ports();
        let id = source + 1;
        let mut relayed = Relayed::default();

        let n = match nix::unistd::read(ports[source].control_fd(), buf) {
            Ok(0) | Err(nix::Error::EAGAIN) => return relayed,
            Ok(n) => n,
            Err(nix::Error::EIO) => {
                debug!(port = id, "Read returned EIO");
                return relayed;
            }
            Err(e) => {
                warn!(port = id, %e, "PTY read error");
                return relayed;
            }
        };
        let data = &buf[..n];
        relayed.bytes = n;
        debug!(port = id, bytes = n, "Read, forwarding");

        for dest in ports.iter().filter(|p| p.id != id) {
            match nix::unistd::write(dest.control_fd(), data) {
                Ok(written) if written == n => relayed.delivered += 1,
                Ok(written) => {
                    warn!(from = id, to = dest.id, dropped = n - written, "Short write");
                    relayed.failed += 1;
                }
                Err(e) => {
                    warn!(
                        from = id,
                        to = dest.id,
                        %e,
                        "Failed forwarding to {}",
                        dest.device_path().display()
                    );
                    relayed.failed += 1;
                }
            }
        }
        relayed
    }

    /// Stop companions and release every port.
    pub fn close(self) {
        self.ports.close(self.companion_grace);
    }
}
