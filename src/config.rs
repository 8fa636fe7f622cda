//! Bus configuration.
//!
//! A `BusConfig` is built once at startup (usually from the CLI) and passed by
//! reference into the port manager, the launcher and the broadcast loop.

use std::time::Duration;
use thiserror::Error;

/// Token replaced with a port's device path in companion commands.
pub const PATH_PLACEHOLDER: &str = "%p";

/// Default bounded wait for the readiness poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Longest bounded wait `poll(2)` accepts.
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(0x7fff_ffff);

/// Default grace period between SIGTERM and SIGKILL for companions.
pub const DEFAULT_COMPANION_GRACE: Duration = Duration::from_secs(5);

/// Errors in a bus configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("number of ports must be at least 1")]
    NoPorts,

    #[error("relay chunk size must be at least 1 byte")]
    ZeroChunk,

    #[error("poll timeout exceeds {} ms", MAX_POLL_TIMEOUT.as_millis())]
    PollTimeoutTooLong,

    #[error("companion command for port {id} is empty")]
    EmptyCommand { id: usize },

    #[error("port {id} does not exist (bus has {count} ports)")]
    NoSuchPort { id: usize, count: usize },
}

/// Per-port settings. The port ordinal is the index in `BusConfig::ports` plus one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSpec {
    /// Companion command (program and arguments), if any.
    pub command: Option<Vec<String>>,
}

/// Settings for a whole bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// One entry per port, in ordinal order.
    pub ports: Vec<PortSpec>,
    /// Readiness poll wait. `None` blocks until something happens.
    pub poll_timeout: Option<Duration>,
    /// Maximum bytes read from a source per readiness event.
    pub chunk_size: usize,
    /// Put the secondary side into raw mode at allocation.
    pub raw_mode: bool,
    /// Time a companion gets to exit after SIGTERM before it is killed.
    pub companion_grace: Duration,
}

impl BusConfig {
    /// Config for `count` ports without companions.
    #[must_use]
    pub fn with_ports(count: usize) -> Self {
        Self {
            ports: vec![PortSpec::default(); count],
            ..Self::default()
        }
    }

    /// Attach a companion command to port `id` (1-based).
    pub fn set_companion(&mut self, id: usize, command: Vec<String>) -> Result<(), ConfigError> {
        let count = self.ports.len();
        let spec = id
            .checked_sub(1)
            .and_then(|idx| self.ports.get_mut(idx))
            .ok_or(ConfigError::NoSuchPort { id, count })?;
        spec.command = Some(command);
        Ok(())
    }

    /// Number of ports the bus will have.
    #[must_use]
    pub const fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Check the config before anything is allocated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunk);
        }
        if self.poll_timeout.is_some_and(|timeout| timeout > MAX_POLL_TIMEOUT) {
            return Err(ConfigError::PollTimeoutTooLong);
        }
        for (idx, spec) in self.ports.iter().enumerate() {
            if spec.command.as_ref().is_some_and(Vec::is_empty) {
                return Err(ConfigError::EmptyCommand { id: idx + 1 });
            }
        }
        Ok(())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            poll_timeout: Some(DEFAULT_POLL_TIMEOUT),
            chunk_size: 1,
            raw_mode: true,
            companion_grace: DEFAULT_COMPANION_GRACE,
        }
    }
}
