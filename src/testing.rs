//! Test framework for bus scenarios.
//!
//! Runs a bus on a blocking task and connects external clients to its device
//! paths, the way a program using the emulated serial ports would:
//!
//! ```ignore
//! let harness = BusHarness::new(3).await?;
//! let a = harness.connect(1)?;
//! let b = harness.connect(2)?;
//!
//! a.send(b"ping").await?;
//! let got = b.wait_for_bytes(4, Duration::from_secs(5)).await?;
//! assert_eq!(got, b"ping");
//!
//! harness.shutdown().await?;
//! ```

use crate::bus::{Bus, BusError, ShutdownHandle};
use crate::config::BusConfig;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Poll timeout used by harness buses so shutdown is quick.
const HARNESS_POLL_TIMEOUT: Duration = Duration::from_millis(20);

/// Errors from the test framework.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("timeout waiting for condition")]
    Timeout,

    #[error("no such port: {0}")]
    NoSuchPort(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("bus task failed: {0}")]
    Join(String),
}

/// Test harness that owns a running bus.
pub struct BusHarness {
    paths: Vec<PathBuf>,
    companions: Vec<Option<Vec<String>>>,
    shutdown: ShutdownHandle,
    task: JoinHandle<(Bus, Result<(), BusError>)>,
}

impl BusHarness {
    /// Start a bus with `count` plain ports.
    pub async fn new(count: usize) -> Result<Self, TestError> {
        Self::start(BusConfig::with_ports(count)).await
    }

    /// Start a bus from an explicit config. The poll timeout is shortened.
    pub async fn start(config: BusConfig) -> Result<Self, TestError> {
        let config = BusConfig {
            poll_timeout: Some(HARNESS_POLL_TIMEOUT),
            ..config
        };
        let mut bus = Bus::open(&config)?;

        let paths = bus.device_paths();
        let companions = bus
            .ports()
            .ports()
            .iter()
            .map(|p| p.companion.as_ref().map(|c| c.argv().to_vec()))
            .collect();
        let shutdown = bus.shutdown_handle();

        let task = tokio::task::spawn_blocking(move || {
            let result = bus.run();
            (bus, result)
        });

        // Give the loop time to enter poll
        tokio::time::sleep(Duration::from_millis(20)).await;

        Ok(Self {
            paths,
            companions,
            shutdown,
            task,
        })
    }

    /// Device path of port `id` (1-based).
    pub fn path(&self, id: usize) -> Result<&Path, TestError> {
        id.checked_sub(1)
            .and_then(|idx| self.paths.get(idx))
            .map(PathBuf::as_path)
            .ok_or(TestError::NoSuchPort(id))
    }

    /// All device paths in ordinal order.
    #[must_use]
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Substituted companion argv of port `id`, if it has one.
    #[must_use]
    pub fn companion_argv(&self, id: usize) -> Option<&[String]> {
        self.companions.get(id.checked_sub(1)?)?.as_deref()
    }

    /// Open port `id`'s device as an external client.
    pub fn connect(&self, id: usize) -> Result<PortClient, TestError> {
        PortClient::open(self.path(id)?)
    }

    /// Whether the bus loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop and hand back the bus without closing it.
    pub async fn stop(self) -> Result<Bus, TestError> {
        self.shutdown.trigger();
        let (bus, result) = self
            .task
            .await
            .map_err(|e| TestError::Join(e.to_string()))?;
        result?;
        Ok(bus)
    }

    /// Stop the loop and close the bus.
    pub async fn shutdown(self) -> Result<(), TestError> {
        let bus = self.stop().await?;
        tokio::task::spawn_blocking(move || bus.close())
            .await
            .map_err(|e| TestError::Join(e.to_string()))
    }
}

/// An external program's handle on one port's device.
pub struct PortClient {
    fd: AsyncFd<File>,
}

impl PortClient {
    /// Open a device path read-write and non-blocking.
    pub fn open(path: &Path) -> Result<Self, TestError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)?;
        Ok(Self {
            fd: AsyncFd::new(file)?,
        })
    }

    /// Write all of `data` to the device.
    pub async fn send(&self, data: &[u8]) -> Result<(), TestError> {
        let mut rest = data;
        while !rest.is_empty() {
            let mut guard = self.fd.writable().await?;
            if let Ok(result) = guard.try_io(|inner| inner.get_ref().write(rest)) {
                rest = &rest[result?..];
            }
        }
        Ok(())
    }

    /// Read whatever arrives next.
    async fn read_some(&self, buf: &mut [u8]) -> Result<usize, TestError> {
        loop {
            let mut guard = self.fd.readable().await?;
            if let Ok(result) = guard.try_io(|inner| inner.get_ref().read(buf)) {
                return Ok(result?);
            }
        }
    }

    /// Collect everything that arrives within `window`.
    pub async fn read_for(&self, window: Duration) -> Result<Vec<u8>, TestError> {
        let deadline = Instant::now() + window;
        let mut received = Vec::new();
        let mut buf = [0u8; 256];

        while let Ok(result) = tokio::time::timeout_at(deadline, self.read_some(&mut buf)).await {
            let n = result?;
            received.extend_from_slice(&buf[..n]);
        }
        Ok(received)
    }

    /// Wait until at least `count` bytes have arrived.
    pub async fn wait_for_bytes(
        &self,
        count: usize,
        timeout_duration: Duration,
    ) -> Result<Vec<u8>, TestError> {
        let deadline = Instant::now() + timeout_duration;
        let mut received = Vec::new();
        let mut buf = [0u8; 256];

        while received.len() < count {
            let n = tokio::time::timeout_at(deadline, self.read_some(&mut buf))
                .await
                .map_err(|_| TestError::Timeout)??;
            received.extend_from_slice(&buf[..n]);
        }
        Ok(received)
    }

    /// Wait until the received bytes end with `needle`.
    pub async fn wait_for_suffix(
        &self,
        needle: &[u8],
        timeout_duration: Duration,
    ) -> Result<Vec<u8>, TestError> {
        let deadline = Instant::now() + timeout_duration;
        let mut received = Vec::new();
        let mut buf = [0u8; 256];

        while !received.ends_with(needle) {
            let n = tokio::time::timeout_at(deadline, self.read_some(&mut buf))
                .await
                .map_err(|_| TestError::Timeout)??;
            received.extend_from_slice(&buf[..n]);
        }
        Ok(received)
    }
}
