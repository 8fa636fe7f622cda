//! Port manager.

use super::port::Port;
use super::BusError;
use crate::config::BusConfig;
use crate::{launcher, pty};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Owns every port on the bus, indexed by ordinal.
pub struct PortManager {
    ports: Vec<Port>,
}

impl PortManager {
    /// Allocate every port described by `config`, launching companions as
    /// each port comes up. Any failure aborts the whole build.
    pub fn build(config: &BusConfig) -> Result<Self, BusError> {
        config.validate()?;

        let mut manager = Self {
            ports: Vec::with_capacity(config.port_count()),
        };
        for (idx, spec) in config.ports.iter().enumerate() {
            let id = idx + 1;
            let pair = pty::allocate(config.raw_mode).map_err(|source| BusError::Port { id, source })?;
            let mut port = Port::new(id, pair);

            if let Some(command) = &spec.command {
                let companion = launcher::spawn(command, port.device_path())
                    .map_err(|source| BusError::Launch { id, source })?;
                info!(
                    "device {id} => {} ({})",
                    port.device_path().display(),
                    companion.command_line()
                );
                port.companion = Some(companion);
            } else {
                info!("device {id} => {}", port.device_path().display());
            }

            manager.ports.push(port);
        }
        Ok(manager)
    }

    /// Get a port by ordinal.
    #[must_use]
    pub fn get(&self, id: usize) -> Option<&Port> {
        self.ports.get(id.checked_sub(1)?)
    }

    /// Get a mutable reference to a port by ordinal.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Port> {
        self.ports.get_mut(id.checked_sub(1)?)
    }

    /// All ports in ordinal order.
    #[must_use]
    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    /// All ports in ordinal order, mutably.
    pub fn ports_mut(&mut self) -> &mut [Port] {
        &mut self.ports
    }

    /// Device paths in ordinal order.
    #[must_use]
    pub fn device_paths(&self) -> Vec<PathBuf> {
        self.ports.iter().map(|p| p.device_path().to_path_buf()).collect()
    }

    /// Get the number of ports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Check if there are no ports.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Stop all companions, then release every descriptor.
    pub fn close(mut self, grace: Duration) {
        for port in &mut self.ports {
            port.stop_companion(grace);
        }
    }
}

impl Drop for PortManager {
    fn drop(&mut self) {
        // Catches a partially built bus as well as an unclosed one
        for port in &mut self.ports {
            port.stop_companion(Duration::ZERO);
        }
    }
}
