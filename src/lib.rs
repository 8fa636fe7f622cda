//! ptybus — shared serial bus emulation
//!
//! Allocates N pseudo-terminal pairs and broadcasts every byte received on
//! one to all the others, so software expecting independent serial links can
//! be tested without hardware.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod bus;
pub mod cli;
pub mod config;
pub mod launcher;
pub mod pty;
pub mod testing;

pub use bus::{Bus, BusError, Port, PortManager, ShutdownHandle};
pub use cli::Cli;
pub use config::{BusConfig, ConfigError, PortSpec, PATH_PLACEHOLDER};
pub use launcher::{Companion, LaunchError};
pub use pty::{PtyError, PtyPair};
pub use testing::{BusHarness, PortClient, TestError};
