//! Command-line interface for ptybus.

use crate::config::{BusConfig, ConfigError, PortSpec};
use clap::Parser;
use std::time::Duration;

/// Token separating companion commands.
pub const COMMAND_SEPARATOR: &str = "--";

/// Split trailing arguments into companion commands.
///
/// Each run of tokens up to the next `--` is one command. Empty runs are
/// skipped.
#[must_use]
pub fn split_commands(args: &[String]) -> Vec<Vec<String>> {
    args.split(|token| token == COMMAND_SEPARATOR)
        .filter(|run| !run.is_empty())
        .map(<[String]>::to_vec)
        .collect()
}

/// Parse a count that must be at least 1.
pub fn parse_nonzero(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

/// Emulate a shared serial bus over pseudo-terminals.
#[derive(Debug, Parser)]
#[command(
    name = "ptybus",
    version,
    about,
    after_help = "Each COMMAND run adds one port after the NUM base ports and is \
                  spawned with %p replaced by that port's device path.\n\
                  Example: ptybus -n 2 -- minicom -D %p -- picocom %p"
)]
pub struct Cli {
    /// Number of serial ports to create.
    #[arg(short = 'n', long = "num", value_name = "NUM", value_parser = parse_nonzero)]
    pub num: usize,

    /// Enable debug messages.
    #[arg(short = 'd', long = "debug", short_alias = 'f')]
    pub debug: bool,

    /// Readiness poll timeout in milliseconds (0 waits indefinitely).
    #[arg(long, env = "PTYBUS_POLL_TIMEOUT_MS", default_value = "250", value_name = "MS")]
    pub poll_timeout_ms: u64,

    /// Maximum bytes relayed per readiness event.
    #[arg(
        long,
        env = "PTYBUS_CHUNK_SIZE",
        default_value = "1",
        value_name = "BYTES",
        value_parser = parse_nonzero
    )]
    pub chunk_size: usize,

    /// Leave the secondary side in the default (cooked) line discipline.
    #[arg(long)]
    pub cooked: bool,

    /// Companion commands, separated by `--`.
    #[arg(last = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub commands: Vec<String>,
}

impl Cli {
    /// Build the bus configuration these arguments describe.
    pub fn to_config(&self) -> Result<BusConfig, ConfigError> {
        let mut ports = vec![PortSpec::default(); self.num];
        ports.extend(split_commands(&self.commands).into_iter().map(|command| PortSpec {
            command: Some(command),
        }));

        let config = BusConfig {
            ports,
            poll_timeout: (self.poll_timeout_ms > 0)
                .then(|| Duration::from_millis(self.poll_timeout_ms)),
            chunk_size: self.chunk_size,
            raw_mode: !self.cooked,
            ..BusConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}
