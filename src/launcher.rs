//! Companion process launching.
//!
//! A companion is an external program bound to one port's device path by
//! substituting the path placeholder in its argument list.

use crate::config::PATH_PLACEHOLDER;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors that can occur while launching or managing a companion.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("command is empty")]
    EmptyCommand,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send signal: {0}")]
    Signal(#[source] nix::Error),

    #[error("failed to wait: {0}")]
    Wait(#[source] std::io::Error),
}

/// Replace every token exactly equal to the placeholder with `path`.
#[must_use]
pub fn substitute(command: &[String], path: &Path) -> Vec<String> {
    command
        .iter()
        .map(|token| {
            if token == PATH_PLACEHOLDER {
                path.display().to_string()
            } else {
                token.clone()
            }
        })
        .collect()
}

/// Spawn `command` with the placeholder replaced by `path`.
pub fn spawn(command: &[String], path: &Path) -> Result<Companion, LaunchError> {
    let argv = substitute(command, path);
    let (program, args) = argv.split_first().ok_or(LaunchError::EmptyCommand)?;

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            program: program.clone(),
            source,
        })?;

    Ok(Companion {
        argv,
        child,
        exit_code: None,
    })
}

/// A spawned companion process.
pub struct Companion {
    argv: Vec<String>,
    child: Child,
    exit_code: Option<i32>,
}

impl Companion {
    /// The substituted argument list, program first.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// The argument list joined for display.
    #[must_use]
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }

    /// The child process ID.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // PIDs fit in i32
    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Exit code, once the companion has been reaped.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Check if the companion is still running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.exit_code.is_none()
    }

    /// Send a signal to the companion.
    pub fn signal(&self, sig: Signal) -> Result<(), LaunchError> {
        signal::kill(self.pid(), sig).map_err(LaunchError::Signal)
    }

    /// Reap the companion if it has exited, without blocking.
    /// Returns `Some(exit_code)` if exited, None if still running.
    pub fn try_wait(&mut self) -> Result<Option<i32>, LaunchError> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        let status = self.child.try_wait().map_err(LaunchError::Wait)?;
        Ok(status.map(|status| self.record(status)))
    }

    /// Wait for the companion to exit (blocking).
    pub fn wait(&mut self) -> Result<i32, LaunchError> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let status = self.child.wait().map_err(LaunchError::Wait)?;
        Ok(self.record(status))
    }

    /// SIGTERM the companion, then SIGKILL it if it is still alive after `grace`.
    pub fn terminate(&mut self, grace: Duration) -> Result<i32, LaunchError> {
        if let Some(code) = self.try_wait()? {
            return Ok(code);
        }

        self.signal(Signal::SIGTERM)?;
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(code) = self.try_wait()? {
                return Ok(code);
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        tracing::warn!(pid = %self.pid(), "companion ignored SIGTERM, killing");
        self.signal(Signal::SIGKILL)?;
        self.wait()
    }

    fn record(&mut self, status: ExitStatus) -> i32 {
        let code = status
            .code()
            .or_else(|| status.signal().map(|sig| 128 + sig))
            .unwrap_or(-1);
        self.exit_code = Some(code);
        code
    }
}
