//! Pseudo-terminal allocation.
//!
//! Allocates the primary/secondary pairs that back each bus port and holds
//! the secondary side open so the primary never reports a hang-up while no
//! external client is attached.
//!
//! # Safety
//!
//! `ptsname` is not thread-safe; it is only used on targets without
//! `ptsname_r`.

#![allow(unsafe_code)]

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};
use nix::sys::termios::{self, SetArg};
use std::fs::OpenOptions;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while allocating a PTY pair.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed opening PTY: {0}")]
    Open(#[source] nix::Error),

    #[error("failed granting PTY: {0}")]
    Grant(#[source] nix::Error),

    #[error("failed unlocking PTY: {0}")]
    Unlock(#[source] nix::Error),

    #[error("failed acquiring secondary PTY name: {0}")]
    Name(#[source] nix::Error),

    #[error("failed opening {path}: {source}")]
    Keepalive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to get terminal attributes: {0}")]
    GetTermios(#[source] nix::Error),

    #[error("failed to set terminal attributes: {0}")]
    SetTermios(#[source] nix::Error),

    #[error("failed to set descriptor flags: {0}")]
    Fcntl(#[source] nix::Error),
}

/// An allocated PTY pair.
pub struct PtyPair {
    /// The primary side, used for all relay I/O.
    pub master: PtyMaster,
    /// Write-only handle on the secondary side. Never used for data.
    pub keepalive: OwnedFd,
    /// Path of the secondary device.
    pub path: PathBuf,
}

impl PtyPair {
    /// Borrow the primary side.
    #[must_use]
    pub fn master_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    /// Path of the secondary device.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Allocate a new PTY pair.
///
/// The primary is opened non-blocking and close-on-exec. When `raw` is set,
/// the secondary side is switched to raw mode so relayed bytes are neither
/// echoed back nor translated.
pub fn allocate(raw: bool) -> Result<PtyPair, PtyError> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(PtyError::Open)?;
    grantpt(&master).map_err(PtyError::Grant)?;
    unlockpt(&master).map_err(PtyError::Unlock)?;

    let path = PathBuf::from(secondary_name(&master).map_err(PtyError::Name)?);

    // Holding the secondary open keeps POLLHUP off the primary.
    let keepalive: OwnedFd = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(&path)
        .map_err(|source| PtyError::Keepalive {
            path: path.clone(),
            source,
        })?
        .into();

    if raw {
        let mut attrs = termios::tcgetattr(&keepalive).map_err(PtyError::GetTermios)?;
        termios::cfmakeraw(&mut attrs);
        termios::tcsetattr(&keepalive, SetArg::TCSANOW, &attrs).map_err(PtyError::SetTermios)?;
    }

    fcntl(&master, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(PtyError::Fcntl)?;

    // Set master to non-blocking mode so a full destination never stalls the relay
    let flags = fcntl(&master, FcntlArg::F_GETFL).map_err(PtyError::Fcntl)?;
    let mut flags = OFlag::from_bits_retain(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(&master, FcntlArg::F_SETFL(flags)).map_err(PtyError::Fcntl)?;

    Ok(PtyPair {
        master,
        keepalive,
        path,
    })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn secondary_name(master: &PtyMaster) -> nix::Result<String> {
    nix::pty::ptsname_r(master)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn secondary_name(master: &PtyMaster) -> nix::Result<String> {
    // SAFETY: the bus allocates ports from a single thread.
    unsafe { nix::pty::ptsname(master) }
}
