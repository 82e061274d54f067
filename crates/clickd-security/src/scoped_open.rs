use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::sync::Mutex;

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{getegid, geteuid, getgroups, setegid, seteuid, setgroups};
use tracing::error;

use crate::PeerIdentity;

/// Whether opens actually switch identity. `Ambient` is the explicit
/// test bypass for unprivileged runs; `detect` is the only sanctioned
/// way to obtain it, and `open_as_identity` refuses to honor it while
/// the process is privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeScope {
    Scoped,
    Ambient,
}

impl PrivilegeScope {
    pub fn detect() -> Self {
        if geteuid().is_root() {
            Self::Scoped
        } else {
            Self::Ambient
        }
    }

    pub fn is_privileged(self) -> bool {
        matches!(self, Self::Scoped)
    }
}

/// The ambient process identity is a single process-wide resource; the
/// switch/open/restore bracket must never overlap another switch.
static IDENTITY_SWITCH: Mutex<()> = Mutex::new(());

/// Opens `path` while the process's effective identity is narrowed to the
/// caller's. Supplementary groups are set first (dropping them needs the
/// privilege being dropped), then the effective gid, then the effective
/// uid; restoration runs unconditionally in reverse order. A failing open
/// is a normal error for the caller to report; a failing identity switch
/// or restore aborts the process, because continuing under an
/// indeterminate identity is unsafe.
pub fn open_as_identity(
    path: &Path,
    flags: OFlag,
    mode: Mode,
    identity: &PeerIdentity,
    scope: PrivilegeScope,
) -> io::Result<OwnedFd> {
    if scope == PrivilegeScope::Ambient {
        if geteuid().is_root() {
            fatal("ambient open requested while running privileged");
        }
        return raw_open(path, flags, mode);
    }

    let _guard = IDENTITY_SWITCH
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let orig_uid = geteuid();
    let orig_gid = getegid();
    let orig_groups = match getgroups() {
        Ok(groups) => groups,
        Err(errno) => fatal_errno("getgroups", errno),
    };

    if let Err(errno) = setgroups(&identity.groups) {
        fatal_errno("setgroups", errno);
    }
    if setegid(identity.gid).is_err() || getegid() != identity.gid {
        fatal("setegid failed");
    }
    // uid last: once it is dropped the process may no longer be allowed
    // to change its gid.
    if seteuid(identity.uid).is_err() || geteuid() != identity.uid {
        fatal("seteuid failed");
    }

    let opened = open(path, flags, mode);

    if let Err(errno) = seteuid(orig_uid) {
        fatal_errno("failed to restore euid", errno);
    }
    if let Err(errno) = setegid(orig_gid) {
        fatal_errno("failed to restore egid", errno);
    }
    if let Err(errno) = setgroups(&orig_groups) {
        fatal_errno("failed to restore groups", errno);
    }

    match opened {
        Ok(fd) => Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

fn raw_open(path: &Path, flags: OFlag, mode: Mode) -> io::Result<OwnedFd> {
    match open(path, flags, mode) {
        Ok(fd) => Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

fn fatal(message: &str) -> ! {
    error!("{message}");
    std::process::abort();
}

fn fatal_errno(message: &str, errno: Errno) -> ! {
    error!("{message}: {errno}");
    std::process::abort();
}
