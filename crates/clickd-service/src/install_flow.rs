use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::Command;

use clickd_core::{ServiceConfig, ServiceError};
use clickd_security::{open_as_identity, resolve_peer, PrivilegeScope};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tracing::{debug, warn};

/// External package tool; does the actual unpacking, verification and
/// hook running.
const INSTALL_TOOL: &str = "click";

pub fn install(
    stream: &UnixStream,
    path: &Path,
    config: &ServiceConfig,
    scope: PrivilegeScope,
) -> Result<(), ServiceError> {
    debug!(path = %path.display(), "package installation requested");

    let identity = resolve_peer(stream).map_err(|err| {
        warn!("failed to resolve caller identity: {err:#}");
        ServiceError::internal("failed to resolve caller identity")
    })?;

    // Open with the caller's own identity, never the helper's.
    let fd = open_as_identity(path, OFlag::O_RDONLY, Mode::empty(), &identity, scope)
        .map_err(|err| {
            debug!("failed to open: {err}");
            ServiceError::operation_failed(format!("failed to open {}", path.display()))
        })?;

    // The tool gets a procfs reference to the already-opened descriptor
    // instead of the raw path, so the file whose permissions were checked
    // is the file that gets installed.
    let source = proc_fd_path(&fd);
    let argv = install_argv(config.overlay_root().map(|root| root.as_path()), &source);
    run_install_tool(INSTALL_TOOL, &argv, path)
}

pub(crate) fn proc_fd_path(fd: &OwnedFd) -> String {
    format!("/proc/{}/fd/{}", std::process::id(), fd.as_raw_fd())
}

pub(crate) fn install_argv(overlay_root: Option<&Path>, source: &str) -> Vec<String> {
    let mut argv = vec![
        "install".to_string(),
        "--all-users".to_string(),
        "--allow-unauthenticated".to_string(),
    ];
    if let Some(root) = overlay_root {
        argv.push(format!("--root={}", root.display()));
    }
    argv.push(source.to_string());
    argv
}

pub(crate) fn run_install_tool(
    tool: &str,
    argv: &[String],
    package_path: &Path,
) -> Result<(), ServiceError> {
    let output = Command::new(tool).args(argv).output().map_err(|err| {
        warn!("failed to spawn {tool}: {err}");
        ServiceError::internal(format!(
            "failed to install {} due to internal error",
            package_path.display()
        ))
    })?;

    let Some(code) = output.status.code() else {
        warn!("{tool} exited abnormally");
        return Err(ServiceError::internal(format!(
            "failed to install {} due to internal error",
            package_path.display()
        )));
    };

    debug!(code, "{tool} exited");
    if code != 0 {
        debug!(
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "install tool error output"
        );
        return Err(ServiceError::operation_failed(format!(
            "failed to install {}",
            package_path.display()
        )));
    }
    Ok(())
}
