use std::path::PathBuf;

pub const DEFAULT_SOCKET_PATH: &str = "/run/clickd/clickd.sock";
pub const DEFAULT_DB_ROOT: &str = "/var/lib/clickd/db";

/// $PATH is not set when the daemon is socket-activated, which breaks the
/// external tool when it shells out to dpkg and the signature verifier.
pub const DEFAULT_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

/// Colon-separated extra registry roots, appended after the base root in
/// listed order. Only honored when the daemon is not running privileged.
pub const TEST_DB_PATHS_ENV: &str = "CLICKD_TEST_DB_PATHS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub db_root: PathBuf,
    pub extra_db_roots: Vec<PathBuf>,
}

impl ServiceConfig {
    /// The writable overlay root handed to the external install tool,
    /// present only when extra roots are configured.
    pub fn overlay_root(&self) -> Option<&PathBuf> {
        self.extra_db_roots.last()
    }
}

pub fn parse_extra_db_roots(raw: &str) -> Vec<PathBuf> {
    raw.split(':')
        .filter(|entry| !entry.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Sets a sane $PATH when none is inherited; never overrides a set one.
pub fn set_default_path_env() {
    if std::env::var_os("PATH").is_none_or(|path| path.is_empty()) {
        std::env::set_var("PATH", DEFAULT_PATH);
    }
}
