mod dispatch;
mod install_flow;
mod remove_flow;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use clickd_core::{
    parse_extra_db_roots, set_default_path_env, ServiceConfig, DEFAULT_DB_ROOT,
    DEFAULT_SOCKET_PATH, TEST_DB_PATHS_ENV,
};
use clickd_security::PrivilegeScope;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "clickd")]
#[command(about = "Privileged package helper daemon", long_about = None)]
struct Cli {
    /// Unix socket path to listen on.
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
    /// Base package registry root.
    #[arg(long, default_value = DEFAULT_DB_ROOT)]
    db_root: PathBuf,
    /// Enable debug logging.
    #[arg(long, short = 'v')]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    set_default_path_env();
    debug!(
        path = %std::env::var("PATH").unwrap_or_default(),
        "PATH configured"
    );

    let scope = PrivilegeScope::detect();
    let mut extra_db_roots = Vec::new();
    // Test registry roots are never honored while privileged.
    if !scope.is_privileged() {
        warn!("running as unprivileged user, this only works in a test environment");
        if let Ok(raw) = std::env::var(TEST_DB_PATHS_ENV) {
            extra_db_roots = parse_extra_db_roots(&raw);
        }
    }

    let config = ServiceConfig {
        socket_path: cli.socket,
        db_root: cli.db_root,
        extra_db_roots,
    };
    dispatch::serve(&config, scope)
}

#[cfg(test)]
mod tests;
