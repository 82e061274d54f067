use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use anyhow::{Context, Result};
use clickd_core::{Request, Response, ServiceConfig, ServiceError};
use clickd_security::PrivilegeScope;
use tracing::{debug, info, warn};

/// Sequential accept loop: one connection, one request at a time. The
/// identity-switch bracket is process-global, so requests are never
/// dispatched concurrently.
pub fn serve(config: &ServiceConfig, scope: PrivilegeScope) -> Result<()> {
    if let Some(parent) = config.socket_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket dir: {}", parent.display()))?;
    }
    if config.socket_path.exists() {
        fs::remove_file(&config.socket_path).with_context(|| {
            format!(
                "failed to remove stale socket: {}",
                config.socket_path.display()
            )
        })?;
    }

    let listener = UnixListener::bind(&config.socket_path).with_context(|| {
        format!("failed to bind socket: {}", config.socket_path.display())
    })?;
    info!(socket = %config.socket_path.display(), "listening");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(err) = handle_connection(stream, config, scope) {
                    warn!("connection failed: {err:#}");
                }
            }
            Err(err) => warn!("accept failed: {err}"),
        }
    }
    Ok(())
}

fn handle_connection(
    stream: UnixStream,
    config: &ServiceConfig,
    scope: PrivilegeScope,
) -> Result<()> {
    let reader = BufReader::new(stream.try_clone().context("failed to clone connection")?);
    let mut writer = stream;

    for line in reader.lines() {
        let line = line.context("failed to read request")?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle_request(&writer, request, config, scope),
            Err(err) => {
                debug!("malformed request: {err}");
                ServiceError::internal("malformed request").into_response()
            }
        };

        let mut payload =
            serde_json::to_string(&response).context("failed to encode response")?;
        payload.push('\n');
        writer
            .write_all(payload.as_bytes())
            .context("failed to write response")?;
    }
    Ok(())
}

pub(crate) fn handle_request(
    stream: &UnixStream,
    request: Request,
    config: &ServiceConfig,
    scope: PrivilegeScope,
) -> Response {
    let result = match request {
        Request::Install { path } => {
            crate::install_flow::install(stream, Path::new(&path), config, scope)
        }
        Request::Remove { package } => crate::remove_flow::remove(stream, &package, config),
    };
    match result {
        Ok(()) => Response::Ok,
        Err(err) => {
            warn!("request failed: {err}");
            err.into_response()
        }
    }
}
