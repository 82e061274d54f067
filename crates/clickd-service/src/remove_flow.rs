use std::os::unix::net::UnixStream;

use clickd_core::{ServiceConfig, ServiceError};
use clickd_registry::{RegistryStack, Viewpoint};
use clickd_security::resolve_peer;
use tracing::{debug, warn};

pub fn remove(
    stream: &UnixStream,
    package: &str,
    config: &ServiceConfig,
) -> Result<(), ServiceError> {
    debug!(package, "package removal requested");

    let identity = resolve_peer(stream).map_err(|err| {
        warn!("failed to resolve caller identity: {err:#}");
        ServiceError::internal("failed to resolve caller identity")
    })?;

    // A fresh view per request; registrations on disk are the truth.
    let stack = RegistryStack::load(&config.db_root, &config.extra_db_roots).map_err(|err| {
        warn!("failed to read package registry: {err:#}");
        ServiceError::internal("failed to read package registry")
    })?;

    remove_for_user(&stack, &identity.user_name, package)
}

/// Removal is performed against the registry layer that actually owns the
/// installed package. A package can be *visible* through inheritance from
/// a lower layer without being *physically removable* there, so each
/// candidate is ownership-tested against the overlay before a true
/// removal; what remains visible only through inheritance is hidden
/// instead of deleted.
pub(crate) fn remove_for_user(
    stack: &RegistryStack,
    user_name: &str,
    package: &str,
) -> Result<(), ServiceError> {
    let overlay = stack
        .overlay()
        .ok_or_else(|| ServiceError::internal("package registry is empty"))?;

    let version_all = stack.installed_version(package, Viewpoint::AllUsers);
    debug!(?version_all);

    let mut uninstalled = false;
    let mut all_error = None;
    let mut user_error = None;

    if let Some(version) = &version_all {
        if overlay.has_package_version(package, version) {
            if let Err(err) = stack.remove_registration(Viewpoint::AllUsers, package) {
                all_error = Some(err);
            }
            if let Err(err) = stack.maybe_remove(package, version) {
                debug!("bookkeeping after all-users removal failed: {err:#}");
            }
            uninstalled = true;
        }
    }

    // Computed after the all-users attempt: removing the @all entry
    // changes what this user's viewpoint would otherwise inherit.
    let version_user = stack.installed_version(package, Viewpoint::User(user_name));
    debug!(?version_user);

    if version_all.is_none() && version_user.is_none() {
        return Err(ServiceError::operation_failed(format!(
            "package '{package}' does not appear to be installed"
        )));
    }

    if let Some(version) = &version_user {
        if overlay.has_package_version(package, version) {
            if let Err(err) = stack.remove_registration(Viewpoint::User(user_name), package) {
                user_error = Some(err);
            }
            if let Err(err) = stack.maybe_remove(package, version) {
                debug!("bookkeeping after user removal failed: {err:#}");
            }
            uninstalled = true;
        }
    }

    // Shadow case: visible through @all but physically owned by a lower
    // layer. Hiding the registration keeps the underlying files intact
    // while making the package disappear for this caller.
    if !uninstalled {
        if let Some(version) = &version_all {
            if let Err(err) = stack.remove_registration(Viewpoint::AllUsers, package) {
                all_error = Some(err);
            }
            if let Err(err) = stack.maybe_remove(package, version) {
                debug!("bookkeeping after hide removal failed: {err:#}");
            }
        }
    }

    combine_outcomes(RemovalOutcome {
        version_all_present: version_all.is_some(),
        version_user_present: version_user.is_some(),
        uninstalled,
        all_error,
        user_error,
    })
}

/// Per-layer outcome of one removal request, combined into the single
/// reported result.
pub(crate) struct RemovalOutcome {
    pub version_all_present: bool,
    pub version_user_present: bool,
    pub uninstalled: bool,
    pub all_error: Option<anyhow::Error>,
    pub user_error: Option<anyhow::Error>,
}

/// A package present in both registries fails only when both removals
/// fail; a package present in one registry mirrors that registry's own
/// result. The user-layer error wins the reported message.
pub(crate) fn combine_outcomes(outcome: RemovalOutcome) -> Result<(), ServiceError> {
    let RemovalOutcome {
        version_all_present,
        version_user_present,
        uninstalled,
        all_error,
        user_error,
    } = outcome;

    let failed = (user_error.is_some() && all_error.is_some())
        || ((!version_user_present || !uninstalled) && all_error.is_some())
        || (!version_all_present && user_error.is_some());
    if failed {
        let message = user_error
            .or(all_error)
            .map_or_else(|| "removal failed".to_string(), |err| err.to_string());
        return Err(ServiceError::operation_failed(message));
    }
    Ok(())
}
