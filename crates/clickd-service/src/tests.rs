use std::fs;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use clickd_core::{
    ErrorKind, Request, Response, ServiceConfig, ServiceError, DEFAULT_SOCKET_PATH,
};
use clickd_registry::{RegistryStack, Viewpoint, ALL_USERS};
use clickd_security::PrivilegeScope;

use crate::dispatch::handle_request;
use crate::install_flow::{install_argv, proc_fd_path, run_install_tool};
use crate::remove_flow::{combine_outcomes, remove_for_user, RemovalOutcome};

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let sequence = TEST_ROOT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "clickd-service-tests-{label}-{}-{nanos}-{sequence}",
        std::process::id()
    ));
    fs::create_dir_all(&path).expect("must create test root");
    path
}

fn register(root: &Path, key: &str, package: &str, version: &str) {
    let version_dir = root.join(package).join(version);
    fs::create_dir_all(&version_dir).expect("must create version dir");
    let link_dir = root.join(".click/users").join(key);
    fs::create_dir_all(&link_dir).expect("must create users dir");
    std::os::unix::fs::symlink(&version_dir, link_dir.join(package))
        .expect("must create registration link");
}

/// Registration link without physical data in this layer, the shape an
/// inherited entry has after the owning layer was stacked underneath.
fn register_link_only(root: &Path, key: &str, package: &str, version_dir: &Path) {
    let link_dir = root.join(".click/users").join(key);
    fs::create_dir_all(&link_dir).expect("must create users dir");
    std::os::unix::fs::symlink(version_dir, link_dir.join(package))
        .expect("must create registration link");
}

fn two_layer_stack(label: &str) -> (PathBuf, PathBuf, RegistryStack) {
    let base = test_root(&format!("{label}-base"));
    let overlay = test_root(&format!("{label}-overlay"));
    let stack =
        RegistryStack::load(&base, std::slice::from_ref(&overlay)).expect("must load stack");
    (base, overlay, stack)
}

fn cleanup(roots: &[&Path]) {
    for root in roots {
        let _ = fs::remove_dir_all(root);
    }
}

#[test]
fn install_argv_matches_tool_template() {
    let argv = install_argv(None, "/proc/42/fd/7");
    assert_eq!(
        argv,
        vec![
            "install",
            "--all-users",
            "--allow-unauthenticated",
            "/proc/42/fd/7"
        ]
    );
}

#[test]
fn install_argv_inserts_overlay_root_before_source() {
    let argv = install_argv(Some(Path::new("/tmp/overlay")), "/proc/42/fd/7");
    assert_eq!(
        argv,
        vec![
            "install",
            "--all-users",
            "--allow-unauthenticated",
            "--root=/tmp/overlay",
            "/proc/42/fd/7"
        ]
    );
}

#[test]
fn proc_fd_path_names_this_process() {
    let file = std::fs::File::open("/dev/null").expect("must open /dev/null");
    let fd = std::os::fd::OwnedFd::from(file);
    let path = proc_fd_path(&fd);
    assert!(path.starts_with(&format!("/proc/{}/fd/", std::process::id())));
    assert!(fs::read_link(&path).is_ok());
}

#[test]
fn run_install_tool_maps_exit_codes() {
    let package = Path::new("/home/alice/app_1.0_all.click");

    run_install_tool("true", &[], package).expect("exit 0 must succeed");

    let err = run_install_tool("false", &[], package).expect_err("exit 1 must fail");
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
    assert!(err.message().contains("failed to install"));

    let err = run_install_tool("clickd-no-such-tool", &[], package)
        .expect_err("missing tool must fail");
    assert_eq!(err.kind(), ErrorKind::InternalError);
}

#[test]
fn remove_unknown_package_reports_not_found_and_mutates_nothing() {
    let (base, overlay, stack) = two_layer_stack("not-found");

    let err =
        remove_for_user(&stack, "alice", "com.example.ghost").expect_err("must report not found");
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
    assert!(err.message().contains("does not appear to be installed"));
    assert!(!overlay.join(".click").exists());
    assert!(!base.join(".click").exists());

    cleanup(&[&base, &overlay]);
}

#[test]
fn remove_all_users_package_owned_by_overlay() {
    let (base, overlay, stack) = two_layer_stack("all-users");
    register(&overlay, ALL_USERS, "com.example.app", "2.0");

    remove_for_user(&stack, "alice", "com.example.app").expect("must remove package");

    assert_eq!(
        stack.installed_version("com.example.app", Viewpoint::AllUsers),
        None
    );
    assert_eq!(
        stack.installed_version("com.example.app", Viewpoint::User("alice")),
        None
    );
    // Unreferenced data is garbage collected along with the package entry.
    assert!(!overlay.join("com.example.app").exists());

    cleanup(&[&base, &overlay]);
}

#[test]
fn remove_shadows_package_inherited_from_lower_layer() {
    let (base, overlay, stack) = two_layer_stack("shadow");
    register(&base, ALL_USERS, "com.example.app", "1.0");

    remove_for_user(&stack, "alice", "com.example.app").expect("must hide package");

    // The lower layer still physically owns the package.
    assert!(base.join("com.example.app").join("1.0").is_dir());
    assert!(base
        .join(".click/users")
        .join(ALL_USERS)
        .join("com.example.app")
        .exists());
    // But it is no longer visible to the caller.
    assert_eq!(
        stack.installed_version("com.example.app", Viewpoint::User("alice")),
        None
    );

    cleanup(&[&base, &overlay]);
}

#[test]
fn remove_true_ownership_in_both_registries() {
    let (base, overlay, stack) = two_layer_stack("both");
    register(&overlay, ALL_USERS, "com.example.app", "2.0");
    register(&overlay, "alice", "com.example.app", "2.2");

    remove_for_user(&stack, "alice", "com.example.app").expect("must remove both registrations");

    assert_eq!(
        stack.installed_version("com.example.app", Viewpoint::AllUsers),
        None
    );
    assert_eq!(
        stack.installed_version("com.example.app", Viewpoint::User("alice")),
        None
    );
    assert!(!overlay.join("com.example.app").exists());

    cleanup(&[&base, &overlay]);
}

#[test]
fn remove_user_only_package() {
    let (base, overlay, stack) = two_layer_stack("user-only");
    register(&overlay, "alice", "com.example.app", "3.0");

    remove_for_user(&stack, "alice", "com.example.app").expect("must remove package");

    assert_eq!(
        stack.installed_version("com.example.app", Viewpoint::User("alice")),
        None
    );
    assert!(!overlay.join("com.example.app").exists());

    cleanup(&[&base, &overlay]);
}

#[test]
fn remove_user_package_leaves_other_users_version_data() {
    let (base, overlay, stack) = two_layer_stack("other-user");
    register(&overlay, "alice", "com.example.app", "3.0");
    register_link_only(
        &overlay,
        "bob",
        "com.example.app",
        &overlay.join("com.example.app").join("3.0"),
    );

    remove_for_user(&stack, "alice", "com.example.app").expect("must remove registration");

    assert_eq!(
        stack.installed_version("com.example.app", Viewpoint::User("alice")),
        None
    );
    // bob still references 3.0, so the data survives.
    assert_eq!(
        stack.installed_version("com.example.app", Viewpoint::User("bob")),
        Some("3.0".to_string())
    );
    assert!(overlay.join("com.example.app").join("3.0").is_dir());

    cleanup(&[&base, &overlay]);
}

#[test]
fn combine_outcomes_fails_when_both_layers_error() {
    let err = combine_outcomes(RemovalOutcome {
        version_all_present: true,
        version_user_present: true,
        uninstalled: true,
        all_error: Some(anyhow!("all-users removal failed")),
        user_error: Some(anyhow!("user removal failed")),
    })
    .expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
    // The user-layer error wins the reported message.
    assert_eq!(err.message(), "user removal failed");
}

#[test]
fn combine_outcomes_tolerates_all_users_error_after_user_uninstall() {
    combine_outcomes(RemovalOutcome {
        version_all_present: true,
        version_user_present: true,
        uninstalled: true,
        all_error: Some(anyhow!("all-users removal failed")),
        user_error: None,
    })
    .expect("one successful uninstall must win");
}

#[test]
fn combine_outcomes_mirrors_single_layer_results() {
    // Only the user layer had a version; its error is the result.
    let err = combine_outcomes(RemovalOutcome {
        version_all_present: false,
        version_user_present: true,
        uninstalled: true,
        all_error: None,
        user_error: Some(anyhow!("user removal failed")),
    })
    .expect_err("must mirror user layer failure");
    assert_eq!(err.message(), "user removal failed");

    // Only the all-users layer had a version; its error is the result.
    let err = combine_outcomes(RemovalOutcome {
        version_all_present: true,
        version_user_present: false,
        uninstalled: true,
        all_error: Some(anyhow!("all-users removal failed")),
        user_error: None,
    })
    .expect_err("must mirror all-users layer failure");
    assert_eq!(err.message(), "all-users removal failed");

    combine_outcomes(RemovalOutcome {
        version_all_present: true,
        version_user_present: false,
        uninstalled: true,
        all_error: None,
        user_error: None,
    })
    .expect("clean single-layer removal must succeed");
}

fn own_user_name() -> String {
    nix::unistd::User::from_uid(nix::unistd::geteuid())
        .expect("must look up own account")
        .expect("own account must exist")
        .name
}

fn test_config(base: &Path, overlay: &Path) -> ServiceConfig {
    ServiceConfig {
        socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
        db_root: base.to_path_buf(),
        extra_db_roots: vec![overlay.to_path_buf()],
    }
}

#[test]
fn handle_request_removes_own_package_end_to_end() {
    let base = test_root("e2e-base");
    let overlay = test_root("e2e-overlay");
    register(&overlay, &own_user_name(), "com.example.app", "1.0");

    let (local, _remote) = UnixStream::pair().expect("must create socket pair");
    let response = handle_request(
        &local,
        Request::Remove {
            package: "com.example.app".to_string(),
        },
        &test_config(&base, &overlay),
        PrivilegeScope::detect(),
    );
    assert_eq!(response, Response::Ok);
    assert!(!overlay.join("com.example.app").exists());

    cleanup(&[&base, &overlay]);
}

#[test]
fn handle_request_reports_unopenable_install_path() {
    let base = test_root("install-base");
    let overlay = test_root("install-overlay");

    let (local, _remote) = UnixStream::pair().expect("must create socket pair");
    let response = handle_request(
        &local,
        Request::Install {
            path: "/no/such/package.click".to_string(),
        },
        &test_config(&base, &overlay),
        PrivilegeScope::detect(),
    );
    let Response::Error { kind, message } = response else {
        panic!("install of a missing path must fail");
    };
    assert_eq!(kind, ErrorKind::OperationFailed);
    assert!(message.contains("failed to open /no/such/package.click"));

    cleanup(&[&base, &overlay]);
}

#[test]
fn removal_error_surfaces_as_operation_failed() {
    let err = ServiceError::operation_failed("package 'x' does not appear to be installed");
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
}
