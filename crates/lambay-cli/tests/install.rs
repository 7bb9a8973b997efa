//! Integration tests for `lambay install`.
//!
//! Every test pins the registry to an unreachable address and the cache to
//! a per-test directory, so nothing here touches the network; resolution
//! only succeeds through seeded on-disk caches.

use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

fn cargo_bin(cache: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO"));
    cmd.args(["run", "-p", "lambay-cli", "--bin", "lambay", "--"]);
    cmd.env("LAMBAY_NPM_REGISTRY", "http://127.0.0.1:9/");
    cmd.env("LAMBAY_CACHE_DIR", cache);
    cmd
}

/// Helper to create a package.json with the given dependencies object.
fn create_package_json(dir: &Path, deps: &str) {
    let content =
        format!(r#"{{"name": "test-project", "version": "1.0.0", "dependencies": {deps}}}"#);
    fs::write(dir.join("package.json"), content).unwrap();
}

/// Seed the per-version registry entry cache so an exact spec resolves
/// without a reachable registry.
fn seed_version_entry(cache: &Path, name: &str, version: &str) {
    let dir = cache.join("registry-cache").join("versions");
    fs::create_dir_all(&dir).unwrap();
    let content = format!(
        r#"{{"name": "{name}", "version": "{version}", "dist": {{"tarball": "https://example.com/{name}-{version}.tgz"}}, "dependencies": {{}}}}"#
    );
    fs::write(dir.join(format!("{name}@{version}.json")), content).unwrap();
}

/// Seed a slot integrity marker so the installer treats it as up to date.
fn seed_marker(project: &Path, name: &str, version: &str) {
    let slot = project.join("node_modules").join(name);
    fs::create_dir_all(&slot).unwrap();
    let content = format!(r#"{{"name": "{name}", "version": "{version}", "hash": "cafe01"}}"#);
    fs::write(slot.join(".integrity"), content).unwrap();
}

/// A manifest with no dependencies installs nothing and exits zero.
#[test]
fn test_install_no_dependencies() {
    let project = tempdir().unwrap();
    let cache = tempdir().unwrap();
    create_package_json(project.path(), "{}");

    let output = cargo_bin(cache.path())
        .args(["install", "--cwd"])
        .arg(project.path())
        .output()
        .expect("failed to run lambay install");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "install with no dependencies should succeed. stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(
        stdout.contains("no dependencies to install"),
        "stdout should report nothing to install: {stdout}"
    );
    assert!(
        !project.path().join("lambay.lock").exists(),
        "no lockfile should be written when nothing was installed"
    );
}

/// A missing package.json is an error.
#[test]
fn test_install_missing_manifest_fails() {
    let project = tempdir().unwrap();
    let cache = tempdir().unwrap();

    let output = cargo_bin(cache.path())
        .args(["install", "--cwd"])
        .arg(project.path())
        .output()
        .expect("failed to run lambay install");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        !output.status.success(),
        "install without a manifest should fail"
    );
    assert!(
        stderr.contains("manifest not found"),
        "stderr should name the missing manifest: {stderr}"
    );
}

/// End-to-end offline install: an exact dependency resolves through the
/// seeded entry cache, the up-to-date slot is skipped without any network
/// or extraction work, and the lockfile snapshot is persisted.
#[test]
fn test_install_up_to_date_project_offline() {
    let project = tempdir().unwrap();
    let cache = tempdir().unwrap();
    create_package_json(project.path(), r#"{"left-pad": "1.3.0"}"#);
    seed_version_entry(cache.path(), "left-pad", "1.3.0");
    seed_marker(project.path(), "left-pad", "1.3.0");

    let output = cargo_bin(cache.path())
        .args(["install", "--cwd"])
        .arg(project.path())
        .output()
        .expect("failed to run lambay install");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "offline install of an up-to-date project should succeed. stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(
        stdout.contains("1 already up to date"),
        "stdout should report the skipped slot: {stdout}"
    );

    // The snapshot records the resolved package and the marker's hash.
    let lockfile = fs::read_to_string(project.path().join("lambay.lock")).unwrap();
    assert!(lockfile.contains("left-pad"), "lockfile: {lockfile}");
    assert!(lockfile.contains("1.3.0"), "lockfile: {lockfile}");
    assert!(lockfile.contains("cafe01"), "lockfile: {lockfile}");
}

/// A requirement that cannot be resolved is reported and the run exits
/// non-zero, even though sibling work is unaffected.
#[test]
fn test_install_resolve_failure_exits_nonzero() {
    let project = tempdir().unwrap();
    let cache = tempdir().unwrap();
    create_package_json(project.path(), r#"{"ghost-pkg": "^1"}"#);

    let output = cargo_bin(cache.path())
        .args(["install", "--cwd"])
        .arg(project.path())
        .output()
        .expect("failed to run lambay install");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        !output.status.success(),
        "install should exit non-zero when a requirement fails to resolve"
    );
    assert!(
        stderr.contains("failed to resolve ghost-pkg"),
        "stderr should name the failed requirement: {stderr}"
    );
}

/// Test the help output for the install command.
#[test]
fn test_install_help_shows_options() {
    let cache = tempdir().unwrap();

    let output = cargo_bin(cache.path())
        .args(["install", "--help"])
        .output()
        .expect("failed to run lambay install --help");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--dev"), "help should show --dev option");
    assert!(
        stdout.contains("--concurrency"),
        "help should show --concurrency option"
    );
}

/// Verify the lockfile contract constants are stable.
#[test]
fn test_lockfile_contract_stable() {
    assert_eq!(lambay_core::lockfile::LOCKFILE_VERSION, 1);
    assert_eq!(lambay_core::LOCKFILE_NAME, "lambay.lock");
}
