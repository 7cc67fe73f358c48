//! Integration tests for `lode version` and argument parsing.

use std::process::Command;

fn cargo_bin() -> Command {
    let mut cmd = Command::new(env!("CARGO"));
    cmd.args(["run", "-q", "-p", "lode-cli", "--bin", "lode", "--"]);
    cmd
}

#[test]
fn test_version_prints_package_version() {
    let output = cargo_bin()
        .arg("version")
        .output()
        .expect("Failed to run version command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("lode "), "unexpected output: {stdout}");
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_dev_rejects_missing_config() {
    let dir = tempfile::tempdir().unwrap();
    let output = cargo_bin()
        .args(["--cwd"])
        .arg(dir.path())
        .args(["dev", "--config", "missing.json"])
        .output()
        .expect("Failed to run dev command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Config file not found"), "unexpected stderr: {stderr}");
}
