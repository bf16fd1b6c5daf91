use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn demo_plugins() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/plugins")
}

/// The binary with a throwaway home so no user configuration leaks in
fn plugin_sandbox(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("plugin-sandbox").unwrap();
    cmd.env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join(".config"))
        .env_remove("PLUGIN_SANDBOX_DIR")
        .env_remove("PLUGIN_SANDBOX_TIMEOUT_MS")
        .env_remove("PLUGIN_SANDBOX_LOG")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn validate_demo_plugins() {
    let home = TempDir::new().unwrap();
    plugin_sandbox(&home)
        .arg("validate")
        .arg(demo_plugins())
        .assert()
        .success()
        .stdout(predicate::str::contains("add: ok (add 1.0.0)"));
}

#[test]
fn validate_reports_bad_packages() {
    let home = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let bad = root.path().join("bad");
    fs::create_dir_all(&bad).unwrap();
    fs::write(
        bad.join("plugin.json"),
        r#"{"name": "bad", "version": "1.0.0", "entry": "/etc/passwd"}"#,
    )
    .unwrap();
    fs::create_dir_all(root.path().join("empty")).unwrap();

    plugin_sandbox(&home)
        .arg("validate")
        .arg(root.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("bad: invalid manifest: unsafe entry path"))
        .stdout(predicate::str::contains("empty: no manifest found"));
}

#[test]
fn validate_uses_config_file() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("config.toml");
    fs::write(
        &config,
        format!("[plugins]\ndirectory = {:?}\n", demo_plugins().display().to_string()),
    )
    .unwrap();

    plugin_sandbox(&home)
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("add: ok"));
}

#[test]
fn missing_command_is_a_usage_error() {
    let home = TempDir::new().unwrap();
    plugin_sandbox(&home)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[cfg(unix)]
#[test]
fn exec_prints_result() {
    let home = TempDir::new().unwrap();
    plugin_sandbox(&home)
        .arg("--plugins-dir")
        .arg(demo_plugins())
        .args(["exec", "add", r#"{"a": 5, "b": 3}"#])
        .assert()
        .success()
        .stdout(predicate::str::diff("8\n"));
}

#[cfg(unix)]
#[test]
fn exec_unknown_plugin_fails() {
    let home = TempDir::new().unwrap();
    plugin_sandbox(&home)
        .arg("--plugins-dir")
        .arg(demo_plugins())
        .args(["exec", "ghost", "{}"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("plugin 'ghost' not found"));
}

#[cfg(unix)]
#[test]
fn call_binds_arguments() {
    let home = TempDir::new().unwrap();
    plugin_sandbox(&home)
        .arg("--plugins-dir")
        .arg(demo_plugins())
        .args(["call", "add", "add", r#"{"a": 2, "b": 40, "c": "dropped"}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""success": true"#))
        .stdout(predicate::str::contains(r#""data": 42"#));

    plugin_sandbox(&home)
        .arg("--plugins-dir")
        .arg(demo_plugins())
        .args(["call", "add", "add", r#"{"a": 2}"#])
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""code": "invalid_arguments""#));
}

#[cfg(unix)]
#[test]
fn tools_lists_schemas() {
    let home = TempDir::new().unwrap();
    plugin_sandbox(&home)
        .arg("--plugins-dir")
        .arg(demo_plugins())
        .arg("tools")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""toolSchemas""#))
        .stdout(predicate::str::contains(r#""name": "add""#));
}
