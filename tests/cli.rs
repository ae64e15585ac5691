use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/codesync.sqlite"

[server]
bind = "127.0.0.1:7341"

[[repositories]]
id = "acme-api"
kind = "git"
path = "{}/checkout"
default_branch = "main"
"#,
        root.display(),
        root.display()
    );

    let config_path = config_dir.join("codesync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_codesync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_codesync"))
        .arg("--config")
        .arg(config_path)
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .expect("failed to run codesync binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_codesync(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/codesync.sqlite").exists());

    let (_, stderr, success) = run_codesync(&config_path, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_status_before_first_sync() {
    let (_tmp, config_path) = setup_test_env();
    run_codesync(&config_path, &["init"]);

    let (stdout, stderr, success) = run_codesync(&config_path, &["status", "acme-api"]);
    assert!(success, "status failed: {}", stderr);
    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["codebase_id"], "acme-api");
    assert_eq!(status["synced"], false);
    assert_eq!(status["files"], 0);
}

#[test]
fn test_unknown_codebase_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_codesync(&config_path, &["init"]);

    let (_, stderr, success) = run_codesync(&config_path, &["sync", "nope"]);
    assert!(!success);
    assert!(stderr.contains("unknown codebase"));
}

#[test]
fn test_invalid_config_is_reported() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("bad.toml");
    fs::write(&config_path, "[db]\npath = \"x\"\n[index]\nprovider = \"faiss\"\n").unwrap();

    let (_, stderr, success) = run_codesync(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Unknown index provider"));
}
