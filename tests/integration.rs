use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ecfr_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ecfr");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Port 9 (discard) refuses connections, so nothing here reaches the network.
    let config_content = format!(
        r#"[db]
path = "{}/data/ecfr.sqlite"

[corpus]
base_url = "http://127.0.0.1:9/api"
timeout_secs = 2
max_retries = 0
backoff_base_ms = 1

[ingest]
per_page = 20
workers = 2
retry_delay_ms = 0

[metrics]
workers = 3
"#,
        root.display()
    );

    let config_path = config_dir.join("ecfr.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ecfr(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ecfr_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ecfr binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ecfr(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("ecfr.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_ecfr(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_ecfr(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_stats_on_empty_database() {
    let (_tmp, config_path) = setup_test_env();

    run_ecfr(&config_path, &["init"]);
    let (stdout, stderr, success) = run_ecfr(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Agencies:     0"));
    assert!(stdout.contains("Metrics:      0"));
    assert!(!stdout.contains("Crawls:"));
}

#[test]
fn test_agencies_list_empty() {
    let (_tmp, config_path) = setup_test_env();

    run_ecfr(&config_path, &["init"]);
    let (stdout, _, success) = run_ecfr(&config_path, &["agencies", "list"]);
    assert!(success);
    assert!(stdout.contains("No agencies stored"));
}

#[test]
fn test_agencies_refresh_unreachable_corpus_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_ecfr(&config_path, &["init"]);
    let (_, _, success) = run_ecfr(&config_path, &["agencies", "refresh"]);
    assert!(!success, "refresh should fail without a reachable corpus");
}

#[test]
fn test_sync_unknown_agency() {
    let (_tmp, config_path) = setup_test_env();

    run_ecfr(&config_path, &["init"]);
    let (_, stderr, success) = run_ecfr(
        &config_path,
        &["sync", "no-such-agency", "--progress", "off"],
    );
    assert!(!success);
    assert!(stderr.contains("Unknown agency"), "stderr: {}", stderr);
}

#[test]
fn test_sync_rejects_bad_date() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_ecfr(
        &config_path,
        &["sync", "environmental-protection-agency", "--since", "2024-13-01"],
    );
    assert!(!success);
    assert!(stderr.contains("--since"), "stderr: {}", stderr);
}

#[test]
fn test_metrics_compute_with_nothing_pending() {
    let (_tmp, config_path) = setup_test_env();

    run_ecfr(&config_path, &["init"]);
    let (stdout, stderr, success) = run_ecfr(&config_path, &["metrics", "compute", "--workers", "4"]);
    assert!(success, "metrics compute failed: {}", stderr);
    assert!(stdout.contains("processed: 0"));
}

#[test]
fn test_metrics_show_unknown_document() {
    let (_tmp, config_path) = setup_test_env();

    run_ecfr(&config_path, &["init"]);
    let (_, stderr, success) = run_ecfr(&config_path, &["metrics", "show", "T99CIP1"]);
    assert!(!success);
    assert!(stderr.contains("No document found"));
}

#[test]
fn test_missing_config_reports_path() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");
    let (_, stderr, success) = run_ecfr(&missing, &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
