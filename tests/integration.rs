use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn taskh_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("taskh");
    path
}

const EXPORT: &str = r#"{
  "projects": [
    { "id": "p1", "name": "Errands", "child_order": 1 },
    { "id": "p2", "name": "Inbox", "inbox_project": true }
  ],
  "tasks": [
    { "id": "t1", "project_id": "p1", "content": "Buy milk", "priority": 2 },
    { "id": "t2", "project_id": "p1", "content": "Call the plumber about the leaking sink",
      "due": { "date": "2026-11-02", "is_recurring": false } },
    { "id": "t3", "project_id": "p2", "content": "Renew passport", "priority": 4,
      "description": "Appointment needed at the consulate" }
  ]
}"#;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    fs::write(data_dir.join("export.json"), EXPORT).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/taskh.sqlite"

[source]
provider = "file"
path = "{root}/data/export.json"

[enrichment]
provider = "hash"
dims = 128

[ingest]
backoff_base_ms = 1
backoff_max_ms = 5

[logging]
level = "warn"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("taskh.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_taskh(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = taskh_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("TASKH_LOG")
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run taskh binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn export_path(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .and_then(Path::parent)
        .unwrap()
        .join("data/export.json")
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success1) = run_taskh(&config_path, &["init"]);
    assert!(success1, "First init failed");
    assert!(stdout.contains("initialized"));

    let (_, _, success2) = run_taskh(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_sync_then_resync_skips_everything() {
    let (_tmp, config_path) = setup_test_env();
    run_taskh(&config_path, &["init"]);

    let (stdout, stderr, success) = run_taskh(&config_path, &["sync", "--progress", "none"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("fetched: 3 tasks"));
    assert!(stdout.contains("processed: 3"));
    assert!(stdout.contains("ok"));

    let (stdout, _, success) = run_taskh(&config_path, &["sync", "--progress", "none"]);
    assert!(success);
    assert!(stdout.contains("processed: 0"));
    assert!(stdout.contains("skipped: 3"));
}

#[test]
fn test_removed_task_is_deleted_on_next_sync() {
    let (_tmp, config_path) = setup_test_env();
    run_taskh(&config_path, &["init"]);
    run_taskh(&config_path, &["sync", "--progress", "none"]);

    let export = export_path(&config_path);
    let mut json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&export).unwrap()).unwrap();
    json["tasks"].as_array_mut().unwrap().retain(|t| t["id"] != "t2");
    fs::write(&export, json.to_string()).unwrap();

    let (stdout, stderr, success) = run_taskh(&config_path, &["sync", "--progress", "none"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("deleted: 1"));
    assert!(stdout.contains("skipped: 2"));
}

#[test]
fn test_dry_run_writes_nothing() {
    let (_tmp, config_path) = setup_test_env();
    run_taskh(&config_path, &["init"]);

    let (stdout, _, success) = run_taskh(&config_path, &["sync", "--dry-run"]);
    assert!(success);
    assert!(stdout.contains("would process: 3"));

    let (stdout, _, _) = run_taskh(&config_path, &["status"]);
    assert!(stdout.contains("Tasks:       0"));
}

#[test]
fn test_search_finds_synced_task() {
    let (_tmp, config_path) = setup_test_env();
    run_taskh(&config_path, &["init"]);
    run_taskh(&config_path, &["sync", "--progress", "none"]);

    let (stdout, stderr, success) =
        run_taskh(&config_path, &["search", "renew passport", "--limit", "1"]);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("task: t3"));
}

#[test]
fn test_status_reports_counts() {
    let (_tmp, config_path) = setup_test_env();
    run_taskh(&config_path, &["init"]);
    run_taskh(&config_path, &["sync", "--progress", "none"]);

    let (stdout, _, success) = run_taskh(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("Projects:    2"));
    assert!(stdout.contains("Tasks:       3"));
    assert!(stdout.contains("Vectors:     3"));
}

#[test]
fn test_sync_with_unreadable_source_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_taskh(&config_path, &["init"]);
    fs::remove_file(export_path(&config_path)).unwrap();

    let (stdout, _, success) = run_taskh(&config_path, &["sync", "--progress", "none"]);
    assert!(!success);
    assert!(stdout.contains("failed"));
}
