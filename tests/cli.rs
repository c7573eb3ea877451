use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::json;
use tempfile::TempDir;

fn recall_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_recall"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let feeds_dir = root.join("feeds");
    fs::create_dir_all(&feeds_dir).unwrap();

    let feed = json!({ "data": [
        {
            "id": "R-1",
            "published": "2024-01-10",
            "product": "Rock 'n Play Sleeper",
            "brand": "Fisher-Price",
            "model": "CHP39",
            "barcodes": ["0-12345-67890-5"],
            "hazard": "Infant fatalities reported after babies rolled over",
            "risk": "Serious"
        },
        {
            "id": "R-2",
            "published": "2024-02-20",
            "product": "Electric Kettle",
            "brand": "Brewco",
            "model": "K-200",
            "barcodes": ["5012345678900"],
            "hazard": "Kettle can overheat and cause a fire",
            "risk": "High"
        },
        {
            "id": "R-3",
            "published": "2024-03-15",
            "product": "Toy Car",
            "brand": "Playco",
            "barcodes": [],
            "hazard": "Small parts present a choking hazard",
            "risk": "Medium"
        }
    ]});
    fs::write(feeds_dir.join("opss.json"), feed.to_string()).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/recall.sqlite"

[server]
bind = "127.0.0.1:7341"

[agencies.UK_OPSS]
kind = "json"
url = "file://{root}/feeds/opss.json"
records_path = "data"
max_staleness_hours = 24

[agencies.UK_OPSS.fields]
native_id = "id"
recall_date = "published"
product_name = "product"
brand = "brand"
model_number = "model"
identifiers = ["barcodes"]
hazard = "hazard"
severity = "risk"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("recall.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_recall(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = recall_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run recall binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn synced_env() -> (TempDir, PathBuf) {
    let (tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_recall(&config_path, &["sync", "UK_OPSS"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    (tmp, config_path)
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success1) = run_recall(&config_path, &["init"]);
    assert!(success1, "First init failed");
    assert!(stdout.contains("initialized"));

    let (_, _, success2) = run_recall(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_agencies_lists_configured_feeds() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, _, success) = run_recall(&config_path, &["agencies"]);
    assert!(success);
    assert!(stdout.contains("UK_OPSS"));
    assert!(stdout.contains("json"));
    assert!(stdout.contains("UK Office for Product Safety and Standards"));

    let (catalogue, _, success) = run_recall(&config_path, &["agencies", "--catalogue"]);
    assert!(success);
    assert!(catalogue.contains("*UK_OPSS"));
    assert!(catalogue.contains("CPSC"));
}

#[test]
fn test_sync_reports_counts() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_recall(&config_path, &["sync", "UK_OPSS"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("sync UK_OPSS"));
    assert!(stdout.contains("fetched: 3 records"));
    assert!(stdout.contains("upserted: 3"));
    assert!(stdout.contains("watermark: 2024-03-15"));
    assert!(stdout.contains("completed"));
}

#[test]
fn test_sync_resumes_from_watermark() {
    let (_tmp, config_path) = synced_env();

    // The newest day is fetched again; it is absorbed as an unchanged upsert.
    let (stdout, _, success) = run_recall(&config_path, &["sync", "UK_OPSS"]);
    assert!(success);
    assert!(stdout.contains("fetched: 1 records"), "stdout={}", stdout);
    assert!(stdout.contains("upserted: 1"), "stdout={}", stdout);
    assert!(stdout.contains("watermark: 2024-03-15"), "stdout={}", stdout);

    let (stdout, _, success) = run_recall(&config_path, &["sync", "all", "--full"]);
    assert!(success);
    assert!(stdout.contains("upserted: 3"));

    let (stats, _, _) = run_recall(&config_path, &["stats"]);
    assert!(stats.contains("Recalls:      3"), "stats={}", stats);
}

#[test]
fn test_sync_unknown_agency_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_recall(&config_path, &["sync", "NOPE"]);
    assert!(!success);
    assert!(stderr.contains("NOPE"));

    let (_, stderr, success) =
        run_recall(&config_path, &["sync", "UK_OPSS", "--full", "--since", "2024-01-01"]);
    assert!(!success);
    assert!(stderr.contains("cannot be combined"));
}

#[test]
fn test_lookup_exact_barcode() {
    let (_tmp, config_path) = synced_env();

    let (stdout, _, success) = run_recall(&config_path, &["lookup", "012345678905"]);
    assert!(success);
    assert!(stdout.contains("1 recall(s) carry"));
    assert!(stdout.contains("UK_OPSS:R-1"));

    // EAN-13 spelling of the same UPC-A.
    let (stdout, _, _) = run_recall(&config_path, &["lookup", "0012345678905"]);
    assert!(stdout.contains("UK_OPSS:R-1"));

    let (stdout, _, success) = run_recall(&config_path, &["lookup", "4006381333931"]);
    assert!(success);
    assert!(stdout.contains("No exact match."));

    let (_, stderr, success) = run_recall(&config_path, &["lookup", "not-a-code"]);
    assert!(!success);
    assert!(stderr.contains("invalid query"));
}

#[test]
fn test_similar_and_text_search() {
    let (_tmp, config_path) = synced_env();

    let (stdout, stderr, success) = run_recall(
        &config_path,
        &["similar", "--brand", "Fisher Price", "--name", "Rock n Play"],
    );
    assert!(success, "similar failed: {}", stderr);
    assert!(stdout.contains("UK_OPSS:R-1"));
    assert!(!stdout.contains("UK_OPSS:R-2"));

    let (stdout, _, success) = run_recall(&config_path, &["search", "overheat"]);
    assert!(success);
    assert!(stdout.contains("UK_OPSS:R-2"));

    let (stdout, _, success) = run_recall(
        &config_path,
        &["search", "overheat", "--from", "2024-03-01"],
    );
    assert!(success);
    assert!(stdout.contains("No results."));

    let (_, _, success) = run_recall(&config_path, &["similar"]);
    assert!(!success, "a query with no fields is rejected");
}

#[test]
fn test_get_and_run_management() {
    let (_tmp, config_path) = synced_env();

    let (stdout, _, success) = run_recall(&config_path, &["get", "UK_OPSS:R-2"]);
    assert!(success);
    assert!(stdout.contains("--- Recall ---"));
    assert!(stdout.contains("Brewco"));
    assert!(stdout.contains("region:       GB"));
    assert!(stdout.contains("severity:     HIGH"));

    let (_, _, success) = run_recall(&config_path, &["get", "UK_OPSS:missing"]);
    assert!(!success);

    let (stdout, _, success) = run_recall(&config_path, &["runs"]);
    assert!(success);
    assert!(stdout.contains("COMPLETED"));

    let (stdout, _, success) = run_recall(&config_path, &["freshness"]);
    assert!(success);
    assert!(stdout.contains("UK_OPSS"));
    assert!(stdout.contains(" no "));

    let (stdout, _, success) = run_recall(&config_path, &["recover"]);
    assert!(success);
    assert!(stdout.contains("No orphaned runs."));
}
