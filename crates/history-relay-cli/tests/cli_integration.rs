use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_hr<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_hr"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute hr binary: {err}"))
}

fn parse_stdout(output: &Output) -> Value {
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "hr command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let value = parse_stdout(&run_hr(args));
    assert_eq!(value["contract_version"], "cli.v1");
    value
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn record_json(id_seed: &str, category: u16, created_at: i64) -> String {
    serde_json::json!({
        "id": id_seed.repeat(32),
        "identity": "bb".repeat(32),
        "category": category,
        "created_at": created_at,
        "tags": [["e", "cafe"]],
        "content": "cli fixture",
    })
    .to_string()
}

fn write_record(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body)
        .unwrap_or_else(|err| panic!("failed to write record file {}: {err}", path.display()));
    path
}

fn admit_status(db: &Path, record: &Path) -> Value {
    run_json(["--db", path_str(db), "admit", "--file", path_str(record)])["outcome"].clone()
}

// Test IDs: TCLI-001
#[test]
fn cli_schema_version_and_migrate_lifecycle() {
    let dir = unique_temp_dir("hr-cli-migrate");
    let db = dir.join("relay.sqlite3");

    let status = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(status["current_version"], 0);
    assert_eq!(status["pending_versions"], serde_json::json!([1]));
    assert_eq!(status["up_to_date"], false);

    let planned = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(planned["dry_run"], true);
    assert_eq!(planned["would_apply_versions"], serde_json::json!([1]));

    let applied = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(applied["after_version"], 1);
    assert_eq!(applied["up_to_date"], true);

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert_eq!(integrity["quick_check_ok"], true);
    assert_eq!(integrity["oversized_buckets"], serde_json::json!([]));

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-002
#[test]
fn cli_admit_reports_outcomes_for_files_and_stdin() {
    let dir = unique_temp_dir("hr-cli-admit");
    let db = dir.join("relay.sqlite3");
    let first = write_record(&dir, "first.json", &record_json("01", 0, 100));
    let wrong_category = write_record(&dir, "kind1.json", &record_json("02", 1, 100));
    let malformed = write_record(&dir, "broken.json", "{\"id\": 7");

    assert_eq!(admit_status(&db, &first)["status"], "admitted");
    let duplicate = admit_status(&db, &first);
    assert_eq!(duplicate["status"], "rejected");
    assert_eq!(duplicate["reason"], "duplicate");
    assert_eq!(admit_status(&db, &wrong_category)["reason"], "category_not_accepted");
    assert_eq!(admit_status(&db, &malformed)["reason"], "invalid");

    let mut child = Command::new(env!("CARGO_BIN_EXE_hr"))
        .args(["--db", path_str(&db), "admit", "--file", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|err| panic!("failed to spawn hr binary: {err}"));
    child
        .stdin
        .take()
        .unwrap_or_else(|| panic!("stdin should be piped"))
        .write_all(record_json("03", 3, 200).as_bytes())
        .unwrap_or_else(|err| panic!("failed to write record to stdin: {err}"));
    let output =
        child.wait_with_output().unwrap_or_else(|err| panic!("failed to wait for hr: {err}"));
    assert_eq!(parse_stdout(&output)["outcome"]["status"], "admitted");

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-003
#[test]
fn cli_query_prints_records_and_scan_stats() {
    let dir = unique_temp_dir("hr-cli-query");
    let db = dir.join("relay.sqlite3");
    for (seed, category, created_at) in [("01", 0, 100), ("02", 3, 200), ("03", 3, 300)] {
        let record =
            write_record(&dir, &format!("{seed}.json"), &record_json(seed, category, created_at));
        assert_eq!(admit_status(&db, &record)["status"], "admitted");
    }

    let result = run_json([
        "--db",
        path_str(&db),
        "query",
        "--filter",
        r#"{"categories": [3], "since": 150}"#,
    ]);
    let records = result["records"]
        .as_array()
        .unwrap_or_else(|| panic!("records should be an array: {result}"));
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|record| record["category"] == 3));
    assert_eq!(result["stats"]["yielded"], 2);
    assert_eq!(result["stats"]["stop_reason"], "exhausted");

    let limited = run_json(["--db", path_str(&db), "query", "--filter", r#"{"limit": 1}"#]);
    assert_eq!(limited["records"].as_array().map(Vec::len), Some(1));
    assert_eq!(limited["stats"]["stop_reason"], "result_cap");

    let unaccepted =
        run_json(["--db", path_str(&db), "query", "--filter", r#"{"categories": [1]}"#]);
    assert_eq!(unaccepted["records"], serde_json::json!([]));
    assert_eq!(unaccepted["stats"]["scanned"], 0);

    let bad_filter = run_hr(["--db", path_str(&db), "query", "--filter", r#"{"kinds": [0]}"#]);
    assert!(!bad_filter.status.success());

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-004
#[test]
fn cli_config_file_controls_retention() {
    let dir = unique_temp_dir("hr-cli-config");
    let db = dir.join("relay.sqlite3");
    let config = dir.join("relay.yaml");
    fs::write(&config, "retention_per_bucket: 1\naccepted_categories: [0, 3, 7]\n")
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));
    let base = ["--db", path_str(&db), "--config", path_str(&config)];

    let older = write_record(&dir, "older.json", &record_json("01", 7, 100));
    let newer = write_record(&dir, "newer.json", &record_json("02", 7, 200));
    let stale = write_record(&dir, "stale.json", &record_json("03", 7, 50));

    for (record, expected) in [(&older, "admitted"), (&newer, "admitted"), (&stale, "rejected")] {
        let value = run_json(base.iter().copied().chain(["admit", "--file", path_str(record)]));
        assert_eq!(value["outcome"]["status"], expected);
    }

    let buckets = run_json(base.iter().copied().chain(["buckets"]));
    assert_eq!(buckets["buckets"].as_array().map(Vec::len), Some(1));
    assert_eq!(buckets["buckets"][0]["records"], 1);
    assert_eq!(buckets["buckets"][0]["newest_created_at"], 200);

    let bad_config = dir.join("bad.yaml");
    fs::write(&bad_config, "result_cap: 0\n")
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));
    let rejected = run_hr(["--db", path_str(&db), "--config", path_str(&bad_config), "buckets"]);
    assert!(!rejected.status.success());

    let _ = fs::remove_dir_all(&dir);
}
