use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn wm_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("wm");
    path
}

fn setup_test_env(diff_url: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Three captures of one page
    let captures = root.join("captures");
    fs::create_dir_all(&captures).unwrap();
    fs::write(
        captures.join("2017-01-19.html"),
        "<html><body><h1>Climate Change</h1><p>Climate change is happening.</p></body></html>",
    )
    .unwrap();
    fs::write(
        captures.join("2017-01-20.html"),
        "<html><body><h1>Climate Change</h1><p>This page is being updated.</p></body></html>",
    )
    .unwrap();
    fs::write(
        captures.join("2017-01-21.html"),
        "<html><body><h1>Climate</h1><p>This page is being updated.</p></body></html>",
    )
    .unwrap();
    fs::write(captures.join("empty.html"), "").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/wm.sqlite"

[storage]
payload_dir = "{root}/data/diffs"

[diff_service]
url = "{diff_url}"
max_attempts = 2
backoff_base_ms = 1
backoff_max_ms = 5
timeout_secs = 5

[pipeline]
workers = 2

[triage]
scorer = "change_size"
"#,
        root = root.display(),
        diff_url = diff_url,
    );

    let config_path = config_dir.join("wm.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_wm(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = wm_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run wm binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn capture_path(config_path: &Path, name: &str) -> String {
    let root = config_path.parent().unwrap().parent().unwrap();
    root.join("captures").join(name).display().to_string()
}

fn ingest(config_path: &Path, name: &str, capture_time: &str) -> (String, String, bool) {
    let file = capture_path(config_path, name);
    run_wm(
        config_path,
        &[
            "ingest",
            &file,
            "--url",
            "https://www.epa.gov/climatechange",
            "--title",
            "Climate Change",
            "--agency",
            "EPA",
            "--site",
            "epa.gov",
            "--capture-time",
            capture_time,
            "--source-type",
            "versionista",
        ],
    )
}

fn ingest_all(config_path: &Path) {
    for (name, time) in [
        ("2017-01-19.html", "2017-01-19T12:00:00Z"),
        ("2017-01-20.html", "2017-01-20T12:00:00Z"),
        ("2017-01-21.html", "2017-01-21T12:00:00Z"),
    ] {
        let (stdout, stderr, success) = ingest(config_path, name, time);
        assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    }
}

fn stats(config_path: &Path) -> Value {
    let (stdout, stderr, success) = run_wm(config_path, &["stats", "--json"]);
    assert!(success, "stats failed: {}", stderr);
    serde_json::from_str(&stdout).unwrap()
}

/// Value of a `  key: value` line in command output.
fn field<'a>(stdout: &'a str, key: &str) -> &'a str {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix(&format!("{}:", key)))
        .map(str::trim)
        .unwrap_or_else(|| panic!("no '{}' in output:\n{}", key, stdout))
}

const UNUSED_SERVICE: &str = "http://127.0.0.1:9/compare";

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env(UNUSED_SERVICE);

    let (stdout, stderr, success) = run_wm(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env(UNUSED_SERVICE);

    let (_, _, success1) = run_wm(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_wm(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_reuses_page() {
    let (_tmp, config_path) = setup_test_env(UNUSED_SERVICE);
    run_wm(&config_path, &["init"]);

    let (first, stderr, success) = ingest(&config_path, "2017-01-19.html", "2017-01-19T12:00:00Z");
    assert!(success, "ingest failed: {}", stderr);
    assert!(first.contains("(new)"));
    assert!(first.contains("ok"));

    let (second, _, success) = ingest(&config_path, "2017-01-20.html", "2017-01-20 12:00:00");
    assert!(success);
    assert!(!second.contains("(new)"));
    let page = |out: &str| field(out, "page").split_whitespace().next().unwrap().to_string();
    assert_eq!(page(&first), page(&second));
    assert_ne!(field(&first, "version"), field(&second, "version"));

    let stats = stats(&config_path);
    assert_eq!(stats["pages"], 1);
    assert_eq!(stats["versions"], 2);
    assert_eq!(stats["unprocessed_versions"], 2);
    assert_eq!(stats["diffs"], 0);
}

#[test]
fn test_ingest_empty_capture_fails() {
    let (_tmp, config_path) = setup_test_env(UNUSED_SERVICE);
    run_wm(&config_path, &["init"]);

    let (_, stderr, success) = ingest(&config_path, "empty.html", "2017-01-19T12:00:00Z");
    assert!(!success);
    assert!(stderr.contains("cannot read capture"), "stderr: {}", stderr);
    assert_eq!(stats(&config_path)["pages"], 0);
}

#[test]
fn test_ingest_bad_capture_time() {
    let (_tmp, config_path) = setup_test_env(UNUSED_SERVICE);
    run_wm(&config_path, &["init"]);

    let (_, stderr, success) = ingest(&config_path, "2017-01-19.html", "last tuesday");
    assert!(!success);
    assert!(stderr.contains("Invalid capture time"), "stderr: {}", stderr);
}

#[test]
fn test_get_page_and_history() {
    let (_tmp, config_path) = setup_test_env(UNUSED_SERVICE);
    run_wm(&config_path, &["init"]);
    ingest_all(&config_path);

    let (stdout, stderr, success) = run_wm(
        &config_path,
        &["get", "page", "https://www.epa.gov/climatechange"],
    );
    assert!(success, "get page failed: {}", stderr);
    assert!(stdout.contains("--- Page ---"));
    assert!(stdout.contains("Climate Change"));
    assert!(stdout.contains("EPA"));

    let (stdout, _, success) = run_wm(
        &config_path,
        &["history", "https://www.epa.gov/climatechange"],
    );
    assert!(success);
    assert!(stdout.contains("(3 versions)"));
    let newest = stdout.find("2017-01-21").unwrap();
    let oldest = stdout.find("2017-01-19").unwrap();
    assert!(newest < oldest, "history should be newest first:\n{}", stdout);
}

#[test]
fn test_get_missing_records() {
    let (_tmp, config_path) = setup_test_env(UNUSED_SERVICE);
    run_wm(&config_path, &["init"]);

    let (_, stderr, success) = run_wm(&config_path, &["get", "page", "https://example.gov/"]);
    assert!(!success);
    assert!(stderr.contains("page not found"), "stderr: {}", stderr);

    let (_, stderr, success) = run_wm(&config_path, &["get", "diff", "not-a-uuid"]);
    assert!(!success);
    assert!(stderr.contains("Invalid diff uuid"), "stderr: {}", stderr);
}

#[test]
fn test_annotate_missing_diff() {
    let (_tmp, config_path) = setup_test_env(UNUSED_SERVICE);
    run_wm(&config_path, &["init"]);

    let (_, stderr, success) = run_wm(
        &config_path,
        &[
            "annotate",
            "00000000-0000-0000-0000-000000000001",
            "--author",
            "ana",
            "--content",
            "cosmetic",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("diff not found"), "stderr: {}", stderr);

    let (_, stderr, success) = run_wm(&config_path, &["annotations"]);
    assert!(!success);
    assert!(stderr.contains("--diff"), "stderr: {}", stderr);
}

#[test]
fn test_empty_queues() {
    let (_tmp, config_path) = setup_test_env(UNUSED_SERVICE);
    run_wm(&config_path, &["init"]);

    let (stdout, _, success) = run_wm(&config_path, &["queue"]);
    assert!(success);
    assert!(stdout.contains("Review queue is empty."));

    let (stdout, _, success) = run_wm(&config_path, &["dead-letters"]);
    assert!(success);
    assert!(stdout.contains("No dead letters."));

    let (stdout, _, success) = run_wm(&config_path, &["triage"]);
    assert!(success);
    assert!(stdout.contains("scored: 0"));
}

#[test]
fn test_unknown_scorer_rejected() {
    let (_tmp, config_path) = setup_test_env(UNUSED_SERVICE);
    let content = fs::read_to_string(&config_path)
        .unwrap()
        .replace("change_size", "oracle");
    fs::write(&config_path, content).unwrap();

    let (_, stderr, success) = run_wm(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Unknown triage scorer"), "stderr: {}", stderr);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_diff_triage_and_annotate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/compare"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "ok",
            "output": {
                "diffs": [[0, "<h1>Climate"], [-1, " Change"], [0, "</h1>"]]
            }
        })))
        .expect(2)
        .mount(&server)
        .await;

    let (_tmp, config_path) = setup_test_env(&format!("{}/compare", server.uri()));
    run_wm(&config_path, &["init"]);
    ingest_all(&config_path);

    let (stdout, stderr, success) = run_wm(&config_path, &["diff"]);
    assert!(success, "diff failed: stdout={}, stderr={}", stdout, stderr);
    assert_eq!(field(&stdout, "created"), "2");
    assert_eq!(field(&stdout, "no ancestor"), "1");
    assert!(stdout.contains("ok"));

    // Nothing left to do on a second pass.
    let (stdout, _, success) = run_wm(&config_path, &["diff"]);
    assert!(success);
    assert_eq!(field(&stdout, "processed"), "0");

    let (stdout, stderr, success) = run_wm(&config_path, &["triage"]);
    assert!(success, "triage failed: {}", stderr);
    assert_eq!(field(&stdout, "scored"), "2");

    let stats = stats(&config_path);
    assert_eq!(stats["diffs"], 2);
    assert_eq!(stats["unprocessed_versions"], 0);
    assert_eq!(stats["unprocessed_diffs"], 0);
    assert_eq!(stats["no_ancestor"], 1);

    let (stdout, _, success) = run_wm(&config_path, &["queue"]);
    assert!(success);
    let diff_id = stdout
        .lines()
        .skip(2)
        .find_map(|line| line.split_whitespace().nth(1))
        .expect("queue lists a diff")
        .to_string();

    let (stdout, stderr, success) = run_wm(
        &config_path,
        &[
            "annotate",
            &diff_id,
            "--author",
            "ana",
            "--content",
            r#"{"significant": true, "note": "heading shortened"}"#,
        ],
    );
    assert!(success, "annotate failed: {}", stderr);
    assert!(stdout.contains("ok"));

    let (stdout, _, success) = run_wm(&config_path, &["annotations", "--diff", &diff_id]);
    assert!(success);
    assert!(stdout.contains("ana"));
    assert!(stdout.contains("heading shortened"));

    let (stdout, stderr, success) =
        run_wm(&config_path, &["get", "diff", &diff_id, "--content"]);
    assert!(success, "get diff failed: {}", stderr);
    assert!(stdout.contains("--- Annotations (1) ---"));
    assert!(stdout.contains("--- Content ---"));
    assert!(stdout.contains("Climate"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_service_requeues_versions() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let (_tmp, config_path) = setup_test_env(&format!("{}/compare", server.uri()));
    run_wm(&config_path, &["init"]);
    ingest_all(&config_path);

    let (stdout, stderr, success) = run_wm(&config_path, &["diff"]);
    assert!(success, "diff failed: stdout={}, stderr={}", stdout, stderr);
    assert_eq!(field(&stdout, "created"), "0");
    assert_eq!(field(&stdout, "requeued"), "2");

    // Default requeue_limit is 3: two more passes dead-letter both.
    run_wm(&config_path, &["diff"]);
    let (stdout, _, _) = run_wm(&config_path, &["diff"]);
    assert_eq!(field(&stdout, "dead-lettered"), "2");

    let (stdout, _, success) = run_wm(&config_path, &["dead-letters"]);
    assert!(success);
    assert!(stdout.contains("502"));

    let (stdout, _, success) = run_wm(&config_path, &["dead-letters", "--requeue"]);
    assert!(success);
    assert!(stdout.contains("requeued 2 version(s)"));
    assert_eq!(stats(&config_path)["unprocessed_versions"], 2);
}
