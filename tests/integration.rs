use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kb_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("kb");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let docs_dir = root.join("docs");
    fs::create_dir_all(docs_dir.join("it")).unwrap();
    fs::write(
        docs_dir.join("handbook.md"),
        "# Employee Handbook\n\n## Overtime\n\nOvertime is paid at 1.5x after 40 hours per week.\n\n## Holidays\n\nThe office closes for ten public holidays each year.",
    )
    .unwrap();
    fs::write(
        docs_dir.join("it/laptops.md"),
        "# Laptops\n\nRequest a replacement laptop through the IT portal.\n\nDevices are refreshed every three years.",
    )
    .unwrap();
    fs::write(docs_dir.join("notes.txt"), "Not markdown, never ingested.").unwrap();

    let config_content = format!(
        r#"[store]
path = "{root}/data/kb.sqlite"

[documents]
root = "{root}/docs"

[chunking]
max_chars = 800
overlap_chars = 80

[embedding]
provider = "hash"
model = "hash"
dims = 512
retry_base_ms = 1

[generation]
provider = "extractive"
model = "extractive-test"

[retrieval]
top_k = 3
max_context_chars = 2000

[server]
bind = "127.0.0.1:7390"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("kb.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kb_output(config_path: &Path, args: &[&str]) -> std::process::Output {
    let binary = kb_binary();
    Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kb binary at {:?}: {}", binary, e))
}

fn run_kb(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = run_kb_output(config_path, args);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_store() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kb(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/kb.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_kb(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_kb(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_then_unchanged() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kb(&config_path, &["ingest"]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("documents seen: 2"), "{}", stdout);
    assert!(stdout.contains("ingested: 2"), "{}", stdout);
    assert!(stdout.contains("ok"));

    let (stdout, _, success) = run_kb(&config_path, &["ingest"]);
    assert!(success);
    assert!(stdout.contains("unchanged: 2"), "{}", stdout);
    assert!(stdout.contains("chunks written: 0"), "{}", stdout);
}

#[test]
fn test_ingest_dry_run() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_kb(&config_path, &["ingest", "--dry-run"]);
    assert!(success);
    assert!(stdout.contains("items found: 2"), "{}", stdout);
    assert!(stdout.contains("estimated chunks: 3"), "{}", stdout);
    assert!(!tmp.path().join("data/kb.sqlite").exists());
}

#[test]
fn test_dry_run_reports_broken_document() {
    let (tmp, config_path) = setup_test_env();
    fs::write(
        tmp.path().join("docs/broken.md"),
        "# Broken\n\n```rust\nfn main() {}\n",
    )
    .unwrap();

    let output = run_kb_output(&config_path, &["ingest", "--dry-run"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(2), "{}", stdout);
    assert!(stdout.contains("items found: 3"), "{}", stdout);
    assert!(stdout.contains("estimated chunks: 3"), "{}", stdout);
    assert!(stdout.contains("failed items: 1"), "{}", stdout);
    assert!(stdout.contains("broken.md"));
}

#[test]
fn test_partial_ingest_exit_code() {
    let (tmp, config_path) = setup_test_env();
    fs::write(
        tmp.path().join("docs/broken.md"),
        "# Broken\n\n```\nthis fence never closes",
    )
    .unwrap();

    let output = run_kb_output(&config_path, &["ingest"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(2), "{}", stdout);
    assert!(stdout.contains("failed items: 1"), "{}", stdout);
    assert!(stdout.contains("broken.md"));
}

#[test]
fn test_missing_docs_dir_is_fatal() {
    let (tmp, config_path) = setup_test_env();
    let missing = tmp.path().join("nope");

    let output = run_kb_output(
        &config_path,
        &["ingest", "--docs-dir", missing.to_str().unwrap()],
    );
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"), "{}", stderr);
}

#[test]
fn test_query_answers_from_context() {
    let (tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["ingest"]);

    let out_file = tmp.path().join("answer.json");
    let (stdout, stderr, success) = run_kb(
        &config_path,
        &[
            "query",
            "How is overtime paid?",
            "--show-context",
            "--output",
            out_file.to_str().unwrap(),
        ],
    );
    assert!(success, "query failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("1.5x"), "{}", stdout);
    assert!(stdout.contains("handbook.md | Employee Handbook > Overtime"), "{}", stdout);

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&out_file).unwrap()).unwrap();
    assert_eq!(json["query"], "How is overtime paid?");
    assert_eq!(json["model_used"], "extractive-test");
    assert_eq!(json["context"][0]["source"], "handbook.md");
}

#[test]
fn test_query_empty_store() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);

    let (stdout, _, success) = run_kb(&config_path, &["query", "anything at all"]);
    assert!(success);
    assert!(stdout.contains("I don't have enough information"), "{}", stdout);
}

#[test]
fn test_search_with_source_filter() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["ingest"]);

    let (stdout, _, success) = run_kb(
        &config_path,
        &["search", "replacement laptop", "--source", "it/laptops.md"],
    );
    assert!(success);
    assert!(stdout.starts_with("1. ["), "{}", stdout);
    assert!(stdout.contains("it/laptops.md | Laptops"));
    assert!(!stdout.contains("handbook.md"));
}

#[test]
fn test_deleted_document_is_pruned() {
    let (tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["ingest"]);
    fs::remove_file(tmp.path().join("docs/it/laptops.md")).unwrap();

    let (stdout, _, success) = run_kb(&config_path, &["ingest"]);
    assert!(success);
    assert!(stdout.contains("removed: 1"), "{}", stdout);

    let (stdout, _, _) = run_kb(&config_path, &["search", "laptop"]);
    assert!(!stdout.contains("laptops.md"), "{}", stdout);
}

#[test]
fn test_stats_after_ingest() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["ingest"]);

    let (stdout, stderr, success) = run_kb(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Documents:   2"), "{}", stdout);
    assert!(stdout.contains("Chunks:      3"), "{}", stdout);
    assert!(stdout.contains("hash-512 (512 dims)"), "{}", stdout);
    assert!(stdout.contains("Last ingest:"));
}

#[test]
fn test_switching_embedder_requires_rebuild() {
    let (tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["ingest"]);

    let content = fs::read_to_string(&config_path)
        .unwrap()
        .replace("dims = 512", "dims = 256");
    fs::write(&config_path, content).unwrap();

    let output = run_kb_output(&config_path, &["ingest"]);
    assert_eq!(output.status.code(), Some(1));

    let (stdout, _, success) = run_kb(&config_path, &["ingest", "--rebuild"]);
    assert!(success, "{}", stdout);
    assert!(stdout.contains("ingested: 2"));
    assert!(tmp.path().join("data/kb.sqlite").exists());
}
