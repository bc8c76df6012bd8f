use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn dms_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("dms-search");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("sub")).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.",
    )
    .unwrap();
    fs::write(
        files_dir.join("sub").join("gamma.txt"),
        "Gamma plain text file.\n\nKubernetes and Docker deployment notes.",
    )
    .unwrap();
    fs::write(
        files_dir.join("note.eml"),
        "From: carol@example.com\nTo: alice@example.com\nSubject: Budget review\n\nThe quarterly budget is attached.\n",
    )
    .unwrap();
    fs::write(files_dir.join(".hidden"), "never imported").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/dms.sqlite"

[search]
strategy = "am_limited"

[indexer]
rebuild_on_startup = false

[server]
bind = "127.0.0.1:7341"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("dms.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_dms(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = dms_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run dms-search binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn files_dir(config_path: &Path) -> String {
    config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("files")
        .to_string_lossy()
        .to_string()
}

fn import_as_alice(config_path: &Path) {
    let (_, _, ok) = run_dms(config_path, &["init"]);
    assert!(ok, "init failed");
    let dir = files_dir(config_path);
    let (stdout, stderr, ok) = run_dms(
        config_path,
        &["import", &dir, "--as", "alice", "--role", "ROLE_USER"],
    );
    assert!(ok, "import failed: stdout={}, stderr={}", stdout, stderr);
}

/// First result uuid of a JSON search.
fn first_uuid(config_path: &Path, expression: &str) -> String {
    let (stdout, stderr, ok) = run_dms(config_path, &["search", expression, "--json"]);
    assert!(ok, "search failed: {}", stderr);
    let page: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    page["results"][0]["node"]["uuid"]
        .as_str()
        .unwrap_or_else(|| panic!("no results for {}: {}", expression, stdout))
        .to_string()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dms(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_dms(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_dms(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_import_counts_nodes() {
    let (_tmp, config_path) = setup_test_env();
    run_dms(&config_path, &["init"]);

    let dir = files_dir(&config_path);
    let (stdout, stderr, success) = run_dms(&config_path, &["import", &dir, "--as", "alice"]);
    assert!(success, "import failed: stdout={}, stderr={}", stdout, stderr);
    assert!(
        stdout.contains("Imported 2 folders, 3 documents, 1 mails (0 unchanged, 0 failed)"),
        "unexpected: {}",
        stdout
    );
}

#[test]
fn test_reimport_skips_unchanged() {
    let (_tmp, config_path) = setup_test_env();
    import_as_alice(&config_path);

    let dir = files_dir(&config_path);
    let (stdout, _, success) = run_dms(&config_path, &["import", &dir, "--as", "alice"]);
    assert!(success);
    assert!(
        stdout.contains("Imported 0 folders, 0 documents, 0 mails (4 unchanged, 0 failed)"),
        "unexpected: {}",
        stdout
    );
}

#[test]
fn test_search_owner_sees_document() {
    let (_tmp, config_path) = setup_test_env();
    import_as_alice(&config_path);

    let (stdout, stderr, success) = run_dms(&config_path, &["search", "cargo", "--as", "alice"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("document / alpha"), "unexpected: {}", stdout);
    assert!(!stdout.contains("beta"));
}

#[test]
fn test_search_filters_unreadable() {
    let (_tmp, config_path) = setup_test_env();
    import_as_alice(&config_path);

    let (stdout, _, success) = run_dms(&config_path, &["search", "cargo", "--as", "bob"]);
    assert!(success);
    assert!(stdout.contains("No results."), "bob should see nothing: {}", stdout);

    let (stdout, _, success) = run_dms(
        &config_path,
        &["search", "cargo", "--as", "bob", "--role", "ROLE_USER"],
    );
    assert!(success);
    assert!(stdout.contains("alpha"), "role grants read: {}", stdout);
}

#[test]
fn test_search_mail_subject() {
    let (_tmp, config_path) = setup_test_env();
    import_as_alice(&config_path);

    let (stdout, _, success) = run_dms(&config_path, &["search", "subject:budget", "--as", "alice"]);
    assert!(success);
    assert!(stdout.contains("mail / Budget review"), "unexpected: {}", stdout);
}

#[test]
fn test_search_json_page() {
    let (_tmp, config_path) = setup_test_env();
    import_as_alice(&config_path);

    let (stdout, _, success) = run_dms(
        &config_path,
        &["search", "document", "--json", "--strategy", "am_more", "--limit", "1"],
    );
    assert!(success);
    let page: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(page["results"].as_array().unwrap().len(), 1);
    assert_eq!(page["total"].as_u64(), Some(2));
    assert_eq!(page["results"][0]["type"], "document");
}

#[test]
fn test_search_rejects_fuzzy_syntax() {
    let (_tmp, config_path) = setup_test_env();
    import_as_alice(&config_path);

    let (_, stderr, success) = run_dms(&config_path, &["search", "cargo~2"]);
    assert!(!success);
    assert!(stderr.contains("parse failure"), "stderr: {}", stderr);
}

#[test]
fn test_reindex_rebuilds_everything() {
    let (_tmp, config_path) = setup_test_env();
    import_as_alice(&config_path);

    let (stdout, stderr, success) = run_dms(&config_path, &["reindex"]);
    assert!(success, "reindex failed: {}", stderr);
    assert!(stdout.contains("Indexed 6 of 6 nodes"), "unexpected: {}", stdout);

    let (stdout, _, _) = run_dms(&config_path, &["search", "kubernetes", "--as", "alice"]);
    assert!(stdout.contains("gamma"));
}

#[test]
fn test_reindex_single_kind() {
    let (_tmp, config_path) = setup_test_env();
    import_as_alice(&config_path);

    let (stdout, _, success) = run_dms(&config_path, &["reindex", "--kind", "mail"]);
    assert!(success);
    assert!(stdout.contains("Indexed 1 of 1 nodes"), "unexpected: {}", stdout);
}

#[test]
fn test_terms_and_index_show() {
    let (_tmp, config_path) = setup_test_env();
    import_as_alice(&config_path);
    let uuid = first_uuid(&config_path, "cargo");

    let (stdout, _, success) = run_dms(&config_path, &["terms", "document", &uuid]);
    assert!(success);
    let terms: Vec<&str> = stdout.lines().collect();
    assert!(terms.contains(&"cargo"));
    assert!(terms.contains(&"rust"));

    let (stdout, _, success) = run_dms(&config_path, &["index", "show", &uuid]);
    assert!(success);
    assert!(stdout.contains(&uuid));
    assert!(stdout.contains("alpha.md"));
}

#[test]
fn test_index_search_and_stats() {
    let (_tmp, config_path) = setup_test_env();
    import_as_alice(&config_path);

    let (stdout, _, success) = run_dms(&config_path, &["index", "search", "python"]);
    assert!(success);
    assert!(stdout.contains("beta.md"));

    let (stdout, _, success) = run_dms(&config_path, &["index", "search", "python", "--as", "bob"]);
    assert!(success);
    assert!(stdout.contains("No hits."));

    let (stdout, _, success) = run_dms(&config_path, &["index", "stats"]);
    assert!(success);
    assert!(stdout.contains("document"));
    assert!(stdout.contains("folder"));
}

#[test]
fn test_suggest_build_and_query() {
    let (_tmp, config_path) = setup_test_env();
    import_as_alice(&config_path);

    let (stdout, _, success) = run_dms(&config_path, &["suggest", "build"]);
    assert!(success);
    assert!(stdout.contains("Suggestion index rebuilt"));

    let (stdout, _, success) = run_dms(&config_path, &["suggest", "query", "car"]);
    assert!(success);
    assert!(stdout.lines().any(|l| l == "cargo"), "unexpected: {}", stdout);
}

#[test]
fn test_delete_removes_from_results() {
    let (_tmp, config_path) = setup_test_env();
    import_as_alice(&config_path);
    let uuid = first_uuid(&config_path, "cargo");

    let (stdout, stderr, success) = run_dms(&config_path, &["delete", &uuid]);
    assert!(success, "delete failed: {}", stderr);
    assert!(stdout.contains("Deleted"));

    let (stdout, _, _) = run_dms(&config_path, &["search", "cargo"]);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_perms_purge_user_updates_index() {
    let (_tmp, config_path) = setup_test_env();
    import_as_alice(&config_path);

    let (stdout, _, success) = run_dms(&config_path, &["perms", "list"]);
    assert!(success);
    assert!(stdout.lines().any(|l| l == "user\talice"), "unexpected: {}", stdout);
    assert!(stdout.lines().any(|l| l == "role\tROLE_USER"), "unexpected: {}", stdout);

    let (stdout, _, _) = run_dms(&config_path, &["index", "search", "python", "--as", "alice"]);
    assert!(stdout.contains("beta.md"));

    let (stdout, stderr, success) = run_dms(&config_path, &["perms", "purge", "--user", "alice"]);
    assert!(success, "purge failed: {}", stderr);
    assert!(stdout.contains("Purged alice"), "unexpected: {}", stdout);

    let (stdout, _, _) = run_dms(&config_path, &["index", "search", "python", "--as", "alice"]);
    assert!(stdout.contains("No hits."), "index still grants alice: {}", stdout);
    let (stdout, _, _) = run_dms(&config_path, &["search", "cargo", "--as", "alice"]);
    assert!(stdout.contains("No results."));
    let (stdout, _, _) = run_dms(
        &config_path,
        &["search", "cargo", "--as", "alice", "--role", "ROLE_USER"],
    );
    assert!(stdout.contains("alpha"), "role grant survives: {}", stdout);

    let (stdout, _, _) = run_dms(&config_path, &["perms", "list"]);
    assert!(!stdout.contains("alice"));
}

#[test]
fn test_perms_purge_needs_one_subject() {
    let (_tmp, config_path) = setup_test_env();
    run_dms(&config_path, &["init"]);

    let (_, _, success) = run_dms(&config_path, &["perms", "purge"]);
    assert!(!success);
    let (_, _, success) = run_dms(
        &config_path,
        &["perms", "purge", "--user", "alice", "--role", "ROLE_USER"],
    );
    assert!(!success);
}

#[test]
fn test_read_only_refuses_import() {
    let (_tmp, config_path) = setup_test_env();
    let mut cfg = fs::read_to_string(&config_path).unwrap();
    cfg.push_str("\n[maintenance]\nread_only = true\n");
    fs::write(&config_path, cfg).unwrap();

    run_dms(&config_path, &["init"]);
    let dir = files_dir(&config_path);
    let (_, stderr, success) = run_dms(&config_path, &["import", &dir]);
    assert!(!success);
    assert!(stderr.contains("read-only"));
}

#[test]
fn test_extract_plain_text() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("readme.txt");
    fs::write(&file, "plain words here").unwrap();

    let output = Command::new(dms_binary())
        .arg("extract")
        .arg(&file)
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("plain words here"));
}

#[test]
fn test_extract_unsupported_type_fails() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("blob.bin");
    fs::write(&file, [0u8, 159, 146, 150]).unwrap();

    let output = Command::new(dms_binary())
        .arg("extract")
        .arg(&file)
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_invalid_config_rejected() {
    let (_tmp, config_path) = setup_test_env();
    let mut cfg = fs::read_to_string(&config_path).unwrap();
    cfg = cfg.replace("[indexer]\n", "[indexer]\nbatch_size = 0\n");
    fs::write(&config_path, cfg).unwrap();

    let (_, stderr, success) = run_dms(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("batch_size"));
}
