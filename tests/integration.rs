use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn desk_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("desk");
    path
}

const PAYLOAD: &str = r#"{"summary": "Kickoff recap.", "decisions": ["Ship in Q2"], "actions": [{"title": "Send follow-up deck", "owner": "sarah", "due_date": "2026-02-10"}], "tags": ["acme", "kickoff"]}"#;

/// Write an executable stub enrichment agent.
fn write_agent(root: &Path, name: &str, body: &str) -> PathBuf {
    let path = root.join(name);
    fs::write(&path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let agent = write_agent(
        &root,
        "agent.sh",
        &format!("#!/bin/sh\necho '{}'\n", PAYLOAD),
    );

    let config_content = format!(
        r#"[workspace]
root = "{root}"

[watcher]
poll_interval_ms = 50
quiet_period_ms = 50

[enrich]
command = ["{agent}"]
timeout_secs = 5
max_retries = 1
backoff_secs = 1
concurrency = 2

[[entities]]
name = "Acme"
kind = "account"
domains = ["acme.com"]
"#,
        root = root.display(),
        agent = agent.display(),
    );

    let config_path = root.join("deskflow.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_desk(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = desk_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run desk binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn drop_acme_call(root: &Path) -> PathBuf {
    let inbox = root.join("Inbox");
    let doc = inbox.join("2026-02-03-acme-call.md");
    fs::write(
        &doc,
        "Sarah: thanks for joining\nJim: let's recap the rollout\nSarah: I'll send the deck\n",
    )
    .unwrap();
    fs::write(
        inbox.join("2026-02-03-acme-call.md.meta.json"),
        r#"{"attendees": ["sarah@acme.com", "me@example.com"]}"#,
    )
    .unwrap();
    doc
}

#[test]
fn test_init_creates_workspace() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_desk(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    for dir in ["Inbox", "Projects", "Areas", "Resources", "Archive", "Accounts"] {
        assert!(tmp.path().join(dir).is_dir(), "{} missing", dir);
    }

    // Idempotent.
    let (_, _, success2) = run_desk(&config_path, &["init"]);
    assert!(success2, "second init failed (not idempotent)");
}

#[test]
fn test_acme_call_is_classified_routed_and_delivered() {
    let (tmp, config_path) = setup_test_env();
    run_desk(&config_path, &["init"]);
    let doc = drop_acme_call(tmp.path());

    let (stdout, stderr, success) = run_desk(&config_path, &["process"]);
    assert!(success, "process failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("discovered: 1"));
    assert!(stdout.contains("ok"));

    // Delivered to the canonical destination; staging is empty.
    let delivered = tmp
        .path()
        .join("Accounts/Acme/meetings/2026-02-03-acme-call.md");
    assert!(delivered.is_file(), "expected delivery at {:?}", delivered);
    assert!(!doc.exists(), "original should have left staging");

    // The delivered document carries the enrichment annotation.
    let content = fs::read_to_string(&delivered).unwrap();
    assert!(content.contains("## Summary"));
    assert!(content.contains("Kickoff recap."));
    assert!(content.contains("- [ ] Send follow-up deck"));

    // The working database has the matching action row.
    let (stdout, _, success) = run_desk(&config_path, &["actions", "list"]);
    assert!(success);
    assert!(
        stdout.contains("Accounts/Acme/meetings/2026-02-03-acme-call.md#action-1"),
        "missing source ref in: {}",
        stdout
    );
    assert!(stdout.contains("Send follow-up deck"));
    assert!(stdout.contains("2026-02-10"));
}

#[test]
fn test_idempotent_delivery() {
    let (tmp, config_path) = setup_test_env();
    run_desk(&config_path, &["init"]);
    drop_acme_call(tmp.path());

    run_desk(&config_path, &["process"]);

    // The user re-saves the same content into the holding area.
    drop_acme_call(tmp.path());
    let (stdout, _, success) = run_desk(&config_path, &["process"]);
    assert!(success, "second process failed: {}", stdout);

    // Exactly one delivered file, no suffixed duplicate.
    let meetings = tmp.path().join("Accounts/Acme/meetings");
    let delivered: Vec<_> = fs::read_dir(&meetings)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|x| x == "md").unwrap_or(false))
        .collect();
    assert_eq!(delivered.len(), 1, "duplicate delivery: {:?}", delivered);

    // Exactly one set of actions.
    let (stdout, _, _) = run_desk(&config_path, &["actions", "list"]);
    assert_eq!(stdout.matches("Send follow-up deck").count(), 1);
}

#[test]
fn test_collision_gets_disambiguating_suffix() {
    let (tmp, config_path) = setup_test_env();
    run_desk(&config_path, &["init"]);

    // Two distinct documents that resolve to the same destination name.
    let inbox = tmp.path().join("Inbox");
    fs::create_dir_all(inbox.join("a")).unwrap();
    fs::create_dir_all(inbox.join("b")).unwrap();
    fs::write(
        inbox.join("a/2026-02-03-acme-call.md"),
        "Sarah: first call about acme\n",
    )
    .unwrap();
    fs::write(
        inbox.join("b/2026-02-03-acme-call.md"),
        "Sarah: a different call about acme\n",
    )
    .unwrap();

    let (stdout, stderr, success) = run_desk(&config_path, &["process"]);
    assert!(success, "process failed: stdout={}, stderr={}", stdout, stderr);

    let meetings = tmp.path().join("Accounts/Acme/meetings");
    assert!(meetings.join("2026-02-03-acme-call.md").is_file());
    assert!(
        meetings.join("2026-02-03-acme-call-2.md").is_file(),
        "expected suffixed sibling"
    );
}

#[test]
fn test_enrichment_timeout_parks_document_for_review() {
    let (tmp, config_path) = setup_test_env();

    // Replace the agent with one that never finishes in time, and shrink the
    // timeout so two attempts fit in the test budget.
    let slow = write_agent(tmp.path(), "slow.sh", "#!/bin/sh\nsleep 30\n");
    let config_content = fs::read_to_string(&config_path)
        .unwrap()
        .replace("agent.sh", slow.file_name().unwrap().to_str().unwrap())
        .replace("timeout_secs = 5", "timeout_secs = 1");
    fs::write(&config_path, config_content).unwrap();

    run_desk(&config_path, &["init"]);
    let doc = drop_acme_call(tmp.path());

    let (stdout, _, success) = run_desk(&config_path, &["process"]);
    assert!(success, "process should not error: {}", stdout);
    assert!(stdout.contains("needs review (total): 1"));

    // Original untouched in staging, visible in status with its reason.
    assert!(doc.exists(), "document must stay in staging");
    let (stdout, _, _) = run_desk(&config_path, &["status"]);
    assert!(stdout.contains("needs_review"));
    assert!(stdout.contains("2026-02-03-acme-call.md"));
    assert!(stdout.contains("timed out"));
}

#[test]
fn test_reconcile_document_edit_updates_database() {
    let (tmp, config_path) = setup_test_env();
    run_desk(&config_path, &["init"]);
    drop_acme_call(tmp.path());
    run_desk(&config_path, &["process"]);

    // User ticks the box in the delivered document.
    let delivered = tmp
        .path()
        .join("Accounts/Acme/meetings/2026-02-03-acme-call.md");
    let content = fs::read_to_string(&delivered).unwrap();
    fs::write(
        &delivered,
        content.replace("- [ ] Send follow-up deck", "- [x] Send follow-up deck"),
    )
    .unwrap();

    let (stdout, _, success) = run_desk(&config_path, &["reconcile"]);
    assert!(success);
    assert!(stdout.contains("document -> database: 1"), "got: {}", stdout);

    let (stdout, _, _) = run_desk(&config_path, &["actions", "list", "--status", "completed"]);
    assert!(stdout.contains("Send follow-up deck"));
}

#[test]
fn test_reconcile_database_edit_rewrites_checklist() {
    let (tmp, config_path) = setup_test_env();
    run_desk(&config_path, &["init"]);
    drop_acme_call(tmp.path());
    run_desk(&config_path, &["process"]);

    // Find the action id, complete it from the database side.
    let (stdout, _, _) = run_desk(&config_path, &["actions", "list"]);
    let id = stdout
        .lines()
        .find(|l| l.contains("Send follow-up deck"))
        .and_then(|l| l.split_whitespace().next())
        .unwrap()
        .to_string();
    let (_, _, success) = run_desk(&config_path, &["actions", "complete", &id]);
    assert!(success);

    let (stdout, _, _) = run_desk(&config_path, &["reconcile"]);
    assert!(stdout.contains("database -> document: 1"), "got: {}", stdout);

    let delivered = tmp
        .path()
        .join("Accounts/Acme/meetings/2026-02-03-acme-call.md");
    let content = fs::read_to_string(&delivered).unwrap();
    assert!(
        content.contains("- [x] Send follow-up deck"),
        "checklist not rewritten: {}",
        content
    );
}

#[test]
fn test_deleted_checklist_never_deletes_rows() {
    let (tmp, config_path) = setup_test_env();
    run_desk(&config_path, &["init"]);
    drop_acme_call(tmp.path());
    run_desk(&config_path, &["process"]);

    // User deletes the whole checklist block.
    let delivered = tmp
        .path()
        .join("Accounts/Acme/meetings/2026-02-03-acme-call.md");
    let content = fs::read_to_string(&delivered).unwrap();
    let without_block = content
        .split("<!-- deskflow:actions -->")
        .next()
        .unwrap()
        .to_string();
    fs::write(&delivered, without_block).unwrap();

    let (stdout, _, success) = run_desk(&config_path, &["reconcile"]);
    assert!(success, "reconcile failed: {}", stdout);

    // The database row survives.
    let (stdout, _, _) = run_desk(&config_path, &["actions", "list"]);
    assert!(
        stdout.contains("Send follow-up deck"),
        "action row was deleted: {}",
        stdout
    );
}

#[test]
fn test_hand_written_checklist_line_becomes_action() {
    let (tmp, config_path) = setup_test_env();
    run_desk(&config_path, &["init"]);
    drop_acme_call(tmp.path());
    run_desk(&config_path, &["process"]);

    let delivered = tmp
        .path()
        .join("Accounts/Acme/meetings/2026-02-03-acme-call.md");
    let content = fs::read_to_string(&delivered).unwrap();
    fs::write(
        &delivered,
        content.replace(
            "<!-- /deskflow:actions -->",
            "- [ ] Call the vendor back\n<!-- /deskflow:actions -->",
        ),
    )
    .unwrap();

    let (stdout, _, _) = run_desk(&config_path, &["reconcile"]);
    assert!(stdout.contains("actions created from checklists: 1"), "got: {}", stdout);

    let (stdout, _, _) = run_desk(&config_path, &["actions", "list"]);
    assert!(stdout.contains("Call the vendor back"));

    // The rewritten checklist now carries the id tag.
    let content = fs::read_to_string(&delivered).unwrap();
    assert!(content.contains("Call the vendor back (id: "));
}

#[test]
fn test_unclassifiable_document_is_parked_not_dropped() {
    let (tmp, config_path) = setup_test_env();
    run_desk(&config_path, &["init"]);

    let doc = tmp.path().join("Inbox/xq.md");
    fs::write(&doc, "??\n").unwrap();

    let (stdout, _, success) = run_desk(&config_path, &["process"]);
    assert!(success, "process failed: {}", stdout);
    assert!(stdout.contains("needs review (total): 1"));
    assert!(doc.exists());

    let (stdout, _, _) = run_desk(&config_path, &["status"]);
    assert!(stdout.contains("unclassified"));
}

#[test]
fn test_retry_requeues_parked_document() {
    let (tmp, config_path) = setup_test_env();

    // Start with a crashing agent so the document parks.
    let crash = write_agent(tmp.path(), "crash.sh", "#!/bin/sh\nexit 3\n");
    let original = fs::read_to_string(&config_path).unwrap();
    fs::write(
        &config_path,
        original.replace("agent.sh", crash.file_name().unwrap().to_str().unwrap()),
    )
    .unwrap();

    run_desk(&config_path, &["init"]);
    drop_acme_call(tmp.path());
    let (stdout, _, _) = run_desk(&config_path, &["process"]);
    assert!(stdout.contains("needs review (total): 1"));

    // Fix the agent, retry the document.
    fs::write(&config_path, original).unwrap();
    let (stdout, stderr, success) =
        run_desk(&config_path, &["retry", "2026-02-03-acme-call.md"]);
    assert!(success, "retry failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("state: delivered"));

    assert!(tmp
        .path()
        .join("Accounts/Acme/meetings/2026-02-03-acme-call.md")
        .is_file());
}
