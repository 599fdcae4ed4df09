use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const A_TS_DIFF: &str = "\
diff --git a/a.ts b/a.ts
--- a/a.ts
+++ b/a.ts
@@ -10,3 +10,4 @@
 function f() {
+const x = 1;
   return y;
 }
";

#[allow(deprecated)]
fn cmd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("diffsweep").unwrap();
    cmd.current_dir(dir.path()).env("RUST_LOG", "warn");
    cmd
}

fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("change.diff"), A_TS_DIFF).unwrap();
    dir
}

// --- Help & version ---

#[test]
fn help_flag() {
    let dir = TempDir::new().unwrap();
    cmd(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("review"))
        .stdout(predicate::str::contains("resolve"));
}

#[test]
fn version_flag() {
    let dir = TempDir::new().unwrap();
    cmd(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("diffsweep"));
}

// --- resolve ---

#[test]
fn resolve_prefers_added_line() {
    let dir = workspace();
    cmd(&dir)
        .args([
            "resolve",
            "--diff",
            "change.diff",
            "--file",
            "a.ts",
            "--snippet",
            "const x = 1",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"line\": 11"))
        .stdout(predicate::str::contains("\"is_old_file\": false"));
}

#[test]
fn resolve_unknown_snippet_fails() {
    let dir = workspace();
    cmd(&dir)
        .args([
            "resolve",
            "--diff",
            "change.diff",
            "--file",
            "a.ts",
            "--snippet",
            "launchMissiles(now)",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot locate finding"));
}

// --- fingerprint ---

#[test]
fn fingerprint_is_stable_hex() {
    let dir = workspace();
    let first = cmd(&dir)
        .args(["fingerprint", "--diff", "change.diff"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(first).unwrap();
    let text = text.trim();
    assert_eq!(text.len(), 64);
    assert!(text.chars().all(|c| c.is_ascii_hexdigit()));

    cmd(&dir)
        .args(["fingerprint", "--diff", "-"])
        .write_stdin(A_TS_DIFF)
        .assert()
        .success()
        .stdout(predicate::str::contains(text));
}

#[test]
fn fingerprint_rejects_malformed_diff() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("bad.diff"),
        "--- a/a.ts\n+++ b/a.ts\n@@ -1,2 +1,2 @@\n-only one line\n",
    )
    .unwrap();
    cmd(&dir)
        .args(["fingerprint", "--diff", "bad.diff"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("malformed diff"));
}

// --- exec ---

#[test]
fn exec_passes_exit_code_through() {
    let dir = TempDir::new().unwrap();
    cmd(&dir)
        .args(["exec", "--workers", "1", "--", "sh", "-c", "echo hello; exit 3"])
        .assert()
        .code(3)
        .stdout(predicate::str::contains("hello"));
}

#[test]
fn exec_timeout_fails() {
    let dir = TempDir::new().unwrap();
    cmd(&dir)
        .args(["exec", "--timeout", "1", "--", "sleep", "30"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("timed out"));
}

// --- config ---

#[test]
fn explicit_missing_config_fails() {
    let dir = workspace();
    cmd(&dir)
        .args(["--config", "nope.toml", "fingerprint", "--diff", "change.diff"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("config file not found"));
}

#[test]
fn invalid_config_fails() {
    let dir = workspace();
    fs::write(dir.path().join("diffsweep.toml"), "[pool]\nworkers = 0\n").unwrap();
    cmd(&dir)
        .args(["fingerprint", "--diff", "change.diff"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("config validation error"));
}

// --- review ---

const SCRIPTED_CONFIG: &str = r##"
state_dir = "state"

[coordinator]
retry_on_error = false

[completion]
kind = "command"
binary = "sh"
args = ["-c", '''cat > /dev/null; echo '{"findings": [{"file": "a.ts", "snippet": "const x = 1", "message": "x is never used", "confidence": 0.8}]}' ''']

[[review]]
name = "correctness"
focus = "Logic errors."
"##;

#[test]
fn review_reports_then_reuses_state() {
    let dir = workspace();
    fs::write(dir.path().join("diffsweep.toml"), SCRIPTED_CONFIG).unwrap();

    cmd(&dir)
        .args([
            "review",
            "--diff",
            "change.diff",
            "--change-id",
            "pr-1",
            "--publish",
            "published.jsonl",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"mode\": \"full\""))
        .stdout(predicate::str::contains("\"line\": 11"))
        .stdout(predicate::str::contains("x is never used"));

    let published = fs::read_to_string(dir.path().join("published.jsonl")).unwrap();
    assert_eq!(published.lines().count(), 1);
    assert!(published.contains("\"change_id\":\"pr-1\""));

    cmd(&dir)
        .args(["review", "--diff", "change.diff", "--change-id", "pr-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"mode\": \"incremental\""))
        .stdout(predicate::str::contains("x is never used"));
}
