use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

#[test]
fn test_cli_help() {
    let mut cmd = cargo_bin_cmd!("parley");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Multi-agent discussion daemon for AI CLI assistants",
        ))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("list"));
}

#[test]
fn test_cli_version() {
    let mut cmd = cargo_bin_cmd!("parley");
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("parley"));
}

#[test]
fn test_cli_run_help() {
    let mut cmd = cargo_bin_cmd!("parley");
    cmd.args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Run the agent daemon"))
        .stdout(predicate::str::contains("--agent"));
}

#[test]
fn test_cli_run_rejects_unknown_agent() {
    let dir = TempDir::new().unwrap();
    let mut cmd = cargo_bin_cmd!("parley");
    cmd.args(["--base-dir"])
        .arg(dir.path())
        .args(["run", "--agent", "gemini"])
        .assert()
        .failure();
}

#[test]
fn test_cli_create_list_ask_end_flow() {
    let dir = TempDir::new().unwrap();

    cargo_bin_cmd!("parley")
        .args(["--base-dir"])
        .arg(dir.path())
        .args(["create", "Use REST or GraphQL?"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Use REST or GraphQL?"));

    // The log file names the discussion id.
    let id = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            (path.extension().and_then(|x| x.to_str()) == Some("jsonl"))
                .then(|| path.file_stem().unwrap().to_string_lossy().into_owned())
        })
        .next()
        .expect("created log file");

    cargo_bin_cmd!("parley")
        .args(["--base-dir"])
        .arg(dir.path())
        .args(["list", "--active"])
        .assert()
        .success()
        .stdout(predicate::str::contains(&id))
        .stdout(predicate::str::contains("active"));

    cargo_bin_cmd!("parley")
        .args(["--base-dir"])
        .arg(dir.path())
        .args(["ask", &id, "What about caching?", "--target", "claude"])
        .assert()
        .success()
        .stdout(predicate::str::contains("What about caching?"))
        .stdout(predicate::str::contains("claude"));

    cargo_bin_cmd!("parley")
        .args(["--base-dir"])
        .arg(dir.path())
        .args(["end", &id, "REST + caching layer", "--consensus"])
        .assert()
        .success()
        .stdout(predicate::str::contains("REST + caching layer"));

    cargo_bin_cmd!("parley")
        .args(["--base-dir"])
        .arg(dir.path())
        .args(["status", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("ended"))
        .stdout(predicate::str::contains("REST + caching layer"));

    cargo_bin_cmd!("parley")
        .args(["--base-dir"])
        .arg(dir.path())
        .args(["list", "--active"])
        .assert()
        .success()
        .stdout(predicate::str::contains(&id).not());
}

#[test]
fn test_cli_status_unknown_discussion_fails() {
    let dir = TempDir::new().unwrap();
    cargo_bin_cmd!("parley")
        .args(["--base-dir"])
        .arg(dir.path())
        .args(["status", "12345678"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}
