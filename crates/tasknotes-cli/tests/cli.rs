use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

fn bin(dir: &Path, home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tasknotes"));
    cmd.current_dir(dir)
        .env("TASKNOTES_HOME", home)
        .env_remove("TASKNOTES_TASKS_DIR")
        .env_remove("TASKNOTES_NOTES_DIR")
        .env_remove("TASKNOTES_LOG");
    cmd
}

fn run(dir: &Path, home: &Path, args: &[&str]) -> Output {
    bin(dir, home).args(args).output().expect("run tasknotes")
}

fn run_ok(dir: &Path, home: &Path, args: &[&str]) -> String {
    let output = run(dir, home, args);
    assert!(
        output.status.success(),
        "tasknotes {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("utf8")
}

fn json(dir: &Path, home: &Path, args: &[&str]) -> Value {
    serde_json::from_str(&run_ok(dir, home, args)).expect("json")
}

#[test]
fn task_lifecycle_through_directories() {
    let repo = TempDir::new().expect("repo");
    let home = TempDir::new().expect("home");
    run_ok(repo.path(), home.path(), &["init"]);

    let created = json(
        repo.path(),
        home.path(),
        &["add", "Fix login bug", "--tag", "auth", "--json"],
    );
    assert_eq!(created["id"], "001");
    assert_eq!(created["container"], "backlog");
    assert_eq!(created["header"]["tags"], serde_json::json!(["auth"]));

    run_ok(repo.path(), home.path(), &["start", "001"]);
    let active = json(repo.path(), home.path(), &["list", "--status", "active", "--json"]);
    assert_eq!(active.as_array().map(Vec::len), Some(1));
    assert_eq!(active[0]["header"]["status"], "active");

    run_ok(repo.path(), home.path(), &["done", "fix login bug"]);
    let shown = json(repo.path(), home.path(), &["show", "1", "--json"]);
    assert_eq!(shown["container"], "completed");
    assert!(shown["path"]
        .as_str()
        .expect("path")
        .ends_with("completed/001-fix-login-bug.md"));
    assert!(shown["body"].as_str().expect("body").contains("# Fix login bug"));

    let backlog = repo.path().join(".tasknotes/tasks/backlog/001-fix-login-bug.md");
    assert!(!backlog.exists());
}

#[test]
fn subdirectories_discover_the_workspace() {
    let repo = TempDir::new().expect("repo");
    let home = TempDir::new().expect("home");
    run_ok(repo.path(), home.path(), &["init"]);
    let nested = repo.path().join("src/deep");
    std::fs::create_dir_all(&nested).expect("nested");

    run_ok(&nested, home.path(), &["add", "From below"]);
    let listed = run_ok(repo.path(), home.path(), &["list"]);
    assert!(listed.contains("001 | backlog | From below"));

    let place = json(&nested, home.path(), &["where", "--json"]);
    assert_eq!(place["mode"], "local");
}

#[test]
fn missing_workspace_fails_with_hint() {
    let repo = TempDir::new().expect("repo");
    let home = TempDir::new().expect("home");
    let output = run(repo.path(), home.path(), &["list"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error:"), "{}", stderr);
    assert!(stderr.contains("hint: run `tasknotes init`"), "{}", stderr);
}

#[test]
fn global_workspace_lives_under_home() {
    let repo = TempDir::new().expect("repo");
    let home = TempDir::new().expect("home");
    run_ok(repo.path(), home.path(), &["--global", "init"]);
    run_ok(repo.path(), home.path(), &["--global", "add", "Personal errand"]);

    assert!(home.path().join("tasks/backlog/001-personal-errand.md").is_file());
    let place = json(repo.path(), home.path(), &["--global", "where", "--json"]);
    assert_eq!(place["mode"], "global");
}

#[test]
fn notes_use_kind_directories() {
    let repo = TempDir::new().expect("repo");
    let home = TempDir::new().expect("home");
    run_ok(repo.path(), home.path(), &["init"]);

    let note = json(
        repo.path(),
        home.path(),
        &["note", "Weekly Sync", "--kind", "meetings", "--json"],
    );
    assert_eq!(note["container"], "meetings");
    assert!(note["id"].as_str().expect("id").ends_with("-weekly-sync"));

    run_ok(repo.path(), home.path(), &["move", "weekly sync", "reference", "--notes"]);
    let listed = json(repo.path(), home.path(), &["list", "--notes", "--json"]);
    assert_eq!(listed[0]["container"], "reference");
    assert_eq!(listed[0]["header"]["kind"], "reference");
}

#[test]
fn set_updates_field_and_rejects_status() {
    let repo = TempDir::new().expect("repo");
    let home = TempDir::new().expect("home");
    run_ok(repo.path(), home.path(), &["init"]);
    run_ok(repo.path(), home.path(), &["add", "Ship it"]);

    run_ok(repo.path(), home.path(), &["set", "1", "priority", "high"]);
    let shown = json(repo.path(), home.path(), &["show", "1", "--json"]);
    assert_eq!(shown["header"]["priority"], "high");

    let output = run(repo.path(), home.path(), &["set", "1", "status", "active"]);
    assert!(!output.status.success());
    let output = run(repo.path(), home.path(), &["move", "1", "finished"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown tasks container"));
}

#[test]
fn repair_reports_clean_workspace() {
    let repo = TempDir::new().expect("repo");
    let home = TempDir::new().expect("home");
    run_ok(repo.path(), home.path(), &["init"]);
    run_ok(repo.path(), home.path(), &["add", "Something"]);

    let out = run_ok(repo.path(), home.path(), &["repair"]);
    assert!(out.contains("Nothing to repair"));
    let report = json(repo.path(), home.path(), &["repair", "--json"]);
    assert_eq!(report["fixed_headers"], serde_json::json!([]));
}

#[test]
fn configured_id_width_applies() {
    let repo = TempDir::new().expect("repo");
    let home = TempDir::new().expect("home");
    run_ok(repo.path(), home.path(), &["init"]);
    std::fs::write(repo.path().join(".tasknotes/config.toml"), "id_width = 5\n").expect("config");

    let created = json(repo.path(), home.path(), &["add", "Wide", "--json"]);
    assert_eq!(created["id"], "00001");
}

#[test]
fn concurrent_adds_get_distinct_ids() {
    let repo = TempDir::new().expect("repo");
    let home = TempDir::new().expect("home");
    run_ok(repo.path(), home.path(), &["init"]);

    let children: Vec<_> = (0..6)
        .map(|i| {
            bin(repo.path(), home.path())
                .args(["add", &format!("Parallel {}", i)])
                .spawn()
                .expect("spawn")
        })
        .collect();
    for mut child in children {
        assert!(child.wait().expect("wait").success());
    }

    let listed = json(repo.path(), home.path(), &["list", "--json"]);
    let mut ids: Vec<String> = listed
        .as_array()
        .expect("array")
        .iter()
        .map(|v| v["id"].as_str().expect("id").to_string())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids, vec!["001", "002", "003", "004", "005", "006"]);
}
