use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir =
            TempDir::new().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"));
        Self { dir }
    }

    fn store_path(&self) -> PathBuf {
        self.dir.path().join("store.json")
    }

    fn secret_path(&self) -> PathBuf {
        self.dir.path().join("store.key")
    }

    fn run<I, S>(&self, args: I) -> Output
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(env!("CARGO_BIN_EXE_flowstore"))
            .arg("--store")
            .arg(self.store_path())
            .arg("--secret-file")
            .arg(self.secret_path())
            .args(args)
            .output()
            .unwrap_or_else(|err| panic!("failed to execute flowstore binary: {err}"))
    }

    fn run_json<I, S>(&self, args: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run(args);
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            panic!(
                "flowstore command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
                output.status, stdout, stderr
            );
        }
        parse_stdout(&output)
    }
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn read_store(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body).unwrap_or_else(|err| panic!("store is not JSON: {err}"))
}

#[test]
fn set_then_get_round_trips_through_the_file() {
    let ws = Workspace::new();
    let set = ws.run_json(["set", "settings", r#"{"theme":"dark"}"#]);
    assert_eq!(set["written"], Value::Bool(true));
    assert_eq!(set["verified"], Value::Bool(true));
    assert_eq!(set["contract_version"], Value::from("flowstore.v1"));

    let get = ws.run_json(["get", "settings"]);
    assert_eq!(get["found"], Value::Bool(true));
    assert_eq!(get["value"]["theme"], Value::from("dark"));

    let raw = read_store(&ws.store_path());
    assert!(raw["settings"]["hmac"].as_str().is_some_and(|h| h.len() == 64));

    let keys = ws.run_json(["keys"]);
    assert_eq!(keys["keys"], serde_json::json!(["settings"]));
}

#[test]
fn get_missing_key_uses_default() {
    let ws = Workspace::new();
    let get = ws.run_json(["get", "lastOpened", "--default", "\"none\""]);
    assert_eq!(get["found"], Value::Bool(false));
    assert_eq!(get["value"], Value::from("none"));
}

#[test]
fn verify_fails_after_the_file_is_edited() {
    let ws = Workspace::new();
    ws.run_json(["set", "settings", r#"{"telemetry":false}"#]);
    let clean = ws.run_json(["verify"]);
    assert_eq!(clean["verified"], serde_json::json!(["settings"]));

    let path = ws.store_path();
    let edited = fs::read_to_string(&path)
        .unwrap_or_else(|err| panic!("failed to read store: {err}"))
        .replace("false", "true");
    fs::write(&path, edited).unwrap_or_else(|err| panic!("failed to edit store: {err}"));

    let output = ws.run(["verify"]);
    assert!(!output.status.success());
    let report = parse_stdout(&output);
    assert_eq!(report["tampered"], serde_json::json!(["settings"]));

    let get = ws.run_json(["get", "settings"]);
    assert_eq!(get["found"], Value::Bool(false));
}

#[test]
fn repair_unwraps_nested_workflows() {
    let ws = Workspace::new();
    ws.run_json([
        "set",
        "workflows",
        r#"{"workflows":{"a":{"id":"a"}},"c":{"id":"c"}}"#,
    ]);

    let dry = ws.run_json(["repair", "--dry-run"]);
    assert_eq!(dry["repaired"], Value::Bool(true));
    assert_eq!(dry["persisted"], Value::Bool(false));

    let repair = ws.run_json(["repair"]);
    assert_eq!(repair["repaired"], Value::Bool(true));
    assert_eq!(repair["entries"], Value::from(2));
    assert_eq!(repair["persisted"], Value::Bool(true));

    let get = ws.run_json(["get", "workflows"]);
    assert_eq!(
        get["value"],
        serde_json::json!({"a": {"id": "a"}, "c": {"id": "c"}})
    );

    let again = ws.run_json(["repair"]);
    assert_eq!(again["repaired"], Value::Bool(false));
}

#[test]
fn migrate_integrity_wraps_legacy_file() {
    let ws = Workspace::new();
    fs::write(ws.store_path(), r#"{"settings":{"theme":"light"},"lastOpened":"a"}"#)
        .unwrap_or_else(|err| panic!("failed to seed store: {err}"));

    let report = ws.run_json(["migrate-integrity"]);
    assert_eq!(report["migrated"], Value::from(2));
    assert_eq!(report["failed"], Value::from(0));

    let migrate = ws.run_json(["migrate"]);
    assert_eq!(migrate["to"], Value::from("2"));

    let second = ws.run_json(["migrate"]);
    assert_eq!(second["applied"], serde_json::json!([]));
    assert_eq!(ws.run_json(["verify"])["tampered"], serde_json::json!([]));
}

#[test]
fn backups_list_restore_and_purge() {
    let ws = Workspace::new();
    for theme in ["one", "two", "three"] {
        ws.run_json(["set", "settings", &format!(r#"{{"theme":"{theme}"}}"#)]);
    }

    let list = ws.run_json(["backups", "list", "settings"]);
    let backups = list["backups"]
        .as_array()
        .unwrap_or_else(|| panic!("backups should be an array: {list}"));
    assert_eq!(backups.len(), 2);

    let restore = ws.run_json(["backups", "restore", "settings"]);
    assert_eq!(restore["restored"], Value::Bool(true));
    let get = ws.run_json(["get", "settings"]);
    assert_eq!(get["value"]["theme"], Value::from("two"));

    let purge = ws.run_json(["backups", "purge", "--keep", "0"]);
    assert_eq!(purge["removed"], Value::from(2));
}

#[test]
fn health_and_stats_report_json() {
    let ws = Workspace::new();
    let health = ws.run_json(["health"]);
    assert_eq!(health["healthy"], Value::Bool(true));

    ws.run_json(["set", "lastOpened", "\"a\""]);
    let stats = ws.run_json(["stats"]);
    assert_eq!(stats["liveKeys"], Value::from(1));
}

#[test]
fn invalid_json_value_is_rejected() {
    let ws = Workspace::new();
    let output = ws.run(["set", "settings", "{not json"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not valid JSON"));
}
