use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
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

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn schema_file() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fullhistory.yaml")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to locate fullhistory.yaml: {err}"))
}

struct Sandbox {
    dir: PathBuf,
    db: PathBuf,
    schema: PathBuf,
}

impl Sandbox {
    fn new(prefix: &str) -> Self {
        let dir = unique_temp_dir(prefix);
        let db = dir.join("history.sqlite3");
        Self { dir, db, schema: schema_file() }
    }

    fn run<I, S>(&self, args: I) -> Output
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(env!("CARGO_BIN_EXE_fh"))
            .arg("--db")
            .arg(&self.db)
            .arg("--schema")
            .arg(&self.schema)
            .args(args)
            .env_remove("FULLHISTORY_LOG")
            .output()
            .unwrap_or_else(|err| panic!("failed to execute fh binary: {err}"))
    }

    fn json<I, S>(&self, args: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run(args);
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            panic!(
                "fh command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
                output.status, stdout, stderr
            );
        }
        parse_stdout(&output)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, pointer: &str) -> i64 {
    value
        .pointer(pointer)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer at `{pointer}` in payload: {value}"))
}

fn array_len(value: &Value, pointer: &str) -> usize {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or_else(|| panic!("missing array at `{pointer}` in payload: {value}"))
}

// Test IDs: TCLI-001
#[test]
fn db_commands_cover_migrate_integrity_export_backup() {
    let sandbox = Sandbox::new("fullhistory-cli-db");
    let export_dir = sandbox.dir.join("export");
    let backup_file = sandbox.dir.join("backup.sqlite3");

    let before = sandbox.json(["db", "schema-version"]);
    assert_eq!(as_i64(&before, "/current_version"), 0);
    assert_eq!(before.get("contract_version"), Some(&Value::from("cli.v1")));

    let dry_run = sandbox.json(["db", "migrate", "--dry-run"]);
    assert_eq!(array_len(&dry_run, "/would_apply_versions"), 2);
    assert_eq!(as_i64(&sandbox.json(["db", "schema-version"]), "/current_version"), 0);

    let migrate = sandbox.json(["db", "migrate"]);
    assert_eq!(as_i64(&migrate, "/after_version"), 2);
    assert_eq!(migrate.get("up_to_date"), Some(&Value::Bool(true)));

    sandbox.json(["--actor-id", "7", "record", "create", "--type", "ticket", "--set", "summary=a"]);

    let integrity = sandbox.json(["db", "integrity-check"]);
    assert_eq!(integrity.get("quick_check_ok"), Some(&Value::Bool(true)));
    assert_eq!(array_len(&integrity, "/ledger_findings"), 0);

    let export = sandbox.json(["db", "export", "--out", path_str(&export_dir)]);
    assert_eq!(array_len(&export, "/manifest/files"), 2);
    assert!(export_dir.join("manifest.json").exists());

    let backup = sandbox.json(["db", "backup", "--out", path_str(&backup_file)]);
    assert_eq!(backup.get("status"), Some(&Value::from("ok")));
    assert!(backup_file.exists());
}

// Test IDs: TCLI-002
#[test]
fn record_and_history_commands_track_one_ticket() {
    let sandbox = Sandbox::new("fullhistory-cli-history");
    let actor = ["--actor-id", "7", "--actor-name", "alice"];

    let user = sandbox.json(
        actor.iter().copied().chain(["record", "create", "--type", "auth.user", "--set", "username=carol"]),
    );
    assert_eq!(array_len(&user, "/entries"), 0);
    let reported_by = format!("reported_by={}", as_i64(&user, "/record/entity_id"));

    let created = sandbox.json(actor.iter().copied().chain([
        "record",
        "create",
        "--type",
        "ticket",
        "--set",
        "summary=Printer on fire",
        "--set",
        reported_by.as_str(),
        "--set",
        "time_opened=2024-05-01T09:30:00Z",
    ]));
    assert_eq!(created.pointer("/entries/0/action"), Some(&Value::from("create")));
    assert_eq!(created.pointer("/entries/0/info"), Some(&Value::from("alice Created")));
    let ticket_id = as_i64(&created, "/record/entity_id").to_string();
    let ticket = ["--type", "ticket", "--id", ticket_id.as_str()];

    let updated = sandbox.json(
        actor
            .iter()
            .copied()
            .chain(["record", "update"])
            .chain(ticket)
            .chain(["--set", "summary=Printer fixed"]),
    );
    assert_eq!(as_i64(&updated, "/entries/0/revision"), 1);
    assert_eq!(
        updated.pointer("/entries/0/data/summary"),
        Some(&serde_json::json!(["Printer on fire", "Printer fixed"]))
    );

    let listed = sandbox.json(["history", "list"].into_iter().chain(ticket));
    assert_eq!(array_len(&listed, "/entries"), 2);

    let audit = sandbox.json(["history", "audit"].into_iter().chain(ticket));
    assert_eq!(audit.get("status"), Some(&Value::from("ok")));
    assert_eq!(as_i64(&audit, "/report/revision"), 1);

    let version = sandbox.json(["history", "version"].into_iter().chain(ticket).chain(["--revision", "0"]));
    assert_eq!(
        version.pointer("/record/values/summary/value"),
        Some(&Value::from("Printer on fire"))
    );

    let rollback = sandbox.json(
        actor
            .iter()
            .copied()
            .chain(["history", "rollback"])
            .chain(ticket)
            .chain(["--revision", "0", "--commit"]),
    );
    assert_eq!(rollback.get("committed"), Some(&Value::Bool(true)));
    let after_rollback = sandbox.json(["history", "list"].into_iter().chain(ticket));
    assert_eq!(array_len(&after_rollback, "/entries"), 3);
    let shown = sandbox.json(["record", "show"].into_iter().chain(ticket));
    assert_eq!(shown.pointer("/values/summary/value"), Some(&Value::from("Printer on fire")));

    let by_actor = sandbox.json(["history", "actor", "--actor", "7"]);
    assert_eq!(array_len(&by_actor, "/entries"), 3);
    let request = by_actor
        .pointer("/entries/0/request_id")
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("entry should carry a request id: {by_actor}"))
        .to_string();
    let grouped = sandbox.json(["history", "request", "--request", request.as_str()]);
    assert_eq!(array_len(&grouped, "/entries"), 1);
    assert_eq!(as_i64(&grouped, "/request/actor_id"), 7);

    let next = sandbox.json(["history", "next"].into_iter().chain(ticket).chain(["--revision", "0"]));
    assert_eq!(as_i64(&next, "/revision"), 1);
    let first_previous =
        sandbox.run(["history", "previous"].into_iter().chain(ticket).chain(["--revision", "0"]));
    assert!(!first_previous.status.success());
}

// Test IDs: TCLI-003
#[test]
fn detached_writes_and_deleted_records_can_be_restored() {
    let sandbox = Sandbox::new("fullhistory-cli-restore");

    let created =
        sandbox.json(["record", "create", "--type", "ticket", "--set", "summary=orphaned"]);
    assert_eq!(created.pointer("/entries/0/info"), Some(&Value::from("(System) Created")));
    assert_eq!(created.pointer("/entries/0/request_id"), Some(&Value::Null));
    let ticket_id = as_i64(&created, "/record/entity_id").to_string();
    let ticket = ["--type", "ticket", "--id", ticket_id.as_str()];

    let deleted = sandbox.json(["--anonymous", "record", "delete"].into_iter().chain(ticket));
    assert_eq!(deleted.pointer("/entries/0/action"), Some(&Value::from("delete")));
    assert_eq!(deleted.pointer("/entries/0/info"), Some(&Value::from("(Anonymous) Deleted")));
    assert!(!sandbox.run(["record", "show"].into_iter().chain(ticket)).status.success());

    let restored = sandbox.json(["history", "restore"].into_iter().chain(ticket).chain(["--commit"]));
    assert_eq!(restored.pointer("/record/values/summary/value"), Some(&Value::from("orphaned")));
    let listed = sandbox.json(["history", "list"].into_iter().chain(ticket));
    assert_eq!(listed.pointer("/entries/2/action"), Some(&Value::from("create")));
    let audit = sandbox.json(["history", "audit"].into_iter().chain(ticket));
    assert_eq!(audit.get("status"), Some(&Value::from("ok")));
}

// Test IDs: TCLI-004
#[test]
fn invalid_assignments_fail_without_writing() {
    let sandbox = Sandbox::new("fullhistory-cli-invalid");

    let unknown = sandbox.run(["record", "create", "--type", "ticket", "--set", "nope=1"]);
    assert!(!unknown.status.success());
    let malformed = sandbox.run(["record", "create", "--type", "ticket", "--set", "summary"]);
    assert!(!malformed.status.success());
    let bad_time =
        sandbox.run(["record", "create", "--type", "ticket", "--set", "time_opened=yesterday"]);
    assert!(!bad_time.status.success());
    let abstract_type = sandbox.run(["record", "create", "--type", "category"]);
    assert!(!abstract_type.status.success());

    let integrity = sandbox.json(["db", "integrity-check"]);
    assert_eq!(array_len(&integrity, "/ledger_findings"), 0);
    let export_dir = sandbox.dir.join("export");
    let export = sandbox.json(["db", "export", "--out", path_str(&export_dir)]);
    assert_eq!(as_i64(&export, "/manifest/files/1/records"), 0);
}

// Test IDs: TCLI-005
#[test]
fn create_with_taken_id_is_rejected() {
    let sandbox = Sandbox::new("fullhistory-cli-taken-id");

    let created = sandbox.json(["record", "create", "--type", "ticket", "--set", "summary=first"]);
    let ticket_id = as_i64(&created, "/record/entity_id").to_string();
    let ticket = ["--type", "ticket", "--id", ticket_id.as_str()];

    let again = sandbox.run(
        ["record", "create"].into_iter().chain(ticket).chain(["--set", "summary=second"]),
    );
    assert!(!again.status.success());

    let shown = sandbox.json(["record", "show"].into_iter().chain(ticket));
    assert_eq!(shown.pointer("/values/summary/value"), Some(&Value::from("first")));
    let listed = sandbox.json(["history", "list"].into_iter().chain(ticket));
    assert_eq!(array_len(&listed, "/entries"), 1);
}
