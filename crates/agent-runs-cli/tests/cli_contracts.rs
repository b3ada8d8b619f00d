use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn temp_db(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("agent-runs-cli-test-{}-{}.sqlite", name, Ulid::new()))
}

fn run_cli(db: &Path, args: &[&str]) -> Output {
    let output = Command::new(env!("CARGO_BIN_EXE_agent-runs"))
        .arg("--db")
        .arg(db)
        .args(args)
        .env("RUST_LOG", "warn")
        .output();
    assert!(output.is_ok());
    output.unwrap_or_else(|_| unreachable!())
}

fn run_ok(db: &Path, args: &[&str]) -> Vec<Value> {
    let output = run_cli(db, args);
    assert!(
        output.status.success(),
        "agent-runs {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
}

fn stdout_json(output: &Output) -> Vec<Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .unwrap_or_else(|err| panic!("stdout line is not JSON ({err}): {line}"))
        })
        .collect()
}

fn single(mut docs: Vec<Value>) -> Value {
    assert_eq!(docs.len(), 1, "expected one JSON document, got {docs:?}");
    docs.remove(0)
}

fn str_field<'a>(doc: &'a Value, field: &str) -> &'a str {
    doc[field]
        .as_str()
        .unwrap_or_else(|| panic!("expected string field {field} in {doc}"))
}

#[test]
fn approval_gated_run_flows_from_submit_to_apply() {
    let db = temp_db("flow");
    single(run_ok(&db, &["migrate"]));

    let payload = r#"{"attributes":{"inspection_items":[{"code":"gfci","description":"no GFCI in kitchen","result":"fail"}]}}"#;
    let run = single(run_ok(
        &db,
        &[
            "submit", "--tenant", "7", "--kind", "hqs-precheck", "--subject", "70", "--payload",
            payload,
        ],
    ));
    assert_eq!(str_field(&run, "status"), "queued");
    let run_id = str_field(&run, "run_id").to_string();

    let executed = single(run_ok(&db, &["execute", "--tenant", "7", "--run-id", &run_id]));
    assert_eq!(str_field(&executed, "status"), "blocked");
    assert_eq!(str_field(&executed, "approval_status"), "pending");

    let approved = single(run_ok(
        &db,
        &["approve", "--tenant", "7", "--run-id", &run_id, "--actor", "ops@example.com"],
    ));
    assert_eq!(str_field(&approved, "approval_status"), "approved");

    let outcome = single(run_ok(
        &db,
        &["apply", "--tenant", "7", "--run-id", &run_id, "--actor", "ops@example.com"],
    ));
    assert_eq!(outcome["applied_count"], 2);
    assert_eq!(str_field(&outcome["run"], "status"), "done");

    let mutations = single(run_ok(&db, &["mutations", "--tenant", "7", "--subject", "70"]));
    let rehab = mutations["rehab_tasks"].as_array().cloned().unwrap_or_default();
    assert_eq!(rehab.len(), 1);
    assert_eq!(str_field(&rehab[0], "title"), "Repair gfci: no GFCI in kitchen");
    assert_eq!(
        mutations["workflow_events"].as_array().map(Vec::len),
        Some(1)
    );

    let events = run_ok(&db, &["events", "--run-id", &run_id]);
    assert_eq!(events.len(), 5);

    let audit = single(run_ok(&db, &["replay-audit", "--run-id", &run_id]));
    assert_eq!(audit["chain_valid"], true);
    assert_eq!(audit["events"], 5);
}

#[test]
fn repeated_idempotency_key_returns_the_same_run() {
    let db = temp_db("idempotency");
    let args = [
        "submit",
        "--tenant",
        "3",
        "--kind",
        "ops-judge",
        "--idempotency-key",
        "weekly-review",
    ];
    let first = single(run_ok(&db, &args));
    let second = single(run_ok(&db, &args));
    assert_eq!(first["run_id"], second["run_id"]);

    let runs = run_ok(&db, &["runs", "--tenant", "3"]);
    assert_eq!(runs.len(), 1);
}

#[test]
fn unknown_task_kind_is_rejected_without_output() {
    let db = temp_db("unknown-kind");
    let output = run_cli(&db, &["submit", "--tenant", "1", "--kind", "market-oracle"]);
    assert!(!output.status.success());
    assert!(stdout_json(&output).is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown task kind"));
}

#[test]
fn other_tenants_cannot_see_a_run() {
    let db = temp_db("tenant-isolation");
    let run = single(run_ok(&db, &["submit", "--tenant", "1", "--kind", "ops-judge"]));
    let run_id = str_field(&run, "run_id").to_string();

    let output = run_cli(&db, &["show", "--tenant", "2", "--run-id", &run_id]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not_found"));
}

#[test]
fn work_drain_executes_every_queued_run() {
    let db = temp_db("work-drain");
    for kind in ["intake-validate", "packet-builder", "timeline-nudger"] {
        single(run_ok(&db, &["submit", "--tenant", "9", "--kind", kind, "--subject", "1"]));
    }

    let report = single(run_ok(&db, &["work", "--drain"]));
    assert_eq!(report["failed"], 0);

    let done = run_ok(&db, &["runs", "--tenant", "9", "--status", "done"]);
    assert_eq!(done.len(), 3);
}

#[test]
fn planner_submits_stage_routes_once() {
    let db = temp_db("plan");
    single(run_ok(
        &db,
        &[
            "subject", "set", "--tenant", "5", "--subject", "50", "--stage", "rehab", "--flag",
            "valuation-stale",
        ],
    ));

    let planned = run_ok(&db, &["plan", "--tenant", "5", "--subject", "50"]);
    let kinds: Vec<&str> = planned.iter().map(|doc| str_field(doc, "task_kind")).collect();
    assert_eq!(kinds, vec!["timeline-nudger", "rent-reasonableness"]);

    let submitted = run_ok(&db, &["plan", "--tenant", "5", "--subject", "50", "--submit"]);
    assert_eq!(submitted.len(), 2);
    let resubmitted = run_ok(&db, &["plan", "--tenant", "5", "--subject", "50", "--submit"]);
    assert_eq!(resubmitted.len(), 1);

    let runs = run_ok(&db, &["runs", "--tenant", "5", "--subject", "50"]);
    assert_eq!(runs.len(), 2);
}

#[test]
fn contracts_lists_every_task_kind() {
    let db = temp_db("contracts");
    let contracts = run_ok(&db, &["contracts"]);
    assert_eq!(contracts.len(), 7);
    let hqs = contracts
        .iter()
        .find(|doc| doc["task_kind"] == "hqs-precheck")
        .cloned()
        .unwrap_or_default();
    assert_eq!(hqs["contract"]["mode"], "approval_required");
    let advisory = contracts
        .iter()
        .filter(|doc| doc["contract"]["mode"] == "advisory_only")
        .count();
    assert_eq!(advisory, 6);
}
