use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_timetabled");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn timetabled");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn config_defaults_and_patch_persist_across_reopen() {
    let workspace = temp_dir("timetable-config");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let initial = request_ok(&mut stdin, &mut reader, "2", "config.get", json!({}));
    assert_eq!(initial["config"]["lectureDurationMinutes"], 90);
    assert_eq!(initial["config"]["schoolStartTime"], "09:00");
    assert_eq!(initial["config"]["enforceConflicts"], false);
    assert_eq!(
        initial["config"]["workingDays"].as_array().map(|a| a.len()),
        Some(5)
    );

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "config.update",
        json!({
            "patch": {
                "lectureDurationMinutes": 60,
                "workingDays": ["monday", "wednesday", "Friday"]
            }
        }),
    );
    assert_eq!(updated["config"]["lectureDurationMinutes"], 60);
    // Day names are normalized to lowercase.
    assert_eq!(
        updated["config"]["workingDays"],
        json!(["monday", "wednesday", "friday"])
    );
    // Untouched keys keep their defaults.
    assert_eq!(updated["config"]["maxLecturesPerDay"], 8);

    // A fresh process over the same workspace sees the stored values.
    let (_child2, mut stdin2, mut reader2) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin2,
        &mut reader2,
        "4",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let reloaded = request_ok(&mut stdin2, &mut reader2, "5", "config.get", json!({}));
    assert_eq!(reloaded["config"]["lectureDurationMinutes"], 60);
    assert_eq!(
        reloaded["config"]["workingDays"],
        json!(["monday", "wednesday", "friday"])
    );
}

#[test]
fn config_update_rejects_bad_patches() {
    let workspace = temp_dir("timetable-config-bad");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let unknown = request(
        &mut stdin,
        &mut reader,
        "2",
        "config.update",
        json!({ "patch": { "mystery": 1 } }),
    );
    assert_eq!(unknown["ok"], false);
    assert_eq!(unknown["error"]["code"], "bad_params");

    let empty = request(
        &mut stdin,
        &mut reader,
        "3",
        "config.update",
        json!({ "patch": {} }),
    );
    assert_eq!(empty["ok"], false);
    assert_eq!(empty["error"]["code"], "no_fields");

    let inverted = request(
        &mut stdin,
        &mut reader,
        "4",
        "config.update",
        json!({ "patch": { "schoolEndTime": "08:00" } }),
    );
    assert_eq!(inverted["ok"], false);
    assert_eq!(inverted["error"]["code"], "bad_params");

    let out_of_range = request(
        &mut stdin,
        &mut reader,
        "5",
        "config.update",
        json!({ "patch": { "lectureDurationMinutes": 5 } }),
    );
    assert_eq!(out_of_range["ok"], false);
    assert_eq!(out_of_range["error"]["code"], "bad_params");

    // Failed patches leave the stored config untouched.
    let current = request_ok(&mut stdin, &mut reader, "6", "config.get", json!({}));
    assert_eq!(current["config"]["lectureDurationMinutes"], 90);
    assert_eq!(current["config"]["schoolEndTime"], "17:00");
}
