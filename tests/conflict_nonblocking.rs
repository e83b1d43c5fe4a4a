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

fn seed(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> (String, String, String) {
    let created = request_ok(
        stdin,
        reader,
        "seed-version",
        "versions.create",
        json!({ "versionName": "Term", "effectiveFrom": "2026-09-01" }),
    );
    let version_id = created["version"]["id"].as_str().expect("id").to_string();
    let replaced = request_ok(
        stdin,
        reader,
        "seed-periods",
        "versions.periods.replace",
        json!({
            "versionId": version_id,
            "periods": [
                { "periodNumber": 1, "periodName": "Lecture 1", "startTime": "09:00", "endTime": "10:30" },
                { "periodNumber": 3, "periodName": "Lecture 2", "startTime": "10:30", "endTime": "12:00" }
            ]
        }),
    );
    let p1 = replaced["periods"][0]["id"].as_str().expect("p1").to_string();
    let p2 = replaced["periods"][1]["id"].as_str().expect("p2").to_string();
    (version_id, p1, p2)
}

#[test]
fn overlapping_schedules_succeed_with_advisory_conflicts() {
    let workspace = temp_dir("timetable-conflicts");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (version_id, p1, p2) = seed(&mut stdin, &mut reader);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schedules.create",
        json!({
            "versionId": version_id,
            "periodId": p1,
            "sessionTitle": "OS Lab A",
            "scheduleDate": "2026-09-10",
            "labId": "lab-1",
            "instructorId": "instr-1",
            "classId": "cs-2a"
        }),
    );
    assert_eq!(first["conflicts"].as_array().map(|a| a.len()), Some(0));
    let first_id = first["schedule"]["id"].as_str().expect("id").to_string();

    // Same lab and instructor, same date and period: the write still
    // succeeds and both dimensions are reported.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "schedules.create",
        json!({
            "versionId": version_id,
            "periodId": p1,
            "sessionTitle": "OS Lab B",
            "scheduleDate": "2026-09-10",
            "labId": "lab-1",
            "instructorId": "instr-1",
            "classId": "cs-2b"
        }),
    );
    let conflicts = second["conflicts"].as_array().expect("conflicts");
    let types: Vec<&str> = conflicts
        .iter()
        .map(|c| c["conflictType"].as_str().expect("type"))
        .collect();
    assert!(types.contains(&"lab_double_booked"), "types: {:?}", types);
    assert!(
        types.contains(&"instructor_double_booked"),
        "types: {:?}",
        types
    );
    assert!(!types.contains(&"class_double_booked"), "types: {:?}", types);

    // A different period on the same date does not collide.
    let third = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "schedules.create",
        json!({
            "versionId": version_id,
            "periodId": p2,
            "sessionTitle": "OS Lab C",
            "scheduleDate": "2026-09-10",
            "labId": "lab-1",
            "instructorId": "instr-1"
        }),
    );
    assert_eq!(third["conflicts"].as_array().map(|a| a.len()), Some(0));

    // The advisory records are persisted for later inspection.
    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "schedules.conflicts",
        json!({ "scheduleId": first_id }),
    );
    assert_eq!(stored["conflicts"].as_array().map(|a| a.len()), Some(2));
}

#[test]
fn enforce_conflicts_flag_turns_detection_into_rejection() {
    let workspace = temp_dir("timetable-conflicts-enforce");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (version_id, p1, _p2) = seed(&mut stdin, &mut reader);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schedules.create",
        json!({
            "versionId": version_id,
            "periodId": p1,
            "sessionTitle": "OS Lab A",
            "scheduleDate": "2026-09-10",
            "labId": "lab-1"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "config.update",
        json!({ "patch": { "enforceConflicts": true } }),
    );

    let rejected = request(
        &mut stdin,
        &mut reader,
        "4",
        "schedules.create",
        json!({
            "versionId": version_id,
            "periodId": p1,
            "sessionTitle": "OS Lab B",
            "scheduleDate": "2026-09-10",
            "labId": "lab-1"
        }),
    );
    assert_eq!(rejected["ok"], false);
    assert_eq!(rejected["error"]["code"], "conflict_detected");

    // The rejected write left nothing behind.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "schedules.list",
        json!({ "versionId": version_id }),
    );
    assert_eq!(listed["schedules"].as_array().map(|a| a.len()), Some(1));
}
