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

fn generated_version(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    generate_params: serde_json::Value,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        "version",
        "versions.create",
        json!({ "versionName": "Generated", "effectiveFrom": "2026-09-01" }),
    );
    let version_id = created["version"]["id"].as_str().expect("id").to_string();

    let generated = request_ok(stdin, reader, "generate", "config.generatePeriods", generate_params);
    let periods = generated["periods"].clone();
    let _ = request_ok(
        stdin,
        reader,
        "replace",
        "versions.periods.replace",
        json!({ "versionId": version_id, "periods": periods }),
    );
    version_id
}

#[test]
fn generated_periods_validate_clean() {
    let workspace = temp_dir("timetable-validate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Both shapes: pure lecture progression and a day with breaks.
    for params in [
        json!({
            "schoolStartTime": "09:00",
            "schoolEndTime": "12:00",
            "lectureDurationMinutes": 90,
            "breakConfigurations": [],
            "includeBreaks": false
        }),
        json!({
            "schoolStartTime": "08:45",
            "schoolEndTime": "15:00",
            "lectureDurationMinutes": 90,
            "breakConfigurations": [
                { "afterLecture": 0, "durationMinutes": 15 },
                { "afterLecture": 2, "durationMinutes": 30 }
            ],
            "includeBreaks": true
        }),
    ] {
        let version_id = generated_version(&mut stdin, &mut reader, params);
        let report = request_ok(
            &mut stdin,
            &mut reader,
            "validate",
            "versions.validate",
            json!({ "versionId": version_id }),
        );
        assert_eq!(report["isValid"], true, "report: {}", report);
        assert_eq!(report["issues"].as_array().map(|a| a.len()), Some(0));
    }
}

#[test]
fn orphaned_schedules_and_gaps_are_reported() {
    let workspace = temp_dir("timetable-validate-issues");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "versions.create",
        json!({ "versionName": "Messy", "effectiveFrom": "2026-09-01" }),
    );
    let version_id = created["version"]["id"].as_str().expect("id").to_string();

    let replaced = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "versions.periods.replace",
        json!({
            "versionId": version_id,
            "periods": [
                { "periodNumber": 1, "periodName": "Lecture 1", "startTime": "09:00", "endTime": "10:30" }
            ]
        }),
    );
    let period_id = replaced["periods"][0]["id"].as_str().expect("period id");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "schedules.create",
        json!({
            "versionId": version_id,
            "periodId": period_id,
            "sessionTitle": "Lab",
            "scheduleDate": "2026-09-10"
        }),
    );

    // New period ids orphan the schedule; 2 -> 6 skips period slots.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "versions.periods.replace",
        json!({
            "versionId": version_id,
            "periods": [
                { "periodNumber": 1, "periodName": "Lecture 1", "startTime": "09:00", "endTime": "10:30" },
                { "periodNumber": 2, "periodName": "Break", "startTime": "10:30", "endTime": "10:45", "isBreak": true },
                { "periodNumber": 6, "periodName": "Break 3", "startTime": "10:45", "endTime": "11:00", "isBreak": true }
            ]
        }),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "versions.validate",
        json!({ "versionId": version_id }),
    );
    assert_eq!(report["isValid"], false);
    let kinds: Vec<&str> = report["issues"]
        .as_array()
        .expect("issues")
        .iter()
        .map(|i| i["kind"].as_str().expect("kind"))
        .collect();
    assert!(kinds.contains(&"orphaned_schedule"), "kinds: {:?}", kinds);
    assert!(kinds.contains(&"period_sequence_gap"), "kinds: {:?}", kinds);
    assert!(!kinds.contains(&"overlapping_periods"), "kinds: {:?}", kinds);
}

#[test]
fn overlapping_period_input_is_rejected_at_the_write_path() {
    let workspace = temp_dir("timetable-validate-overlap");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "versions.create",
        json!({ "versionName": "Overlap", "effectiveFrom": "2026-09-01" }),
    );
    let version_id = created["version"]["id"].as_str().expect("id");

    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "versions.periods.replace",
        json!({
            "versionId": version_id,
            "periods": [
                { "periodNumber": 1, "periodName": "Lecture 1", "startTime": "09:00", "endTime": "10:30" },
                { "periodNumber": 3, "periodName": "Lecture 2", "startTime": "10:00", "endTime": "11:30" }
            ]
        }),
    );
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "bad_params");
}
