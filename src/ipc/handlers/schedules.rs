use crate::conflicts;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::config::enforce_conflicts;
use crate::ipc::helpers::{
    db_conn, now_ts, opt_nullable_i64, opt_nullable_str, opt_str, parse_date, parse_opt_i64,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::validate;
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension, Row};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

const SCHEDULE_COLUMNS: &str = "id, version_id, period_id, session_title, session_type,
     session_description, schedule_date, lab_id, room_name, instructor_id, instructor_name,
     class_id, group_id, student_count, max_capacity, status, color_code, notes,
     created_by, created_at, updated_at";

fn schedule_json(r: &Row) -> rusqlite::Result<JsonValue> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "versionId": r.get::<_, String>(1)?,
        "periodId": r.get::<_, String>(2)?,
        "sessionTitle": r.get::<_, String>(3)?,
        "sessionType": r.get::<_, String>(4)?,
        "sessionDescription": r.get::<_, Option<String>>(5)?,
        "scheduleDate": r.get::<_, String>(6)?,
        "labId": r.get::<_, Option<String>>(7)?,
        "roomName": r.get::<_, Option<String>>(8)?,
        "instructorId": r.get::<_, Option<String>>(9)?,
        "instructorName": r.get::<_, Option<String>>(10)?,
        "classId": r.get::<_, Option<String>>(11)?,
        "groupId": r.get::<_, Option<String>>(12)?,
        "studentCount": r.get::<_, Option<i64>>(13)?,
        "maxCapacity": r.get::<_, Option<i64>>(14)?,
        "status": r.get::<_, String>(15)?,
        "colorCode": r.get::<_, Option<String>>(16)?,
        "notes": r.get::<_, Option<String>>(17)?,
        "createdBy": r.get::<_, Option<String>>(18)?,
        "createdAt": r.get::<_, String>(19)?,
        "updatedAt": r.get::<_, String>(20)?,
    }))
}

fn load_schedule(conn: &Connection, schedule_id: &str) -> rusqlite::Result<Option<JsonValue>> {
    conn.query_row(
        &format!("SELECT {} FROM schedules WHERE id = ?", SCHEDULE_COLUMNS),
        [schedule_id],
        |r| schedule_json(r),
    )
    .optional()
}

/// Conflict detection never blocks the write path: a detector failure is
/// logged and reported as an empty conflict list.
fn detect_soft(conn: &Connection, schedule_id: &str) -> Vec<conflicts::ConflictRecord> {
    match conflicts::detect_conflicts(conn, schedule_id) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(schedule = %schedule_id, error = %e, "conflict detection failed; treating as no conflicts");
            Vec::new()
        }
    }
}

fn period_version(conn: &Connection, period_id: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT version_id FROM periods WHERE id = ?",
        [period_id],
        |r| r.get::<_, String>(0),
    )
    .optional()
}

fn handle_schedules_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let version_id = match required_str(req, "versionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period_id = match required_str(req, "periodId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let session_title = match required_str(req, "sessionTitle") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let schedule_date = match required_str(req, "scheduleDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(m) = parse_date(&schedule_date) {
        return err(&req.id, "bad_params", m, None);
    }

    match validate::version_exists(conn, &version_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "version not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match period_version(conn, &period_id) {
        Ok(Some(owner)) if owner == version_id => {}
        Ok(Some(_)) => {
            return err(
                &req.id,
                "bad_params",
                "periodId does not belong to versionId",
                None,
            )
        }
        Ok(None) => return err(&req.id, "not_found", "period not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let session_type = opt_str(req, "sessionType").unwrap_or_else(|| "lecture".to_string());
    let student_count = match parse_opt_i64(req.params.get("studentCount")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("studentCount {}", m), None),
    };
    let max_capacity = match parse_opt_i64(req.params.get("maxCapacity")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("maxCapacity {}", m), None),
    };

    let schedule_id = Uuid::new_v4().to_string();
    let now = now_ts();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO schedules(
            id, version_id, period_id, session_title, session_type, session_description,
            schedule_date, lab_id, room_name, instructor_id, instructor_name, class_id,
            group_id, student_count, max_capacity, status, color_code, notes, created_by,
            created_at, updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'scheduled', ?, ?, ?, ?, ?)",
        params![
            schedule_id,
            version_id,
            period_id,
            session_title,
            session_type,
            opt_str(req, "sessionDescription"),
            schedule_date,
            opt_str(req, "labId"),
            opt_str(req, "roomName"),
            opt_str(req, "instructorId"),
            opt_str(req, "instructorName"),
            opt_str(req, "classId"),
            opt_str(req, "groupId"),
            student_count,
            max_capacity,
            opt_str(req, "colorCode"),
            opt_str(req, "notes"),
            opt_str(req, "createdBy"),
            now,
            now
        ],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    let found = detect_soft(&tx, &schedule_id);
    if enforce_conflicts(&tx) && !found.is_empty() {
        let _ = tx.rollback();
        return err(
            &req.id,
            "conflict_detected",
            format!("{} scheduling conflict(s) detected", found.len()),
            Some(json!({
                "conflicts": serde_json::to_value(&found).unwrap_or(JsonValue::Null)
            })),
        );
    }
    if let Err(e) = conflicts::persist_conflicts(&tx, &found, &now) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    let schedule = match load_schedule(conn, &schedule_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "db_query_failed", "schedule vanished", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "schedule": schedule,
            "conflicts": serde_json::to_value(&found).unwrap_or(JsonValue::Null)
        }),
    )
}

/// Allow-listed partial update, collected into typed fields before any SQL
/// is assembled. Unknown params are ignored; an absent key keeps the stored
/// value, while an explicit null (or empty string) clears a nullable field.
/// A request that sets nothing fails instead of silently succeeding.
#[derive(Default)]
struct ScheduleUpdate {
    session_title: Option<String>,
    session_type: Option<String>,
    schedule_date: Option<String>,
    period_id: Option<String>,
    status: Option<String>,
    session_description: Option<Option<String>>,
    lab_id: Option<Option<String>>,
    room_name: Option<Option<String>>,
    instructor_id: Option<Option<String>>,
    instructor_name: Option<Option<String>>,
    class_id: Option<Option<String>>,
    group_id: Option<Option<String>>,
    color_code: Option<Option<String>>,
    notes: Option<Option<String>>,
    student_count: Option<Option<i64>>,
    max_capacity: Option<Option<i64>>,
}

impl ScheduleUpdate {
    fn from_request(req: &Request) -> Result<Self, String> {
        let u = ScheduleUpdate {
            session_title: opt_str(req, "sessionTitle"),
            session_type: opt_str(req, "sessionType"),
            schedule_date: opt_str(req, "scheduleDate"),
            period_id: opt_str(req, "periodId"),
            status: opt_str(req, "status"),
            session_description: opt_nullable_str(req, "sessionDescription"),
            lab_id: opt_nullable_str(req, "labId"),
            room_name: opt_nullable_str(req, "roomName"),
            instructor_id: opt_nullable_str(req, "instructorId"),
            instructor_name: opt_nullable_str(req, "instructorName"),
            class_id: opt_nullable_str(req, "classId"),
            group_id: opt_nullable_str(req, "groupId"),
            color_code: opt_nullable_str(req, "colorCode"),
            notes: opt_nullable_str(req, "notes"),
            student_count: opt_nullable_i64(req.params.get("studentCount"))
                .map_err(|m| format!("studentCount {}", m))?,
            max_capacity: opt_nullable_i64(req.params.get("maxCapacity"))
                .map_err(|m| format!("maxCapacity {}", m))?,
        };

        if let Some(date) = u.schedule_date.as_deref() {
            parse_date(date)?;
        }
        if let Some(status) = u.status.as_deref() {
            // `migrated` is reserved for the migrator's own status flip.
            if !matches!(status, "scheduled" | "completed" | "cancelled") {
                return Err(
                    "status must be one of: scheduled, completed, cancelled".to_string()
                );
            }
        }
        Ok(u)
    }

    fn set_clauses(&self) -> (Vec<&'static str>, Vec<Value>) {
        let mut cols: Vec<&'static str> = Vec::new();
        let mut vals: Vec<Value> = Vec::new();
        let mut push_text = |col: &'static str, v: &Option<String>| {
            if let Some(s) = v {
                cols.push(col);
                vals.push(Value::Text(s.clone()));
            }
        };
        push_text("session_title", &self.session_title);
        push_text("session_type", &self.session_type);
        push_text("schedule_date", &self.schedule_date);
        push_text("period_id", &self.period_id);
        push_text("status", &self.status);
        let mut push_nullable = |col: &'static str, v: &Option<Option<String>>| {
            if let Some(set) = v {
                cols.push(col);
                vals.push(match set {
                    Some(s) => Value::Text(s.clone()),
                    None => Value::Null,
                });
            }
        };
        push_nullable("session_description", &self.session_description);
        push_nullable("lab_id", &self.lab_id);
        push_nullable("room_name", &self.room_name);
        push_nullable("instructor_id", &self.instructor_id);
        push_nullable("instructor_name", &self.instructor_name);
        push_nullable("class_id", &self.class_id);
        push_nullable("group_id", &self.group_id);
        push_nullable("color_code", &self.color_code);
        push_nullable("notes", &self.notes);
        for (col, v) in [
            ("student_count", &self.student_count),
            ("max_capacity", &self.max_capacity),
        ] {
            if let Some(set) = v {
                cols.push(col);
                vals.push(match set {
                    Some(n) => Value::Integer(*n),
                    None => Value::Null,
                });
            }
        }
        (cols, vals)
    }
}

fn handle_schedules_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let schedule_id = match required_str(req, "scheduleId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let existing_version: Option<String> = match conn
        .query_row(
            "SELECT version_id FROM schedules WHERE id = ?",
            [&schedule_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(version_id) = existing_version else {
        return err(&req.id, "not_found", "schedule not found", None);
    };

    let update = match ScheduleUpdate::from_request(req) {
        Ok(u) => u,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let (cols, vals) = update.set_clauses();
    if cols.is_empty() {
        return err(&req.id, "no_fields", "no valid fields to update", None);
    }

    if let Some(new_period) = update.period_id.as_deref() {
        match period_version(conn, new_period) {
            Ok(Some(owner)) if owner == version_id => {}
            Ok(Some(_)) => {
                return err(
                    &req.id,
                    "bad_params",
                    "periodId does not belong to the schedule's version",
                    None,
                )
            }
            Ok(None) => return err(&req.id, "not_found", "period not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let now = now_ts();
    let assignments: Vec<String> = cols.iter().map(|c| format!("{} = ?", c)).collect();
    let sql = format!(
        "UPDATE schedules SET {}, updated_at = ? WHERE id = ?",
        assignments.join(", ")
    );
    let mut bind: Vec<Value> = vals;
    bind.push(Value::Text(now.clone()));
    bind.push(Value::Text(schedule_id.clone()));

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(&sql, params_from_iter(bind.iter())) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    // The slot may have moved; refresh the advisory records.
    if let Err(e) = conflicts::clear_conflicts_for(&tx, &schedule_id) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    let found = detect_soft(&tx, &schedule_id);
    if enforce_conflicts(&tx) && !found.is_empty() {
        let _ = tx.rollback();
        return err(
            &req.id,
            "conflict_detected",
            format!("{} scheduling conflict(s) detected", found.len()),
            Some(json!({
                "conflicts": serde_json::to_value(&found).unwrap_or(JsonValue::Null)
            })),
        );
    }
    if let Err(e) = conflicts::persist_conflicts(&tx, &found, &now) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    let schedule = match load_schedule(conn, &schedule_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "schedule not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "schedule": schedule,
            "conflicts": serde_json::to_value(&found).unwrap_or(JsonValue::Null)
        }),
    )
}

fn handle_schedules_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let schedule_id = match required_str(req, "scheduleId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM schedules WHERE id = ?",
            [&schedule_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "schedule not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM conflicts WHERE schedule_id_1 = ? OR schedule_id_2 = ?",
        params![schedule_id, schedule_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM schedules WHERE id = ?", [&schedule_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "deleted": true }))
}

fn handle_schedules_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let version_id = opt_str(req, "versionId");
    let date = opt_str(req, "date");
    if let Some(d) = date.as_deref() {
        if let Err(m) = parse_date(d) {
            return err(&req.id, "bad_params", m, None);
        }
    }

    let mut clauses: Vec<&str> = Vec::new();
    let mut bind: Vec<Value> = Vec::new();
    if let Some(v) = version_id {
        clauses.push("version_id = ?");
        bind.push(Value::Text(v));
    }
    if let Some(d) = date {
        clauses.push("schedule_date = ?");
        bind.push(Value::Text(d));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT {} FROM schedules{} ORDER BY schedule_date, id",
        SCHEDULE_COLUMNS, where_sql
    );

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let schedules = match stmt.query_map(params_from_iter(bind.iter()), |r| schedule_json(r)) {
        Ok(rows) => match rows.collect::<Result<Vec<_>, _>>() {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "schedules": schedules }))
}

fn handle_schedules_conflicts(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let schedule_id = match required_str(req, "scheduleId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, schedule_id_1, schedule_id_2, conflict_type, conflict_description, detected_at
         FROM conflicts
         WHERE schedule_id_1 = ? OR schedule_id_2 = ?
         ORDER BY detected_at, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt.query_map(params![schedule_id, schedule_id], |r| {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "scheduleId1": r.get::<_, String>(1)?,
            "scheduleId2": r.get::<_, String>(2)?,
            "conflictType": r.get::<_, String>(3)?,
            "conflictDescription": r.get::<_, String>(4)?,
            "detectedAt": r.get::<_, String>(5)?,
        }))
    }) {
        Ok(rows) => match rows.collect::<Result<Vec<_>, _>>() {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "conflicts": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schedules.create" => Some(handle_schedules_create(state, req)),
        "schedules.update" => Some(handle_schedules_update(state, req)),
        "schedules.delete" => Some(handle_schedules_delete(state, req)),
        "schedules.list" => Some(handle_schedules_list(state, req)),
        "schedules.conflicts" => Some(handle_schedules_conflicts(state, req)),
        _ => None,
    }
}
