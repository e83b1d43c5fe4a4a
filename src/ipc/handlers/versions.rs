use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, now_ts, opt_str, parse_bool, parse_opt_i64, required_date, required_str, today,
};
use crate::ipc::types::{AppState, Request};
use crate::migrate;
use crate::validate;
use chrono::Duration;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

const VERSION_COLUMNS: &str = "id, version_number, version_name, description, effective_from,
     effective_until, is_active, created_by, created_at, updated_at";

fn version_json(r: &Row) -> rusqlite::Result<JsonValue> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "versionNumber": r.get::<_, i64>(1)?,
        "versionName": r.get::<_, String>(2)?,
        "description": r.get::<_, String>(3)?,
        "effectiveFrom": r.get::<_, String>(4)?,
        "effectiveUntil": r.get::<_, Option<String>>(5)?,
        "isActive": r.get::<_, i64>(6)? != 0,
        "createdBy": r.get::<_, Option<String>>(7)?,
        "createdAt": r.get::<_, String>(8)?,
        "updatedAt": r.get::<_, String>(9)?,
    }))
}

fn load_version(conn: &Connection, version_id: &str) -> rusqlite::Result<Option<JsonValue>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM timetable_versions WHERE id = ?",
            VERSION_COLUMNS
        ),
        [version_id],
        |r| version_json(r),
    )
    .optional()
}

fn period_json(r: &Row) -> rusqlite::Result<JsonValue> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "versionId": r.get::<_, String>(1)?,
        "periodNumber": r.get::<_, i64>(2)?,
        "periodName": r.get::<_, String>(3)?,
        "startTime": r.get::<_, String>(4)?,
        "endTime": r.get::<_, String>(5)?,
        "durationMinutes": r.get::<_, i64>(6)?,
        "isBreak": r.get::<_, i64>(7)? != 0,
        "breakDurationMinutes": r.get::<_, Option<i64>>(8)?,
        "displayOrder": r.get::<_, i64>(9)?,
        "isActive": r.get::<_, i64>(10)? != 0,
    }))
}

const PERIOD_COLUMNS: &str = "id, version_id, period_number, period_name, start_time, end_time,
     duration_minutes, is_break, break_duration_minutes, display_order, is_active";

fn handle_versions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(&format!(
        "SELECT {} FROM timetable_versions ORDER BY version_number",
        VERSION_COLUMNS
    )) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let versions = match stmt.query_map([], |r| version_json(r)) {
        Ok(rows) => match rows.collect::<Result<Vec<_>, _>>() {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "versions": versions }))
}

fn handle_versions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let version_name = match required_str(req, "versionName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let effective_from = match required_date(req, "effectiveFrom") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let description = opt_str(req, "description").unwrap_or_default();
    let created_by = opt_str(req, "createdBy");
    let copy_from = opt_str(req, "copyFromVersionId");
    let copy_schedules = match parse_bool(req.params.get("copySchedules"), false) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("copySchedules {}", m), None),
    };

    if let Some(src) = copy_from.as_deref() {
        match validate::version_exists(conn, src) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "copyFromVersionId not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let next_number: i64 = match tx.query_row(
        "SELECT COALESCE(MAX(version_number), 0) + 1 FROM timetable_versions",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let version_id = Uuid::new_v4().to_string();
    let now = now_ts();
    let from_str = effective_from.format("%Y-%m-%d").to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO timetable_versions(
            id, version_number, version_name, description, effective_from,
            effective_until, is_active, created_by, created_at, updated_at
         ) VALUES (?, ?, ?, ?, ?, NULL, 0, ?, ?, ?)",
        params![
            version_id,
            next_number,
            version_name,
            description,
            from_str,
            created_by,
            now,
            now
        ],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    if let Some(src) = copy_from.as_deref() {
        if let Err(e) = copy_periods(&tx, src, &version_id) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }

    // Future bookings only move when the new version starts strictly in the
    // future; a version effective today or earlier governs no unseen dates.
    let mut migration: Option<migrate::MigrationSummary> = None;
    if copy_schedules {
        if let Some(src) = copy_from.as_deref() {
            if effective_from > today() {
                match migrate::migrate_future_schedules(&tx, src, &version_id, effective_from, &now)
                {
                    Ok(summary) => migration = Some(summary),
                    Err(e) => {
                        let _ = tx.rollback();
                        return err(&req.id, "migration_failed", e.to_string(), None);
                    }
                }
            }
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    let version = match load_version(conn, &version_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "db_query_failed", "version vanished", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    tracing::info!(version = %version_id, number = next_number, "version created");

    let migration_json = migration
        .map(|m| serde_json::to_value(&m).unwrap_or(JsonValue::Null))
        .unwrap_or(JsonValue::Null);
    ok(
        &req.id,
        json!({ "version": version, "migration": migration_json }),
    )
}

fn copy_periods(
    tx: &rusqlite::Transaction,
    from_version_id: &str,
    to_version_id: &str,
) -> anyhow::Result<()> {
    let mut stmt = tx.prepare(
        "SELECT period_number, period_name, start_time, end_time, duration_minutes,
                is_break, break_duration_minutes, display_order, is_active
         FROM periods WHERE version_id = ? ORDER BY display_order",
    )?;
    let rows = stmt.query_map([from_version_id], |r| {
        Ok((
            r.get::<_, i64>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, i64>(4)?,
            r.get::<_, i64>(5)?,
            r.get::<_, Option<i64>>(6)?,
            r.get::<_, i64>(7)?,
            r.get::<_, i64>(8)?,
        ))
    })?;
    for row in rows {
        let (number, name, start, end, duration, is_break, break_minutes, order, active) = row?;
        tx.execute(
            "INSERT INTO periods(
                id, version_id, period_number, period_name, start_time, end_time,
                duration_minutes, is_break, break_duration_minutes, display_order, is_active
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                Uuid::new_v4().to_string(),
                to_version_id,
                number,
                name,
                start,
                end,
                duration,
                is_break,
                break_minutes,
                order,
                active
            ],
        )?;
    }
    Ok(())
}

fn handle_versions_resolve_active(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let date = match opt_str(req, "date") {
        Some(raw) => match crate::ipc::helpers::parse_date(&raw) {
            Ok(d) => d,
            Err(m) => return err(&req.id, "bad_params", m, None),
        },
        None => today(),
    };
    let date_str = date.format("%Y-%m-%d").to_string();

    // Latest effective_from wins; creation order breaks ties.
    let version = match conn
        .query_row(
            &format!(
                "SELECT {} FROM timetable_versions
                 WHERE effective_from <= ?
                 ORDER BY effective_from DESC, created_at DESC, rowid DESC
                 LIMIT 1",
                VERSION_COLUMNS
            ),
            [&date_str],
            |r| version_json(r),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({ "date": date_str, "version": version.unwrap_or(JsonValue::Null) }),
    )
}

fn handle_versions_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let version_id = match required_str(req, "versionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let effective_date = match required_date(req, "effectiveDate") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match validate::version_exists(conn, &version_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "version not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let now = now_ts();
    let from_str = effective_date.format("%Y-%m-%d").to_string();
    let until_str = (effective_date - Duration::days(1))
        .format("%Y-%m-%d")
        .to_string();

    // Deactivate-then-activate in one transaction keeps the single-active
    // invariant visible at every commit point.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE timetable_versions
         SET effective_until = ?, is_active = 0, updated_at = ?
         WHERE is_active = 1 AND id != ?",
        params![until_str, now, version_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "UPDATE timetable_versions
         SET effective_from = ?, effective_until = NULL, is_active = 1, updated_at = ?
         WHERE id = ?",
        params![from_str, now, version_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    tracing::info!(version = %version_id, effective = %from_str, "version activated");
    match load_version(conn, &version_id) {
        Ok(Some(v)) => ok(&req.id, json!({ "version": v })),
        Ok(None) => err(&req.id, "not_found", "version not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_versions_archive_older_than(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let cutoff = match required_date(req, "cutoffDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let cutoff_str = cutoff.format("%Y-%m-%d").to_string();
    let now = now_ts();
    // Only rows that actually flip are touched, so repeat sweeps report 0
    // and leave updated_at alone.
    let archived = match conn.execute(
        "UPDATE timetable_versions
         SET is_active = 0, updated_at = ?
         WHERE effective_until IS NOT NULL AND effective_until < ? AND is_active = 1",
        params![now, cutoff_str],
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "archivedCount": archived }))
}

fn handle_versions_periods_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let version_id = match required_str(req, "versionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match validate::version_exists(conn, &version_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "version not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let mut stmt = match conn.prepare(&format!(
        "SELECT {} FROM periods WHERE version_id = ? ORDER BY display_order",
        PERIOD_COLUMNS
    )) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let periods = match stmt.query_map([&version_id], |r| period_json(r)) {
        Ok(rows) => match rows.collect::<Result<Vec<_>, _>>() {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "periods": periods }))
}

struct PeriodInput {
    period_number: i64,
    period_name: String,
    start_time: String,
    end_time: String,
    duration_minutes: i64,
    is_break: bool,
    break_duration_minutes: Option<i64>,
    display_order: i64,
    is_active: bool,
}

fn parse_period_input(raw: &JsonValue, index: usize) -> Result<PeriodInput, String> {
    let obj = raw
        .as_object()
        .ok_or_else(|| format!("periods[{}] must be an object", index))?;
    let period_number = obj
        .get("periodNumber")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| format!("periods[{}].periodNumber must be integer", index))?;
    let period_name = obj
        .get("periodName")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("periods[{}].periodName must be a non-empty string", index))?;
    let start_time = obj
        .get("startTime")
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("periods[{}].startTime is required", index))?;
    let end_time = obj
        .get("endTime")
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("periods[{}].endTime is required", index))?;
    let start = crate::generator::parse_time_of_day(start_time)
        .map_err(|e| format!("periods[{}]: {}", index, e))?;
    let end = crate::generator::parse_time_of_day(end_time)
        .map_err(|e| format!("periods[{}]: {}", index, e))?;
    if end <= start {
        return Err(format!("periods[{}]: endTime must be after startTime", index));
    }
    let is_break = obj
        .get("isBreak")
        .map(|v| v.as_bool().ok_or(()))
        .transpose()
        .map_err(|_| format!("periods[{}].isBreak must be boolean", index))?
        .unwrap_or(false);
    let break_duration_minutes = parse_opt_i64(obj.get("breakDurationMinutes"))
        .map_err(|m| format!("periods[{}].breakDurationMinutes {}", index, m))?;
    let display_order = parse_opt_i64(obj.get("displayOrder"))
        .map_err(|m| format!("periods[{}].displayOrder {}", index, m))?
        .unwrap_or(index as i64 + 1);
    let is_active = obj
        .get("isActive")
        .map(|v| v.as_bool().ok_or(()))
        .transpose()
        .map_err(|_| format!("periods[{}].isActive must be boolean", index))?
        .unwrap_or(true);

    Ok(PeriodInput {
        period_number,
        period_name,
        start_time: start.format("%H:%M").to_string(),
        end_time: end.format("%H:%M").to_string(),
        duration_minutes: (end - start).num_minutes(),
        is_break,
        break_duration_minutes,
        display_order,
        is_active,
    })
}

fn handle_versions_periods_replace(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let version_id = match required_str(req, "versionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match validate::version_exists(conn, &version_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "version not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let Some(raw_periods) = req.params.get("periods").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing periods array", None);
    };

    let mut inputs: Vec<PeriodInput> = Vec::with_capacity(raw_periods.len());
    for (i, raw) in raw_periods.iter().enumerate() {
        match parse_period_input(raw, i) {
            Ok(p) => inputs.push(p),
            Err(m) => return err(&req.id, "bad_params", m, None),
        }
    }

    // The no-overlap invariant is enforced at the write path; the validator
    // only re-checks it for data written by older builds.
    for i in 0..inputs.len() {
        for j in (i + 1)..inputs.len() {
            let a = &inputs[i];
            let b = &inputs[j];
            if a.start_time < b.end_time && b.start_time < a.end_time {
                return err(
                    &req.id,
                    "bad_params",
                    format!(
                        "periods '{}' and '{}' overlap",
                        a.period_name, b.period_name
                    ),
                    None,
                );
            }
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM periods WHERE version_id = ?", [&version_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    for p in &inputs {
        if let Err(e) = tx.execute(
            "INSERT INTO periods(
                id, version_id, period_number, period_name, start_time, end_time,
                duration_minutes, is_break, break_duration_minutes, display_order, is_active
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                Uuid::new_v4().to_string(),
                version_id,
                p.period_number,
                p.period_name,
                p.start_time,
                p.end_time,
                p.duration_minutes,
                p.is_break,
                p.break_duration_minutes,
                p.display_order,
                p.is_active
            ],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    handle_versions_periods_list(state, req)
}

fn handle_versions_validate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let version_id = match required_str(req, "versionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match validate::version_exists(conn, &version_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "version not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match validate::validate_version(conn, &version_id) {
        Ok(report) => ok(
            &req.id,
            serde_json::to_value(&report).unwrap_or(JsonValue::Null),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "versions.list" => Some(handle_versions_list(state, req)),
        "versions.create" => Some(handle_versions_create(state, req)),
        "versions.resolveActive" => Some(handle_versions_resolve_active(state, req)),
        "versions.activate" => Some(handle_versions_activate(state, req)),
        "versions.archiveOlderThan" => Some(handle_versions_archive_older_than(state, req)),
        "versions.periods.list" => Some(handle_versions_periods_list(state, req)),
        "versions.periods.replace" => Some(handle_versions_periods_replace(state, req)),
        "versions.validate" => Some(handle_versions_validate(state, req)),
        _ => None,
    }
}
