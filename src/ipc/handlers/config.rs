use crate::db;
use crate::generator::{self, BreakConfig};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, parse_bool, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

const SETTINGS_KEY: &str = "setup.timetable";

const WEEKDAYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

fn default_config() -> Value {
    json!({
        "maxLecturesPerDay": 8,
        "lectureDurationMinutes": 90,
        "breakDurationMinutes": 15,
        "schoolStartTime": "09:00",
        "schoolEndTime": "17:00",
        "workingDays": ["monday", "tuesday", "wednesday", "thursday", "friday"],
        "enforceConflicts": false
    })
}

fn load_config(conn: &rusqlite::Connection) -> anyhow::Result<Value> {
    let mut merged = default_config();
    if let Some(stored) = db::settings_get_json(conn, SETTINGS_KEY)? {
        if let (Some(dst), Some(src)) = (merged.as_object_mut(), stored.as_object()) {
            for (k, v) in src {
                dst.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(merged)
}

/// Whether schedule writes are rejected on detected conflicts. Advisory
/// detection is the default; this flag opts callers into hard rejection.
pub fn enforce_conflicts(conn: &rusqlite::Connection) -> bool {
    load_config(conn)
        .ok()
        .and_then(|c| c.get("enforceConflicts").and_then(|v| v.as_bool()))
        .unwrap_or(false)
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_time_value(v: &Value, key: &str) -> Result<String, String> {
    let raw = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let t = generator::parse_time_of_day(raw).map_err(|e| format!("{}: {}", key, e))?;
    Ok(t.format("%H:%M").to_string())
}

fn merge_config_patch(current: &mut Value, patch: &Map<String, Value>) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal config must be a JSON object".to_string())?;
    for (k, v) in patch {
        match k.as_str() {
            "maxLecturesPerDay" => {
                obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 16)?));
            }
            "lectureDurationMinutes" => {
                obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 15, 240)?));
            }
            "breakDurationMinutes" => {
                obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 5, 120)?));
            }
            "schoolStartTime" | "schoolEndTime" => {
                obj.insert(k.clone(), Value::String(parse_time_value(v, k)?));
            }
            "workingDays" => {
                let arr = v
                    .as_array()
                    .ok_or_else(|| "workingDays must be an array of day names".to_string())?;
                let mut days: Vec<String> = Vec::with_capacity(arr.len());
                for item in arr {
                    let day = item
                        .as_str()
                        .map(|s| s.trim().to_ascii_lowercase())
                        .filter(|s| WEEKDAYS.contains(&s.as_str()))
                        .ok_or_else(|| {
                            "workingDays entries must be weekday names (monday..sunday)"
                                .to_string()
                        })?;
                    if !days.contains(&day) {
                        days.push(day);
                    }
                }
                if days.is_empty() {
                    return Err("workingDays must not be empty".to_string());
                }
                obj.insert(
                    k.clone(),
                    Value::Array(days.into_iter().map(Value::String).collect()),
                );
            }
            "enforceConflicts" => {
                let b = v
                    .as_bool()
                    .ok_or_else(|| "enforceConflicts must be boolean".to_string())?;
                obj.insert(k.clone(), Value::Bool(b));
            }
            _ => return Err(format!("unknown config field: {}", k)),
        }
    }

    // Cross-field check after the merge so a patch can move both ends.
    let start = obj
        .get("schoolStartTime")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let end = obj
        .get("schoolEndTime")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if !start.is_empty() && !end.is_empty() && end <= start {
        return Err("schoolEndTime must be after schoolStartTime".to_string());
    }
    Ok(())
}

fn handle_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match load_config(conn) {
        Ok(config) => ok(&req.id, json!({ "config": config })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_config_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };
    if patch.is_empty() {
        return err(&req.id, "no_fields", "no valid fields to update", None);
    }

    let mut config = match load_config(conn) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(m) = merge_config_patch(&mut config, patch) {
        return err(&req.id, "bad_params", m, None);
    }
    if let Err(e) = db::settings_set_json(conn, SETTINGS_KEY, &config) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "config": config }))
}

fn handle_config_generate_periods(state: &mut AppState, req: &Request) -> serde_json::Value {
    // Requires a workspace like every other method, even though nothing is
    // persisted; defaults come from the stored config.
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let config = match load_config(conn) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let start_raw = match required_str(req, "schoolStartTime") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end_raw = match required_str(req, "schoolEndTime") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start = match generator::parse_time_of_day(&start_raw) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };
    let end = match generator::parse_time_of_day(&end_raw) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };
    let lecture_minutes = match req.params.get("lectureDurationMinutes") {
        Some(v) => match v.as_i64() {
            Some(n) => n,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "lectureDurationMinutes must be integer",
                    None,
                )
            }
        },
        None => config
            .get("lectureDurationMinutes")
            .and_then(|v| v.as_i64())
            .unwrap_or(90),
    };
    let include_breaks = match parse_bool(req.params.get("includeBreaks"), true) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("includeBreaks {}", m), None),
    };
    let breaks: Vec<BreakConfig> = match req.params.get("breakConfigurations") {
        None => Vec::new(),
        Some(v) if v.is_null() => Vec::new(),
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(b) => b,
            Err(e) => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("breakConfigurations: {}", e),
                    None,
                )
            }
        },
    };

    match generator::generate_periods(start, end, lecture_minutes, &breaks, include_breaks) {
        Ok((periods, stats)) => ok(
            &req.id,
            json!({
                "periods": serde_json::to_value(&periods).unwrap_or(Value::Null),
                "stats": serde_json::to_value(&stats).unwrap_or(Value::Null),
            }),
        ),
        Err(e) => err(&req.id, "bad_params", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "config.get" => Some(handle_config_get(state, req)),
        "config.update" => Some(handle_config_update(state, req)),
        "config.generatePeriods" => Some(handle_config_generate_periods(state, req)),
        _ => None,
    }
}
