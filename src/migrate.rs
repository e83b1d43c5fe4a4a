use chrono::NaiveDate;
use rusqlite::{params, Transaction};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSummary {
    pub schedules_migrated: i64,
    /// Source schedules left behind because their period number has no
    /// counterpart in the target version.
    pub skipped_schedule_ids: Vec<String>,
    pub unmapped_period_numbers: Vec<i64>,
    pub migrated_at: String,
}

struct EligibleSchedule {
    id: String,
    period_id: String,
    session_title: String,
    session_type: String,
    session_description: Option<String>,
    schedule_date: String,
    lab_id: Option<String>,
    room_name: Option<String>,
    instructor_id: Option<String>,
    instructor_name: Option<String>,
    class_id: Option<String>,
    group_id: Option<String>,
    student_count: Option<i64>,
    max_capacity: Option<i64>,
    color_code: Option<String>,
    notes: Option<String>,
    created_by: Option<String>,
}

/// Copies future-dated, still-scheduled entries from one version into
/// another, rewriting each period reference by period number. Originals are
/// kept for audit: their status flips to `migrated` and a note line is
/// appended. Runs inside the caller's version-creation transaction so a
/// failure here aborts the whole creation.
pub fn migrate_future_schedules(
    tx: &Transaction,
    from_version_id: &str,
    to_version_id: &str,
    effective_from: NaiveDate,
    now: &str,
) -> anyhow::Result<MigrationSummary> {
    let cutoff = effective_from.format("%Y-%m-%d").to_string();

    // period_number -> period id, per version.
    let mut period_map: HashMap<i64, String> = HashMap::new();
    {
        let mut stmt =
            tx.prepare("SELECT period_number, id FROM periods WHERE version_id = ?")?;
        let rows = stmt.query_map([to_version_id], |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (number, id) = row?;
            period_map.insert(number, id);
        }
    }
    let mut source_numbers: HashMap<String, i64> = HashMap::new();
    {
        let mut stmt =
            tx.prepare("SELECT id, period_number FROM periods WHERE version_id = ?")?;
        let rows = stmt.query_map([from_version_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (id, number) = row?;
            source_numbers.insert(id, number);
        }
    }

    let eligible: Vec<EligibleSchedule> = {
        let mut stmt = tx.prepare(
            "SELECT id, period_id, session_title, session_type, session_description,
                    schedule_date, lab_id, room_name, instructor_id, instructor_name,
                    class_id, group_id, student_count, max_capacity, color_code, notes,
                    created_by
             FROM schedules
             WHERE version_id = ? AND schedule_date >= ? AND status = 'scheduled'
             ORDER BY schedule_date, id",
        )?;
        let rows = stmt.query_map(params![from_version_id, cutoff], |r| {
            Ok(EligibleSchedule {
                id: r.get(0)?,
                period_id: r.get(1)?,
                session_title: r.get(2)?,
                session_type: r.get(3)?,
                session_description: r.get(4)?,
                schedule_date: r.get(5)?,
                lab_id: r.get(6)?,
                room_name: r.get(7)?,
                instructor_id: r.get(8)?,
                instructor_name: r.get(9)?,
                class_id: r.get(10)?,
                group_id: r.get(11)?,
                student_count: r.get(12)?,
                max_capacity: r.get(13)?,
                color_code: r.get(14)?,
                notes: r.get(15)?,
                created_by: r.get(16)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let mut migrated = 0i64;
    let mut skipped_ids: Vec<String> = Vec::new();
    let mut unmapped: Vec<i64> = Vec::new();

    for sched in &eligible {
        let Some(number) = source_numbers.get(&sched.period_id) else {
            // Orphaned period reference; the validator reports these.
            skipped_ids.push(sched.id.clone());
            continue;
        };
        let Some(target_period_id) = period_map.get(number) else {
            if !unmapped.contains(number) {
                unmapped.push(*number);
            }
            skipped_ids.push(sched.id.clone());
            continue;
        };

        let new_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO schedules(
                id, version_id, period_id, session_title, session_type,
                session_description, schedule_date, lab_id, room_name,
                instructor_id, instructor_name, class_id, group_id,
                student_count, max_capacity, status, color_code, notes,
                created_by, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'scheduled', ?, ?, ?, ?, ?)",
            params![
                new_id,
                to_version_id,
                target_period_id,
                sched.session_title,
                sched.session_type,
                sched.session_description,
                sched.schedule_date,
                sched.lab_id,
                sched.room_name,
                sched.instructor_id,
                sched.instructor_name,
                sched.class_id,
                sched.group_id,
                sched.student_count,
                sched.max_capacity,
                sched.color_code,
                sched.notes,
                sched.created_by,
                now,
                now,
            ],
        )?;

        let audit_line = format!("[migrated to version {} on {}]", to_version_id, now);
        let notes = match sched.notes.as_deref() {
            Some(prior) if !prior.trim().is_empty() => format!("{}\n{}", prior, audit_line),
            _ => audit_line,
        };
        tx.execute(
            "UPDATE schedules SET status = 'migrated', notes = ?, updated_at = ? WHERE id = ?",
            params![notes, now, sched.id],
        )?;
        migrated += 1;
    }

    unmapped.sort_unstable();

    Ok(MigrationSummary {
        schedules_migrated: migrated,
        skipped_schedule_ids: skipped_ids,
        unmapped_period_numbers: unmapped,
        migrated_at: now.to_string(),
    })
}
