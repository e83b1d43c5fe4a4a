use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

pub const CONFLICT_LAB: &str = "lab_double_booked";
pub const CONFLICT_INSTRUCTOR: &str = "instructor_double_booked";
pub const CONFLICT_CLASS: &str = "class_double_booked";
pub const CONFLICT_GROUP: &str = "group_double_booked";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub schedule_id_1: String,
    pub schedule_id_2: String,
    pub conflict_type: String,
    pub conflict_description: String,
}

struct ScheduleSlot {
    id: String,
    schedule_date: String,
    start_time: String,
    end_time: String,
    lab_id: Option<String>,
    instructor_id: Option<String>,
    class_id: Option<String>,
    group_id: Option<String>,
    session_title: String,
}

fn load_slot(conn: &Connection, schedule_id: &str) -> anyhow::Result<Option<ScheduleSlot>> {
    let row = conn
        .query_row(
            "SELECT s.id, s.schedule_date, p.start_time, p.end_time,
                    s.lab_id, s.instructor_id, s.class_id, s.group_id, s.session_title
             FROM schedules s
             JOIN periods p ON p.id = s.period_id
             WHERE s.id = ?",
            [schedule_id],
            |r| {
                Ok(ScheduleSlot {
                    id: r.get(0)?,
                    schedule_date: r.get(1)?,
                    start_time: r.get(2)?,
                    end_time: r.get(3)?,
                    lab_id: r.get(4)?,
                    instructor_id: r.get(5)?,
                    class_id: r.get(6)?,
                    group_id: r.get(7)?,
                    session_title: r.get(8)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn same_key(a: &Option<String>, b: &Option<String>) -> bool {
    matches!((a, b), (Some(x), Some(y)) if x == y)
}

/// Pairwise overlap scan for one schedule against every other live schedule
/// on the same date. Cancelled entries and migrated audit copies occupy no
/// slot, so they never collide. One record per colliding dimension per pair.
/// Detection only; callers decide whether to persist or enforce.
pub fn detect_conflicts(
    conn: &Connection,
    schedule_id: &str,
) -> anyhow::Result<Vec<ConflictRecord>> {
    let Some(subject) = load_slot(conn, schedule_id)? else {
        return Ok(Vec::new());
    };

    let others: Vec<ScheduleSlot> = {
        let mut stmt = conn.prepare(
            "SELECT s.id, s.schedule_date, p.start_time, p.end_time,
                    s.lab_id, s.instructor_id, s.class_id, s.group_id, s.session_title
             FROM schedules s
             JOIN periods p ON p.id = s.period_id
             WHERE s.schedule_date = ? AND s.id != ?
               AND s.status NOT IN ('cancelled', 'migrated')
             ORDER BY s.id",
        )?;
        let rows = stmt.query_map(params![subject.schedule_date, subject.id], |r| {
            Ok(ScheduleSlot {
                id: r.get(0)?,
                schedule_date: r.get(1)?,
                start_time: r.get(2)?,
                end_time: r.get(3)?,
                lab_id: r.get(4)?,
                instructor_id: r.get(5)?,
                class_id: r.get(6)?,
                group_id: r.get(7)?,
                session_title: r.get(8)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let mut out = Vec::new();
    for other in &others {
        // Half-open [start, end) interval intersection on HH:MM strings;
        // lexicographic order matches chronological order for this format.
        let overlaps =
            subject.start_time < other.end_time && other.start_time < subject.end_time;
        if !overlaps {
            continue;
        }

        if same_key(&subject.lab_id, &other.lab_id) {
            out.push(ConflictRecord {
                schedule_id_1: subject.id.clone(),
                schedule_id_2: other.id.clone(),
                conflict_type: CONFLICT_LAB.to_string(),
                conflict_description: format!(
                    "lab {} double-booked on {}: '{}' overlaps '{}'",
                    subject.lab_id.as_deref().unwrap_or(""),
                    subject.schedule_date,
                    subject.session_title,
                    other.session_title
                ),
            });
        }
        if same_key(&subject.instructor_id, &other.instructor_id) {
            out.push(ConflictRecord {
                schedule_id_1: subject.id.clone(),
                schedule_id_2: other.id.clone(),
                conflict_type: CONFLICT_INSTRUCTOR.to_string(),
                conflict_description: format!(
                    "instructor {} double-booked on {}: '{}' overlaps '{}'",
                    subject.instructor_id.as_deref().unwrap_or(""),
                    subject.schedule_date,
                    subject.session_title,
                    other.session_title
                ),
            });
        }
        if same_key(&subject.class_id, &other.class_id) {
            out.push(ConflictRecord {
                schedule_id_1: subject.id.clone(),
                schedule_id_2: other.id.clone(),
                conflict_type: CONFLICT_CLASS.to_string(),
                conflict_description: format!(
                    "class {} double-booked on {}: '{}' overlaps '{}'",
                    subject.class_id.as_deref().unwrap_or(""),
                    subject.schedule_date,
                    subject.session_title,
                    other.session_title
                ),
            });
        }
        if same_key(&subject.group_id, &other.group_id) {
            out.push(ConflictRecord {
                schedule_id_1: subject.id.clone(),
                schedule_id_2: other.id.clone(),
                conflict_type: CONFLICT_GROUP.to_string(),
                conflict_description: format!(
                    "group {} double-booked on {}: '{}' overlaps '{}'",
                    subject.group_id.as_deref().unwrap_or(""),
                    subject.schedule_date,
                    subject.session_title,
                    other.session_title
                ),
            });
        }
    }

    Ok(out)
}

pub fn persist_conflicts(
    conn: &Connection,
    conflicts: &[ConflictRecord],
    now: &str,
) -> anyhow::Result<()> {
    for c in conflicts {
        conn.execute(
            "INSERT INTO conflicts(id, schedule_id_1, schedule_id_2, conflict_type, conflict_description, detected_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                Uuid::new_v4().to_string(),
                c.schedule_id_1,
                c.schedule_id_2,
                c.conflict_type,
                c.conflict_description,
                now,
            ],
        )?;
    }
    Ok(())
}

/// Stale advisory rows for a schedule are replaced whenever it is re-checked.
pub fn clear_conflicts_for(conn: &Connection, schedule_id: &str) -> anyhow::Result<()> {
    conn.execute(
        "DELETE FROM conflicts WHERE schedule_id_1 = ? OR schedule_id_2 = ?",
        params![schedule_id, schedule_id],
    )?;
    Ok(())
}
