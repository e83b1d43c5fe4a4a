use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("timetable.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_versions(
            id TEXT PRIMARY KEY,
            version_number INTEGER NOT NULL,
            version_name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            effective_from TEXT NOT NULL,
            effective_until TEXT,
            is_active INTEGER NOT NULL DEFAULT 0,
            created_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_versions_effective_from ON timetable_versions(effective_from)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS periods(
            id TEXT PRIMARY KEY,
            version_id TEXT NOT NULL,
            period_number INTEGER NOT NULL,
            period_name TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL,
            is_break INTEGER NOT NULL DEFAULT 0,
            break_duration_minutes INTEGER,
            display_order INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(version_id) REFERENCES timetable_versions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_periods_version ON periods(version_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_periods_version_order ON periods(version_id, display_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedules(
            id TEXT PRIMARY KEY,
            version_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            session_title TEXT NOT NULL,
            session_type TEXT NOT NULL DEFAULT 'lecture',
            session_description TEXT,
            schedule_date TEXT NOT NULL,
            lab_id TEXT,
            room_name TEXT,
            instructor_id TEXT,
            instructor_name TEXT,
            class_id TEXT,
            group_id TEXT,
            student_count INTEGER,
            max_capacity INTEGER,
            status TEXT NOT NULL DEFAULT 'scheduled',
            color_code TEXT,
            notes TEXT,
            created_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(version_id) REFERENCES timetable_versions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedules_version ON schedules(version_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedules_date ON schedules(schedule_date)",
        [],
    )?;
    // Conflict scans filter on date first, then the colliding dimension.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedules_date_lab ON schedules(schedule_date, lab_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS conflicts(
            id TEXT PRIMARY KEY,
            schedule_id_1 TEXT NOT NULL,
            schedule_id_2 TEXT NOT NULL,
            conflict_type TEXT NOT NULL,
            conflict_description TEXT NOT NULL,
            detected_at TEXT NOT NULL,
            FOREIGN KEY(schedule_id_1) REFERENCES schedules(id),
            FOREIGN KEY(schedule_id_2) REFERENCES schedules(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_conflicts_schedule ON conflicts(schedule_id_1)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    // Existing workspaces may predate the created_by column on versions.
    ensure_versions_created_by(&conn)?;

    Ok(conn)
}

fn ensure_versions_created_by(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "timetable_versions", "created_by")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE timetable_versions ADD COLUMN created_by TEXT",
        [],
    )?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let raw = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, raw),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
