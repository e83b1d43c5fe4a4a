use rusqlite::params;
use rusqlite::Connection;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
}

/// Structural integrity checks over one version: orphaned schedules, gaps in
/// the period number sequence, overlapping period windows. Read-only; issues
/// are reported, never auto-repaired.
pub fn validate_version(conn: &Connection, version_id: &str) -> anyhow::Result<ValidationReport> {
    let mut issues: Vec<ValidationIssue> = Vec::new();

    // Schedules whose period does not resolve within the same version.
    {
        let mut stmt = conn.prepare(
            "SELECT s.id
             FROM schedules s
             LEFT JOIN periods p ON p.id = s.period_id AND p.version_id = s.version_id
             WHERE s.version_id = ? AND p.id IS NULL
             ORDER BY s.id",
        )?;
        let orphans = stmt
            .query_map([version_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for id in orphans {
            issues.push(ValidationIssue {
                kind: "orphaned_schedule".to_string(),
                message: format!("schedule {} references a period outside this version", id),
            });
        }
    }

    let periods: Vec<(i64, String, String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT period_number, period_name, start_time, end_time
             FROM periods
             WHERE version_id = ?
             ORDER BY period_number",
        )?;
        let rows = stmt.query_map([version_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    for pair in periods.windows(2) {
        let (prev_number, _, _, _) = &pair[0];
        let (next_number, _, _, _) = &pair[1];
        let jump = next_number - prev_number;
        // Lectures take odd numbers, so a day without breaks legitimately
        // runs 1, 3, 5, ... A jump of 2 between two odd numbers is that
        // convention; everything wider (or an even slot skipped over) is a
        // real gap.
        let odd_stride = jump == 2 && prev_number % 2 == 1 && next_number % 2 == 1;
        if jump > 1 && !odd_stride {
            issues.push(ValidationIssue {
                kind: "period_sequence_gap".to_string(),
                message: format!(
                    "period numbers jump from {} to {}",
                    prev_number, next_number
                ),
            });
        }
    }

    for i in 0..periods.len() {
        for j in (i + 1)..periods.len() {
            let (_, name_a, start_a, end_a) = &periods[i];
            let (_, name_b, start_b, end_b) = &periods[j];
            if start_a < end_b && start_b < end_a {
                issues.push(ValidationIssue {
                    kind: "overlapping_periods".to_string(),
                    message: format!(
                        "'{}' ({}-{}) overlaps '{}' ({}-{})",
                        name_a, start_a, end_a, name_b, start_b, end_b
                    ),
                });
            }
        }
    }

    Ok(ValidationReport {
        is_valid: issues.is_empty(),
        issues,
    })
}

/// Quick existence probe shared by handlers that take a versionId.
pub fn version_exists(conn: &Connection, version_id: &str) -> anyhow::Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM timetable_versions WHERE id = ?",
        params![version_id],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}
