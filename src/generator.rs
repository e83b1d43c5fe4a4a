use anyhow::bail;
use chrono::{Duration, NaiveTime};
use serde::{Deserialize, Serialize};

/// A break slot requested after the Nth lecture. `after_lecture == 0` means
/// a pre-day break (assembly) emitted before the first lecture.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakConfig {
    pub after_lecture: i64,
    pub duration_minutes: i64,
    #[serde(default)]
    pub break_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedPeriod {
    pub period_number: i64,
    pub period_name: String,
    pub start_time: String,
    pub end_time: String,
    pub duration_minutes: i64,
    pub is_break: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub break_duration_minutes: Option<i64>,
    pub display_order: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStats {
    pub lecture_periods: i64,
    pub break_periods: i64,
    pub lecture_minutes: i64,
    pub break_minutes: i64,
    pub utilization_percentage: i64,
}

/// A tail break that cannot fit another lecture after it is only kept when
/// it still leaves more than this much slack before the end of the day.
const MIN_TAIL_SLACK_MINUTES: i64 = 30;

pub fn parse_time_of_day(raw: &str) -> anyhow::Result<NaiveTime> {
    match NaiveTime::parse_from_str(raw.trim(), "%H:%M") {
        Ok(t) => Ok(t),
        Err(_) => bail!("invalid time of day: {} (expected HH:MM)", raw),
    }
}

fn fmt_time(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

fn break_period(
    period_number: i64,
    cfg: &BreakConfig,
    start: NaiveTime,
    end: NaiveTime,
    display_order: i64,
) -> GeneratedPeriod {
    let duration = (end - start).num_minutes();
    GeneratedPeriod {
        period_number,
        period_name: cfg
            .break_name
            .clone()
            .unwrap_or_else(|| "Break".to_string()),
        start_time: fmt_time(start),
        end_time: fmt_time(end),
        duration_minutes: duration,
        is_break: true,
        break_duration_minutes: Some(duration),
        display_order,
    }
}

/// Partitions a school day into lectures and breaks with a single linear
/// sweep. Lectures take odd period numbers (1, 3, 5, ...), breaks the even
/// slot after the lecture they follow; a pre-day break takes 0.
pub fn generate_periods(
    school_start: NaiveTime,
    school_end: NaiveTime,
    lecture_minutes: i64,
    breaks: &[BreakConfig],
    include_breaks: bool,
) -> anyhow::Result<(Vec<GeneratedPeriod>, GenerationStats)> {
    if school_end <= school_start {
        bail!("schoolEndTime must be after schoolStartTime");
    }
    if lecture_minutes <= 0 {
        bail!("lectureDurationMinutes must be positive");
    }
    for b in breaks {
        if b.after_lecture < 0 {
            bail!("afterLecture must be >= 0");
        }
        if b.duration_minutes <= 0 {
            bail!("break durationMinutes must be positive");
        }
    }

    let total_minutes = (school_end - school_start).num_minutes();
    let break_after = |n: i64| breaks.iter().find(|b| b.after_lecture == n);

    let mut out: Vec<GeneratedPeriod> = Vec::new();
    let mut clock = school_start;
    let mut display_order = 1i64;

    if include_breaks {
        if let Some(b) = break_after(0) {
            // A day shorter than the assembly truncates it at school end.
            let end = (clock + Duration::minutes(b.duration_minutes)).min(school_end);
            out.push(break_period(0, b, clock, end, display_order));
            display_order += 1;
            clock = end;
        }
    }

    let mut lecture_count = 1i64;
    let mut period_number = 1i64;
    loop {
        let remaining = (school_end - clock).num_minutes();
        if remaining < lecture_minutes {
            break;
        }
        let end = clock + Duration::minutes(lecture_minutes);
        out.push(GeneratedPeriod {
            period_number,
            period_name: format!("Lecture {}", lecture_count),
            start_time: fmt_time(clock),
            end_time: fmt_time(end),
            duration_minutes: lecture_minutes,
            is_break: false,
            break_duration_minutes: None,
            display_order,
        });
        display_order += 1;
        clock = end;

        if include_breaks {
            if let Some(b) = break_after(lecture_count) {
                let break_end = clock + Duration::minutes(b.duration_minutes);
                let after_break = (school_end - break_end).num_minutes();
                let fits_lecture = after_break >= lecture_minutes;
                let worthwhile_slack = after_break > MIN_TAIL_SLACK_MINUTES;
                if !fits_lecture && !worthwhile_slack {
                    // Tail break: would leave a dead stub of a day. Drop it
                    // and end the sweep.
                    break;
                }
                out.push(break_period(period_number + 1, b, clock, break_end, display_order));
                display_order += 1;
                clock = break_end;
            }
        }

        lecture_count += 1;
        period_number += 2;
    }

    let mut lecture_periods = 0i64;
    let mut break_periods = 0i64;
    let mut lecture_total = 0i64;
    let mut break_total = 0i64;
    for p in &out {
        if p.is_break {
            break_periods += 1;
            break_total += p.duration_minutes;
        } else {
            lecture_periods += 1;
            lecture_total += p.duration_minutes;
        }
    }
    let utilization_percentage = if total_minutes > 0 {
        ((lecture_total as f64) / (total_minutes as f64) * 100.0).round() as i64
    } else {
        0
    };

    Ok((
        out,
        GenerationStats {
            lecture_periods,
            break_periods,
            lecture_minutes: lecture_total,
            break_minutes: break_total,
            utilization_percentage,
        },
    ))
}
