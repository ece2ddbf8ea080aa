use std::collections::HashMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{ProgressRow, ProgressStatus, Student};

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSummary {
    pub status: ProgressStatus,
    pub count: usize,
    pub avg_score: Option<f64>,
}

pub fn summarize_by_status(rows: &[ProgressRow]) -> Vec<StatusSummary> {
    let mut map: HashMap<ProgressStatus, (usize, f64, usize)> = HashMap::new();

    for row in rows {
        let entry = map.entry(row.status).or_insert((0, 0.0, 0));
        entry.0 += 1;
        if let Some(score) = row.rolling_metrics.average_score {
            entry.1 += score;
            entry.2 += 1;
        }
    }

    let mut summaries: Vec<StatusSummary> = map
        .into_iter()
        .map(|(status, (count, total_score, scored))| StatusSummary {
            status,
            count,
            avg_score: (scored > 0).then(|| total_score / scored as f64),
        })
        .collect();

    summaries.sort_by(|a, b| b.status.cmp(&a.status));
    summaries
}

fn student_label(students: &HashMap<Uuid, &Student>, id: Uuid) -> String {
    students
        .get(&id)
        .map(|student| format!("{} ({})", student.name, student.external_id))
        .unwrap_or_else(|| id.to_string())
}

fn format_score(score: Option<f64>) -> String {
    score.map_or_else(|| "n/a".to_string(), |s| format!("{s:.1}"))
}

pub fn build_report(
    scope: Option<&str>,
    lookback_days: i64,
    generated_at: DateTime<Utc>,
    rows: &[ProgressRow],
    students: &[Student],
) -> String {
    let summaries = summarize_by_status(rows);
    let by_id: HashMap<Uuid, &Student> = students.iter().map(|s| (s.id, s)).collect();

    let mut output = String::new();
    let scope_label = scope.unwrap_or("all students");

    let _ = writeln!(output, "# Study Plan Progress Report");
    let _ = writeln!(
        output,
        "Generated for {} at {} ({}-day evidence window)",
        scope_label,
        generated_at.format("%Y-%m-%d %H:%M UTC"),
        lookback_days
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Status Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No progress has been evaluated yet.");
    } else {
        for summary in &summaries {
            let _ = writeln!(
                output,
                "- {}: {} question types (avg score {})",
                summary.status,
                summary.count,
                format_score(summary.avg_score)
            );
        }
    }

    let mut closest: Vec<&ProgressRow> = rows
        .iter()
        .filter(|row| row.status == ProgressStatus::NearMastery)
        .collect();
    closest.sort_by(|a, b| {
        b.rolling_metrics
            .average_score
            .unwrap_or(0.0)
            .total_cmp(&a.rolling_metrics.average_score.unwrap_or(0.0))
    });

    let _ = writeln!(output);
    let _ = writeln!(output, "## Closest to Mastery");

    if closest.is_empty() {
        let _ = writeln!(output, "No question types are near mastery.");
    } else {
        for row in closest.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} on {}: score {} across {} samples",
                student_label(&by_id, row.student_id),
                row.question_type_key,
                format_score(row.rolling_metrics.average_score),
                row.rolling_metrics.sample_size
            );
        }
    }

    let mut recent: Vec<&ProgressRow> = rows.iter().collect();
    recent.sort_by(|a, b| b.last_decision_at.cmp(&a.last_decision_at));

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recently Decided");

    if recent.is_empty() {
        let _ = writeln!(output, "No decisions recorded.");
    } else {
        for row in recent.iter().take(5) {
            let _ = writeln!(
                output,
                "- {} on {}: {} at {}",
                student_label(&by_id, row.student_id),
                row.question_type_key,
                row.status,
                row.last_decision_at.format("%Y-%m-%d %H:%M")
            );
        }
    }

    output
}
