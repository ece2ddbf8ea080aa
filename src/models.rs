use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: Uuid,
    pub external_id: String,
    pub name: String,
    pub timezone: String,
    pub active: bool,
    pub platform_student_id: Option<String>,
    pub study_plan_id: Option<Uuid>,
}

/// Assignment state for one (student, curriculum) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRow {
    pub student_id: Uuid,
    pub student_curriculum_id: String,
    pub curriculum_title: Option<String>,
    pub total_minutes: Option<i32>,
    pub remaining_minutes: Option<i32>,
    pub first_dispatched_at: Option<DateTime<Utc>>,
    pub last_dispatched_at: Option<DateTime<Utc>>,
    pub stopped: bool,
}

/// Per (student, date, curriculum, lesson bundle) aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyPerformanceRow {
    pub student_id: Uuid,
    pub date: NaiveDate,
    pub student_curriculum_id: String,
    pub lesson_bundle_id: String,
    pub curriculum_title: Option<String>,
    pub correctness_pct: Option<f64>,
    pub confidence_pct: Option<f64>,
    pub unit_count: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceUnitRow {
    pub student_id: Uuid,
    pub date: NaiveDate,
    pub student_curriculum_id: String,
    pub lesson_bundle_id: String,
    pub lesson_id: String,
    pub unit_id: String,
    pub sequence: i32,
    pub is_correct: Option<bool>,
    pub is_completed: bool,
    /// Always on the 0..1 scale.
    pub confidence: Option<f64>,
    pub consecutive_correct: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionType {
    pub id: Uuid,
    pub domain: String,
    pub category: String,
    pub specific_type: String,
    pub canonical_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub external_id: String,
    pub raw_title: String,
    pub question_type_id: Uuid,
    pub subtype: Option<String>,
    pub active: bool,
    pub ingested_at: DateTime<Utc>,
}

/// A practice result captured outside the platform mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceRecord {
    pub student_id: Uuid,
    pub curriculum_id: Option<String>,
    pub question_type_label: Option<String>,
    pub score: Option<f64>,
    pub confidence_rating: Option<f64>,
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    NotStarted,
    InProgress,
    NearMastery,
    Mastered,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::NotStarted => "not_started",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::NearMastery => "near_mastery",
            ProgressStatus::Mastered => "mastered",
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "not_started" => Ok(ProgressStatus::NotStarted),
            "in_progress" => Ok(ProgressStatus::InProgress),
            "near_mastery" => Ok(ProgressStatus::NearMastery),
            "mastered" => Ok(ProgressStatus::Mastered),
            other => Err(format!("unknown progress status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSample {
    pub score: Option<f64>,
    pub confidence_rating: Option<f64>,
    pub captured_at: Option<DateTime<Utc>>,
}

/// The most recent samples behind a status decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceWindow {
    pub lookback_days: i64,
    pub sample_size: usize,
    pub samples: Vec<EvidenceSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingMetrics {
    pub sample_size: usize,
    pub average_score: Option<f64>,
    pub average_confidence: Option<f64>,
    pub confidence_samples: usize,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRow {
    pub student_id: Uuid,
    pub study_plan_id: Uuid,
    pub question_type_key: String,
    pub question_type_id: Option<Uuid>,
    pub status: ProgressStatus,
    pub evidence_window: EvidenceWindow,
    pub rolling_metrics: RollingMetrics,
    pub last_decision_at: DateTime<Utc>,
}
