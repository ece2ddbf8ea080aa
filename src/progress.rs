use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::mastery::{evaluate, window_start, MasterySample};
use crate::models::{
    DailyPerformanceRow, PerformanceRecord, PerformanceUnitRow, ProgressRow, QuestionType, Student,
};
use crate::refresh::normalize_confidence;
use crate::store::SyncStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProgressPassSummary {
    pub students_evaluated: usize,
    pub students_skipped: usize,
    pub students_failed: usize,
    pub rows_written: usize,
}

/// Samples collected for one question type.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SampleGroup {
    pub question_type_id: Option<Uuid>,
    pub samples: Vec<MasterySample>,
}

pub struct ProgressAggregator<'a> {
    store: &'a dyn SyncStore,
    lookback_days: i64,
}

impl<'a> ProgressAggregator<'a> {
    pub fn new(store: &'a dyn SyncStore, lookback_days: i64) -> Self {
        Self {
            store,
            lookback_days: lookback_days.max(1),
        }
    }

    /// Recompute progress for every active student with a published study plan.
    /// One student's failure is logged and does not stop the pass.
    pub async fn evaluate_all(&self, now: DateTime<Utc>) -> Result<ProgressPassSummary, StoreError> {
        let students = self.store.list_active_students().await?;
        let mut summary = ProgressPassSummary::default();

        for student in &students {
            if student.study_plan_id.is_none() {
                summary.students_skipped += 1;
                continue;
            }
            match self.evaluate_student(student, now).await {
                Ok(rows) => {
                    summary.students_evaluated += 1;
                    summary.rows_written += rows.len();
                }
                Err(e) => {
                    summary.students_failed += 1;
                    warn!(student_id = %student.id, error = %e, "progress evaluation failed");
                }
            }
        }

        info!(
            evaluated = summary.students_evaluated,
            skipped = summary.students_skipped,
            failed = summary.students_failed,
            rows = summary.rows_written,
            "progress pass finished"
        );
        Ok(summary)
    }

    /// Replace the student's per-question-type conclusions with a fresh evaluation.
    pub async fn evaluate_student(
        &self,
        student: &Student,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProgressRow>, StoreError> {
        let Some(study_plan_id) = student.study_plan_id else {
            return Ok(Vec::new());
        };

        let since = window_start(now, self.lookback_days);
        let records = self.store.performance_records_since(student.id, since).await?;
        let units = self
            .store
            .performance_units_since(student.id, since.date_naive())
            .await?;
        let daily = self
            .store
            .daily_performance_since(student.id, since.date_naive())
            .await?;

        let curriculum_ids: Vec<String> = records
            .iter()
            .filter_map(|r| r.curriculum_id.clone())
            .chain(units.iter().map(|u| u.student_curriculum_id.clone()))
            .chain(daily.iter().map(|d| d.student_curriculum_id.clone()))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let mapping = self.store.catalog_mapping(&curriculum_ids).await?;

        let mut groups = group_samples(&records, &units, &daily, &mapping);

        // Conclusions whose evidence has aged out are re-decided on an empty sample set.
        let existing = self.store.list_progress_rows(Some(student.id)).await?;
        for row in existing {
            if row.study_plan_id == study_plan_id && !groups.contains_key(&row.question_type_key) {
                groups.insert(
                    row.question_type_key,
                    SampleGroup {
                        question_type_id: row.question_type_id,
                        samples: Vec::new(),
                    },
                );
            }
        }

        let rows: Vec<ProgressRow> = groups
            .into_iter()
            .map(|(key, group)| {
                let evaluation = evaluate(&group.samples, self.lookback_days, now);
                ProgressRow {
                    student_id: student.id,
                    study_plan_id,
                    question_type_key: key,
                    question_type_id: group.question_type_id,
                    status: evaluation.status,
                    evidence_window: evaluation.evidence_window,
                    rolling_metrics: evaluation.rolling_metrics,
                    last_decision_at: now,
                }
            })
            .collect();

        self.store.upsert_progress_rows(&rows).await?;
        debug!(student_id = %student.id, rows = rows.len(), "progress rows written");
        Ok(rows)
    }
}

/// Bucket every resolvable sample by question type key.
///
/// Curriculum-linked rows without a catalog mapping are dropped. Daily summary rows only
/// count for (date, curriculum) pairs that have no unit rows, so a day is never counted
/// twice.
pub fn group_samples(
    records: &[PerformanceRecord],
    units: &[PerformanceUnitRow],
    daily: &[DailyPerformanceRow],
    mapping: &HashMap<String, QuestionType>,
) -> BTreeMap<String, SampleGroup> {
    let mut groups: BTreeMap<String, SampleGroup> = BTreeMap::new();
    let mut push = |key: String, question_type_id: Option<Uuid>, sample: MasterySample| {
        let group = groups.entry(key).or_default();
        if group.question_type_id.is_none() {
            group.question_type_id = question_type_id;
        }
        group.samples.push(sample);
    };

    for record in records {
        let sample = MasterySample {
            score: record.score,
            confidence_rating: record.confidence_rating.map(normalize_confidence),
            timestamp: record.recorded_at,
        };
        match (&record.curriculum_id, &record.question_type_label) {
            (Some(curriculum_id), _) => {
                if let Some(qt) = mapping.get(curriculum_id) {
                    push(qt.canonical_path.clone(), Some(qt.id), sample);
                }
            }
            (None, Some(label)) => {
                let key = normalize_label(label);
                if !key.is_empty() {
                    push(key, None, sample);
                }
            }
            (None, None) => {}
        }
    }

    let mut covered: HashSet<(NaiveDate, &str)> = HashSet::new();
    for unit in units {
        let Some(qt) = mapping.get(&unit.student_curriculum_id) else {
            continue;
        };
        covered.insert((unit.date, unit.student_curriculum_id.as_str()));
        push(
            qt.canonical_path.clone(),
            Some(qt.id),
            MasterySample {
                score: unit.is_correct.map(|correct| if correct { 100.0 } else { 0.0 }),
                confidence_rating: unit.confidence,
                timestamp: start_of_day(unit.date),
            },
        );
    }

    for row in daily {
        if covered.contains(&(row.date, row.student_curriculum_id.as_str())) {
            continue;
        }
        let Some(qt) = mapping.get(&row.student_curriculum_id) else {
            continue;
        };
        push(
            qt.canonical_path.clone(),
            Some(qt.id),
            MasterySample {
                score: row.correctness_pct,
                confidence_rating: row.confidence_pct.map(|pct| pct / 100.0),
                timestamp: start_of_day(row.date),
            },
        );
    }

    groups
}

pub fn normalize_label(label: &str) -> String {
    label.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn start_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc())
}
