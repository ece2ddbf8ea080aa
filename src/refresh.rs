//! Incremental mirroring of platform activity, one student at a time or fanned out
//! across a bounded worker pool.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::CatalogReconciler;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::{DailyPerformanceRow, DispatchRow, PerformanceUnitRow, Student};
use crate::notify::Notifier;
use crate::platform::{PlatformApi, StudentCurriculum, StudySchedule};
use crate::store::SyncStore;

/// Runaway guard on date enumeration.
pub const MAX_WINDOW_DATES: usize = 365;

/// Dates still needing a fetch: the day after the last mirrored date (or a bounded
/// backfill when nothing is mirrored) through `today`, inclusive.
pub fn incremental_window(
    last_mirrored: Option<NaiveDate>,
    today: NaiveDate,
    max_range_days: u32,
) -> Vec<NaiveDate> {
    let start = match last_mirrored {
        Some(last) => last + Duration::days(1),
        None => today - Duration::days(i64::from(max_range_days.max(1)) - 1),
    };
    if start > today {
        return Vec::new();
    }

    start
        .iter_days()
        .take_while(|date| *date <= today)
        .take(MAX_WINDOW_DATES)
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRefreshCounts {
    pub dates_processed: usize,
    pub schedule_calls: usize,
    pub dispatch_calls: usize,
    pub failed_calls: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub students_total: usize,
    pub students_succeeded: usize,
    pub students_failed: usize,
    pub dates_processed: usize,
    pub schedule_calls: usize,
    pub dispatch_calls: usize,
}

impl RefreshSummary {
    pub fn record(&mut self, outcome: &StudentOutcome) {
        match outcome {
            Ok(counts) => {
                self.students_succeeded += 1;
                self.dates_processed += counts.dates_processed;
                self.schedule_calls += counts.schedule_calls;
                self.dispatch_calls += counts.dispatch_calls;
            }
            Err(_) => self.students_failed += 1,
        }
    }
}

/// Result of one student's refresh as seen by the pool; errors carry only the message.
pub type StudentOutcome = Result<StudentRefreshCounts, String>;

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct RefreshContext {
    pub platform: Arc<dyn PlatformApi>,
    pub store: Arc<dyn SyncStore>,
    pub notifier: Arc<dyn Notifier>,
    pub max_date_range_days: u32,
}

impl RefreshContext {
    pub fn new(
        platform: Arc<dyn PlatformApi>,
        store: Arc<dyn SyncStore>,
        notifier: Arc<dyn Notifier>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            platform,
            store,
            notifier,
            max_date_range_days: config.max_date_range_days,
        }
    }

    async fn reconcile_titles(&self, student_id: Uuid, titles: Vec<(String, String)>) {
        if titles.is_empty() {
            return;
        }
        let reconciler = CatalogReconciler::new(self.store.as_ref(), self.notifier.as_ref());
        match reconciler.reconcile(titles).await {
            Ok(summary) => debug!(student_id = %student_id, ?summary, "catalog reconciled"),
            Err(e) => warn!(student_id = %student_id, error = %e, "catalog reconciliation failed"),
        }
    }
}

/// Mirror one student's missing days. Platform failures are contained per call and per
/// date so the remaining dates still run. The student still ends in error when the
/// dispatch fetch failed or when calls failed and no date was written; store failures
/// outside a date's write escape immediately.
pub async fn refresh_student(
    ctx: &RefreshContext,
    student: &Student,
    today: NaiveDate,
) -> Result<StudentRefreshCounts, SyncError> {
    let mut counts = StudentRefreshCounts::default();
    let Some(platform_id) = student.platform_student_id.as_deref() else {
        debug!(student_id = %student.id, "student has no platform id; skipping");
        return Ok(counts);
    };

    let mut dispatch_failed = false;
    let mut last_error: Option<String> = None;

    counts.dispatch_calls += 1;
    match ctx.platform.student_curriculums(platform_id).await {
        Ok(curriculums) => {
            let rows = dispatch_rows(student.id, &curriculums);
            ctx.store.upsert_dispatch_rows(&rows).await?;
            let titles = curriculums
                .iter()
                .filter_map(|c| c.title.clone().map(|title| (c.id.clone(), title)))
                .collect();
            ctx.reconcile_titles(student.id, titles).await;
        }
        Err(e) => {
            counts.failed_calls += 1;
            dispatch_failed = true;
            warn!(student_id = %student.id, error = %e, "dispatch fetch failed");
            last_error = Some(e.to_string());
        }
    }

    let gaps = ctx.store.pending_gaps(student.id).await?;
    let last = ctx.store.last_performance_date(student.id).await?;
    let window = incremental_window(last, today, ctx.max_date_range_days);
    let gap_set: BTreeSet<NaiveDate> = gaps.iter().copied().collect();
    let dates: Vec<NaiveDate> = gap_set
        .iter()
        .copied()
        .filter(|date| *date <= today)
        .chain(window)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .take(MAX_WINDOW_DATES)
        .collect();

    if dates.is_empty() {
        debug!(student_id = %student.id, "nothing to fetch");
    }

    // Strictly sequential: the next date is fetched only after this one's write attempt.
    for date in dates {
        counts.schedule_calls += 1;
        match sync_date(ctx, student.id, platform_id, date).await {
            Ok(titles) => {
                counts.dates_processed += 1;
                if gap_set.contains(&date) {
                    ctx.store.clear_gap(student.id, date).await?;
                }
                ctx.reconcile_titles(student.id, titles).await;
            }
            Err(e) => {
                counts.failed_calls += 1;
                warn!(student_id = %student.id, %date, error = %e, "schedule sync failed");
                let message = e.to_string();
                if let Err(gap_err) = ctx.store.record_gap(student.id, date, &message).await {
                    warn!(student_id = %student.id, %date, error = %gap_err, "could not record refresh gap");
                }
                last_error = Some(message);
            }
        }
    }

    match last_error {
        Some(message) if dispatch_failed || counts.dates_processed == 0 => Err(SyncError::Fetch {
            failed_calls: counts.failed_calls,
            message,
        }),
        _ => Ok(counts),
    }
}

async fn sync_date(
    ctx: &RefreshContext,
    student_id: Uuid,
    platform_id: &str,
    date: NaiveDate,
) -> Result<Vec<(String, String)>, SyncError> {
    let schedules = ctx.platform.study_schedules(platform_id, date).await?;
    let (daily, units) = flatten_schedules(student_id, date, &schedules);
    // Units first, so a summary row (the cursor) never exists without its detail rows.
    ctx.store.upsert_performance_units(&units).await?;
    ctx.store.upsert_daily_performance(&daily).await?;

    Ok(schedules
        .into_iter()
        .filter_map(|s| s.curriculum_title.map(|title| (s.student_curriculum_id, title)))
        .collect())
}

pub fn dispatch_rows(student_id: Uuid, curriculums: &[StudentCurriculum]) -> Vec<DispatchRow> {
    curriculums
        .iter()
        .map(|c| DispatchRow {
            student_id,
            student_curriculum_id: c.id.clone(),
            curriculum_title: c.title.clone(),
            total_minutes: c.total_minutes.map(|m| m.round() as i32),
            remaining_minutes: c.remaining_minutes.map(|m| m.round() as i32),
            first_dispatched_at: c.first_dispatched_at,
            last_dispatched_at: c.last_dispatched_at,
            stopped: c.stopped.unwrap_or(false),
        })
        .collect()
}

/// Platform confidence arrives either as 0..1 or as a percentage.
pub fn normalize_confidence(value: f64) -> f64 {
    if value > 1.0 {
        value / 100.0
    } else {
        value
    }
}

/// Flatten schedule -> lessons -> units into one summary row per
/// (curriculum, lesson bundle) and one row per unit.
pub fn flatten_schedules(
    student_id: Uuid,
    date: NaiveDate,
    schedules: &[StudySchedule],
) -> (Vec<DailyPerformanceRow>, Vec<PerformanceUnitRow>) {
    let mut units = Vec::new();
    let mut bundles: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
    let mut titles: BTreeMap<String, Option<String>> = BTreeMap::new();

    for schedule in schedules {
        titles
            .entry(schedule.student_curriculum_id.clone())
            .or_insert_with(|| schedule.curriculum_title.clone());

        for lesson in &schedule.lessons {
            let bundle_id = lesson
                .lesson_bundle_id
                .clone()
                .unwrap_or_else(|| lesson.id.clone());

            let mut ordered: Vec<_> = lesson.units.iter().enumerate().collect();
            ordered.sort_by_key(|(index, unit)| unit.sequence.unwrap_or(*index as i32 + 1));

            let mut streak = 0;
            for (index, unit) in ordered {
                streak = match unit.is_correct {
                    Some(true) => streak + 1,
                    _ => 0,
                };
                bundles
                    .entry((schedule.student_curriculum_id.clone(), bundle_id.clone()))
                    .or_default()
                    .push(units.len());
                units.push(PerformanceUnitRow {
                    student_id,
                    date,
                    student_curriculum_id: schedule.student_curriculum_id.clone(),
                    lesson_bundle_id: bundle_id.clone(),
                    lesson_id: lesson.id.clone(),
                    unit_id: unit.id.clone(),
                    sequence: unit.sequence.unwrap_or(index as i32 + 1),
                    is_correct: unit.is_correct,
                    is_completed: unit.is_completed.unwrap_or(false),
                    confidence: unit.confidence.filter(|c| c.is_finite()).map(normalize_confidence),
                    consecutive_correct: unit.consecutive_correct.unwrap_or(streak),
                });
            }
        }
    }

    let daily = bundles
        .into_iter()
        .map(|((curriculum_id, bundle_id), indexes)| {
            let members: Vec<&PerformanceUnitRow> = indexes.iter().map(|i| &units[*i]).collect();
            let graded: Vec<bool> = members.iter().filter_map(|u| u.is_correct).collect();
            let confidences: Vec<f64> = members.iter().filter_map(|u| u.confidence).collect();

            DailyPerformanceRow {
                student_id,
                date,
                curriculum_title: titles.get(&curriculum_id).cloned().flatten(),
                student_curriculum_id: curriculum_id,
                lesson_bundle_id: bundle_id,
                correctness_pct: percentage(graded.iter().filter(|c| **c).count(), graded.len()),
                confidence_pct: (!confidences.is_empty()).then(|| {
                    confidences.iter().sum::<f64>() / confidences.len() as f64 * 100.0
                }),
                unit_count: members.len() as i32,
            }
        })
        .collect();

    (daily, units)
}

fn percentage(part: usize, whole: usize) -> Option<f64> {
    (whole > 0).then(|| part as f64 / whole as f64 * 100.0)
}

/// Live progress hooks for whoever drives the pool.
pub trait RefreshObserver: Send + Sync {
    fn on_student_start(&self, _student_id: Uuid) {}

    fn on_student_complete(&self, _student_id: Uuid, _outcome: &StudentOutcome) {}
}

/// Fixed-size pool; each worker claims the next unclaimed student index until none remain.
pub struct RefreshPool {
    concurrency: usize,
}

impl RefreshPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(
        &self,
        ctx: &RefreshContext,
        students: &[Student],
        today: NaiveDate,
        observer: &dyn RefreshObserver,
    ) -> RefreshSummary {
        let mut summary = RefreshSummary {
            students_total: students.len(),
            ..RefreshSummary::default()
        };
        if students.is_empty() {
            return summary;
        }

        let next = AtomicUsize::new(0);
        let next = &next;
        let workers = self.concurrency.min(students.len());

        let outcomes: Vec<Vec<StudentOutcome>> = stream::iter(0..workers)
            .map(move |worker| async move {
                let mut outcomes = Vec::new();
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(student) = students.get(index) else {
                        break;
                    };

                    observer.on_student_start(student.id);
                    let outcome = refresh_student(ctx, student, today)
                        .await
                        .map_err(|e| e.to_string());
                    if let Err(message) = &outcome {
                        warn!(worker, student_id = %student.id, error = %message, "student refresh failed");
                    }
                    observer.on_student_complete(student.id, &outcome);
                    outcomes.push(outcome);
                }
                outcomes
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        for outcome in outcomes.iter().flatten() {
            summary.record(outcome);
        }

        info!(
            students = summary.students_total,
            succeeded = summary.students_succeeded,
            failed = summary.students_failed,
            dates = summary.dates_processed,
            "refresh pool finished"
        );
        summary
    }
}
