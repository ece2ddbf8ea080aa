//! In-memory doubles for the store, platform and notifier seams.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{PlatformError, StoreError};
use crate::models::{
    CatalogEntry, DailyPerformanceRow, DispatchRow, PerformanceRecord, PerformanceUnitRow,
    ProgressRow, QuestionType, Student,
};
use crate::notify::Notifier;
use crate::platform::{
    PlatformApi, ScheduledLesson, ScheduledUnit, StudentCurriculum, StudySchedule,
};
use crate::store::SyncStore;
use crate::taxonomy::ParsedTitle;

pub fn student(name: &str, platform_id: Option<&str>) -> Student {
    Student {
        id: Uuid::new_v4(),
        external_id: name.to_lowercase().replace(' ', "."),
        name: name.to_string(),
        timezone: "UTC".to_string(),
        active: true,
        platform_student_id: platform_id.map(str::to_string),
        study_plan_id: Some(Uuid::new_v4()),
    }
}

/// One schedule with a single lesson bundle; each unit is `(is_correct, confidence)`.
pub fn schedule(curriculum_id: &str, title: &str, units: &[(bool, f64)]) -> StudySchedule {
    StudySchedule {
        student_curriculum_id: curriculum_id.to_string(),
        curriculum_title: Some(title.to_string()),
        lessons: vec![ScheduledLesson {
            id: format!("{curriculum_id}-lesson"),
            lesson_bundle_id: Some(format!("{curriculum_id}-bundle")),
            units: units
                .iter()
                .enumerate()
                .map(|(i, (correct, confidence))| ScheduledUnit {
                    id: format!("{curriculum_id}-unit-{i}"),
                    sequence: Some(i as i32 + 1),
                    is_correct: Some(*correct),
                    is_completed: Some(true),
                    confidence: Some(*confidence),
                    consecutive_correct: None,
                })
                .collect(),
        }],
    }
}

#[derive(Default)]
struct MemoryState {
    students: BTreeMap<Uuid, Student>,
    dispatch: BTreeMap<(Uuid, String), DispatchRow>,
    daily: BTreeMap<(Uuid, NaiveDate, String, String), DailyPerformanceRow>,
    units: BTreeMap<(Uuid, NaiveDate, String, String), PerformanceUnitRow>,
    gaps: BTreeMap<(Uuid, NaiveDate), String>,
    question_types: BTreeMap<String, QuestionType>,
    catalog: BTreeMap<String, CatalogEntry>,
    records: Vec<PerformanceRecord>,
    progress: BTreeMap<(Uuid, Uuid, String), ProgressRow>,
    failing_students: HashSet<Uuid>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn with_students(students: &[Student]) -> Self {
        let store = Self::default();
        for student in students {
            store.add_student(student.clone());
        }
        store
    }

    pub fn add_student(&self, student: Student) {
        self.state.lock().unwrap().students.insert(student.id, student);
    }

    pub fn add_performance_record(&self, record: PerformanceRecord) {
        self.state.lock().unwrap().records.push(record);
    }

    pub fn add_daily_row(&self, row: DailyPerformanceRow) {
        let key = (row.student_id, row.date, row.student_curriculum_id.clone(), row.lesson_bundle_id.clone());
        self.state.lock().unwrap().daily.insert(key, row);
    }

    /// Make every read for this student fail.
    pub fn fail_reads_for(&self, student_id: Uuid) {
        self.state.lock().unwrap().failing_students.insert(student_id);
    }

    pub fn daily_row_count(&self) -> usize {
        self.state.lock().unwrap().daily.len()
    }

    pub fn unit_row_count(&self) -> usize {
        self.state.lock().unwrap().units.len()
    }

    pub fn dispatch_rows(&self) -> Vec<DispatchRow> {
        self.state.lock().unwrap().dispatch.values().cloned().collect()
    }

    pub fn question_type_count(&self) -> usize {
        self.state.lock().unwrap().question_types.len()
    }

    pub fn gap_dates(&self, student_id: Uuid) -> Vec<NaiveDate> {
        self.state
            .lock()
            .unwrap()
            .gaps
            .keys()
            .filter(|(id, _)| *id == student_id)
            .map(|(_, date)| *date)
            .collect()
    }

    fn check(&self, student_id: Uuid) -> Result<(), StoreError> {
        if self.state.lock().unwrap().failing_students.contains(&student_id) {
            return Err(StoreError::Database(sqlx::Error::Protocol(format!(
                "reads disabled for {student_id}"
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn list_active_students(&self) -> Result<Vec<Student>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.students.values().filter(|s| s.active).cloned().collect())
    }

    async fn get_students(&self, ids: &[Uuid]) -> Result<Vec<Student>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(ids.iter().filter_map(|id| state.students.get(id).cloned()).collect())
    }

    async fn last_performance_date(&self, student_id: Uuid) -> Result<Option<NaiveDate>, StoreError> {
        self.check(student_id)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .daily
            .keys()
            .filter(|(id, ..)| *id == student_id)
            .map(|(_, date, ..)| *date)
            .max())
    }

    async fn pending_gaps(&self, student_id: Uuid) -> Result<Vec<NaiveDate>, StoreError> {
        self.check(student_id)?;
        Ok(self.gap_dates(student_id))
    }

    async fn record_gap(&self, student_id: Uuid, date: NaiveDate, error: &str) -> Result<(), StoreError> {
        self.state.lock().unwrap().gaps.insert((student_id, date), error.to_string());
        Ok(())
    }

    async fn clear_gap(&self, student_id: Uuid, date: NaiveDate) -> Result<(), StoreError> {
        self.state.lock().unwrap().gaps.remove(&(student_id, date));
        Ok(())
    }

    async fn upsert_dispatch_rows(&self, rows: &[DispatchRow]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().unwrap();
        for row in rows {
            state
                .dispatch
                .insert((row.student_id, row.student_curriculum_id.clone()), row.clone());
        }
        Ok(rows.len())
    }

    async fn upsert_daily_performance(&self, rows: &[DailyPerformanceRow]) -> Result<usize, StoreError> {
        for row in rows {
            self.add_daily_row(row.clone());
        }
        Ok(rows.len())
    }

    async fn upsert_performance_units(&self, rows: &[PerformanceUnitRow]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().unwrap();
        for row in rows {
            let key = (row.student_id, row.date, row.lesson_id.clone(), row.unit_id.clone());
            state.units.insert(key, row.clone());
        }
        Ok(rows.len())
    }

    async fn get_catalog_entry(&self, external_id: &str) -> Result<Option<CatalogEntry>, StoreError> {
        Ok(self.state.lock().unwrap().catalog.get(external_id).cloned())
    }

    async fn get_question_type(&self, id: Uuid) -> Result<Option<QuestionType>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.question_types.values().find(|qt| qt.id == id).cloned())
    }

    async fn find_or_create_question_type(&self, parsed: &ParsedTitle) -> Result<QuestionType, StoreError> {
        let mut state = self.state.lock().unwrap();
        let node = state
            .question_types
            .entry(parsed.canonical_path.clone())
            .or_insert_with(|| QuestionType {
                id: Uuid::new_v4(),
                domain: parsed.domain.clone(),
                category: parsed.category.clone(),
                specific_type: parsed.specific_type.clone(),
                canonical_path: parsed.canonical_path.clone(),
            });
        Ok(node.clone())
    }

    async fn upsert_catalog_entry(&self, entry: &CatalogEntry) -> Result<(), StoreError> {
        self.state
            .lock()
            .unwrap()
            .catalog
            .insert(entry.external_id.clone(), entry.clone());
        Ok(())
    }

    async fn update_catalog_observation(
        &self,
        external_id: &str,
        raw_title: &str,
        subtype: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.catalog.get_mut(external_id) {
            entry.raw_title = raw_title.to_string();
            if entry.subtype.is_none() {
                entry.subtype = subtype.map(str::to_string);
            }
        }
        Ok(())
    }

    async fn catalog_mapping(
        &self,
        curriculum_ids: &[String],
    ) -> Result<HashMap<String, QuestionType>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut mapping = HashMap::new();
        for id in curriculum_ids {
            let Some(entry) = state.catalog.get(id).filter(|entry| entry.active) else {
                continue;
            };
            if let Some(qt) = state.question_types.values().find(|qt| qt.id == entry.question_type_id) {
                mapping.insert(id.clone(), qt.clone());
            }
        }
        Ok(mapping)
    }

    async fn performance_records_since(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<PerformanceRecord>, StoreError> {
        self.check(student_id)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .iter()
            .filter(|r| r.student_id == student_id)
            .filter(|r| r.recorded_at.map_or(true, |ts| ts >= since))
            .cloned()
            .collect())
    }

    async fn performance_units_since(
        &self,
        student_id: Uuid,
        since: NaiveDate,
    ) -> Result<Vec<PerformanceUnitRow>, StoreError> {
        self.check(student_id)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .units
            .values()
            .filter(|u| u.student_id == student_id && u.date >= since)
            .cloned()
            .collect())
    }

    async fn daily_performance_since(
        &self,
        student_id: Uuid,
        since: NaiveDate,
    ) -> Result<Vec<DailyPerformanceRow>, StoreError> {
        self.check(student_id)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .daily
            .values()
            .filter(|d| d.student_id == student_id && d.date >= since)
            .cloned()
            .collect())
    }

    async fn upsert_progress_rows(&self, rows: &[ProgressRow]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().unwrap();
        for row in rows {
            let key = (row.student_id, row.study_plan_id, row.question_type_key.clone());
            state.progress.insert(key, row.clone());
        }
        Ok(rows.len())
    }

    async fn list_progress_rows(&self, student_id: Option<Uuid>) -> Result<Vec<ProgressRow>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .progress
            .values()
            .filter(|row| student_id.map_or(true, |id| row.student_id == id))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct FakeState {
    curriculums: HashMap<String, Vec<StudentCurriculum>>,
    schedules: HashMap<(String, NaiveDate), Vec<StudySchedule>>,
    failing_dates: HashSet<(String, NaiveDate)>,
    failing_students: HashSet<String>,
    schedule_calls: Vec<(String, NaiveDate)>,
    dispatch_calls: usize,
}

/// Scripted platform. Unscripted dates answer with an empty schedule list.
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl FakePlatform {
    pub fn set_curriculums(&self, platform_id: &str, curriculums: Vec<StudentCurriculum>) {
        self.state
            .lock()
            .unwrap()
            .curriculums
            .insert(platform_id.to_string(), curriculums);
    }

    pub fn set_schedules(&self, platform_id: &str, date: NaiveDate, schedules: Vec<StudySchedule>) {
        self.state
            .lock()
            .unwrap()
            .schedules
            .insert((platform_id.to_string(), date), schedules);
    }

    pub fn fail_date(&self, platform_id: &str, date: NaiveDate) {
        self.state
            .lock()
            .unwrap()
            .failing_dates
            .insert((platform_id.to_string(), date));
    }

    pub fn heal_date(&self, platform_id: &str, date: NaiveDate) {
        self.state
            .lock()
            .unwrap()
            .failing_dates
            .remove(&(platform_id.to_string(), date));
    }

    pub fn fail_student(&self, platform_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_students
            .insert(platform_id.to_string());
    }

    pub fn schedule_calls(&self) -> Vec<(String, NaiveDate)> {
        self.state.lock().unwrap().schedule_calls.clone()
    }

    pub fn dispatch_calls(&self) -> usize {
        self.state.lock().unwrap().dispatch_calls
    }
}

fn unavailable() -> PlatformError {
    PlatformError::Status {
        status: 503,
        body: "service unavailable".to_string(),
    }
}

#[async_trait]
impl PlatformApi for FakePlatform {
    async fn student_curriculums(
        &self,
        platform_student_id: &str,
    ) -> Result<Vec<StudentCurriculum>, PlatformError> {
        let mut state = self.state.lock().unwrap();
        state.dispatch_calls += 1;
        if state.failing_students.contains(platform_student_id) {
            return Err(unavailable());
        }
        Ok(state
            .curriculums
            .get(platform_student_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn study_schedules(
        &self,
        platform_student_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<StudySchedule>, PlatformError> {
        let mut state = self.state.lock().unwrap();
        let key = (platform_student_id.to_string(), date);
        state.schedule_calls.push(key.clone());
        if state.failing_students.contains(platform_student_id) || state.failing_dates.contains(&key) {
            return Err(unavailable());
        }
        Ok(state.schedules.get(&key).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(String, Value)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(String, Value)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str, context: Value) -> anyhow::Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((message.to_string(), context));
        Ok(())
    }
}
