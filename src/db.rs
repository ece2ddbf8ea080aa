use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    CatalogEntry, DailyPerformanceRow, DispatchRow, PerformanceRecord, PerformanceUnitRow,
    ProgressRow, ProgressStatus, QuestionType, Student,
};
use crate::store::SyncStore;
use crate::taxonomy::ParsedTitle;

pub async fn init_db(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let plan_id = Uuid::parse_str("6b0d4f4e-2f6a-4d1c-9a57-3f0f5e1f3c21")?;
    let students = vec![
        (
            Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
            "avery.lee",
            "Avery Lee",
            "America/New_York",
            Some("plt-1001"),
        ),
        (
            Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
            "jules.moreno",
            "Jules Moreno",
            "America/Chicago",
            Some("plt-1002"),
        ),
        (
            Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
            "kiara.patel",
            "Kiara Patel",
            "America/Los_Angeles",
            None,
        ),
    ];

    for (id, external_id, name, timezone, platform_id) in students {
        upsert_student(pool, id, external_id, name, timezone, true, platform_id, Some(plan_id))
            .await
            .with_context(|| format!("failed to seed student {external_id}"))?;
    }

    let records = vec![
        ("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2", "Transitions", 88.0, 0.8),
        ("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2", "Transitions", 93.0, 0.9),
        ("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc", "Linear Equations", 62.0, 0.5),
    ];

    for (student_id, label, score, confidence) in records {
        sqlx::query(
            r#"
            INSERT INTO platform_sync.performance_records
            (id, student_id, question_type_label, score, confidence_rating, recorded_at)
            VALUES ($1, $2, $3, $4, $5, now())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(Uuid::parse_str(student_id)?)
        .bind(label)
        .bind(score)
        .bind(confidence)
        .execute(pool)
        .await?;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn upsert_student(
    pool: &PgPool,
    id: Uuid,
    external_id: &str,
    name: &str,
    timezone: &str,
    active: bool,
    platform_id: Option<&str>,
    study_plan_id: Option<Uuid>,
) -> Result<Uuid, StoreError> {
    let row = sqlx::query(
        r#"
        INSERT INTO platform_sync.students
        (id, external_id, full_name, timezone, active, platform_student_id, study_plan_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (external_id) DO UPDATE
        SET full_name = EXCLUDED.full_name,
            timezone = EXCLUDED.timezone,
            active = EXCLUDED.active,
            platform_student_id = EXCLUDED.platform_student_id,
            study_plan_id = COALESCE(EXCLUDED.study_plan_id, platform_sync.students.study_plan_id),
            updated_at = now()
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(external_id)
    .bind(name)
    .bind(timezone)
    .bind(active)
    .bind(platform_id)
    .bind(study_plan_id)
    .fetch_one(pool)
    .await?;

    Ok(row.try_get("id")?)
}

/// Roster sync from CSV. Students missing from the file are left untouched; nobody is
/// deleted, `active=false` deactivates.
pub async fn import_roster(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        external_id: String,
        name: String,
        timezone: Option<String>,
        platform_student_id: Option<String>,
        active: Option<bool>,
        study_plan_id: Option<Uuid>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut upserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let platform_id = row
            .platform_student_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());

        upsert_student(
            pool,
            Uuid::new_v4(),
            row.external_id.trim(),
            &row.name,
            row.timezone.as_deref().unwrap_or("UTC"),
            row.active.unwrap_or(true),
            platform_id,
            row.study_plan_id,
        )
        .await
        .with_context(|| format!("failed to import student {}", row.external_id))?;
        upserted += 1;
    }

    Ok(upserted)
}

#[derive(Clone)]
pub struct PgSyncStore {
    pool: PgPool,
}

impl PgSyncStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const STUDENT_COLUMNS: &str =
    "id, external_id, full_name, timezone, active, platform_student_id, study_plan_id";

fn student_from_row(row: &PgRow) -> Result<Student, StoreError> {
    Ok(Student {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("full_name")?,
        timezone: row.try_get("timezone")?,
        active: row.try_get("active")?,
        platform_student_id: row.try_get("platform_student_id")?,
        study_plan_id: row.try_get("study_plan_id")?,
    })
}

fn question_type_from_row(row: &PgRow) -> Result<QuestionType, StoreError> {
    Ok(QuestionType {
        id: row.try_get("id")?,
        domain: row.try_get("domain")?,
        category: row.try_get("category")?,
        specific_type: row.try_get("specific_type")?,
        canonical_path: row.try_get("canonical_path")?,
    })
}

fn unit_from_row(row: &PgRow) -> Result<PerformanceUnitRow, StoreError> {
    Ok(PerformanceUnitRow {
        student_id: row.try_get("student_id")?,
        date: row.try_get("performance_date")?,
        student_curriculum_id: row.try_get("student_curriculum_id")?,
        lesson_bundle_id: row.try_get("lesson_bundle_id")?,
        lesson_id: row.try_get("lesson_id")?,
        unit_id: row.try_get("unit_id")?,
        sequence: row.try_get("sequence")?,
        is_correct: row.try_get("is_correct")?,
        is_completed: row.try_get("is_completed")?,
        confidence: row.try_get("confidence")?,
        consecutive_correct: row.try_get("consecutive_correct")?,
    })
}

fn daily_from_row(row: &PgRow) -> Result<DailyPerformanceRow, StoreError> {
    Ok(DailyPerformanceRow {
        student_id: row.try_get("student_id")?,
        date: row.try_get("performance_date")?,
        student_curriculum_id: row.try_get("student_curriculum_id")?,
        lesson_bundle_id: row.try_get("lesson_bundle_id")?,
        curriculum_title: row.try_get("curriculum_title")?,
        correctness_pct: row.try_get("correctness_pct")?,
        confidence_pct: row.try_get("confidence_pct")?,
        unit_count: row.try_get("unit_count")?,
    })
}

fn progress_from_row(row: &PgRow) -> Result<ProgressRow, StoreError> {
    let status: String = row.try_get("status")?;
    let evidence: serde_json::Value = row.try_get("evidence_window")?;
    let metrics: serde_json::Value = row.try_get("rolling_metrics")?;

    Ok(ProgressRow {
        student_id: row.try_get("student_id")?,
        study_plan_id: row.try_get("study_plan_id")?,
        question_type_key: row.try_get("question_type_key")?,
        question_type_id: row.try_get("question_type_id")?,
        status: status.parse::<ProgressStatus>().map_err(StoreError::Decode)?,
        evidence_window: serde_json::from_value(evidence)
            .map_err(|e| StoreError::Decode(format!("evidence_window: {e}")))?,
        rolling_metrics: serde_json::from_value(metrics)
            .map_err(|e| StoreError::Decode(format!("rolling_metrics: {e}")))?,
        last_decision_at: row.try_get("last_decision_at")?,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Decode(e.to_string()))
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn list_active_students(&self) -> Result<Vec<Student>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STUDENT_COLUMNS} FROM platform_sync.students WHERE active ORDER BY full_name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(student_from_row).collect()
    }

    async fn get_students(&self, ids: &[Uuid]) -> Result<Vec<Student>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STUDENT_COLUMNS} FROM platform_sync.students WHERE id = ANY($1) ORDER BY full_name"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(student_from_row).collect()
    }

    async fn last_performance_date(&self, student_id: Uuid) -> Result<Option<NaiveDate>, StoreError> {
        let row = sqlx::query(
            "SELECT MAX(performance_date) AS last_date FROM platform_sync.daily_performance WHERE student_id = $1",
        )
        .bind(student_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("last_date")?)
    }

    async fn pending_gaps(&self, student_id: Uuid) -> Result<Vec<NaiveDate>, StoreError> {
        let rows = sqlx::query(
            "SELECT gap_date FROM platform_sync.refresh_gaps WHERE student_id = $1 ORDER BY gap_date",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("gap_date").map_err(StoreError::from))
            .collect()
    }

    async fn record_gap(&self, student_id: Uuid, date: NaiveDate, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO platform_sync.refresh_gaps (student_id, gap_date, last_error)
            VALUES ($1, $2, $3)
            ON CONFLICT (student_id, gap_date) DO UPDATE
            SET last_error = EXCLUDED.last_error,
                attempts = platform_sync.refresh_gaps.attempts + 1,
                updated_at = now()
            "#,
        )
        .bind(student_id)
        .bind(date)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_gap(&self, student_id: Uuid, date: NaiveDate) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM platform_sync.refresh_gaps WHERE student_id = $1 AND gap_date = $2")
            .bind(student_id)
            .bind(date)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_dispatch_rows(&self, rows: &[DispatchRow]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO platform_sync.dispatch_mirror
                (student_id, student_curriculum_id, curriculum_title, total_minutes,
                 remaining_minutes, first_dispatched_at, last_dispatched_at, stopped)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (student_id, student_curriculum_id) DO UPDATE
                SET curriculum_title = EXCLUDED.curriculum_title,
                    total_minutes = EXCLUDED.total_minutes,
                    remaining_minutes = EXCLUDED.remaining_minutes,
                    first_dispatched_at = COALESCE(platform_sync.dispatch_mirror.first_dispatched_at, EXCLUDED.first_dispatched_at),
                    last_dispatched_at = EXCLUDED.last_dispatched_at,
                    stopped = EXCLUDED.stopped,
                    synced_at = now()
                "#,
            )
            .bind(row.student_id)
            .bind(&row.student_curriculum_id)
            .bind(&row.curriculum_title)
            .bind(row.total_minutes)
            .bind(row.remaining_minutes)
            .bind(row.first_dispatched_at)
            .bind(row.last_dispatched_at)
            .bind(row.stopped)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    async fn upsert_daily_performance(&self, rows: &[DailyPerformanceRow]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO platform_sync.daily_performance
                (student_id, performance_date, student_curriculum_id, lesson_bundle_id,
                 curriculum_title, correctness_pct, confidence_pct, unit_count)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (student_id, performance_date, student_curriculum_id, lesson_bundle_id) DO UPDATE
                SET curriculum_title = EXCLUDED.curriculum_title,
                    correctness_pct = EXCLUDED.correctness_pct,
                    confidence_pct = EXCLUDED.confidence_pct,
                    unit_count = EXCLUDED.unit_count,
                    synced_at = now()
                "#,
            )
            .bind(row.student_id)
            .bind(row.date)
            .bind(&row.student_curriculum_id)
            .bind(&row.lesson_bundle_id)
            .bind(&row.curriculum_title)
            .bind(row.correctness_pct)
            .bind(row.confidence_pct)
            .bind(row.unit_count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    async fn upsert_performance_units(&self, rows: &[PerformanceUnitRow]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO platform_sync.daily_performance_units
                (student_id, performance_date, student_curriculum_id, lesson_bundle_id, lesson_id,
                 unit_id, sequence, is_correct, is_completed, confidence, consecutive_correct)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (student_id, performance_date, lesson_id, unit_id) DO UPDATE
                SET student_curriculum_id = EXCLUDED.student_curriculum_id,
                    lesson_bundle_id = EXCLUDED.lesson_bundle_id,
                    sequence = EXCLUDED.sequence,
                    is_correct = EXCLUDED.is_correct,
                    is_completed = EXCLUDED.is_completed,
                    confidence = EXCLUDED.confidence,
                    consecutive_correct = EXCLUDED.consecutive_correct,
                    synced_at = now()
                "#,
            )
            .bind(row.student_id)
            .bind(row.date)
            .bind(&row.student_curriculum_id)
            .bind(&row.lesson_bundle_id)
            .bind(&row.lesson_id)
            .bind(&row.unit_id)
            .bind(row.sequence)
            .bind(row.is_correct)
            .bind(row.is_completed)
            .bind(row.confidence)
            .bind(row.consecutive_correct)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    async fn get_catalog_entry(&self, external_id: &str) -> Result<Option<CatalogEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT external_id, raw_title, question_type_id, subtype, active, ingested_at
            FROM platform_sync.curriculum_catalog
            WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(CatalogEntry {
                external_id: row.try_get("external_id")?,
                raw_title: row.try_get("raw_title")?,
                question_type_id: row.try_get("question_type_id")?,
                subtype: row.try_get("subtype")?,
                active: row.try_get("active")?,
                ingested_at: row.try_get("ingested_at")?,
            })
        })
        .transpose()
    }

    async fn get_question_type(&self, id: Uuid) -> Result<Option<QuestionType>, StoreError> {
        let row = sqlx::query(
            "SELECT id, domain, category, specific_type, canonical_path FROM platform_sync.question_types WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(question_type_from_row).transpose()
    }

    async fn find_or_create_question_type(&self, parsed: &ParsedTitle) -> Result<QuestionType, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO platform_sync.question_types (id, domain, category, specific_type, canonical_path)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (canonical_path) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&parsed.domain)
        .bind(&parsed.category)
        .bind(&parsed.specific_type)
        .bind(&parsed.canonical_path)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id, domain, category, specific_type, canonical_path FROM platform_sync.question_types WHERE canonical_path = $1",
        )
        .bind(&parsed.canonical_path)
        .fetch_one(&self.pool)
        .await?;
        question_type_from_row(&row)
    }

    async fn upsert_catalog_entry(&self, entry: &CatalogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO platform_sync.curriculum_catalog
            (external_id, raw_title, question_type_id, subtype, active, ingested_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (external_id) DO UPDATE
            SET raw_title = EXCLUDED.raw_title,
                question_type_id = EXCLUDED.question_type_id,
                subtype = COALESCE(platform_sync.curriculum_catalog.subtype, EXCLUDED.subtype),
                active = EXCLUDED.active,
                updated_at = now()
            "#,
        )
        .bind(&entry.external_id)
        .bind(&entry.raw_title)
        .bind(entry.question_type_id)
        .bind(&entry.subtype)
        .bind(entry.active)
        .bind(entry.ingested_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_catalog_observation(
        &self,
        external_id: &str,
        raw_title: &str,
        subtype: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE platform_sync.curriculum_catalog
            SET raw_title = $2,
                subtype = COALESCE(subtype, $3),
                updated_at = now()
            WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .bind(raw_title)
        .bind(subtype)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn catalog_mapping(
        &self,
        curriculum_ids: &[String],
    ) -> Result<HashMap<String, QuestionType>, StoreError> {
        if curriculum_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT c.external_id, q.id, q.domain, q.category, q.specific_type, q.canonical_path
            FROM platform_sync.curriculum_catalog c
            JOIN platform_sync.question_types q ON q.id = c.question_type_id
            WHERE c.active AND c.external_id = ANY($1)
            "#,
        )
        .bind(curriculum_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut mapping = HashMap::with_capacity(rows.len());
        for row in &rows {
            let external_id: String = row.try_get("external_id")?;
            mapping.insert(external_id, question_type_from_row(row)?);
        }
        Ok(mapping)
    }

    async fn performance_records_since(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<PerformanceRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT student_id, curriculum_id, question_type_label, score, confidence_rating, recorded_at
            FROM platform_sync.performance_records
            WHERE student_id = $1 AND (recorded_at IS NULL OR recorded_at >= $2)
            "#,
        )
        .bind(student_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PerformanceRecord {
                    student_id: row.try_get("student_id")?,
                    curriculum_id: row.try_get("curriculum_id")?,
                    question_type_label: row.try_get("question_type_label")?,
                    score: row.try_get("score")?,
                    confidence_rating: row.try_get("confidence_rating")?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }

    async fn performance_units_since(
        &self,
        student_id: Uuid,
        since: NaiveDate,
    ) -> Result<Vec<PerformanceUnitRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT student_id, performance_date, student_curriculum_id, lesson_bundle_id, lesson_id,
                   unit_id, sequence, is_correct, is_completed, confidence, consecutive_correct
            FROM platform_sync.daily_performance_units
            WHERE student_id = $1 AND performance_date >= $2
            ORDER BY performance_date, lesson_id, sequence
            "#,
        )
        .bind(student_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(unit_from_row).collect()
    }

    async fn daily_performance_since(
        &self,
        student_id: Uuid,
        since: NaiveDate,
    ) -> Result<Vec<DailyPerformanceRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT student_id, performance_date, student_curriculum_id, lesson_bundle_id,
                   curriculum_title, correctness_pct, confidence_pct, unit_count
            FROM platform_sync.daily_performance
            WHERE student_id = $1 AND performance_date >= $2
            ORDER BY performance_date
            "#,
        )
        .bind(student_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(daily_from_row).collect()
    }

    async fn upsert_progress_rows(&self, rows: &[ProgressRow]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO platform_sync.study_plan_progress
                (student_id, study_plan_id, question_type_key, question_type_id, status,
                 evidence_window, rolling_metrics, last_decision_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (student_id, study_plan_id, question_type_key) DO UPDATE
                SET question_type_id = EXCLUDED.question_type_id,
                    status = EXCLUDED.status,
                    evidence_window = EXCLUDED.evidence_window,
                    rolling_metrics = EXCLUDED.rolling_metrics,
                    last_decision_at = EXCLUDED.last_decision_at
                "#,
            )
            .bind(row.student_id)
            .bind(row.study_plan_id)
            .bind(&row.question_type_key)
            .bind(row.question_type_id)
            .bind(row.status.as_str())
            .bind(to_json(&row.evidence_window)?)
            .bind(to_json(&row.rolling_metrics)?)
            .bind(row.last_decision_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    async fn list_progress_rows(&self, student_id: Option<Uuid>) -> Result<Vec<ProgressRow>, StoreError> {
        let mut query = String::from(
            "SELECT student_id, study_plan_id, question_type_key, question_type_id, status, \
             evidence_window, rolling_metrics, last_decision_at \
             FROM platform_sync.study_plan_progress",
        );
        if student_id.is_some() {
            query.push_str(" WHERE student_id = $1");
        }
        query.push_str(" ORDER BY student_id, question_type_key");

        let mut rows = sqlx::query(&query);
        if let Some(id) = student_id {
            rows = rows.bind(id);
        }

        let records = rows.fetch_all(&self.pool).await?;
        records.iter().map(progress_from_row).collect()
    }
}
