//! Storage seam for the sync engine. Every write is an upsert on the row's natural key,
//! so repeating a sync never duplicates rows.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    CatalogEntry, DailyPerformanceRow, DispatchRow, PerformanceRecord, PerformanceUnitRow,
    ProgressRow, QuestionType, Student,
};
use crate::taxonomy::ParsedTitle;

#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn list_active_students(&self) -> Result<Vec<Student>, StoreError>;

    async fn get_students(&self, ids: &[Uuid]) -> Result<Vec<Student>, StoreError>;

    /// Most recent date present in the daily performance mirror.
    async fn last_performance_date(&self, student_id: Uuid) -> Result<Option<NaiveDate>, StoreError>;

    /// Dates that failed on an earlier refresh and still need a fetch, ascending.
    async fn pending_gaps(&self, student_id: Uuid) -> Result<Vec<NaiveDate>, StoreError>;

    async fn record_gap(&self, student_id: Uuid, date: NaiveDate, error: &str) -> Result<(), StoreError>;

    async fn clear_gap(&self, student_id: Uuid, date: NaiveDate) -> Result<(), StoreError>;

    async fn upsert_dispatch_rows(&self, rows: &[DispatchRow]) -> Result<usize, StoreError>;

    async fn upsert_daily_performance(&self, rows: &[DailyPerformanceRow]) -> Result<usize, StoreError>;

    async fn upsert_performance_units(&self, rows: &[PerformanceUnitRow]) -> Result<usize, StoreError>;

    async fn get_catalog_entry(&self, external_id: &str) -> Result<Option<CatalogEntry>, StoreError>;

    async fn get_question_type(&self, id: Uuid) -> Result<Option<QuestionType>, StoreError>;

    /// Look up a taxonomy node by canonical path, inserting it when absent.
    async fn find_or_create_question_type(&self, parsed: &ParsedTitle) -> Result<QuestionType, StoreError>;

    async fn upsert_catalog_entry(&self, entry: &CatalogEntry) -> Result<(), StoreError>;

    /// Refresh the raw title and fill `subtype` only when it is still null.
    async fn update_catalog_observation(
        &self,
        external_id: &str,
        raw_title: &str,
        subtype: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn catalog_mapping(
        &self,
        curriculum_ids: &[String],
    ) -> Result<HashMap<String, QuestionType>, StoreError>;

    /// Records recorded since `since`, plus undated records.
    async fn performance_records_since(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<PerformanceRecord>, StoreError>;

    async fn performance_units_since(
        &self,
        student_id: Uuid,
        since: NaiveDate,
    ) -> Result<Vec<PerformanceUnitRow>, StoreError>;

    async fn daily_performance_since(
        &self,
        student_id: Uuid,
        since: NaiveDate,
    ) -> Result<Vec<DailyPerformanceRow>, StoreError>;

    async fn upsert_progress_rows(&self, rows: &[ProgressRow]) -> Result<usize, StoreError>;

    async fn list_progress_rows(&self, student_id: Option<Uuid>) -> Result<Vec<ProgressRow>, StoreError>;
}
