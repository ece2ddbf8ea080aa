//! Pollable refresh jobs.
//!
//! Job records live in process memory only: a restart loses every in-flight and
//! finished job. Runners are spawned onto tokio and their handles kept, so callers
//! can await completion and a panicking runner marks its job `failed`.

use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::JobError;
use crate::models::Student;
use crate::refresh::{
    RefreshContext, RefreshObserver, RefreshPool, RefreshSummary, StudentOutcome,
    StudentRefreshCounts,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StudentRefreshStatus {
    Pending,
    Refreshing,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentProgress {
    pub student_id: Uuid,
    pub name: String,
    pub status: StudentRefreshStatus,
    pub counts: StudentRefreshCounts,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshJobSnapshot {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub summary: RefreshSummary,
    pub students: Vec<StudentProgress>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StartRefreshRequest {
    pub session_id: String,
    /// Explicit targets; `None` refreshes every active student.
    pub student_ids: Option<Vec<Uuid>>,
}

struct RefreshJob {
    snapshot: RefreshJobSnapshot,
    session_id: String,
}

struct RegistryInner {
    ctx: RefreshContext,
    concurrency: usize,
    jobs: RwLock<HashMap<Uuid, RefreshJob>>,
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl RegistryInner {
    fn update<F>(&self, job_id: Uuid, apply: F)
    where
        F: FnOnce(&mut RefreshJobSnapshot),
    {
        let mut jobs = self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(job) = jobs.get_mut(&job_id) {
            apply(&mut job.snapshot);
            job.snapshot.updated_at = Utc::now();
        }
    }

    fn transition(&self, job_id: Uuid, status: JobStatus, error: Option<String>) {
        self.update(job_id, |snapshot| {
            info!(job_id = %job_id, from = ?snapshot.status, to = ?status, "refresh job transition");
            snapshot.status = status;
            snapshot.error = error;
        });
    }
}

#[derive(Clone)]
pub struct RefreshJobRegistry {
    inner: Arc<RegistryInner>,
}

impl RefreshJobRegistry {
    pub fn new(ctx: RefreshContext, concurrency: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ctx,
                concurrency: concurrency.max(1),
                jobs: RwLock::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a job in `pending`, spawn its runner and return the initial snapshot.
    /// Fails only when the target students cannot be resolved.
    pub async fn start_refresh_job(
        &self,
        request: StartRefreshRequest,
    ) -> Result<RefreshJobSnapshot, JobError> {
        let students = self.resolve_students(request.student_ids.as_deref()).await?;
        if students.is_empty() {
            return Err(JobError::NoStudents);
        }

        let now = Utc::now();
        let snapshot = RefreshJobSnapshot {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            summary: RefreshSummary {
                students_total: students.len(),
                ..RefreshSummary::default()
            },
            students: students
                .iter()
                .map(|student| StudentProgress {
                    student_id: student.id,
                    name: student.name.clone(),
                    status: StudentRefreshStatus::Pending,
                    counts: StudentRefreshCounts::default(),
                    error: None,
                })
                .collect(),
            error: None,
        };
        let job_id = snapshot.id;

        self.inner
            .jobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                job_id,
                RefreshJob {
                    snapshot: snapshot.clone(),
                    session_id: request.session_id.clone(),
                },
            );
        info!(job_id = %job_id, session_id = %request.session_id, students = students.len(), "refresh job created");

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_job(inner, job_id, students));
        let mut tasks = self.inner.tasks.lock().await;
        // Finished runners have already written their terminal snapshot.
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(job_id, handle);
        drop(tasks);

        Ok(snapshot)
    }

    pub fn get_refresh_job(&self, job_id: Uuid) -> Option<RefreshJobSnapshot> {
        let jobs = self.inner.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.get(&job_id).map(|job| job.snapshot.clone())
    }

    /// Snapshot plus the originating session id, for callers enforcing poll ownership.
    pub fn get_refresh_job_internal(&self, job_id: Uuid) -> Option<(RefreshJobSnapshot, String)> {
        let jobs = self.inner.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        jobs.get(&job_id)
            .map(|job| (job.snapshot.clone(), job.session_id.clone()))
    }

    /// Wait for a job's runner to finish and return the final snapshot.
    pub async fn wait(&self, job_id: Uuid) -> Option<RefreshJobSnapshot> {
        let handle = self.inner.tasks.lock().await.remove(&job_id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(job_id = %job_id, error = %e, "refresh job task did not complete");
            }
        }
        self.get_refresh_job(job_id)
    }

    async fn resolve_students(&self, ids: Option<&[Uuid]>) -> Result<Vec<Student>, JobError> {
        let store = &self.inner.ctx.store;
        match ids {
            Some(ids) => {
                let unique: Vec<Uuid> = ids
                    .iter()
                    .copied()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                Ok(store.get_students(&unique).await?)
            }
            None => Ok(store.list_active_students().await?),
        }
    }
}

async fn run_job(inner: Arc<RegistryInner>, job_id: Uuid, students: Vec<Student>) {
    inner.transition(job_id, JobStatus::Running, None);

    let observer = JobObserver {
        inner: Arc::clone(&inner),
        job_id,
    };
    let pool = RefreshPool::new(inner.concurrency);
    let today = Utc::now().date_naive();

    let result = AssertUnwindSafe(pool.run(&inner.ctx, &students, today, &observer))
        .catch_unwind()
        .await;

    match result {
        Ok(summary) => {
            inner.update(job_id, |snapshot| snapshot.summary = summary);
            inner.transition(job_id, JobStatus::Completed, None);
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "refresh runner panicked".to_string());
            error!(job_id = %job_id, error = %message, "refresh job failed");
            inner.transition(job_id, JobStatus::Failed, Some(message));
        }
    }
}

struct JobObserver {
    inner: Arc<RegistryInner>,
    job_id: Uuid,
}

impl RefreshObserver for JobObserver {
    fn on_student_start(&self, student_id: Uuid) {
        self.inner.update(self.job_id, |snapshot| {
            if let Some(entry) = snapshot.students.iter_mut().find(|s| s.student_id == student_id) {
                entry.status = StudentRefreshStatus::Refreshing;
            }
        });
    }

    fn on_student_complete(&self, student_id: Uuid, outcome: &StudentOutcome) {
        self.inner.update(self.job_id, |snapshot| {
            snapshot.summary.record(outcome);
            if let Some(entry) = snapshot.students.iter_mut().find(|s| s.student_id == student_id) {
                match outcome {
                    Ok(counts) => {
                        entry.status = StudentRefreshStatus::Complete;
                        entry.counts = *counts;
                    }
                    Err(message) => {
                        entry.status = StudentRefreshStatus::Error;
                        entry.error = Some(message.clone());
                    }
                }
            }
        });
    }
}
