//! Client for the external platform REST API.
//!
//! Only two endpoints are consumed:
//! - `GET /student-curriculums?studentId=&includeStopped=&includeNoRemainingDuration=`
//! - `GET /study-schedules?studentId=&scheduledDate=YYYY-MM-DD`
//!
//! Both may answer with a bare JSON array or with `{ "data": [...] }`.

use std::num::NonZeroU32;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::PlatformError;

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentCurriculum {
    #[serde(alias = "studentCurriculumId", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, alias = "curriculumTitle")]
    pub title: Option<String>,
    #[serde(default, alias = "totalDuration")]
    pub total_minutes: Option<f64>,
    #[serde(default, alias = "remainingDuration")]
    pub remaining_minutes: Option<f64>,
    #[serde(default)]
    pub first_dispatched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_dispatched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudySchedule {
    #[serde(deserialize_with = "string_or_number")]
    pub student_curriculum_id: String,
    #[serde(default)]
    pub curriculum_title: Option<String>,
    #[serde(default)]
    pub lessons: Vec<ScheduledLesson>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledLesson {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub lesson_bundle_id: Option<String>,
    #[serde(default)]
    pub units: Vec<ScheduledUnit>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledUnit {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub sequence: Option<i32>,
    #[serde(default)]
    pub is_correct: Option<bool>,
    #[serde(default)]
    pub is_completed: Option<bool>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub consecutive_correct: Option<i32>,
}

#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Current assignments for a student, including stopped and exhausted ones.
    async fn student_curriculums(
        &self,
        platform_student_id: &str,
    ) -> Result<Vec<StudentCurriculum>, PlatformError>;

    async fn study_schedules(
        &self,
        platform_student_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<StudySchedule>, PlatformError>;
}

pub struct HttpPlatformClient {
    http: Client,
    base_url: String,
    limiter: DefaultDirectRateLimiter,
}

impl HttpPlatformClient {
    pub fn from_config(config: &SyncConfig) -> Result<Self, PlatformError> {
        let base_url = config
            .platform_base_url
            .clone()
            .ok_or_else(|| PlatformError::Config("PLATFORM_BASE_URL is not set".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = &config.platform_api_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| PlatformError::Config(format!("invalid API token: {e}")))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let http = Client::builder()
            .timeout(config.platform_timeout)
            .default_headers(headers)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let per_second = NonZeroU32::new(config.rate_limit_per_sec).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            http,
            base_url,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
        })
    }

    async fn get_list<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, PlatformError> {
        self.limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, ?query, "platform request");
        let response = self.http.get(&url).query(query).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let value: Value = response.json().await?;
        decode_list(value)
    }
}

#[async_trait]
impl PlatformApi for HttpPlatformClient {
    async fn student_curriculums(
        &self,
        platform_student_id: &str,
    ) -> Result<Vec<StudentCurriculum>, PlatformError> {
        self.get_list(
            "/student-curriculums",
            &[
                ("studentId", platform_student_id.to_string()),
                ("includeStopped", "true".to_string()),
                ("includeNoRemainingDuration", "true".to_string()),
            ],
        )
        .await
    }

    async fn study_schedules(
        &self,
        platform_student_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<StudySchedule>, PlatformError> {
        self.get_list(
            "/study-schedules",
            &[
                ("studentId", platform_student_id.to_string()),
                ("scheduledDate", date.format("%Y-%m-%d").to_string()),
            ],
        )
        .await
    }
}

/// Accept either a bare array or a `{ "data": [...] }` envelope.
pub fn decode_list<T: DeserializeOwned>(value: Value) -> Result<Vec<T>, PlatformError> {
    let items = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => match map.remove("data") {
            Some(data @ Value::Array(_)) => data,
            Some(Value::Null) | None => return Ok(Vec::new()),
            Some(other) => {
                return Err(PlatformError::Decode(format!(
                    "expected `data` to be an array, got {other}"
                )))
            }
        },
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(PlatformError::Decode(format!(
                "expected a JSON array, got {other}"
            )))
        }
    };

    serde_json::from_value(items).map_err(|e| PlatformError::Decode(e.to_string()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Integer(i64),
    Float(f64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(text) => text,
            RawId::Integer(n) => n.to_string(),
            RawId::Float(f) => f.to_string(),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(String::from)
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(String::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_nested_schedule_payload() {
        let payload = json!([
            {
                "studentCurriculumId": 1201,
                "curriculumTitle": "[Information & Ideas] > Inferences - Practice (Medium)",
                "lessons": [
                    {
                        "id": "lesson-1",
                        "lessonBundleId": 77,
                        "units": [
                            { "id": 1, "sequence": 1, "isCorrect": true, "isCompleted": true, "confidence": 0.9 },
                            { "id": 2, "sequence": 2, "isCorrect": false, "isCompleted": true, "confidence": null }
                        ]
                    }
                ]
            }
        ]);

        let schedules: Vec<StudySchedule> = decode_list(payload).unwrap();
        assert_eq!(schedules.len(), 1);
        let schedule = &schedules[0];
        assert_eq!(schedule.student_curriculum_id, "1201");
        assert_eq!(schedule.lessons[0].lesson_bundle_id.as_deref(), Some("77"));
        assert_eq!(schedule.lessons[0].units[1].is_correct, Some(false));
        assert_eq!(schedule.lessons[0].units[1].confidence, None);
    }

    #[test]
    fn accepts_data_envelope() {
        let payload = json!({
            "data": [
                { "id": "sc-1", "title": "Algebra > Linear Equations", "totalDuration": 120, "remainingDuration": 30, "stopped": true }
            ]
        });
        let curriculums: Vec<StudentCurriculum> = decode_list(payload).unwrap();
        assert_eq!(curriculums[0].id, "sc-1");
        assert_eq!(curriculums[0].total_minutes, Some(120.0));
        assert_eq!(curriculums[0].stopped, Some(true));
    }

    #[test]
    fn null_and_missing_data_decode_to_empty() {
        let empty: Vec<StudySchedule> = decode_list(Value::Null).unwrap();
        assert!(empty.is_empty());
        let empty: Vec<StudySchedule> = decode_list(json!({ "meta": {} })).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn rejects_scalar_payloads() {
        let result: Result<Vec<StudySchedule>, _> = decode_list(json!("oops"));
        assert!(matches!(result, Err(PlatformError::Decode(_))));
    }

    #[test]
    fn client_requires_base_url() {
        let result = HttpPlatformClient::from_config(&SyncConfig::default());
        assert!(matches!(result, Err(PlatformError::Config(_))));
    }
}
