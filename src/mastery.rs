use chrono::{DateTime, Duration, NaiveTime, Utc};

use crate::models::{EvidenceSample, EvidenceWindow, ProgressStatus, RollingMetrics};

pub const MASTERED_MIN_SAMPLES: usize = 6;
pub const MASTERED_MIN_SCORE: f64 = 90.0;
pub const MASTERED_MIN_CONFIDENCE: f64 = 0.8;
pub const NEAR_MASTERY_MIN_SAMPLES: usize = 3;
pub const NEAR_MASTERY_MIN_SCORE: f64 = 75.0;
pub const EVIDENCE_WINDOW_SIZE: usize = 5;

/// One observation for a (student, question type) pair. Scores are 0..100, confidence 0..1.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasterySample {
    pub score: Option<f64>,
    pub confidence_rating: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasteryEvaluation {
    pub status: ProgressStatus,
    pub evidence_window: EvidenceWindow,
    pub rolling_metrics: RollingMetrics,
}

/// First instant of the lookback window. The window covers whole UTC days, so day-level
/// evidence stamped at midnight on the first day still counts.
pub fn window_start(now: DateTime<Utc>, lookback_days: i64) -> DateTime<Utc> {
    let first_day = (now - Duration::days(lookback_days.max(1))).date_naive();
    first_day.and_time(NaiveTime::MIN).and_utc()
}

/// Classify a sample set. Samples older than the lookback window are ignored; samples
/// without a timestamp are kept since nothing proves them stale.
pub fn evaluate(samples: &[MasterySample], lookback_days: i64, now: DateTime<Utc>) -> MasteryEvaluation {
    let cutoff = window_start(now, lookback_days);
    let in_window: Vec<&MasterySample> = samples
        .iter()
        .filter(|sample| sample.timestamp.map_or(true, |ts| ts >= cutoff))
        .collect();

    let scores: Vec<f64> = in_window
        .iter()
        .filter_map(|sample| numeric(sample.score))
        .collect();
    let confidences: Vec<f64> = in_window
        .iter()
        .filter_map(|sample| numeric(sample.confidence_rating))
        .collect();

    let sample_size = scores.len();
    let average_score = mean(&scores);
    let average_confidence = mean(&confidences);
    let status = classify(sample_size, average_score, average_confidence);

    let mut ordered = in_window.clone();
    // Newest first; undated samples sort last.
    ordered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let evidence = ordered
        .iter()
        .take(EVIDENCE_WINDOW_SIZE)
        .map(|sample| EvidenceSample {
            score: numeric(sample.score),
            confidence_rating: numeric(sample.confidence_rating),
            captured_at: sample.timestamp,
        })
        .collect();

    let timestamps = in_window.iter().filter_map(|sample| sample.timestamp);
    let earliest = timestamps.clone().min();
    let latest = timestamps.max();

    MasteryEvaluation {
        status,
        evidence_window: EvidenceWindow {
            lookback_days,
            sample_size,
            samples: evidence,
        },
        rolling_metrics: RollingMetrics {
            sample_size,
            average_score,
            average_confidence,
            confidence_samples: confidences.len(),
            window_start: earliest,
            window_end: latest,
        },
    }
}

/// Missing confidence never blocks mastery; only a low measured confidence does.
pub fn classify(
    sample_size: usize,
    average_score: Option<f64>,
    average_confidence: Option<f64>,
) -> ProgressStatus {
    let score = average_score.unwrap_or(0.0);
    let confident = average_confidence.map_or(true, |c| c >= MASTERED_MIN_CONFIDENCE);

    if sample_size >= MASTERED_MIN_SAMPLES && score >= MASTERED_MIN_SCORE && confident {
        ProgressStatus::Mastered
    } else if sample_size >= NEAR_MASTERY_MIN_SAMPLES && score >= NEAR_MASTERY_MIN_SCORE {
        ProgressStatus::NearMastery
    } else if sample_size > 0 {
        ProgressStatus::InProgress
    } else {
        ProgressStatus::NotStarted
    }
}

fn numeric(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn sample(score: f64, confidence: Option<f64>, hours_ago: i64) -> MasterySample {
        MasterySample {
            score: Some(score),
            confidence_rating: confidence,
            timestamp: Some(Utc::now() - Duration::hours(hours_ago)),
        }
    }

    #[test]
    fn high_scores_with_confident_answers_are_mastered() {
        let scores = [95.0, 96.0, 94.0, 97.0, 93.0, 99.0];
        let confidences = [0.86, 0.9, 0.95, 0.88, 0.92, 0.91];
        let samples: Vec<MasterySample> = scores
            .iter()
            .zip(confidences.iter())
            .enumerate()
            .map(|(i, (s, c))| sample(*s, Some(*c), i as i64))
            .collect();

        let result = evaluate(&samples, 30, Utc::now());
        assert_eq!(result.status, ProgressStatus::Mastered);
        assert_eq!(result.evidence_window.sample_size, 6);
        assert_eq!(result.evidence_window.samples.len(), EVIDENCE_WINDOW_SIZE);
        assert_eq!(result.rolling_metrics.confidence_samples, 6);
    }

    #[test]
    fn missing_confidence_does_not_block_mastery() {
        let samples: Vec<MasterySample> = (0..6).map(|i| sample(92.0, None, i)).collect();
        let result = evaluate(&samples, 30, Utc::now());
        assert_eq!(result.status, ProgressStatus::Mastered);
        assert_eq!(result.rolling_metrics.average_confidence, None);
        assert_eq!(result.rolling_metrics.confidence_samples, 0);
    }

    #[test]
    fn low_confidence_downgrades_to_near_mastery() {
        let samples: Vec<MasterySample> = (0..6).map(|i| sample(95.0, Some(0.5), i)).collect();
        let result = evaluate(&samples, 30, Utc::now());
        assert_eq!(result.status, ProgressStatus::NearMastery);
    }

    #[test]
    fn thresholds_follow_expected_tiers() {
        assert_eq!(classify(3, Some(80.0), None), ProgressStatus::NearMastery);
        assert_eq!(classify(5, Some(91.0), Some(0.9)), ProgressStatus::NearMastery);
        assert_eq!(classify(2, Some(100.0), None), ProgressStatus::InProgress);
        assert_eq!(classify(4, Some(60.0), Some(0.9)), ProgressStatus::InProgress);
        assert_eq!(classify(0, None, None), ProgressStatus::NotStarted);
    }

    #[test]
    fn no_numeric_scores_is_not_started() {
        let samples = vec![MasterySample {
            score: Some(f64::NAN),
            confidence_rating: Some(0.9),
            timestamp: None,
        }];
        let result = evaluate(&samples, 30, Utc::now());
        assert_eq!(result.status, ProgressStatus::NotStarted);
        assert_eq!(result.rolling_metrics.average_score, None);
        assert_eq!(result.rolling_metrics.confidence_samples, 1);
    }

    #[test]
    fn evidence_window_lists_newest_first() {
        let samples = vec![sample(70.0, None, 48), sample(80.0, None, 1), sample(75.0, None, 24)];
        let result = evaluate(&samples, 30, Utc::now());
        let scores: Vec<Option<f64>> = result
            .evidence_window
            .samples
            .iter()
            .map(|s| s.score)
            .collect();
        assert_eq!(scores, vec![Some(80.0), Some(75.0), Some(70.0)]);
        assert!(result.rolling_metrics.window_start < result.rolling_metrics.window_end);
    }

    #[test]
    fn first_day_of_window_counts_from_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 15, 30, 0).unwrap();
        let first_day = Utc.with_ymd_and_hms(2026, 2, 8, 0, 0, 0).unwrap();
        assert_eq!(window_start(now, 30), first_day);

        let samples = vec![
            MasterySample {
                score: Some(80.0),
                confidence_rating: None,
                timestamp: Some(first_day),
            },
            MasterySample {
                score: Some(10.0),
                confidence_rating: None,
                timestamp: Some(first_day - Duration::seconds(1)),
            },
        ];
        let result = evaluate(&samples, 30, now);
        assert_eq!(result.rolling_metrics.sample_size, 1);
        assert_eq!(result.rolling_metrics.average_score, Some(80.0));
    }

    #[test]
    fn ignores_samples_outside_window() {
        let samples = vec![sample(90.0, None, 2), sample(10.0, None, 24 * 90)];
        let result = evaluate(&samples, 30, Utc::now());
        assert_eq!(result.rolling_metrics.sample_size, 1);
        assert_eq!(result.rolling_metrics.average_score, Some(90.0));
    }
}
