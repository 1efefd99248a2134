//! Composite health and quality scoring over probe-derived status rows.
//! Every score is the sum of four bounded contributions (state, test
//! freshness, error recency, response time), clamped to [0, 100].

use chrono::{DateTime, Utc};
use models::{DataSourceStatus, InterfaceStatus, ProbeState};

fn state_points(state: ProbeState) -> i32 {
    match state {
        ProbeState::Online => 40,
        ProbeState::Testing => 20,
        ProbeState::Offline => 10,
        ProbeState::Error => 0,
    }
}

fn test_freshness_points(last_test: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i32 {
    let Some(last_test) = last_test else {
        return 5;
    };
    let age = now.signed_duration_since(last_test);
    if age <= chrono::Duration::minutes(5) {
        20
    } else if age <= chrono::Duration::minutes(30) {
        15
    } else if age <= chrono::Duration::hours(2) {
        10
    } else {
        5
    }
}

fn error_recency_points(last_error: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i32 {
    let Some(last_error) = last_error else {
        return 20;
    };
    let age = now.signed_duration_since(last_error);
    if age > chrono::Duration::hours(24) {
        20
    } else if age > chrono::Duration::hours(12) {
        15
    } else if age > chrono::Duration::hours(6) {
        10
    } else {
        5
    }
}

fn response_time_points(avg_response_time_ms: Option<i64>) -> i32 {
    match avg_response_time_ms {
        Some(ms) if ms < 100 => 20,
        Some(ms) if ms < 500 => 15,
        Some(ms) if ms < 1000 => 10,
        Some(_) => 5,
        // No traffic yet; score as slow rather than penalizing to zero.
        None => 5,
    }
}

pub fn source_health_score(status: &DataSourceStatus, now: DateTime<Utc>) -> i32 {
    let score = state_points(status.status)
        + test_freshness_points(status.last_test_time, now)
        + error_recency_points(status.last_error_time, now)
        + response_time_points(status.avg_response_time_ms);
    score.clamp(0, 100)
}

/// Interface quality uses the same four contributions; when data-quality
/// figures are present, they scale the base score so that poor
/// completeness or accuracy drags quality down proportionally.
pub fn interface_quality_score(status: &InterfaceStatus, now: DateTime<Utc>) -> i32 {
    let base = state_points(status.status)
        + test_freshness_points(status.last_test_time, now)
        + error_recency_points(status.last_error_time, now)
        + response_time_points(status.avg_response_time_ms);

    let score = match (status.completeness, status.accuracy) {
        (None, None) => base as f64,
        (completeness, accuracy) => {
            let completeness = completeness.unwrap_or(1.0).clamp(0.0, 1.0);
            let accuracy = accuracy.unwrap_or(1.0).clamp(0.0, 1.0);
            base as f64 * (completeness + accuracy) / 2.0
        }
    };
    (score.round() as i32).clamp(0, 100)
}

/// System score: the average of source and interface scores, weighted by
/// how many of each there are.
pub fn system_score(source_scores: &[i32], interface_scores: &[i32]) -> i32 {
    let count = source_scores.len() + interface_scores.len();
    if count == 0 {
        return 0;
    }
    let total: i64 = source_scores
        .iter()
        .chain(interface_scores.iter())
        .map(|&s| s as i64)
        .sum();
    ((total as f64 / count as f64).round() as i32).clamp(0, 100)
}

/// Periodically probe every registered source, persist the refreshed
/// status rows with their health scores, and log the composite system
/// score.
pub async fn serve_source_probes(
    pool: sqlx::PgPool,
    manager: std::sync::Arc<drivers::SourceManager>,
    period: std::time::Duration,
    shutdown: impl std::future::Future<Output = ()>,
) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => return,
            _ = tick.tick() => {}
        }

        let statuses = manager.health_check_all().await;
        let now = Utc::now();
        for (id, runtime) in statuses {
            let state = if runtime.healthy {
                ProbeState::Online
            } else {
                ProbeState::Error
            };

            // Merge this probe into the stored row, so error history from
            // earlier probes still weighs into the score.
            let previous = datahub_sql::statuses::fetch_source_status(id, &pool)
                .await
                .ok()
                .flatten();
            let mut snapshot = previous.unwrap_or_else(|| DataSourceStatus {
                data_source_id: id,
                status: state,
                last_test_time: Some(now),
                last_error_time: None,
                avg_response_time_ms: Some(runtime.response_time_ms),
                statistics: serde_json::json!({}),
                health_score: 0,
                updated_at: now,
            });
            snapshot.status = state;
            snapshot.last_test_time = Some(now);
            if !runtime.healthy {
                snapshot.last_error_time = Some(now);
            }
            snapshot.avg_response_time_ms = Some(runtime.response_time_ms);

            let score = source_health_score(&snapshot, now);
            if let Err(err) = datahub_sql::statuses::upsert_source_status(
                id,
                state,
                Some(runtime.response_time_ms),
                runtime.error_message.as_deref(),
                score,
                &pool,
            )
            .await
            {
                tracing::warn!(source_id = %id, %err, "failed to persist source status");
            }
        }

        let source_scores = datahub_sql::statuses::list_source_scores(&pool)
            .await
            .unwrap_or_default();
        let interface_scores = datahub_sql::statuses::list_interface_scores(&pool)
            .await
            .unwrap_or_default();
        tracing::info!(
            sources = source_scores.len(),
            interfaces = interface_scores.len(),
            system_score = system_score(&source_scores, &interface_scores),
            "health probe sweep complete"
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Duration;
    use models::Id;

    fn status(
        state: ProbeState,
        test_age: Option<Duration>,
        error_age: Option<Duration>,
        avg_ms: Option<i64>,
        now: DateTime<Utc>,
    ) -> DataSourceStatus {
        DataSourceStatus {
            data_source_id: Id::new(0),
            status: state,
            last_test_time: test_age.map(|age| now - age),
            last_error_time: error_age.map(|age| now - age),
            avg_response_time_ms: avg_ms,
            statistics: serde_json::json!({}),
            health_score: 0,
            updated_at: now,
        }
    }

    #[test]
    fn test_perfect_source_scores_full_marks() {
        let now = Utc::now();
        let s = status(
            ProbeState::Online,
            Some(Duration::minutes(1)),
            None,
            Some(50),
            now,
        );
        assert_eq!(source_health_score(&s, now), 100);
    }

    #[test]
    fn test_each_contribution_is_bounded() {
        let now = Utc::now();

        // Stale test, recent error, slow responses, offline.
        let s = status(
            ProbeState::Offline,
            Some(Duration::hours(3)),
            Some(Duration::hours(1)),
            Some(2_000),
            now,
        );
        assert_eq!(source_health_score(&s, now), 10 + 5 + 5 + 5);

        // Error state with nothing else recorded.
        let s = status(ProbeState::Error, None, None, None, now);
        assert_eq!(source_health_score(&s, now), 0 + 5 + 20 + 5);
    }

    #[test]
    fn test_freshness_ladder() {
        let now = Utc::now();
        for (age, expect) in [
            (Duration::minutes(4), 20),
            (Duration::minutes(29), 15),
            (Duration::minutes(119), 10),
            (Duration::hours(5), 5),
        ] {
            let s = status(ProbeState::Online, Some(age), None, Some(50), now);
            assert_eq!(source_health_score(&s, now), 40 + expect + 20 + 20);
        }
    }

    #[test]
    fn test_error_recency_ladder() {
        let now = Utc::now();
        for (age, expect) in [
            (Duration::hours(25), 20),
            (Duration::hours(13), 15),
            (Duration::hours(7), 10),
            (Duration::hours(2), 5),
        ] {
            let s = status(ProbeState::Online, Some(Duration::minutes(1)), Some(age), Some(50), now);
            assert_eq!(source_health_score(&s, now), 40 + 20 + expect + 20);
        }
    }

    #[test]
    fn test_quality_scales_with_data_quality() {
        let now = Utc::now();
        let base = InterfaceStatus {
            interface_id: Id::new(0),
            status: ProbeState::Online,
            last_test_time: Some(now - Duration::minutes(1)),
            last_error_time: None,
            last_query_time: None,
            avg_response_time_ms: Some(50),
            completeness: None,
            accuracy: None,
            statistics: serde_json::json!({}),
            quality_score: 0,
            updated_at: now,
        };
        assert_eq!(interface_quality_score(&base, now), 100);

        let degraded = InterfaceStatus {
            completeness: Some(0.5),
            accuracy: Some(0.9),
            ..base
        };
        assert_eq!(interface_quality_score(&degraded, now), 70);
    }

    #[test]
    fn test_system_score_weighted_average() {
        assert_eq!(system_score(&[], &[]), 0);
        assert_eq!(system_score(&[100, 50], &[]), 75);
        assert_eq!(system_score(&[100], &[40, 40, 40]), 55);
    }

    #[test]
    fn test_scores_stay_in_bounds() {
        let now = Utc::now();
        let s = status(ProbeState::Error, None, Some(Duration::minutes(1)), None, now);
        let score = source_health_score(&s, now);
        assert!((0..=100).contains(&score));
    }
}
