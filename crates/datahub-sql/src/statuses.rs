use chrono::{DateTime, Utc};
use models::{DataSourceStatus, Id, InterfaceStatus, ProbeState, Result};

pub async fn fetch_source_status(
    data_source_id: Id,
    pool: &sqlx::PgPool,
) -> Result<Option<DataSourceStatus>> {
    Ok(sqlx::query_as::<_, DataSourceStatus>(
        r#"
        select data_source_id, status, last_test_time, last_error_time,
               avg_response_time_ms, statistics, health_score, updated_at
        from data_source_statuses
        where data_source_id = $1
        "#,
    )
    .bind(data_source_id)
    .fetch_optional(pool)
    .await?)
}

/// Record the outcome of a probe, folding the response time into a running
/// average kept inside the row.
pub async fn upsert_source_status(
    data_source_id: Id,
    status: ProbeState,
    response_time_ms: Option<i64>,
    error: Option<&str>,
    health_score: i32,
    pool: &sqlx::PgPool,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into data_source_statuses (
            data_source_id, status, last_test_time, last_error_time,
            avg_response_time_ms, statistics, health_score, updated_at
        ) values (
            $1, $2, now(),
            case when $3 then now() end,
            $4, jsonb_build_object('last_error', $5::text), $6, now()
        )
        on conflict (data_source_id) do update set
            status = excluded.status,
            last_test_time = now(),
            last_error_time = coalesce(excluded.last_error_time, data_source_statuses.last_error_time),
            avg_response_time_ms = case
                when excluded.avg_response_time_ms is null then data_source_statuses.avg_response_time_ms
                when data_source_statuses.avg_response_time_ms is null then excluded.avg_response_time_ms
                else (data_source_statuses.avg_response_time_ms * 3 + excluded.avg_response_time_ms) / 4
            end,
            statistics = data_source_statuses.statistics || excluded.statistics,
            health_score = excluded.health_score,
            updated_at = now()
        "#,
    )
    .bind(data_source_id)
    .bind(status)
    .bind(error.is_some())
    .bind(response_time_ms)
    .bind(error)
    .bind(health_score)
    .execute(pool)
    .await?;
    Ok(())
}

/// All current source health scores, for system-level aggregation.
pub async fn list_source_scores(pool: &sqlx::PgPool) -> Result<Vec<i32>> {
    Ok(
        sqlx::query_scalar("select health_score from data_source_statuses")
            .fetch_all(pool)
            .await?,
    )
}

/// All current interface quality scores.
pub async fn list_interface_scores(pool: &sqlx::PgPool) -> Result<Vec<i32>> {
    Ok(
        sqlx::query_scalar("select quality_score from interface_statuses")
            .fetch_all(pool)
            .await?,
    )
}

pub async fn fetch_interface_status(
    interface_id: Id,
    pool: &sqlx::PgPool,
) -> Result<Option<InterfaceStatus>> {
    Ok(sqlx::query_as::<_, InterfaceStatus>(
        r#"
        select interface_id, status, last_test_time, last_error_time,
               last_query_time, avg_response_time_ms, completeness, accuracy,
               statistics, quality_score, updated_at
        from interface_statuses
        where interface_id = $1
        "#,
    )
    .bind(interface_id)
    .fetch_optional(pool)
    .await?)
}

pub async fn upsert_interface_status(
    interface_id: Id,
    status: ProbeState,
    query_time: Option<DateTime<Utc>>,
    response_time_ms: Option<i64>,
    error: Option<&str>,
    quality_score: i32,
    pool: &sqlx::PgPool,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into interface_statuses (
            interface_id, status, last_test_time, last_error_time,
            last_query_time, avg_response_time_ms, statistics, quality_score,
            updated_at
        ) values (
            $1, $2, now(),
            case when $3 then now() end,
            $4, $5, jsonb_build_object('last_error', $6::text), $7, now()
        )
        on conflict (interface_id) do update set
            status = excluded.status,
            last_test_time = now(),
            last_error_time = coalesce(excluded.last_error_time, interface_statuses.last_error_time),
            last_query_time = coalesce(excluded.last_query_time, interface_statuses.last_query_time),
            avg_response_time_ms = case
                when excluded.avg_response_time_ms is null then interface_statuses.avg_response_time_ms
                when interface_statuses.avg_response_time_ms is null then excluded.avg_response_time_ms
                else (interface_statuses.avg_response_time_ms * 3 + excluded.avg_response_time_ms) / 4
            end,
            statistics = interface_statuses.statistics || excluded.statistics,
            quality_score = excluded.quality_score,
            updated_at = now()
        "#,
    )
    .bind(interface_id)
    .bind(status)
    .bind(error.is_some())
    .bind(query_time)
    .bind(response_time_ms)
    .bind(error)
    .bind(quality_score)
    .execute(pool)
    .await?;
    Ok(())
}
