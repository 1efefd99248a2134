use models::{Result, ScheduleConfig};

/// Legacy per-datasource schedule rules, surfaced read-only for
/// compatibility. New scheduling flows through sync_tasks.
pub async fn list(pool: &sqlx::PgPool) -> Result<Vec<ScheduleConfig>> {
    Ok(sqlx::query_as::<_, ScheduleConfig>(
        r#"
        select id, data_source_id, trigger_type, cron_expression,
               interval_seconds, enabled, next_run_time, created_at, updated_at
        from schedule_configs
        order by created_at
        "#,
    )
    .fetch_all(pool)
    .await?)
}
