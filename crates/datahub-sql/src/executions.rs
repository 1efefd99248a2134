use chrono::{DateTime, Utc};
use models::{ExecutionStatus, ExecutionType, Id, Result, SyncTaskExecution};

pub async fn insert(
    id: Id,
    task_id: Id,
    execution_type: ExecutionType,
    start_time: DateTime<Utc>,
    pool: &sqlx::PgPool,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into sync_task_executions (
            id, task_id, execution_type, start_time, status, result
        ) values ($1, $2, $3, $4, 'running', '{}'::jsonb)
        "#,
    )
    .bind(id)
    .bind(task_id)
    .bind(execution_type)
    .bind(start_time)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn finalize(
    id: Id,
    status: ExecutionStatus,
    result: &serde_json::Value,
    error_message: Option<&str>,
    pool: &sqlx::PgPool,
) -> Result<()> {
    sqlx::query(
        r#"
        update sync_task_executions
        set status = $2, result = $3, error_message = $4, end_time = now()
        where id = $1
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(result)
    .bind(error_message)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_for_task(task_id: Id, pool: &sqlx::PgPool) -> Result<Vec<SyncTaskExecution>> {
    Ok(sqlx::query_as::<_, SyncTaskExecution>(
        r#"
        select id, task_id, execution_type, start_time, end_time, status,
               result, error_message
        from sync_task_executions
        where task_id = $1
        order by start_time desc
        "#,
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?)
}

/// Delete basic-library execution rows older than the cutoff, returning the
/// number deleted.
pub async fn delete_before(cutoff: DateTime<Utc>, pool: &sqlx::PgPool) -> Result<u64> {
    let done = sqlx::query("delete from sync_task_executions where start_time < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(done.rows_affected())
}

/// Same, for the thematic materialization engine's execution history.
pub async fn delete_thematic_before(cutoff: DateTime<Utc>, pool: &sqlx::PgPool) -> Result<u64> {
    let done = sqlx::query("delete from thematic_sync_executions where start_time < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(done.rows_affected())
}
