use chrono::{DateTime, Utc};
use models::{
    Error, ExecutionStatus, Id, Result, SyncTask, SyncTaskInterface, TaskStatus,
};

const COLUMNS: &str = r#"
    id, library_type, library_id, data_source_id, task_type, trigger_type,
    cron_expression, interval_seconds, scheduled_time, status,
    execution_status, next_run_time, last_run_time, processed_rows, progress,
    error_message, config, created_by, created_at, updated_at
"#;

pub async fn fetch(id: Id, pool: &sqlx::PgPool) -> Result<SyncTask> {
    sqlx::query_as::<_, SyncTask>(&format!("select {COLUMNS} from sync_tasks where id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::not_found("sync task", id))
}

pub async fn list(pool: &sqlx::PgPool) -> Result<Vec<SyncTask>> {
    Ok(
        sqlx::query_as::<_, SyncTask>(&format!(
            "select {COLUMNS} from sync_tasks order by created_at"
        ))
        .fetch_all(pool)
        .await?,
    )
}

/// Tasks the scheduler must hold timers for: active, non-manual triggers.
pub async fn list_schedulable(pool: &sqlx::PgPool) -> Result<Vec<SyncTask>> {
    Ok(sqlx::query_as::<_, SyncTask>(&format!(
        r#"
        select {COLUMNS} from sync_tasks
        where status = 'active' and trigger_type != 'manual'
        order by created_at
        "#
    ))
    .fetch_all(pool)
    .await?)
}

/// Interval-triggered tasks whose next_run_time has come due.
pub async fn list_due_interval(
    now: DateTime<Utc>,
    pool: &sqlx::PgPool,
) -> Result<Vec<SyncTask>> {
    Ok(sqlx::query_as::<_, SyncTask>(&format!(
        r#"
        select {COLUMNS} from sync_tasks
        where status = 'active'
          and trigger_type = 'interval'
          and next_run_time is not null
          and next_run_time <= $1
        order by next_run_time
        "#
    ))
    .bind(now)
    .fetch_all(pool)
    .await?)
}

pub async fn insert(
    task: &SyncTask,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into sync_tasks (
            id, library_type, library_id, data_source_id, task_type,
            trigger_type, cron_expression, interval_seconds, scheduled_time,
            status, execution_status, next_run_time, last_run_time,
            processed_rows, progress, error_message, config, created_by,
            created_at, updated_at
        ) values (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
            $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
        )
        "#,
    )
    .bind(task.id)
    .bind(task.library_type)
    .bind(task.library_id)
    .bind(task.data_source_id)
    .bind(task.task_type)
    .bind(task.trigger_type)
    .bind(&task.cron_expression)
    .bind(task.interval_seconds)
    .bind(task.scheduled_time)
    .bind(task.status)
    .bind(task.execution_status)
    .bind(task.next_run_time)
    .bind(task.last_run_time)
    .bind(task.processed_rows)
    .bind(task.progress)
    .bind(&task.error_message)
    .bind(&task.config)
    .bind(&task.created_by)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(&mut *txn)
    .await?;
    Ok(())
}

pub async fn insert_task_interface(
    row: &SyncTaskInterface,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into sync_task_interfaces (
            id, task_id, interface_id, config, execution_status,
            processed_rows, error_message, created_at, updated_at
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(row.id)
    .bind(row.task_id)
    .bind(row.interface_id)
    .bind(&row.config)
    .bind(row.execution_status)
    .bind(row.processed_rows)
    .bind(&row.error_message)
    .bind(row.created_at)
    .bind(row.updated_at)
    .execute(&mut *txn)
    .await?;
    Ok(())
}

pub async fn fetch_task_interfaces(
    task_id: Id,
    pool: &sqlx::PgPool,
) -> Result<Vec<SyncTaskInterface>> {
    Ok(sqlx::query_as::<_, SyncTaskInterface>(
        r#"
        select id, task_id, interface_id, config, execution_status,
               processed_rows, error_message, created_at, updated_at
        from sync_task_interfaces
        where task_id = $1
        order by created_at, id
        "#,
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?)
}

pub async fn update_lifecycle_status(
    id: Id,
    status: TaskStatus,
    pool: &sqlx::PgPool,
) -> Result<()> {
    sqlx::query("update sync_tasks set status = $2, updated_at = now() where id = $1")
        .bind(id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

/// Atomically claim a task for a run. The WHERE clause re-checks the
/// can-start predicate so that two racing starters cannot both claim it.
/// An explicit manual start may also claim a draft task.
pub async fn try_begin_run(id: Id, allow_draft: bool, pool: &sqlx::PgPool) -> Result<bool> {
    let done = sqlx::query(
        r#"
        update sync_tasks
        set execution_status = 'running',
            last_run_time = now(),
            progress = 0,
            error_message = null,
            updated_at = now()
        where id = $1
          and (status = 'active' or ($2 and status = 'draft'))
          and execution_status in ('idle', 'failed', 'success')
        "#,
    )
    .bind(id)
    .bind(allow_draft)
    .execute(pool)
    .await?;
    Ok(done.rows_affected() == 1)
}

pub async fn finish_run(
    id: Id,
    status: ExecutionStatus,
    processed_rows: i64,
    error_message: Option<&str>,
    pool: &sqlx::PgPool,
) -> Result<()> {
    sqlx::query(
        r#"
        update sync_tasks
        set execution_status = $2,
            processed_rows = $3,
            progress = 100,
            error_message = $4,
            updated_at = now()
        where id = $1
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(processed_rows)
    .bind(error_message)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_progress(id: Id, progress: i32, pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query("update sync_tasks set progress = $2, updated_at = now() where id = $1")
        .bind(id)
        .bind(progress.clamp(0, 100))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_next_run_time(
    id: Id,
    next_run_time: Option<DateTime<Utc>>,
    pool: &sqlx::PgPool,
) -> Result<()> {
    sqlx::query("update sync_tasks set next_run_time = $2, updated_at = now() where id = $1")
        .bind(id)
        .bind(next_run_time)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_schedule(
    id: Id,
    trigger_type: models::TriggerType,
    cron_expression: Option<&str>,
    interval_seconds: Option<i64>,
    scheduled_time: Option<DateTime<Utc>>,
    next_run_time: Option<DateTime<Utc>>,
    pool: &sqlx::PgPool,
) -> Result<()> {
    sqlx::query(
        r#"
        update sync_tasks
        set trigger_type = $2,
            cron_expression = $3,
            interval_seconds = $4,
            scheduled_time = $5,
            next_run_time = $6,
            updated_at = now()
        where id = $1
        "#,
    )
    .bind(id)
    .bind(trigger_type)
    .bind(cron_expression)
    .bind(interval_seconds)
    .bind(scheduled_time)
    .bind(next_run_time)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_task_interface_outcome(
    id: Id,
    status: ExecutionStatus,
    processed_rows: i64,
    error_message: Option<&str>,
    pool: &sqlx::PgPool,
) -> Result<()> {
    sqlx::query(
        r#"
        update sync_task_interfaces
        set execution_status = $2,
            processed_rows = $3,
            error_message = $4,
            updated_at = now()
        where id = $1
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(processed_rows)
    .bind(error_message)
    .execute(pool)
    .await?;
    Ok(())
}

/// Cascade-delete a task with its interface bindings and execution history.
pub async fn delete(id: Id, txn: &mut sqlx::Transaction<'_, sqlx::Postgres>) -> Result<()> {
    sqlx::query("delete from sync_task_executions where task_id = $1")
        .bind(id)
        .execute(&mut *txn)
        .await?;
    sqlx::query("delete from sync_task_interfaces where task_id = $1")
        .bind(id)
        .execute(&mut *txn)
        .await?;
    sqlx::query("delete from sync_tasks where id = $1")
        .bind(id)
        .execute(&mut *txn)
        .await?;
    Ok(())
}

/// At process boot, any task still marked running was interrupted by the
/// restart: its detached runner no longer exists. Flip such tasks to
/// failed before the scheduler starts.
pub async fn reset_interrupted(pool: &sqlx::PgPool) -> Result<Vec<Id>> {
    let ids: Vec<Id> = sqlx::query_scalar(
        r#"
        update sync_tasks
        set execution_status = 'failed',
            error_message = 'restart interrupted execution',
            updated_at = now()
        where execution_status = 'running'
        returning id
        "#,
    )
    .fetch_all(pool)
    .await?;

    if !ids.is_empty() {
        sqlx::query(
            r#"
            update sync_task_interfaces
            set execution_status = 'failed',
                error_message = 'restart interrupted execution',
                updated_at = now()
            where execution_status = 'running'
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            r#"
            update sync_task_executions
            set status = 'failed',
                end_time = now(),
                error_message = 'restart interrupted execution'
            where status = 'running'
            "#,
        )
        .execute(pool)
        .await?;
    }
    Ok(ids)
}
