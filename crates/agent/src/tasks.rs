use crate::executor::{ExecutorRequest, InterfaceExecutor};
use crate::scheduler::{compute_next_run, SchedulerCommand};
use chrono::Utc;
use drivers::Row;
use models::{
    Error, ExecutionStatus, ExecutionType, Id, IdGenerator, LibraryType, Result, SyncTask,
    SyncTaskInterface, TaskStatus, TaskType, TriggerType,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Inputs of task creation, as supplied by the external surface.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateSyncTask {
    pub library_type: LibraryType,
    pub library_id: Id,
    pub data_source_id: Id,
    pub interface_ids: Vec<Id>,
    #[serde(default)]
    pub interface_configs: HashMap<Id, serde_json::Value>,
    pub task_type: TaskType,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub interval_seconds: Option<i64>,
    #[serde(default)]
    pub scheduled_time: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub created_by: Option<String>,
}

struct RunHandle {
    cancel: CancellationToken,
    reason: Arc<std::sync::Mutex<Option<String>>>,
}

/// SyncTaskService owns the SyncTask lifecycle: creation, the
/// draft/active/paused transitions, starting and finishing runs, retry,
/// and the boot-time reset of interrupted executions.
pub struct SyncTaskService {
    pool: sqlx::PgPool,
    executor: Arc<InterfaceExecutor>,
    id_gen: std::sync::Mutex<IdGenerator>,
    running: tokio::sync::Mutex<HashMap<Id, RunHandle>>,
    scheduler: std::sync::Mutex<Option<UnboundedSender<SchedulerCommand>>>,
}

impl SyncTaskService {
    pub fn new(pool: sqlx::PgPool, executor: Arc<InterfaceExecutor>, id_gen: IdGenerator) -> Self {
        Self {
            pool,
            executor,
            id_gen: std::sync::Mutex::new(id_gen),
            running: tokio::sync::Mutex::new(HashMap::new()),
            scheduler: std::sync::Mutex::new(None),
        }
    }

    /// Wire the scheduler's command channel. Done once at startup, after
    /// both halves exist.
    pub fn set_scheduler(&self, tx: UnboundedSender<SchedulerCommand>) {
        *self.scheduler.lock().unwrap() = Some(tx);
    }

    fn next_id(&self) -> Id {
        self.id_gen.lock().unwrap().next()
    }

    fn notify_scheduler(&self, command: SchedulerCommand) {
        let guard = self.scheduler.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            if tx.send(command).is_err() {
                tracing::debug!("scheduler command channel closed");
            }
        }
    }

    /// Create a task in `draft`, with one SyncTaskInterface per interface.
    /// Draft tasks are not scheduled.
    #[tracing::instrument(skip(self, create))]
    pub async fn create(&self, create: CreateSyncTask) -> Result<SyncTask> {
        if create.interface_ids.is_empty() {
            return Err(Error::validation("a task requires at least one interface"));
        }
        models::validate_trigger(
            create.trigger_type,
            create.cron_expression.as_deref(),
            create.interval_seconds,
            create.scheduled_time,
        )?;

        // Validate the (library, data source, interfaces) triple.
        let library = datahub_sql::data_sources::fetch_library(create.library_id, &self.pool).await?;
        if library.library_type != create.library_type {
            return Err(Error::validation(format!(
                "library {} is not a {} library",
                create.library_id,
                create.library_type.as_str()
            )));
        }
        let source = datahub_sql::data_sources::fetch(create.data_source_id, &self.pool).await?;
        if source.library_id != create.library_id {
            return Err(Error::validation(format!(
                "data source {} does not belong to library {}",
                source.id, create.library_id
            )));
        }
        for interface_id in &create.interface_ids {
            let interface = datahub_sql::interfaces::fetch(*interface_id, &self.pool).await?;
            if interface.data_source_id != create.data_source_id {
                return Err(Error::validation(format!(
                    "interface {} does not belong to data source {}",
                    interface_id, create.data_source_id
                )));
            }
        }

        let now = Utc::now();
        let next_run_time = compute_next_run(
            create.trigger_type,
            create.cron_expression.as_deref(),
            create.interval_seconds,
            create.scheduled_time,
            now,
        )?;

        let task = SyncTask {
            id: self.next_id(),
            library_type: create.library_type,
            library_id: create.library_id,
            data_source_id: create.data_source_id,
            task_type: create.task_type,
            trigger_type: create.trigger_type,
            cron_expression: create.cron_expression,
            interval_seconds: create.interval_seconds,
            scheduled_time: create.scheduled_time,
            status: TaskStatus::Draft,
            execution_status: ExecutionStatus::Idle,
            next_run_time,
            last_run_time: None,
            processed_rows: 0,
            progress: 0,
            error_message: None,
            config: create.config.unwrap_or_else(|| serde_json::json!({})),
            created_by: create.created_by,
            created_at: now,
            updated_at: now,
        };

        let mut txn = self.pool.begin().await?;
        datahub_sql::tasks::insert(&task, &mut txn).await?;
        for interface_id in &create.interface_ids {
            let row = SyncTaskInterface {
                id: self.next_id(),
                task_id: task.id,
                interface_id: *interface_id,
                config: create
                    .interface_configs
                    .get(interface_id)
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({})),
                execution_status: ExecutionStatus::Idle,
                processed_rows: 0,
                error_message: None,
                created_at: now,
                updated_at: now,
            };
            datahub_sql::tasks::insert_task_interface(&row, &mut txn).await?;
        }
        txn.commit().await?;

        tracing::info!(task_id = %task.id, interfaces = create.interface_ids.len(), "created sync task");
        Ok(task)
    }

    async fn transition(&self, id: Id, to: TaskStatus) -> Result<SyncTask> {
        let task = datahub_sql::tasks::fetch(id, &self.pool).await?;
        if !task.status.can_transition_to(to) {
            return Err(Error::conflict(format!(
                "cannot move task {} from {} to {}",
                id,
                task.status.as_str(),
                to.as_str()
            )));
        }
        datahub_sql::tasks::update_lifecycle_status(id, to, &self.pool).await?;
        datahub_sql::tasks::fetch(id, &self.pool).await
    }

    /// Activate a draft or paused task and register it with the scheduler.
    pub async fn activate(&self, id: Id) -> Result<SyncTask> {
        let task = datahub_sql::tasks::fetch(id, &self.pool).await?;
        task.validate_trigger()?;

        let task = self.transition(id, TaskStatus::Active).await?;

        // Recompute the schedule from activation time.
        let next_run_time = compute_next_run(
            task.trigger_type,
            task.cron_expression.as_deref(),
            task.interval_seconds,
            task.scheduled_time,
            Utc::now(),
        )?;
        datahub_sql::tasks::update_next_run_time(id, next_run_time, &self.pool).await?;

        let task = datahub_sql::tasks::fetch(id, &self.pool).await?;
        if task.trigger_type != TriggerType::Manual {
            self.notify_scheduler(SchedulerCommand::Register(task.clone()));
        }
        tracing::info!(task_id = %id, "activated sync task");
        Ok(task)
    }

    /// Pause a task; an in-flight run is finalized as failed("paused").
    pub async fn pause(&self, id: Id) -> Result<SyncTask> {
        let task = self.transition(id, TaskStatus::Paused).await?;
        self.notify_scheduler(SchedulerCommand::Remove(id));

        if let Some(handle) = self.running.lock().await.get(&id) {
            *handle.reason.lock().unwrap() = Some("paused".to_string());
            handle.cancel.cancel();
        }
        tracing::info!(task_id = %id, "paused sync task");
        Ok(task)
    }

    /// Resume is activation from `paused`.
    pub async fn resume(&self, id: Id) -> Result<SyncTask> {
        self.activate(id).await
    }

    /// Update a task's schedule; allowed in any lifecycle state. The
    /// scheduler reloads the entry when the task is active.
    pub async fn update_schedule(
        &self,
        id: Id,
        trigger_type: TriggerType,
        cron_expression: Option<String>,
        interval_seconds: Option<i64>,
        scheduled_time: Option<chrono::DateTime<Utc>>,
    ) -> Result<SyncTask> {
        models::validate_trigger(
            trigger_type,
            cron_expression.as_deref(),
            interval_seconds,
            scheduled_time,
        )?;
        let next_run_time = compute_next_run(
            trigger_type,
            cron_expression.as_deref(),
            interval_seconds,
            scheduled_time,
            Utc::now(),
        )?;

        datahub_sql::tasks::update_schedule(
            id,
            trigger_type,
            cron_expression.as_deref(),
            interval_seconds,
            scheduled_time,
            next_run_time,
            &self.pool,
        )
        .await?;

        let task = datahub_sql::tasks::fetch(id, &self.pool).await?;
        if task.status == TaskStatus::Active {
            if task.trigger_type == TriggerType::Manual {
                self.notify_scheduler(SchedulerCommand::Remove(id));
            } else {
                self.notify_scheduler(SchedulerCommand::Register(task.clone()));
            }
        }
        Ok(task)
    }

    /// Delete a task and its interface/execution rows. Refused while a run
    /// is in progress.
    pub async fn delete(&self, id: Id) -> Result<()> {
        let task = datahub_sql::tasks::fetch(id, &self.pool).await?;
        if task.execution_status == ExecutionStatus::Running {
            return Err(Error::conflict(format!(
                "task {id} has an execution in progress"
            )));
        }
        self.notify_scheduler(SchedulerCommand::Remove(id));

        let mut txn = self.pool.begin().await?;
        datahub_sql::tasks::delete(id, &mut txn).await?;
        txn.commit().await?;
        tracing::info!(task_id = %id, "deleted sync task");
        Ok(())
    }

    /// Delete many tasks; per-id failures are collected, not fatal.
    pub async fn batch_delete(&self, ids: &[Id]) -> Vec<(Id, Error)> {
        let mut failures = Vec::new();
        for id in ids {
            if let Err(err) = self.delete(*id).await {
                failures.push((*id, err));
            }
        }
        failures
    }

    /// Start a run. Scheduled starts require `active`; an explicit manual
    /// start may also run a draft task. Returns the execution id. The
    /// runner is detached: it survives the caller's cancellation.
    #[tracing::instrument(skip(self))]
    pub async fn start(self: Arc<Self>, id: Id, execution_type: ExecutionType) -> Result<Id> {
        let allow_draft = execution_type == ExecutionType::Manual;
        let claimed = datahub_sql::tasks::try_begin_run(id, allow_draft, &self.pool).await?;
        if !claimed {
            let task = datahub_sql::tasks::fetch(id, &self.pool).await?;
            return Err(Error::conflict(format!(
                "task {} is not startable (status {}, execution {})",
                id,
                task.status.as_str(),
                task.execution_status.as_str()
            )));
        }

        let execution_id = self.next_id();
        datahub_sql::executions::insert(execution_id, id, execution_type, Utc::now(), &self.pool)
            .await?;

        let handle = RunHandle {
            cancel: CancellationToken::new(),
            reason: Arc::new(std::sync::Mutex::new(None)),
        };
        let cancel = handle.cancel.clone();
        let reason = handle.reason.clone();
        self.running.lock().await.insert(id, handle);

        let service = self.clone();
        tokio::spawn(async move {
            service.run(id, execution_id, cancel, reason).await;
        });

        tracing::info!(task_id = %id, execution_id = %execution_id, ?execution_type, "started sync task");
        Ok(execution_id)
    }

    /// Stop an in-flight run; it is finalized as failed("stopped").
    pub async fn stop(&self, id: Id) -> Result<()> {
        let running = self.running.lock().await;
        let Some(handle) = running.get(&id) else {
            return Err(Error::conflict(format!("task {id} is not running")));
        };
        *handle.reason.lock().unwrap() = Some("stopped".to_string());
        handle.cancel.cancel();
        Ok(())
    }

    /// The detached runner: iterate the task's interfaces sequentially,
    /// execute each, and aggregate the outcome.
    async fn run(
        self: Arc<Self>,
        task_id: Id,
        execution_id: Id,
        cancel: CancellationToken,
        reason: Arc<std::sync::Mutex<Option<String>>>,
    ) {
        let outcome = self.run_interfaces(task_id, &cancel).await;

        let (status, processed_rows, error_message, result) = match outcome {
            Err(err) => {
                let message = err.to_string();
                (
                    ExecutionStatus::Failed,
                    0,
                    Some(message.clone()),
                    serde_json::json!({ "error": message }),
                )
            }
            Ok(run) if cancel.is_cancelled() => {
                let message = reason
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| "cancelled".to_string());
                (
                    ExecutionStatus::Failed,
                    run.processed_rows,
                    Some(message.clone()),
                    serde_json::json!({
                        "error": message,
                        "interfaces": run.details,
                    }),
                )
            }
            Ok(run) => {
                let status = if run.failures == 0 {
                    ExecutionStatus::Success
                } else if run.successes > 0 {
                    ExecutionStatus::Success // Partial: success with an error summary.
                } else {
                    ExecutionStatus::Failed
                };
                let error_message = if run.failures > 0 {
                    Some(format!(
                        "{} of {} interfaces failed: {}",
                        run.failures,
                        run.failures + run.successes,
                        run.errors.join("; ")
                    ))
                } else {
                    None
                };
                let result = serde_json::json!({
                    "total_rows": run.processed_rows,
                    "interfaces": run.details,
                });
                (status, run.processed_rows, error_message, result)
            }
        };

        if let Err(err) = datahub_sql::tasks::finish_run(
            task_id,
            status,
            processed_rows,
            error_message.as_deref(),
            &self.pool,
        )
        .await
        {
            tracing::error!(task_id = %task_id, %err, "failed to persist run outcome");
        }
        if let Err(err) = datahub_sql::executions::finalize(
            execution_id,
            status,
            &result,
            error_message.as_deref(),
            &self.pool,
        )
        .await
        {
            tracing::error!(execution_id = %execution_id, %err, "failed to finalize execution row");
        }

        self.running.lock().await.remove(&task_id);
        tracing::info!(
            task_id = %task_id,
            execution_id = %execution_id,
            status = status.as_str(),
            processed_rows,
            "sync task finished"
        );
    }

    async fn run_interfaces(&self, task_id: Id, cancel: &CancellationToken) -> Result<RunOutcome> {
        let interfaces = datahub_sql::tasks::fetch_task_interfaces(task_id, &self.pool).await?;
        let count = interfaces.len().max(1);

        let mut run = RunOutcome::default();
        for (at, task_interface) in interfaces.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            let parameters: Row = task_interface
                .config
                .as_object()
                .cloned()
                .unwrap_or_default();
            let request = ExecutorRequest {
                parameters,
                ..ExecutorRequest::sync(task_interface.interface_id)
            };

            let (status, rows, error) = match self.executor.execute(request, cancel).await {
                Ok(response) if response.success => {
                    (ExecutionStatus::Success, response.updated_rows as i64, None)
                }
                Ok(response) => (
                    ExecutionStatus::Failed,
                    response.updated_rows as i64,
                    response.message,
                ),
                Err(err) => (ExecutionStatus::Failed, 0, Some(err.to_string())),
            };

            if let Err(err) = datahub_sql::tasks::update_task_interface_outcome(
                task_interface.id,
                status,
                rows,
                error.as_deref(),
                &self.pool,
            )
            .await
            {
                tracing::warn!(task_interface = %task_interface.id, %err, "failed to persist interface outcome");
            }

            run.processed_rows += rows;
            match status {
                ExecutionStatus::Success => run.successes += 1,
                _ => {
                    run.failures += 1;
                    if let Some(error) = &error {
                        run.errors.push(format!(
                            "interface {}: {error}",
                            task_interface.interface_id
                        ));
                    }
                }
            }
            run.details.push(serde_json::json!({
                "interface_id": task_interface.interface_id,
                "status": status.as_str(),
                "rows": rows,
                "error": error,
            }));

            let progress = (((at + 1) * 100) / count) as i32;
            if let Err(err) =
                datahub_sql::tasks::update_progress(task_id, progress, &self.pool).await
            {
                tracing::debug!(task_id = %task_id, %err, "failed to update progress");
            }
        }
        Ok(run)
    }

    /// Retry: a fresh task copying the original's rows with runtime fields
    /// reset.
    pub async fn retry(&self, id: Id) -> Result<SyncTask> {
        let original = datahub_sql::tasks::fetch(id, &self.pool).await?;
        let interfaces = datahub_sql::tasks::fetch_task_interfaces(id, &self.pool).await?;

        let now = Utc::now();
        let copy = SyncTask {
            id: self.next_id(),
            status: TaskStatus::Draft,
            execution_status: ExecutionStatus::Idle,
            next_run_time: None,
            last_run_time: None,
            processed_rows: 0,
            progress: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            ..original
        };

        let mut txn = self.pool.begin().await?;
        datahub_sql::tasks::insert(&copy, &mut txn).await?;
        for task_interface in interfaces {
            let row = SyncTaskInterface {
                id: self.next_id(),
                task_id: copy.id,
                execution_status: ExecutionStatus::Idle,
                processed_rows: 0,
                error_message: None,
                created_at: now,
                updated_at: now,
                ..task_interface
            };
            datahub_sql::tasks::insert_task_interface(&row, &mut txn).await?;
        }
        txn.commit().await?;

        tracing::info!(original = %id, retry = %copy.id, "created retry task");
        Ok(copy)
    }

    /// Boot-time reset: every task left `running` by a previous process is
    /// flipped to failed, because its detached runner no longer exists.
    pub async fn reset_interrupted(&self) -> Result<usize> {
        let ids = datahub_sql::tasks::reset_interrupted(&self.pool).await?;
        if !ids.is_empty() {
            tracing::warn!(
                tasks = ids.len(),
                "reset interrupted executions from a previous process"
            );
        }
        Ok(ids.len())
    }

    pub async fn fetch(&self, id: Id) -> Result<SyncTask> {
        datahub_sql::tasks::fetch(id, &self.pool).await
    }

    pub async fn list(&self) -> Result<Vec<SyncTask>> {
        datahub_sql::tasks::list(&self.pool).await
    }

    /// Durable per-run history of a task, newest first.
    pub async fn executions(&self, id: Id) -> Result<Vec<models::SyncTaskExecution>> {
        datahub_sql::executions::list_for_task(id, &self.pool).await
    }
}

#[derive(Default)]
struct RunOutcome {
    processed_rows: i64,
    successes: usize,
    failures: usize,
    errors: Vec<String>,
    details: Vec<serde_json::Value>,
}
