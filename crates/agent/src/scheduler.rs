use crate::lock::DistributedLock;
use crate::tasks::SyncTaskService;
use chrono::{DateTime, Utc};
use models::{Error, ExecutionType, Id, LibraryType, Result, SyncTask, TriggerType};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// TTL of the per-fire distributed lock; far beyond any sane dispatch time.
const FIRE_LOCK_TTL: Duration = Duration::from_secs(600);
/// Time allowed for acquiring the lock; a slow answer counts as a skip.
const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);
/// Poll period for interval-triggered tasks.
const INTERVAL_POLL_PERIOD: Duration = Duration::from_secs(60);

/// Commands sent to the scheduler by the task service as tasks are
/// activated, paused, rescheduled, or deleted.
#[derive(Debug)]
pub enum SchedulerCommand {
    Register(SyncTask),
    Remove(Id),
    ReloadAll,
}

/// Compute a task's next run time from its trigger configuration.
/// Cron expressions use the 6-field, seconds-precision form; an invalid
/// expression refuses the computation.
pub fn compute_next_run(
    trigger_type: TriggerType,
    cron_expression: Option<&str>,
    interval_seconds: Option<i64>,
    scheduled_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match trigger_type {
        TriggerType::Manual => Ok(None),
        TriggerType::Once => Ok(scheduled_time),
        TriggerType::Interval => {
            let seconds = interval_seconds
                .filter(|s| *s > 0)
                .ok_or_else(|| Error::validation("interval_seconds must be positive"))?;
            Ok(Some(now + chrono::Duration::seconds(seconds)))
        }
        TriggerType::Cron => {
            let expression = cron_expression
                .filter(|e| !e.is_empty())
                .ok_or_else(|| Error::validation("cron trigger requires an expression"))?;
            let schedule = cron::Schedule::from_str(expression).map_err(|err| {
                Error::validation(format!("invalid cron expression {expression:?}: {err}"))
            })?;
            Ok(schedule.after(&now).next())
        }
    }
}

pub fn fire_lock_key(library_type: LibraryType, task_id: Id) -> String {
    format!("{}:{}", library_type.as_str(), task_id)
}

/// Holds an acquired fire lock; dropping releases it, whether the fire
/// returned, errored, or unwound. Release is fire-and-forget since Drop
/// cannot await; the TTL backstops a release that itself fails.
struct FireLockGuard {
    lock: Arc<dyn DistributedLock>,
    key: String,
}

impl Drop for FireLockGuard {
    fn drop(&mut self) {
        let lock = self.lock.clone();
        let key = std::mem::take(&mut self.key);
        tokio::spawn(async move {
            if let Err(err) = lock.unlock(&key).await {
                tracing::warn!(%key, %err, "failed to release fire lock (TTL will expire it)");
            }
        });
    }
}

/// Scheduler fires active tasks by cron, fixed interval, or one-shot
/// timers. Cron and once entries hold their own timer loop guarded by a
/// cancellation handle; interval tasks are caught by a periodic poller
/// over `next_run_time`. Scheduled fires across process instances are
/// de-duplicated by the distributed lock.
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    pool: sqlx::PgPool,
    service: Arc<SyncTaskService>,
    lock: Arc<dyn DistributedLock>,
    entries: tokio::sync::Mutex<HashMap<Id, CancellationToken>>,
}

impl Scheduler {
    pub fn new(
        pool: sqlx::PgPool,
        service: Arc<SyncTaskService>,
        lock: Arc<dyn DistributedLock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                service,
                lock,
                entries: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Load every schedulable task, then serve commands and the interval
    /// poller until `shutdown` resolves.
    pub async fn serve(
        &self,
        mut commands: mpsc::UnboundedReceiver<SchedulerCommand>,
        shutdown: impl std::future::Future<Output = ()>,
    ) {
        if let Err(err) = self.inner.clone().reload_all().await {
            tracing::error!(%err, "initial scheduler load failed (will retry on reload)");
        }

        let mut poll = tokio::time::interval(INTERVAL_POLL_PERIOD);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.inner.clone().handle_command(command).await;
                }
                _ = poll.tick() => {
                    self.inner.poll_interval_tasks().await;
                }
            }
        }

        tracing::info!("scheduler signaled to stop; cancelling timers");
        let mut entries = self.inner.entries.lock().await;
        for (_, entry) in entries.drain() {
            entry.cancel();
        }
    }
}

impl Inner {
    async fn handle_command(self: Arc<Self>, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Register(task) => self.register(task).await,
            SchedulerCommand::Remove(id) => self.remove(id).await,
            SchedulerCommand::ReloadAll => {
                if let Err(err) = self.reload_all().await {
                    tracing::error!(%err, "scheduler reload failed");
                }
            }
        }
    }

    async fn reload_all(self: Arc<Self>) -> Result<()> {
        let tasks = datahub_sql::tasks::list_schedulable(&self.pool).await?;

        let mut entries = self.entries.lock().await;
        for (_, entry) in entries.drain() {
            entry.cancel();
        }
        drop(entries);

        let count = tasks.len();
        for task in tasks {
            self.clone().register(task).await;
        }
        tracing::info!(tasks = count, "scheduler loaded active tasks");
        Ok(())
    }

    /// Install (or replace) the timer entry for one task.
    async fn register(self: Arc<Self>, task: SyncTask) {
        let mut entries = self.entries.lock().await;
        if let Some(previous) = entries.remove(&task.id) {
            previous.cancel();
        }

        match task.trigger_type {
            TriggerType::Manual => {}
            TriggerType::Interval => {
                // Interval tasks are fired by the poller; make sure a
                // next_run_time exists so the poller can see them.
                if task.next_run_time.is_none() {
                    let next = Utc::now()
                        + chrono::Duration::seconds(task.interval_seconds.unwrap_or(60).max(1));
                    if let Err(err) =
                        datahub_sql::tasks::update_next_run_time(task.id, Some(next), &self.pool)
                            .await
                    {
                        tracing::warn!(task_id = %task.id, %err, "failed to seed next_run_time");
                    }
                }
            }
            TriggerType::Cron => {
                let Some(schedule) = task
                    .cron_expression
                    .as_deref()
                    .and_then(|e| cron::Schedule::from_str(e).ok())
                else {
                    tracing::error!(task_id = %task.id, "active cron task has an unparseable expression");
                    return;
                };
                let cancel = CancellationToken::new();
                entries.insert(task.id, cancel.clone());
                let inner = self.clone();
                let task_id = task.id;
                let library_type = task.library_type;
                tokio::spawn(async move {
                    loop {
                        let Some(next) = schedule.after(&Utc::now()).next() else {
                            break;
                        };
                        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = tokio::time::sleep(wait) => {}
                        }
                        inner.fire(task_id, library_type, Some(next)).await;
                    }
                });
            }
            TriggerType::Once => {
                let Some(at) = task.scheduled_time else {
                    tracing::error!(task_id = %task.id, "active once task has no scheduled_time");
                    return;
                };
                let cancel = CancellationToken::new();
                entries.insert(task.id, cancel.clone());
                let inner = self.clone();
                let task_id = task.id;
                let library_type = task.library_type;
                tokio::spawn(async move {
                    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(wait) => {}
                    }
                    inner.fire(task_id, library_type, None).await;
                });
            }
        }
    }

    async fn remove(&self, id: Id) {
        if let Some(entry) = self.entries.lock().await.remove(&id) {
            entry.cancel();
        }
    }

    async fn poll_interval_tasks(&self) {
        let due = match datahub_sql::tasks::list_due_interval(Utc::now(), &self.pool).await {
            Ok(due) => due,
            Err(err) => {
                tracing::error!(%err, "interval poll query failed");
                return;
            }
        };
        for task in due {
            self.fire(task.id, task.library_type, None).await;
        }
    }

    /// One scheduled fire: lock, re-check, start, advance bookkeeping,
    /// unlock. The acquired lock is held by an RAII guard, so release
    /// happens on every exit path, unwinding included; a crashed process
    /// is covered by the TTL.
    async fn fire(&self, task_id: Id, library_type: LibraryType, occurrence: Option<DateTime<Utc>>) {
        let key = fire_lock_key(library_type, task_id);

        let _guard = match tokio::time::timeout(
            LOCK_ACQUIRE_TIMEOUT,
            self.lock.try_lock(&key, FIRE_LOCK_TTL),
        )
        .await
        {
            Ok(Ok(true)) => Some(FireLockGuard {
                lock: self.lock.clone(),
                key: key.clone(),
            }),
            Ok(Ok(false)) => {
                tracing::info!(%key, "another instance holds the fire lock; skipping");
                return;
            }
            Ok(Err(err)) => {
                // Lock store trouble downgrades to best-effort mode.
                tracing::warn!(%key, %err, "lock store unavailable; firing in best-effort mode");
                None
            }
            Err(_) => {
                tracing::warn!(%key, "lock acquisition timed out; firing in best-effort mode");
                None
            }
        };

        if let Err(err) = self.fire_locked(task_id, occurrence).await {
            tracing::error!(task_id = %task_id, %err, "scheduled fire failed");
        }
    }

    async fn fire_locked(&self, task_id: Id, occurrence: Option<DateTime<Utc>>) -> Result<()> {
        let task = datahub_sql::tasks::fetch(task_id, &self.pool).await?;
        if !task.can_start() {
            tracing::debug!(
                task_id = %task_id,
                status = task.status.as_str(),
                execution_status = task.execution_status.as_str(),
                "task is not startable; skipping fire"
            );
            return Ok(());
        }

        self.service
            .clone()
            .start(task_id, ExecutionType::Scheduled)
            .await?;

        // Advance next_run_time past this occurrence.
        let next = compute_next_run(
            task.trigger_type,
            task.cron_expression.as_deref(),
            task.interval_seconds,
            None, // A fired `once` task has no further occurrence.
            occurrence.unwrap_or_else(Utc::now),
        )
        .unwrap_or(None);
        datahub_sql::tasks::update_next_run_time(task_id, next, &self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_compute_next_run_manual_is_none() {
        let now = Utc::now();
        assert_eq!(
            compute_next_run(TriggerType::Manual, None, None, None, now).unwrap(),
            None
        );
    }

    #[test]
    fn test_compute_next_run_once_returns_scheduled_time() {
        let now = Utc::now();
        let at = now + chrono::Duration::hours(1);
        assert_eq!(
            compute_next_run(TriggerType::Once, None, None, Some(at), now).unwrap(),
            Some(at)
        );
    }

    #[test]
    fn test_compute_next_run_interval() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(
            compute_next_run(TriggerType::Interval, None, Some(300), None, now).unwrap(),
            Some(now + chrono::Duration::seconds(300))
        );
        assert!(compute_next_run(TriggerType::Interval, None, Some(0), None, now).is_err());
    }

    #[test]
    fn test_compute_next_run_cron_with_seconds_precision() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 30).unwrap();
        let next = compute_next_run(
            TriggerType::Cron,
            Some("0 */1 * * * *"),
            None,
            None,
            now,
        )
        .unwrap()
        .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 12, 1, 0).unwrap());
    }

    #[test]
    fn test_invalid_cron_is_refused() {
        let now = Utc::now();
        let err =
            compute_next_run(TriggerType::Cron, Some("not cron"), None, None, now).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = compute_next_run(TriggerType::Cron, Some(""), None, None, now).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_fire_lock_key_shape() {
        let id = Id::new(17);
        assert_eq!(
            fire_lock_key(LibraryType::Basic, id),
            "basic:0000000000000011"
        );
        assert_eq!(
            fire_lock_key(LibraryType::Thematic, id),
            "thematic:0000000000000011"
        );
    }
}
