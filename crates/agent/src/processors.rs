//! Change processors registered with the listener at startup: they keep
//! the driver registry and the scheduler in step with row changes made by
//! the external admin surface.

use crate::listener::{ChangeEvent, ChangeProcessor, ChangeType};
use crate::scheduler::SchedulerCommand;
use drivers::{SourceDriver, SourceManager};
use models::{Id, TaskStatus, TriggerType};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

fn parse_record_id(event: &ChangeEvent) -> anyhow::Result<Id> {
    event
        .record_id
        .parse()
        .map_err(|err| anyhow::anyhow!("record_id {:?}: {err}", event.record_id))
}

/// Keeps the SourceManager in step with `data_sources` rows: activated
/// sources are (re-)registered, deactivated or deleted ones removed.
pub struct DataSourceChangeProcessor {
    pool: sqlx::PgPool,
    manager: Arc<SourceManager>,
}

impl DataSourceChangeProcessor {
    pub fn new(pool: sqlx::PgPool, manager: Arc<SourceManager>) -> Self {
        Self { pool, manager }
    }
}

#[async_trait::async_trait]
impl ChangeProcessor for DataSourceChangeProcessor {
    fn table(&self) -> &'static str {
        "data_sources"
    }

    async fn process(&self, event: ChangeEvent) -> anyhow::Result<()> {
        let id = parse_record_id(&event)?;

        if event.type_ == ChangeType::Delete {
            self.manager.remove(id).await?;
            return Ok(());
        }

        let source = datahub_sql::data_sources::fetch(id, &self.pool).await?;
        if !source.is_active() {
            self.manager.remove(id).await?;
            return Ok(());
        }

        // Re-register so config edits take effect on the live instance.
        let is_resident = self
            .manager
            .registry()
            .new_driver(source.type_)
            .map(|driver| driver.is_resident())
            .unwrap_or(false);
        self.manager.remove(id).await?;
        self.manager.register(source).await?;
        if is_resident {
            self.manager.start_all().await;
        }
        Ok(())
    }
}

/// Keeps the Scheduler in step with `sync_tasks` rows changed outside the
/// task service (for example by another process instance).
pub struct SyncTaskChangeProcessor {
    pool: sqlx::PgPool,
    scheduler: UnboundedSender<SchedulerCommand>,
}

impl SyncTaskChangeProcessor {
    pub fn new(pool: sqlx::PgPool, scheduler: UnboundedSender<SchedulerCommand>) -> Self {
        Self { pool, scheduler }
    }
}

#[async_trait::async_trait]
impl ChangeProcessor for SyncTaskChangeProcessor {
    fn table(&self) -> &'static str {
        "sync_tasks"
    }

    async fn process(&self, event: ChangeEvent) -> anyhow::Result<()> {
        let id = parse_record_id(&event)?;

        if event.type_ == ChangeType::Delete {
            let _ = self.scheduler.send(SchedulerCommand::Remove(id));
            return Ok(());
        }

        let task = datahub_sql::tasks::fetch(id, &self.pool).await?;
        let command = if task.status == TaskStatus::Active
            && task.trigger_type != TriggerType::Manual
        {
            SchedulerCommand::Register(task)
        } else {
            SchedulerCommand::Remove(id)
        };
        let _ = self.scheduler.send(command);
        Ok(())
    }
}
