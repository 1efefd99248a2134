use super::{Error, Id, LibraryType, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sqlx-support",
    derive(sqlx::Type),
    sqlx(rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    FullSync,
    IncrementalSync,
    RealtimeSync,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sqlx-support",
    derive(sqlx::Type),
    sqlx(rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Once,
    Interval,
    Cron,
}

/// TaskStatus is the lifecycle state of a task. It changes only through
/// explicit operator actions (activate, pause, resume), never as a side
/// effect of a run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sqlx-support",
    derive(sqlx::Type),
    sqlx(rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Draft,
    Active,
    Paused,
}

impl TaskStatus {
    /// The lifecycle transition table. Draft may only activate; active and
    /// paused toggle between one another.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!((self, to), (Draft, Active) | (Active, Paused) | (Paused, Active))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Draft => "draft",
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
        }
    }
}

/// ExecutionStatus is the runtime state of a task (or of one task
/// interface). It changes as runs start and finish, on a different horizon
/// than [`TaskStatus`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sqlx-support",
    derive(sqlx::Type),
    sqlx(rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Idle,
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Idle => "idle",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }
}

/// SyncTask is the central scheduling entity: a schedulable unit which fans
/// out to one or more interface executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::FromRow))]
pub struct SyncTask {
    pub id: Id,
    pub library_type: LibraryType,
    pub library_id: Id,
    pub data_source_id: Id,
    pub task_type: TaskType,
    pub trigger_type: TriggerType,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub execution_status: ExecutionStatus,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub processed_rows: i64,
    pub progress: i32,
    pub error_message: Option<String>,
    pub config: serde_json::Value,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncTask {
    /// A task may start only when it is active and no run is in flight.
    pub fn can_start(&self) -> bool {
        self.status == TaskStatus::Active
            && matches!(
                self.execution_status,
                ExecutionStatus::Idle | ExecutionStatus::Failed | ExecutionStatus::Success
            )
    }

    /// Validate the trigger invariants: cron requires an expression,
    /// interval a positive period, once a scheduled time.
    pub fn validate_trigger(&self) -> Result<()> {
        validate_trigger(
            self.trigger_type,
            self.cron_expression.as_deref(),
            self.interval_seconds,
            self.scheduled_time,
        )
    }
}

pub fn validate_trigger(
    trigger_type: TriggerType,
    cron_expression: Option<&str>,
    interval_seconds: Option<i64>,
    scheduled_time: Option<DateTime<Utc>>,
) -> Result<()> {
    match trigger_type {
        TriggerType::Manual => Ok(()),
        TriggerType::Cron => match cron_expression {
            Some(expr) if !expr.is_empty() => Ok(()),
            _ => Err(Error::validation(
                "trigger_type=cron requires a non-empty cron_expression",
            )),
        },
        TriggerType::Interval => match interval_seconds {
            Some(secs) if secs > 0 => Ok(()),
            _ => Err(Error::validation(
                "trigger_type=interval requires interval_seconds > 0",
            )),
        },
        TriggerType::Once => match scheduled_time {
            Some(_) => Ok(()),
            None => Err(Error::validation(
                "trigger_type=once requires a scheduled_time",
            )),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn task() -> SyncTask {
        SyncTask {
            id: Id::new(1),
            library_type: LibraryType::Basic,
            library_id: Id::new(2),
            data_source_id: Id::new(3),
            task_type: TaskType::FullSync,
            trigger_type: TriggerType::Manual,
            cron_expression: None,
            interval_seconds: None,
            scheduled_time: None,
            status: TaskStatus::Active,
            execution_status: ExecutionStatus::Idle,
            next_run_time: None,
            last_run_time: None,
            processed_rows: 0,
            progress: 0,
            error_message: None,
            config: serde_json::json!({}),
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_transition_table() {
        use TaskStatus::*;
        assert!(Draft.can_transition_to(Active));
        assert!(!Draft.can_transition_to(Paused));
        assert!(Active.can_transition_to(Paused));
        assert!(!Active.can_transition_to(Draft));
        assert!(Paused.can_transition_to(Active));
        assert!(!Paused.can_transition_to(Draft));
    }

    #[test]
    fn test_can_start_gating() {
        let mut t = task();
        assert!(t.can_start());

        t.execution_status = ExecutionStatus::Running;
        assert!(!t.can_start());

        t.execution_status = ExecutionStatus::Failed;
        assert!(t.can_start());

        t.status = TaskStatus::Draft;
        assert!(!t.can_start());

        t.status = TaskStatus::Paused;
        assert!(!t.can_start());
    }

    #[test]
    fn test_task_serialization_shape() {
        let mut t = task();
        t.trigger_type = TriggerType::Cron;
        t.cron_expression = Some("0 */5 * * * *".to_string());
        t.created_at = chrono::DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        t.updated_at = t.created_at;

        insta::assert_json_snapshot!(t, @r#"
        {
          "id": "0000000000000001",
          "library_type": "basic",
          "library_id": "0000000000000002",
          "data_source_id": "0000000000000003",
          "task_type": "full_sync",
          "trigger_type": "cron",
          "cron_expression": "0 */5 * * * *",
          "interval_seconds": null,
          "scheduled_time": null,
          "status": "active",
          "execution_status": "idle",
          "next_run_time": null,
          "last_run_time": null,
          "processed_rows": 0,
          "progress": 0,
          "error_message": null,
          "config": {},
          "created_by": null,
          "created_at": "2024-06-01T00:00:00Z",
          "updated_at": "2024-06-01T00:00:00Z"
        }
        "#);
    }

    #[test]
    fn test_trigger_invariants() {
        let mut t = task();
        t.trigger_type = TriggerType::Cron;
        assert!(t.validate_trigger().is_err());
        t.cron_expression = Some(String::new());
        assert!(t.validate_trigger().is_err());
        t.cron_expression = Some("0 */1 * * * *".to_string());
        assert!(t.validate_trigger().is_ok());

        let mut t = task();
        t.trigger_type = TriggerType::Interval;
        assert!(t.validate_trigger().is_err());
        t.interval_seconds = Some(0);
        assert!(t.validate_trigger().is_err());
        t.interval_seconds = Some(60);
        assert!(t.validate_trigger().is_ok());

        let mut t = task();
        t.trigger_type = TriggerType::Once;
        assert!(t.validate_trigger().is_err());
        t.scheduled_time = Some(Utc::now());
        assert!(t.validate_trigger().is_ok());
    }
}
