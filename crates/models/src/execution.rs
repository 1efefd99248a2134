use super::{ExecutionStatus, Id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SyncTaskInterface binds one interface into a task, with per-interface
/// config and runtime status. It is the fan-out unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::FromRow))]
pub struct SyncTaskInterface {
    pub id: Id,
    pub task_id: Id,
    pub interface_id: Id,
    pub config: serde_json::Value,
    pub execution_status: ExecutionStatus,
    pub processed_rows: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sqlx-support",
    derive(sqlx::Type),
    sqlx(rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Manual,
    Scheduled,
    InterfaceExecutor,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::Manual => "manual",
            ExecutionType::Scheduled => "scheduled",
            ExecutionType::InterfaceExecutor => "interface_executor",
        }
    }
}

/// SyncTaskExecution is the durable record of one attempted run of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::FromRow))]
pub struct SyncTaskExecution {
    pub id: Id,
    pub task_id: Id,
    pub execution_type: ExecutionType,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub result: serde_json::Value,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_execution_type_serde() {
        assert_eq!(
            serde_json::to_string(&ExecutionType::InterfaceExecutor).unwrap(),
            "\"interface_executor\""
        );
        assert_eq!(
            serde_json::from_str::<ExecutionType>("\"scheduled\"").unwrap(),
            ExecutionType::Scheduled
        );
    }
}
