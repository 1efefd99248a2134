use super::{Id, TriggerType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ScheduleConfig is the legacy per-datasource scheduling rule, kept for
/// compatibility. New scheduling flows exclusively through SyncTask; these
/// rows are loadable and surfaced read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::FromRow))]
pub struct ScheduleConfig {
    pub id: Id,
    pub data_source_id: Id,
    pub trigger_type: TriggerType,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    pub enabled: bool,
    pub next_run_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
