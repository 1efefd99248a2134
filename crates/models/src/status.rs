use super::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ProbeState is the last observed connection state of a data source or
/// interface, as reported by health checks and executions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sqlx-support",
    derive(sqlx::Type),
    sqlx(rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum ProbeState {
    Online,
    Testing,
    Offline,
    Error,
}

impl ProbeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeState::Online => "online",
            ProbeState::Testing => "testing",
            ProbeState::Offline => "offline",
            ProbeState::Error => "error",
        }
    }
}

/// DataSourceStatus is the derived, probe-updated status row of a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::FromRow))]
pub struct DataSourceStatus {
    pub data_source_id: Id,
    pub status: ProbeState,
    pub last_test_time: Option<DateTime<Utc>>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub avg_response_time_ms: Option<i64>,
    pub statistics: serde_json::Value,
    pub health_score: i32,
    pub updated_at: DateTime<Utc>,
}

/// InterfaceStatus mirrors DataSourceStatus at interface granularity, with
/// optional data-quality contributions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::FromRow))]
pub struct InterfaceStatus {
    pub interface_id: Id,
    pub status: ProbeState,
    pub last_test_time: Option<DateTime<Utc>>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub last_query_time: Option<DateTime<Utc>>,
    pub avg_response_time_ms: Option<i64>,
    pub completeness: Option<f64>,
    pub accuracy: Option<f64>,
    pub statistics: serde_json::Value,
    pub quality_score: i32,
    pub updated_at: DateTime<Utc>,
}
