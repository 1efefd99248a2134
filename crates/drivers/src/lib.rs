use models::{DataSource, Id, Result};
use std::time::Duration;

mod file;
mod http;
mod kafka;
mod manager;
mod mqtt;
mod mysql;
mod postgres;
mod realtime;
mod registry;
mod relational;
mod redis;
mod validate;

pub use manager::{ManagedSource, RuntimeStatus, SourceManager, SourceStatistics};
pub use realtime::{
    preload_bindings, DataWriter, InterfaceLoader, RealtimeBinding, RealtimePipeline,
    RealtimePipelineConfig, RealtimeRecord, RealtimeSender,
};
pub use registry::DriverRegistry;
pub use validate::{advisory_suggestions, validate_config, FieldKind, FieldSchema, ValidationReport};

/// Row is one record produced by a driver: an ordered map of column name to
/// JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Default timeout applied to request/response driver calls. Resident
/// drivers are not bounded.
pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// ExecuteRequest asks a driver to perform one operation, such as `query`
/// for relational sources, `consume` for messaging sources, or `read` for
/// file sources.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub operation: String,
    pub query: Option<String>,
    pub params: Row,
}

#[derive(Debug, Default)]
pub struct ExecuteResponse {
    pub success: bool,
    pub data: Vec<Row>,
    pub row_count: u64,
    pub duration: Duration,
    pub metadata: Row,
    pub warnings: Vec<String>,
    pub message: Option<String>,
}

impl ExecuteResponse {
    pub fn with_rows(data: Vec<Row>, duration: Duration) -> Self {
        Self {
            success: true,
            row_count: data.len() as u64,
            data,
            duration,
            ..Default::default()
        }
    }
}

/// Health is the outcome of a driver probe.
#[derive(Debug, Clone)]
pub struct Health {
    pub healthy: bool,
    pub message: Option<String>,
    pub response_time: Duration,
}

impl Health {
    pub fn ok(response_time: Duration) -> Self {
        Self {
            healthy: true,
            message: None,
            response_time,
        }
    }
    pub fn failed(message: impl Into<String>, response_time: Duration) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
            response_time,
        }
    }
}

/// SourceDriver is the capability set every data-source type implements.
///
/// `init` runs exactly once, before the instance is shared; all other
/// operations take `&self` and may run concurrently. Resident drivers hold
/// a long-lived connection and push records through the realtime seam
/// (`start`/`stop`); on-demand drivers answer `execute` requests.
#[async_trait::async_trait]
pub trait SourceDriver: Send + Sync {
    async fn init(&mut self, source: &DataSource) -> Result<()>;

    async fn health_check(&self) -> Result<Health>;

    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse>;

    async fn close(&self) -> Result<()>;

    fn is_resident(&self) -> bool {
        false
    }

    /// Begin pushing records into the realtime pipeline. Only resident
    /// drivers implement this; it is idempotent.
    async fn start(&self, _source_id: Id, _sink: RealtimeSender) -> Result<()> {
        Err(models::Error::validation(
            "this data source is not resident",
        ))
    }

    /// Stop a resident driver's delivery loop. Idempotent.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Extract a string-valued setting from a JSON config map.
pub(crate) fn config_str(config: &serde_json::Value, key: &str) -> Option<String> {
    match config.get(key) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn config_u16(config: &serde_json::Value, key: &str) -> Option<u16> {
    match config.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

/// A `topics`-style setting: either a JSON array of strings or a
/// comma-separated string.
pub(crate) fn config_string_list(config: &serde_json::Value, key: &str) -> Vec<String> {
    match config.get(key) {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(serde_json::Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_config_string_list_accepts_both_shapes() {
        let config = serde_json::json!({"topics": ["a", "b"], "brokers": "x:9092, y:9092"});
        assert_eq!(config_string_list(&config, "topics"), vec!["a", "b"]);
        assert_eq!(
            config_string_list(&config, "brokers"),
            vec!["x:9092", "y:9092"]
        );
        assert!(config_string_list(&config, "missing").is_empty());
    }
}
