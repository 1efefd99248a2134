use crate::mapping;
use crate::schema::{SchemaOp, SchemaService};
use datahub_sql::interfaces::ResolvedInterface;
use datahub_sql::target;
use drivers::{ExecuteRequest, Row, SourceDriver, SourceManager};
use models::{Error, Id, ProbeState, Result, SourceType};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Well-known parameter key carrying the incremental lower bound.
pub const WATERMARK_PARAM: &str = "_watermark";

const DEFAULT_PREVIEW_LIMIT: u64 = 100;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecuteType {
    /// The unified path used by tasks: full or incremental by interface
    /// config, writing into the target table.
    Sync,
    /// Bounded read, no write.
    Preview,
    /// Like preview, but against a one-off driver instance.
    Test,
}

#[derive(Debug)]
pub struct ExecutorRequest {
    pub interface_id: Id,
    pub execute_type: ExecuteType,
    pub parameters: Row,
    pub limit: Option<u64>,
}

impl ExecutorRequest {
    pub fn sync(interface_id: Id) -> Self {
        Self {
            interface_id,
            execute_type: ExecuteType::Sync,
            parameters: Row::new(),
            limit: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecutorResponse {
    pub success: bool,
    pub row_count: u64,
    pub updated_rows: u64,
    pub column_count: usize,
    pub data: Option<Vec<Row>>,
    pub table_updated: bool,
    pub warnings: Vec<String>,
    pub message: Option<String>,
    pub duration: Duration,
}

/// InterfaceExecutor runs one sync unit against a data source: resolve the
/// interface, invoke the driver, map fields, upsert into the target table,
/// and advance the watermark implicitly through the written rows.
///
/// The executor is stateless; everything it needs rides in the request.
pub struct InterfaceExecutor {
    pool: sqlx::PgPool,
    manager: Arc<SourceManager>,
    schema: Arc<dyn SchemaService>,
    batch_size: usize,
}

impl InterfaceExecutor {
    pub fn new(
        pool: sqlx::PgPool,
        manager: Arc<SourceManager>,
        schema: Arc<dyn SchemaService>,
    ) -> Self {
        Self {
            pool,
            manager,
            schema,
            batch_size: target::DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[tracing::instrument(skip(self, cancel), fields(interface_id = %request.interface_id))]
    pub async fn execute(
        &self,
        request: ExecutorRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutorResponse> {
        let started = Instant::now();

        let resolved = datahub_sql::interfaces::resolve(request.interface_id, &self.pool).await?;
        let source =
            datahub_sql::data_sources::fetch(resolved.interface.data_source_id, &self.pool).await?;

        let mut table_updated = false;
        if request.execute_type == ExecuteType::Sync && !resolved.interface.is_table_created {
            self.schema
                .manage_table_schema(
                    resolved.interface.id,
                    SchemaOp::CreateTable,
                    &resolved.schema_name,
                    &resolved.interface.name_en,
                    &resolved.interface.fields,
                )
                .await?;
            datahub_sql::interfaces::set_table_created(resolved.interface.id, &self.pool).await?;
            table_updated = true;
        }

        let driver_request = self.build_driver_request(&request, &resolved, source.type_).await?;

        if cancel.is_cancelled() {
            return Err(Error::conflict("execution cancelled"));
        }

        // A `test` run uses a throwaway instance so that a misbehaving
        // config cannot disturb the registered driver.
        let outcome = if request.execute_type == ExecuteType::Test {
            let driver = self
                .manager
                .create_test_instance(source.type_, &source)
                .await?;
            let outcome = driver.execute(driver_request).await;
            let _ = driver.close().await;
            outcome
        } else {
            // Register transparently when the source is active but not
            // yet held by the manager.
            if !self.manager.contains(source.id).await {
                if !source.is_active() {
                    return Err(Error::conflict(format!(
                        "data source {} is not active",
                        source.id
                    )));
                }
                self.manager.register(source.clone()).await?;
            }
            let managed = self.manager.get(source.id).await?;
            managed.driver.execute(driver_request).await
        };

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                self.record_interface_probe(&resolved, started, Some(&err.to_string()))
                    .await;
                return Err(err);
            }
        };

        let mut warnings = response.warnings;
        let renames = mapping::field_map(&resolved.interface.parse_config);
        let mapped = mapping::map_rows(
            &response.data,
            &resolved.interface.fields,
            &renames,
            &mut warnings,
        );

        let mut out = ExecutorResponse {
            success: true,
            row_count: mapped.len() as u64,
            column_count: resolved.interface.fields.len(),
            table_updated,
            ..Default::default()
        };

        match request.execute_type {
            ExecuteType::Preview | ExecuteType::Test => {
                let limit = request.limit.unwrap_or(DEFAULT_PREVIEW_LIMIT) as usize;
                out.data = Some(mapped.into_iter().take(limit).collect());
                out.row_count = out.data.as_ref().map(|d| d.len() as u64).unwrap_or(0);
            }
            ExecuteType::Sync => {
                let mut written = 0u64;
                for chunk in mapped.chunks(self.batch_size) {
                    // Cancellation is observed between batches; an
                    // in-flight batch always completes.
                    if cancel.is_cancelled() {
                        warnings.push("cancelled before all batches were written".to_string());
                        out.success = false;
                        out.message = Some("execution cancelled".to_string());
                        break;
                    }
                    written += target::upsert_rows(
                        &resolved.schema_name,
                        &resolved.interface.name_en,
                        &resolved.interface.fields,
                        chunk.to_vec(),
                        self.batch_size,
                        &self.pool,
                    )
                    .await?;
                }
                out.updated_rows = written;
            }
        }

        out.warnings = warnings;
        out.duration = started.elapsed();

        self.record_interface_probe(&resolved, started, None).await;

        tracing::debug!(
            rows = out.row_count,
            written = out.updated_rows,
            duration_ms = out.duration.as_millis() as u64,
            "interface execution finished"
        );
        Ok(out)
    }

    /// Build the driver-specific request from parse_config, the
    /// incremental config, and the caller's parameters.
    async fn build_driver_request(
        &self,
        request: &ExecutorRequest,
        resolved: &ResolvedInterface,
        source_type: SourceType,
    ) -> Result<ExecuteRequest> {
        let parse_config = &resolved.interface.parse_config;

        let mut params = Row::new();
        if let Some(config) = parse_config.as_object() {
            for (key, value) in config {
                if key == "field_map" || key == "query" {
                    continue;
                }
                params.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in &request.parameters {
            params.insert(key.clone(), value.clone());
        }

        // Incremental pulls: bound the query at the target's current
        // watermark, or the configured initial value on the first run.
        if request.execute_type == ExecuteType::Sync {
            if let Some(incremental) = &resolved.interface.incremental_config {
                let current = target::max_watermark(
                    &resolved.schema_name,
                    &resolved.interface.name_en,
                    &incremental.watermark_column,
                    &self.pool,
                )
                .await?;
                let (since, exclusive) = match current {
                    Some(current) => (Some(current), true),
                    None => (incremental.initial_value.clone(), false),
                };

                params.insert(
                    "watermark_column".to_string(),
                    incremental.watermark_column.clone().into(),
                );
                if let Some(since) = since {
                    params.insert(WATERMARK_PARAM.to_string(), since.into());
                    params.insert("_watermark_exclusive".to_string(), exclusive.into());
                }
            }
        } else if let Some(limit) = request.limit {
            params.insert("limit".to_string(), limit.into());
        }

        let operation = match source_type {
            SourceType::Postgresql | SourceType::Mysql | SourceType::Http => "query",
            SourceType::Kafka | SourceType::Mqtt => "consume",
            SourceType::Redis => params
                .get("operation")
                .and_then(|v| v.as_str())
                .unwrap_or("scan"),
            SourceType::File => "read",
        }
        .to_string();

        Ok(ExecuteRequest {
            operation,
            query: parse_config
                .get("query")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            params,
        })
    }

    async fn record_interface_probe(
        &self,
        resolved: &ResolvedInterface,
        started: Instant,
        error: Option<&str>,
    ) {
        let now = chrono::Utc::now();
        let elapsed_ms = started.elapsed().as_millis() as i64;
        let state = if error.is_none() {
            ProbeState::Online
        } else {
            ProbeState::Error
        };

        // Fold this probe into the status row; the score is computed over
        // the merged view so older error history still weighs in.
        let merged = datahub_sql::statuses::fetch_interface_status(resolved.interface.id, &self.pool)
            .await
            .ok()
            .flatten();
        let score = {
            let mut snapshot = merged.unwrap_or_else(|| models::InterfaceStatus {
                interface_id: resolved.interface.id,
                status: state,
                last_test_time: Some(now),
                last_error_time: None,
                last_query_time: Some(now),
                avg_response_time_ms: Some(elapsed_ms),
                completeness: None,
                accuracy: None,
                statistics: serde_json::json!({}),
                quality_score: 0,
                updated_at: now,
            });
            snapshot.status = state;
            snapshot.last_test_time = Some(now);
            if error.is_some() {
                snapshot.last_error_time = Some(now);
            }
            snapshot.avg_response_time_ms = Some(elapsed_ms);
            crate::health::interface_quality_score(&snapshot, now)
        };

        if let Err(err) = datahub_sql::statuses::upsert_interface_status(
            resolved.interface.id,
            state,
            Some(now),
            Some(elapsed_ms),
            error,
            score,
            &self.pool,
        )
        .await
        {
            tracing::warn!(interface_id = %resolved.interface.id, %err, "failed to record interface status");
        }
    }
}
