//! Data-source lifecycle operations: the service-level surface behind the
//! external admin API. Creation validates and registers; deletion is
//! refused while dependents exist; connect-tests run against throwaway
//! instances.

use chrono::Utc;
use drivers::{SourceDriver, SourceManager, ValidationReport};
use models::{
    DataSource, Error, Id, IdGenerator, Result, SourceStatus, SourceType,
};
use std::sync::Arc;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateDataSource {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: SourceType,
    pub library_id: Id,
    pub connection_config: serde_json::Value,
    #[serde(default)]
    pub params_config: serde_json::Value,
}

/// Outcome of a connect-test: the declarative validation report plus the
/// live probe, when the config was valid enough to initialize a driver.
#[derive(Debug, serde::Serialize)]
pub struct ConnectTestReport {
    pub validation: ValidationReport,
    pub connected: bool,
    pub response_time_ms: Option<i64>,
    pub message: Option<String>,
}

pub struct DataSourceService {
    pool: sqlx::PgPool,
    manager: Arc<SourceManager>,
    id_gen: std::sync::Mutex<IdGenerator>,
}

impl DataSourceService {
    pub fn new(pool: sqlx::PgPool, manager: Arc<SourceManager>, id_gen: IdGenerator) -> Self {
        Self {
            pool,
            manager,
            id_gen: std::sync::Mutex::new(id_gen),
        }
    }

    pub async fn list(&self) -> Result<Vec<DataSource>> {
        datahub_sql::data_sources::list(&self.pool).await
    }

    /// Create a data source: validate its config, persist it, and when
    /// active, register a live driver instance.
    pub async fn create(&self, create: CreateDataSource) -> Result<DataSource> {
        let report = self
            .manager
            .registry()
            .validate(create.type_, &create.connection_config)?;
        if !report.is_valid {
            return Err(Error::validation(format!(
                "invalid connection config: {}",
                report.errors.join("; ")
            )));
        }

        // The library must exist; its type namespaces the source.
        datahub_sql::data_sources::fetch_library(create.library_id, &self.pool).await?;

        let now = Utc::now();
        let source = DataSource {
            id: self.id_gen.lock().unwrap().next(),
            name: create.name,
            category: create.type_.category(),
            type_: create.type_,
            library_id: create.library_id,
            status: SourceStatus::Inactive,
            connection_config: create.connection_config,
            params_config: create.params_config,
            created_at: now,
            updated_at: now,
        };
        datahub_sql::data_sources::insert(&source, &self.pool).await?;
        tracing::info!(source_id = %source.id, name = %source.name, "created data source");
        Ok(source)
    }

    /// Flip a source active/inactive, registering or removing the live
    /// instance accordingly.
    pub async fn set_status(&self, id: Id, status: SourceStatus) -> Result<DataSource> {
        datahub_sql::data_sources::update_status(id, status, &self.pool).await?;
        let source = datahub_sql::data_sources::fetch(id, &self.pool).await?;

        match status {
            SourceStatus::Active => {
                if !self.manager.contains(id).await {
                    self.manager.register(source.clone()).await?;
                }
            }
            SourceStatus::Inactive => {
                self.manager.remove(id).await?;
            }
        }
        Ok(source)
    }

    /// Delete a source. Refused while interfaces or running tasks depend
    /// on it.
    pub async fn delete(&self, id: Id) -> Result<()> {
        let (interfaces, running_tasks) =
            datahub_sql::data_sources::count_dependents(id, &self.pool).await?;
        if interfaces > 0 {
            return Err(Error::conflict(format!(
                "data source {id} still owns {interfaces} interfaces"
            )));
        }
        if running_tasks > 0 {
            return Err(Error::conflict(format!(
                "data source {id} is referenced by {running_tasks} running tasks"
            )));
        }

        self.manager.remove(id).await?;
        datahub_sql::data_sources::delete(id, &self.pool).await?;
        tracing::info!(source_id = %id, "deleted data source");
        Ok(())
    }

    /// Delete an interface. Refused while a running task references it.
    pub async fn delete_interface(&self, interface_id: Id) -> Result<()> {
        let running =
            datahub_sql::interfaces::count_referencing_tasks(interface_id, &self.pool).await?;
        if running > 0 {
            return Err(Error::conflict(format!(
                "interface {interface_id} is referenced by {running} running tasks"
            )));
        }
        datahub_sql::interfaces::delete(interface_id, &self.pool).await?;
        tracing::info!(interface_id = %interface_id, "deleted interface");
        Ok(())
    }

    /// Connect-test a config without registering anything: declarative
    /// validation first, then a throwaway instance and a health probe.
    pub async fn test_connection(
        &self,
        type_: SourceType,
        connection_config: serde_json::Value,
    ) -> Result<ConnectTestReport> {
        let validation = self.manager.registry().validate(type_, &connection_config)?;
        if !validation.is_valid {
            return Ok(ConnectTestReport {
                validation,
                connected: false,
                response_time_ms: None,
                message: Some("config validation failed".to_string()),
            });
        }

        let now = Utc::now();
        let probe_source = DataSource {
            id: Id::default(),
            name: "connect-test".to_string(),
            category: type_.category(),
            type_,
            library_id: Id::default(),
            status: SourceStatus::Inactive,
            connection_config,
            params_config: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };

        let report = match self.manager.create_test_instance(type_, &probe_source).await {
            Err(err) => ConnectTestReport {
                validation,
                connected: false,
                response_time_ms: None,
                message: Some(err.to_string()),
            },
            Ok(driver) => {
                let health = driver.health_check().await;
                let _ = driver.close().await;
                match health {
                    Ok(health) => ConnectTestReport {
                        validation,
                        connected: health.healthy,
                        response_time_ms: Some(health.response_time.as_millis() as i64),
                        message: health.message,
                    },
                    Err(err) => ConnectTestReport {
                        validation,
                        connected: false,
                        response_time_ms: None,
                        message: Some(err.to_string()),
                    },
                }
            }
        };
        Ok(report)
    }
}
