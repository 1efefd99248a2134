use crate::{
    config_str, config_u16, relational, ExecuteRequest, ExecuteResponse, Health, SourceDriver,
};
use anyhow::Context;
use models::{DataSource, Error, Result};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use std::time::Instant;

/// On-demand driver for MySQL sources.
#[derive(Default)]
pub struct MysqlDriver {
    pool: Option<sqlx::MySqlPool>,
}

impl MysqlDriver {
    fn pool(&self) -> Result<&sqlx::MySqlPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| Error::validation("mysql driver is not initialized"))
    }

    async fn list_tables(&self) -> Result<ExecuteResponse> {
        let started = Instant::now();
        let rows = sqlx::query(
            r#"
            select table_name, table_type
            from information_schema.tables
            where table_schema = database()
            order by table_name
            "#,
        )
        .fetch_all(self.pool()?)
        .await
        .map_err(|err| Error::Remote(anyhow::Error::new(err).context("listing tables")))?;

        let mut warnings = Vec::new();
        let data = rows
            .iter()
            .map(|row| relational::mysql_row_to_json(row, &mut warnings))
            .collect();
        Ok(ExecuteResponse::with_rows(data, started.elapsed()))
    }

    async fn list_columns(&self, req: &ExecuteRequest) -> Result<ExecuteResponse> {
        let table = req
            .params
            .get("table")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::validation("columns requires a table"))?;
        let started = Instant::now();

        let rows = sqlx::query(
            r#"
            select column_name, data_type, is_nullable, column_default, ordinal_position
            from information_schema.columns
            where table_schema = database() and table_name = ?
            order by ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(self.pool()?)
        .await
        .map_err(|err| Error::Remote(anyhow::Error::new(err).context("listing columns")))?;

        let mut warnings = Vec::new();
        let data = rows
            .iter()
            .map(|row| relational::mysql_row_to_json(row, &mut warnings))
            .collect();
        Ok(ExecuteResponse::with_rows(data, started.elapsed()))
    }
}

#[async_trait::async_trait]
impl SourceDriver for MysqlDriver {
    async fn init(&mut self, source: &DataSource) -> Result<()> {
        let config = &source.connection_config;
        let mut options = MySqlConnectOptions::new()
            .host(&config_str(config, "host").ok_or_else(|| Error::validation("missing host"))?)
            .port(config_u16(config, "port").unwrap_or(3306))
            .database(
                &config_str(config, "database")
                    .ok_or_else(|| Error::validation("missing database"))?,
            )
            .username(
                &config_str(config, "user").ok_or_else(|| Error::validation("missing user"))?,
            );
        if let Some(password) = config_str(config, "password") {
            options = options.password(&password);
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(crate::DEFAULT_EXECUTE_TIMEOUT)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to mysql source {:?}", source.name))
            .map_err(Error::Remote)?;

        self.pool = Some(pool);
        Ok(())
    }

    async fn health_check(&self) -> Result<Health> {
        let started = Instant::now();
        match sqlx::query("select 1").execute(self.pool()?).await {
            Ok(_) => Ok(Health::ok(started.elapsed())),
            Err(err) => Ok(Health::failed(err.to_string(), started.elapsed())),
        }
    }

    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse> {
        match req.operation.as_str() {
            "query" => {}
            "tables" => return self.list_tables().await,
            "columns" => return self.list_columns(&req).await,
            other => {
                return Err(Error::validation(format!(
                    "mysql driver does not support operation {other:?}"
                )))
            }
        }
        let plan = relational::build_query(relational::Dialect::Mysql, &req)?;
        let started = Instant::now();

        let mut query = sqlx::query(&plan.statement);
        if let Some(watermark) = &plan.watermark {
            query = query.bind(watermark);
        }
        let rows = query
            .fetch_all(self.pool()?)
            .await
            .map_err(|err| Error::Remote(anyhow::Error::new(err).context("mysql query")))?;

        let mut warnings = Vec::new();
        let data = rows
            .iter()
            .map(|row| relational::mysql_row_to_json(row, &mut warnings))
            .collect();

        let mut response = ExecuteResponse::with_rows(data, started.elapsed());
        response.warnings = warnings;
        Ok(response)
    }

    async fn close(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
        Ok(())
    }
}
