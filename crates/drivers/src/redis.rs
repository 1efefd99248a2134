use crate::{config_str, config_u16, ExecuteRequest, ExecuteResponse, Health, Row, SourceDriver};
use models::{DataSource, Error, Result};
use std::time::Instant;

/// On-demand driver for Redis sources: bounded key/hash/list reads.
#[derive(Default)]
pub struct RedisDriver {
    connection: Option<::redis::aio::MultiplexedConnection>,
}

impl RedisDriver {
    fn connection(&self) -> Result<::redis::aio::MultiplexedConnection> {
        self.connection
            .clone()
            .ok_or_else(|| Error::validation("redis driver is not initialized"))
    }
}

fn remote(err: ::redis::RedisError) -> Error {
    Error::Remote(anyhow::anyhow!("redis: {err}"))
}

#[async_trait::async_trait]
impl SourceDriver for RedisDriver {
    async fn init(&mut self, source: &DataSource) -> Result<()> {
        let config = &source.connection_config;
        let host = config_str(config, "host").ok_or_else(|| Error::validation("missing host"))?;
        let port = config_u16(config, "port").unwrap_or(6379);
        let db = config
            .get("db")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        let url = match config_str(config, "password") {
            Some(password) => format!("redis://:{password}@{host}:{port}/{db}"),
            None => format!("redis://{host}:{port}/{db}"),
        };
        let client = ::redis::Client::open(url).map_err(remote)?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(remote)?;
        self.connection = Some(connection);
        Ok(())
    }

    async fn health_check(&self) -> Result<Health> {
        let started = Instant::now();
        let mut connection = self.connection()?;
        let result: ::redis::RedisResult<String> =
            ::redis::cmd("PING").query_async(&mut connection).await;
        match result {
            Ok(_) => Ok(Health::ok(started.elapsed())),
            Err(err) => Ok(Health::failed(err.to_string(), started.elapsed())),
        }
    }

    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse> {
        let started = Instant::now();
        let mut connection = self.connection()?;

        let key = req.params.get("key").and_then(|v| v.as_str());
        let data = match req.operation.as_str() {
            "get" => {
                let key = key.ok_or_else(|| Error::validation("get requires a key"))?;
                let value: Option<String> = ::redis::cmd("GET")
                    .arg(key)
                    .query_async(&mut connection)
                    .await
                    .map_err(remote)?;
                match value {
                    None => Vec::new(),
                    Some(value) => {
                        let mut row = Row::new();
                        row.insert("key".to_string(), key.into());
                        row.insert("value".to_string(), parse_value(&value));
                        vec![row]
                    }
                }
            }
            "hgetall" => {
                let key = key.ok_or_else(|| Error::validation("hgetall requires a key"))?;
                let pairs: Vec<(String, String)> = ::redis::cmd("HGETALL")
                    .arg(key)
                    .query_async(&mut connection)
                    .await
                    .map_err(remote)?;
                if pairs.is_empty() {
                    Vec::new()
                } else {
                    let mut row = Row::new();
                    for (field, value) in pairs {
                        row.insert(field, parse_value(&value));
                    }
                    vec![row]
                }
            }
            "scan" => {
                let pattern = req
                    .params
                    .get("pattern")
                    .and_then(|v| v.as_str())
                    .unwrap_or("*");
                let limit = req
                    .params
                    .get("limit")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(100);
                let keys: Vec<String> = ::redis::cmd("SCAN")
                    .arg(0)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(limit)
                    .query_async::<_, (u64, Vec<String>)>(&mut connection)
                    .await
                    .map_err(remote)?
                    .1;

                let mut rows = Vec::with_capacity(keys.len());
                for key in keys.into_iter().take(limit as usize) {
                    let value: Option<String> = ::redis::cmd("GET")
                        .arg(&key)
                        .query_async(&mut connection)
                        .await
                        .unwrap_or(None); // Non-string keys read as null.
                    let mut row = Row::new();
                    row.insert("key".to_string(), key.into());
                    row.insert(
                        "value".to_string(),
                        value.map(|v| parse_value(&v)).unwrap_or(serde_json::Value::Null),
                    );
                    rows.push(row);
                }
                rows
            }
            other => {
                return Err(Error::validation(format!(
                    "redis driver does not support operation {other:?}"
                )))
            }
        };

        Ok(ExecuteResponse::with_rows(data, started.elapsed()))
    }

    async fn close(&self) -> Result<()> {
        // Multiplexed connections close when the last clone drops.
        Ok(())
    }
}

/// Stored values are JSON when they parse as JSON, plain strings otherwise.
fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

#[cfg(test)]
mod test {
    use super::parse_value;

    #[test]
    fn test_parse_value_prefers_json() {
        assert_eq!(parse_value("{\"a\":1}"), serde_json::json!({"a": 1}));
        assert_eq!(parse_value("42"), serde_json::json!(42));
        assert_eq!(parse_value("plain"), serde_json::json!("plain"));
    }
}
