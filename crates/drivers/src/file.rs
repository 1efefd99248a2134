use crate::{config_str, ExecuteRequest, ExecuteResponse, Health, Row, SourceDriver};
use models::{DataSource, Error, Result};
use std::path::PathBuf;
use std::time::Instant;

/// On-demand driver for file sources: bounded reads of JSON, JSON-lines,
/// or CSV files on a locally-reachable path.
#[derive(Default)]
pub struct FileDriver {
    path: PathBuf,
    format: FileFormat,
    delimiter: u8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
enum FileFormat {
    #[default]
    Json,
    Jsonl,
    Csv,
}

#[async_trait::async_trait]
impl SourceDriver for FileDriver {
    async fn init(&mut self, source: &DataSource) -> Result<()> {
        let config = &source.connection_config;
        self.path = config_str(config, "path")
            .ok_or_else(|| Error::validation("missing path"))?
            .into();
        self.format = match config_str(config, "format")
            .ok_or_else(|| Error::validation("missing format"))?
            .as_str()
        {
            "json" => FileFormat::Json,
            "jsonl" | "ndjson" => FileFormat::Jsonl,
            "csv" => FileFormat::Csv,
            other => {
                return Err(Error::validation(format!("unknown file format {other:?}")))
            }
        };
        self.delimiter = config_str(config, "delimiter")
            .and_then(|d| d.bytes().next())
            .unwrap_or(b',');
        Ok(())
    }

    async fn health_check(&self) -> Result<Health> {
        let started = Instant::now();
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.is_file() => Ok(Health::ok(started.elapsed())),
            Ok(_) => Ok(Health::failed(
                format!("{} is not a file", self.path.display()),
                started.elapsed(),
            )),
            Err(err) => Ok(Health::failed(err.to_string(), started.elapsed())),
        }
    }

    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse> {
        if req.operation != "read" {
            return Err(Error::validation(format!(
                "file driver does not support operation {:?}",
                req.operation
            )));
        }
        let limit = req
            .params
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize);

        let started = Instant::now();
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| {
                Error::Remote(anyhow::anyhow!("reading {}: {err}", self.path.display()))
            })?;

        let mut warnings = Vec::new();
        let data = match self.format {
            FileFormat::Json => parse_json(&contents)?,
            FileFormat::Jsonl => parse_jsonl(&contents, &mut warnings),
            FileFormat::Csv => parse_csv(&contents, self.delimiter)?,
        };
        let data = match limit {
            Some(limit) => data.into_iter().take(limit).collect(),
            None => data,
        };

        let mut response = ExecuteResponse::with_rows(data, started.elapsed());
        response.warnings = warnings;
        Ok(response)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn parse_json(contents: &str) -> Result<Vec<Row>> {
    let value: serde_json::Value = serde_json::from_str(contents)
        .map_err(|err| Error::Remote(anyhow::anyhow!("file is not valid JSON: {err}")))?;
    match value {
        serde_json::Value::Array(items) => Ok(items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::Object(map) => map,
                other => {
                    let mut row = Row::new();
                    row.insert("value".to_string(), other);
                    row
                }
            })
            .collect()),
        serde_json::Value::Object(map) => Ok(vec![map]),
        _ => Err(Error::validation(
            "a JSON file must hold an array or an object",
        )),
    }
}

fn parse_jsonl(contents: &str, warnings: &mut Vec<String>) -> Vec<Row> {
    let mut rows = Vec::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(serde_json::Value::Object(map)) => rows.push(map),
            Ok(other) => {
                let mut row = Row::new();
                row.insert("value".to_string(), other);
                rows.push(row);
            }
            Err(err) => warnings.push(format!("line {}: {err}", number + 1)),
        }
    }
    rows
}

fn parse_csv(contents: &str, delimiter: u8) -> Result<Vec<Row>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(contents.as_bytes());

    let headers = reader
        .headers()
        .map_err(|err| Error::Remote(anyhow::anyhow!("reading csv header: {err}")))?
        .clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|err| Error::Remote(anyhow::anyhow!("reading csv record: {err}")))?;
        let mut row = Row::new();
        for (header, value) in headers.iter().zip(record.iter()) {
            row.insert(header.to_string(), serde_json::Value::String(value.to_string()));
        }
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use models::{Id, SourceCategory, SourceStatus, SourceType};
    use std::io::Write;

    fn source(path: &std::path::Path, format: &str) -> DataSource {
        DataSource {
            id: Id::new(5),
            name: "drop-zone".to_string(),
            type_: SourceType::File,
            category: SourceCategory::File,
            library_id: Id::new(1),
            status: SourceStatus::Active,
            connection_config: serde_json::json!({
                "path": path.to_string_lossy(),
                "format": format,
            }),
            params_config: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reads_csv_with_header() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id,name\n1,ada\n2,grace").unwrap();

        let mut driver = FileDriver::default();
        driver.init(&source(file.path(), "csv")).await.unwrap();

        let response = driver
            .execute(ExecuteRequest {
                operation: "read".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(response.row_count, 2);
        assert_eq!(response.data[0]["name"], serde_json::json!("ada"));
    }

    #[tokio::test]
    async fn test_reads_jsonl_and_skips_bad_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"a\": 1}}\nnot json\n{{\"a\": 2}}").unwrap();

        let mut driver = FileDriver::default();
        driver.init(&source(file.path(), "jsonl")).await.unwrap();

        let response = driver
            .execute(ExecuteRequest {
                operation: "read".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(response.row_count, 2);
        assert_eq!(response.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_limit_bounds_the_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[{{\"a\": 1}}, {{\"a\": 2}}, {{\"a\": 3}}]").unwrap();

        let mut driver = FileDriver::default();
        driver.init(&source(file.path(), "json")).await.unwrap();

        let mut params = Row::new();
        params.insert("limit".to_string(), serde_json::json!(2));
        let response = driver
            .execute(ExecuteRequest {
                operation: "read".to_string(),
                query: None,
                params,
            })
            .await
            .unwrap();
        assert_eq!(response.row_count, 2);
    }
}
