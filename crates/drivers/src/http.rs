use crate::{config_str, ExecuteRequest, ExecuteResponse, Health, Row, SourceDriver};
use anyhow::Context;
use models::{DataSource, Error, Result};
use std::time::Instant;

/// On-demand driver for HTTP API sources. One configured endpoint; request
/// parameters are merged as query parameters (GET) or the JSON body
/// (POST/PUT).
#[derive(Default)]
pub struct HttpDriver {
    client: Option<reqwest::Client>,
    url: String,
    method: reqwest::Method,
    headers: Vec<(String, String)>,
}

impl HttpDriver {
    fn client(&self) -> Result<&reqwest::Client> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::validation("http driver is not initialized"))
    }
}

#[async_trait::async_trait]
impl SourceDriver for HttpDriver {
    async fn init(&mut self, source: &DataSource) -> Result<()> {
        let config = &source.connection_config;
        self.url = config_str(config, "url").ok_or_else(|| Error::validation("missing url"))?;
        url::Url::parse(&self.url)
            .map_err(|err| Error::validation(format!("invalid url: {err}")))?;

        let method = config_str(config, "method").unwrap_or_else(|| "GET".to_string());
        self.method = method
            .to_ascii_uppercase()
            .parse()
            .map_err(|_| Error::validation(format!("invalid http method {method:?}")))?;

        if let Some(headers) = config.get("headers").and_then(|v| v.as_object()) {
            self.headers = headers
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect();
        }

        self.client = Some(
            reqwest::Client::builder()
                .timeout(crate::DEFAULT_EXECUTE_TIMEOUT)
                .build()
                .context("building http client")
                .map_err(Error::Remote)?,
        );
        Ok(())
    }

    async fn health_check(&self) -> Result<Health> {
        let started = Instant::now();
        let result = self
            .client()?
            .request(reqwest::Method::HEAD, &self.url)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                Ok(Health::ok(started.elapsed()))
            }
            Ok(resp) => Ok(Health::failed(
                format!("endpoint returned {}", resp.status()),
                started.elapsed(),
            )),
            Err(err) => Ok(Health::failed(err.to_string(), started.elapsed())),
        }
    }

    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse> {
        let started = Instant::now();

        let mut request = self.client()?.request(self.method.clone(), &self.url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        // The `_watermark` and other parameters ride along in the way the
        // endpoint expects for the configured method.
        let params: Row = req
            .params
            .iter()
            .filter(|(k, _)| *k != "data_path")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !params.is_empty() {
            if self.method == reqwest::Method::GET {
                let pairs: Vec<(String, String)> = params
                    .iter()
                    .map(|(k, v)| {
                        let value = match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), value)
                    })
                    .collect();
                request = request.query(&pairs);
            } else {
                request = request.json(&params);
            }
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("requesting {}", self.url))
            .map_err(Error::Remote)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Remote(anyhow::anyhow!(
                "endpoint {} returned {status}",
                self.url
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .context("decoding response body as JSON")
            .map_err(Error::Remote)?;

        let data_path = req.params.get("data_path").and_then(|v| v.as_str());
        let data = extract_rows(&body, data_path)?;

        Ok(ExecuteResponse::with_rows(data, started.elapsed()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Pull the row array out of a response body. `data_path` is a JSON
/// pointer-style path (`/data/items` or `data.items`); without one the
/// body itself must be an array or a single object.
fn extract_rows(body: &serde_json::Value, data_path: Option<&str>) -> Result<Vec<Row>> {
    let target = match data_path {
        None => body,
        Some(path) => {
            let pointer = if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{}", path.replace('.', "/"))
            };
            body.pointer(&pointer).ok_or_else(|| {
                Error::validation(format!("data_path {path:?} not present in response"))
            })?
        }
    };

    match target {
        serde_json::Value::Array(items) => Ok(items
            .iter()
            .map(|item| match item {
                serde_json::Value::Object(map) => map.clone(),
                other => {
                    let mut row = Row::new();
                    row.insert("value".to_string(), other.clone());
                    row
                }
            })
            .collect()),
        serde_json::Value::Object(map) => Ok(vec![map.clone()]),
        other => Err(Error::validation(format!(
            "response data is {} rather than an array or object",
            kind_of(other)
        ))),
    }
}

fn kind_of(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod test {
    use super::extract_rows;

    #[test]
    fn test_extract_rows_with_dotted_path() {
        let body = serde_json::json!({"data": {"items": [{"a": 1}, {"a": 2}]}});
        let rows = extract_rows(&body, Some("data.items")).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["a"], serde_json::json!(2));
    }

    #[test]
    fn test_extract_rows_from_bare_array_and_object() {
        let rows = extract_rows(&serde_json::json!([{"a": 1}]), None).unwrap();
        assert_eq!(rows.len(), 1);

        let rows = extract_rows(&serde_json::json!({"a": 1}), None).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_scalar_elements_become_value_rows() {
        let rows = extract_rows(&serde_json::json!([1, 2]), None).unwrap();
        assert_eq!(rows[0]["value"], serde_json::json!(1));
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let body = serde_json::json!({"data": []});
        assert!(extract_rows(&body, Some("rows")).is_err());
    }
}
