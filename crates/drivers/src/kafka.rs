use crate::{
    config_str, config_string_list, ExecuteRequest, ExecuteResponse, Health, RealtimeRecord,
    RealtimeSender, Row, SourceDriver,
};
use models::{DataSource, Error, Id, Result};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// Preview buffer depth for `consume` requests against a running consumer.
const RECENT_CAPACITY: usize = 200;

/// Resident driver for Kafka sources: holds a consumer-group subscription
/// and pushes decoded records into the realtime pipeline.
#[derive(Default)]
pub struct KafkaDriver {
    source_name: String,
    topics: Vec<String>,
    consumer: Mutex<Option<StreamConsumer>>,
    running: Arc<AtomicBool>,
    cancel: Mutex<Option<CancellationToken>>,
    recent: Arc<Mutex<VecDeque<Row>>>,
    consumed: Arc<AtomicU64>,
}

fn decode_payload(payload: &[u8]) -> Result<Row> {
    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|err| Error::Remote(anyhow::anyhow!("message payload is not JSON: {err}")))?;
    Ok(match value {
        serde_json::Value::Object(map) => map,
        other => {
            let mut row = Row::new();
            row.insert("value".to_string(), other);
            row
        }
    })
}

#[async_trait::async_trait]
impl SourceDriver for KafkaDriver {
    async fn init(&mut self, source: &DataSource) -> Result<()> {
        let config = &source.connection_config;
        let brokers = config_string_list(config, "brokers");
        if brokers.is_empty() {
            return Err(Error::validation("missing brokers"));
        }
        self.topics = config_string_list(config, "topics");
        if self.topics.is_empty() {
            return Err(Error::validation("missing topics"));
        }
        self.source_name = source.name.clone();

        let group_id = config_str(config, "group_id")
            .unwrap_or_else(|| format!("datahub-{}", source.id));

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("group.id", &group_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|err| Error::Remote(anyhow::anyhow!("creating kafka consumer: {err}")))?;
        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|err| Error::Remote(anyhow::anyhow!("subscribing {topics:?}: {err}")))?;

        *self.consumer.lock().unwrap() = Some(consumer);
        Ok(())
    }

    async fn health_check(&self) -> Result<Health> {
        if self.running.load(Ordering::Relaxed) {
            let mut health = Health::ok(Duration::ZERO);
            health.message = Some(format!(
                "consuming, {} records received",
                self.consumed.load(Ordering::Relaxed)
            ));
            return Ok(health);
        }
        if self.consumer.lock().unwrap().is_some() {
            let mut health = Health::ok(Duration::ZERO);
            health.message = Some("consumer initialized, delivery not started".to_string());
            return Ok(health);
        }
        Ok(Health::failed("consumer is closed", Duration::ZERO))
    }

    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse> {
        if req.operation != "consume" {
            return Err(Error::validation(format!(
                "kafka driver does not support operation {:?}",
                req.operation
            )));
        }
        let limit = req
            .params
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(100) as usize;

        // Preview answers from the recent-record buffer rather than
        // spinning up a second consumer-group member.
        let recent = self.recent.lock().unwrap();
        let data: Vec<Row> = recent.iter().rev().take(limit).cloned().collect();
        let mut response = ExecuteResponse::with_rows(data, Duration::ZERO);
        if !self.running.load(Ordering::Relaxed) {
            response
                .warnings
                .push("delivery loop is not running; showing any buffered records".to_string());
        }
        Ok(response)
    }

    async fn close(&self) -> Result<()> {
        self.stop().await?;
        self.consumer.lock().unwrap().take();
        Ok(())
    }

    fn is_resident(&self) -> bool {
        true
    }

    async fn start(&self, source_id: Id, sink: RealtimeSender) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(()); // Already delivering.
        }
        let Some(consumer) = self.consumer.lock().unwrap().take() else {
            self.running.store(false, Ordering::SeqCst);
            return Err(Error::validation("kafka consumer is closed"));
        };

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = Some(cancel.clone());

        let running = self.running.clone();
        let recent = self.recent.clone();
        let consumed = self.consumed.clone();
        let source_name = self.source_name.clone();

        tokio::spawn(async move {
            tracing::info!(source = %source_name, "kafka delivery loop started");
            loop {
                let message = tokio::select! {
                    () = cancel.cancelled() => break,
                    message = consumer.recv() => message,
                };
                let message = match message {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::warn!(source = %source_name, ?err, "kafka receive failed (will retry)");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let Some(payload) = message.payload() else {
                    continue;
                };
                let row = match decode_payload(payload) {
                    Ok(row) => row,
                    Err(err) => {
                        tracing::warn!(source = %source_name, topic = message.topic(), %err, "skipping undecodable message");
                        continue;
                    }
                };

                {
                    let mut recent = recent.lock().unwrap();
                    if recent.len() == RECENT_CAPACITY {
                        recent.pop_front();
                    }
                    recent.push_back(row.clone());
                }
                consumed.fetch_add(1, Ordering::Relaxed);

                let record = RealtimeRecord {
                    source_id,
                    topic: message.topic().to_string(),
                    row,
                };
                if sink.send(record).await.is_err() {
                    tracing::warn!(source = %source_name, "realtime pipeline closed; stopping kafka delivery");
                    break;
                }
            }
            running.store(false, Ordering::SeqCst);
            tracing::info!(source = %source_name, "kafka delivery loop stopped");
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::decode_payload;

    #[test]
    fn test_decode_object_payload() {
        let row = decode_payload(br#"{"user_id": 1001, "ts": "2024-06-01T10:00:00Z"}"#).unwrap();
        assert_eq!(row["user_id"], serde_json::json!(1001));
    }

    #[test]
    fn test_decode_scalar_payload_wraps_value() {
        let row = decode_payload(b"42").unwrap();
        assert_eq!(row["value"], serde_json::json!(42));
    }

    #[test]
    fn test_decode_garbage_is_an_error() {
        assert!(decode_payload(b"not json").is_err());
    }
}
