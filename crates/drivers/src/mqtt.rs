use crate::{
    config_str, config_string_list, ExecuteRequest, ExecuteResponse, Health, RealtimeRecord,
    RealtimeSender, Row, SourceDriver,
};
use models::{DataSource, Error, Id, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RECENT_CAPACITY: usize = 200;

/// Resident driver for MQTT sources. The session is established by
/// `start`; `init` validates and records the connection settings.
#[derive(Default)]
pub struct MqttDriver {
    source_name: String,
    host: String,
    port: u16,
    topics: Vec<String>,
    client_id: String,
    credentials: Option<(String, String)>,
    client: Mutex<Option<AsyncClient>>,
    connected: Arc<AtomicBool>,
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
impl SourceDriver for MqttDriver {
    async fn init(&mut self, source: &DataSource) -> Result<()> {
        let config = &source.connection_config;
        let broker =
            config_str(config, "broker").ok_or_else(|| Error::validation("missing broker"))?;

        // Accept `host`, `host:port`, or `mqtt://host:port` spellings.
        let trimmed = broker
            .strip_prefix("mqtt://")
            .or_else(|| broker.strip_prefix("tcp://"))
            .unwrap_or(&broker);
        let (host, port) = match trimmed.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse()
                    .map_err(|_| Error::validation(format!("invalid broker port {port:?}")))?,
            ),
            None => (trimmed.to_string(), 1883),
        };
        self.host = host;
        self.port = port;

        self.topics = config_string_list(config, "topics");
        if self.topics.is_empty() {
            return Err(Error::validation("missing topics"));
        }
        self.client_id = config_str(config, "client_id")
            .unwrap_or_else(|| format!("datahub-{}", source.id));
        self.credentials = match (
            config_str(config, "username"),
            config_str(config, "password"),
        ) {
            (Some(user), Some(password)) => Some((user, password)),
            _ => None,
        };
        self.source_name = source.name.clone();
        Ok(())
    }

    async fn health_check(&self) -> Result<Health> {
        if !self.running.load(Ordering::Relaxed) {
            let mut health = Health::ok(Duration::ZERO);
            health.message = Some("configured, delivery not started".to_string());
            return Ok(health);
        }
        if self.connected.load(Ordering::Relaxed) {
            let mut health = Health::ok(Duration::ZERO);
            health.message = Some(format!(
                "connected, {} records received",
                self.consumed.load(Ordering::Relaxed)
            ));
            Ok(health)
        } else {
            Ok(Health::failed("broker connection lost", Duration::ZERO))
        }
    }

    async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteResponse> {
        if req.operation != "consume" {
            return Err(Error::validation(format!(
                "mqtt driver does not support operation {:?}",
                req.operation
            )));
        }
        let limit = req
            .params
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(100) as usize;

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
        self.stop().await
    }

    fn is_resident(&self) -> bool {
        true
    }

    async fn start(&self, source_id: Id, sink: RealtimeSender) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some((user, password)) = &self.credentials {
            options.set_credentials(user, password);
        }
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        for topic in &self.topics {
            client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|err| {
                    Error::Remote(anyhow::anyhow!("subscribing {topic:?}: {err}"))
                })?;
        }
        *self.client.lock().unwrap() = Some(client);

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = Some(cancel.clone());

        let running = self.running.clone();
        let connected = self.connected.clone();
        let recent = self.recent.clone();
        let consumed = self.consumed.clone();
        let source_name = self.source_name.clone();

        tokio::spawn(async move {
            tracing::info!(source = %source_name, "mqtt delivery loop started");
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                let publish = match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected.store(true, Ordering::Relaxed);
                        continue;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => publish,
                    Ok(_) => continue,
                    Err(err) => {
                        connected.store(false, Ordering::Relaxed);
                        tracing::warn!(source = %source_name, ?err, "mqtt poll failed (will retry)");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                let row = match decode_payload(&publish.payload) {
                    Ok(row) => row,
                    Err(err) => {
                        tracing::warn!(source = %source_name, topic = %publish.topic, %err, "skipping undecodable message");
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
                    topic: publish.topic.clone(),
                    row,
                };
                if sink.send(record).await.is_err() {
                    tracing::warn!(source = %source_name, "realtime pipeline closed; stopping mqtt delivery");
                    break;
                }
            }
            running.store(false, Ordering::SeqCst);
            connected.store(false, Ordering::Relaxed);
            tracing::info!(source = %source_name, "mqtt delivery loop stopped");
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        if let Some(client) = self.client.lock().unwrap().take() {
            // Best-effort: the eventloop may already be gone.
            let _ = client.try_disconnect();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use models::{SourceCategory, SourceStatus, SourceType};

    fn source(config: serde_json::Value) -> DataSource {
        DataSource {
            id: Id::new(9),
            name: "telemetry".to_string(),
            type_: SourceType::Mqtt,
            category: SourceCategory::Messaging,
            library_id: Id::new(1),
            status: SourceStatus::Active,
            connection_config: config,
            params_config: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_init_parses_broker_spellings() {
        let mut driver = MqttDriver::default();
        driver
            .init(&source(serde_json::json!({
                "broker": "mqtt://broker.local:8883",
                "topics": "sensors/+",
            })))
            .await
            .unwrap();
        assert_eq!(driver.host, "broker.local");
        assert_eq!(driver.port, 8883);

        let mut driver = MqttDriver::default();
        driver
            .init(&source(serde_json::json!({
                "broker": "broker.local",
                "topics": ["a"],
            })))
            .await
            .unwrap();
        assert_eq!(driver.port, 1883);
    }

    #[tokio::test]
    async fn test_init_requires_topics() {
        let mut driver = MqttDriver::default();
        let err = driver
            .init(&source(serde_json::json!({"broker": "b"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
