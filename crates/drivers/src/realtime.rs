use crate::Row;
use models::{Id, Result, TableField};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// One record pushed by a resident driver, identified by its source and
/// the topic (or channel) it arrived on.
#[derive(Debug)]
pub struct RealtimeRecord {
    pub source_id: Id,
    pub topic: String,
    pub row: Row,
}

/// Sending half of the realtime queue, handed to resident drivers.
pub type RealtimeSender = mpsc::Sender<RealtimeRecord>;

/// RealtimeBinding resolves where a resident source's records land: the
/// interface, its target schema/table, and its declared fields.
#[derive(Debug, Clone)]
pub struct RealtimeBinding {
    pub interface_id: Id,
    pub source_id: Id,
    /// Topic filter; None binds every topic of the source.
    pub topic: Option<String>,
    pub schema: String,
    pub table: String,
    /// Source-column to target-column renames, from parse_config.
    pub field_map: HashMap<String, String>,
    pub fields: Vec<TableField>,
}

/// InterfaceLoader resolves the realtime bindings of a source. Implemented
/// over the control database by the daemon.
#[async_trait::async_trait]
pub trait InterfaceLoader: Send + Sync {
    async fn bindings_for_source(&self, source_id: Id) -> Result<Vec<RealtimeBinding>>;
}

/// DataWriter lands a batch of rows in a binding's target table.
/// Implemented with the upsert path by the daemon.
#[async_trait::async_trait]
pub trait DataWriter: Send + Sync {
    async fn write(&self, binding: &RealtimeBinding, rows: Vec<Row>) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub struct RealtimePipelineConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for RealtimePipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            batch_size: 500,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// RealtimePipeline consumes records pushed by resident drivers, groups
/// them per interface, and writes batches through the DataWriter when
/// either the batch size or the flush interval is reached.
///
/// A single consumer task preserves per-source, per-topic arrival order.
pub struct RealtimePipeline {
    worker: tokio::task::JoinHandle<()>,
}

impl RealtimePipeline {
    pub fn start(
        loader: std::sync::Arc<dyn InterfaceLoader>,
        writer: std::sync::Arc<dyn DataWriter>,
        config: RealtimePipelineConfig,
    ) -> (Self, RealtimeSender) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let worker = tokio::spawn(run(rx, loader, writer, config));
        (Self { worker }, tx)
    }

    /// Wait for the pipeline to drain. Callers drop every RealtimeSender
    /// clone first; the worker exits after its final flush.
    pub async fn shutdown(self) {
        let _ = self.worker.await;
    }
}

async fn run(
    mut rx: mpsc::Receiver<RealtimeRecord>,
    loader: std::sync::Arc<dyn InterfaceLoader>,
    writer: std::sync::Arc<dyn DataWriter>,
    config: RealtimePipelineConfig,
) {
    let mut bindings: HashMap<Id, Vec<RealtimeBinding>> = HashMap::new();
    let mut pending: HashMap<Id, (RealtimeBinding, Vec<Row>)> = HashMap::new();
    let mut flush_tick = tokio::time::interval(config.flush_interval);
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            record = rx.recv() => {
                let Some(record) = record else {
                    // Senders are gone; flush what remains and exit.
                    flush_all(&mut pending, writer.as_ref()).await;
                    return;
                };
                enqueue(record, &loader, &mut bindings, &mut pending).await;

                // Flush any interface whose batch is full.
                let full: Vec<Id> = pending
                    .iter()
                    .filter(|(_, (_, rows))| rows.len() >= config.batch_size)
                    .map(|(id, _)| *id)
                    .collect();
                for id in full {
                    if let Some((binding, rows)) = pending.remove(&id) {
                        write_batch(writer.as_ref(), &binding, rows).await;
                    }
                }
            }
            _ = flush_tick.tick() => {
                flush_all(&mut pending, writer.as_ref()).await;
            }
        }
    }
}

async fn enqueue(
    record: RealtimeRecord,
    loader: &std::sync::Arc<dyn InterfaceLoader>,
    bindings: &mut HashMap<Id, Vec<RealtimeBinding>>,
    pending: &mut HashMap<Id, (RealtimeBinding, Vec<Row>)>,
) {
    if !bindings.contains_key(&record.source_id) {
        match loader.bindings_for_source(record.source_id).await {
            Ok(loaded) => {
                bindings.insert(record.source_id, loaded);
            }
            Err(err) => {
                tracing::warn!(source_id = %record.source_id, %err, "failed to load realtime bindings; dropping record");
                return;
            }
        }
    }

    let matched = bindings[&record.source_id].iter().find(|binding| {
        binding
            .topic
            .as_deref()
            .map_or(true, |topic| topic == record.topic)
    });
    let Some(binding) = matched else {
        tracing::debug!(
            source_id = %record.source_id,
            topic = %record.topic,
            "no interface bound to topic; dropping record"
        );
        return;
    };

    pending
        .entry(binding.interface_id)
        .or_insert_with(|| (binding.clone(), Vec::new()))
        .1
        .push(record.row);
}

async fn flush_all(pending: &mut HashMap<Id, (RealtimeBinding, Vec<Row>)>, writer: &dyn DataWriter) {
    for (_, (binding, rows)) in pending.drain() {
        write_batch(writer, &binding, rows).await;
    }
}

async fn write_batch(writer: &dyn DataWriter, binding: &RealtimeBinding, rows: Vec<Row>) {
    if rows.is_empty() {
        return;
    }
    let count = rows.len();
    match writer.write(binding, rows).await {
        Ok(written) => {
            tracing::debug!(
                interface_id = %binding.interface_id,
                received = count,
                written,
                "flushed realtime batch"
            );
        }
        Err(err) => {
            tracing::error!(
                interface_id = %binding.interface_id,
                rows = count,
                %err,
                "failed to write realtime batch; records dropped"
            );
        }
    }
}

/// Load bindings for the given sources up front, so that resident drivers
/// produce traffic immediately after start. Returns the warm cache.
pub async fn preload_bindings(
    loader: &dyn InterfaceLoader,
    source_ids: &[Id],
) -> HashMap<Id, Vec<RealtimeBinding>> {
    let mut out = HashMap::new();
    for id in source_ids {
        match loader.bindings_for_source(*id).await {
            Ok(bindings) => {
                out.insert(*id, bindings);
            }
            Err(err) => {
                tracing::warn!(source_id = %id, %err, "failed to preload realtime bindings");
            }
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use models::ColumnType;
    use std::sync::{Arc, Mutex};

    struct StaticLoader(Vec<RealtimeBinding>);

    #[async_trait::async_trait]
    impl InterfaceLoader for StaticLoader {
        async fn bindings_for_source(&self, source_id: Id) -> Result<Vec<RealtimeBinding>> {
            Ok(self
                .0
                .iter()
                .filter(|b| b.source_id == source_id)
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        batches: Mutex<Vec<(Id, usize)>>,
        notify: Option<tokio::sync::mpsc::UnboundedSender<()>>,
    }

    #[async_trait::async_trait]
    impl DataWriter for RecordingWriter {
        async fn write(&self, binding: &RealtimeBinding, rows: Vec<Row>) -> Result<u64> {
            let count = rows.len();
            self.batches.lock().unwrap().push((binding.interface_id, count));
            if let Some(notify) = &self.notify {
                let _ = notify.send(());
            }
            Ok(count as u64)
        }
    }

    fn binding(interface: u8, source: u8, topic: Option<&str>) -> RealtimeBinding {
        RealtimeBinding {
            interface_id: Id::new(interface.into()),
            source_id: Id::new(source.into()),
            topic: topic.map(str::to_string),
            schema: "staging".to_string(),
            table: format!("t{interface}"),
            field_map: HashMap::new(),
            fields: vec![TableField {
                name_en: "id".to_string(),
                data_type: ColumnType::Integer,
                is_primary_key: true,
                is_nullable: false,
                is_unique: false,
                is_increment_field: false,
                default_value: None,
                check_constraint: None,
                order_num: 0,
            }],
        }
    }

    fn record(source: u8, topic: &str, id: i64) -> RealtimeRecord {
        let mut row = Row::new();
        row.insert("id".to_string(), serde_json::json!(id));
        RealtimeRecord {
            source_id: Id::new(source.into()),
            topic: topic.to_string(),
            row,
        }
    }

    #[tokio::test]
    async fn test_flushes_when_batch_size_reached() {
        let loader = Arc::new(StaticLoader(vec![binding(1, 9, None)]));
        let (notify_tx, mut notify_rx) = tokio::sync::mpsc::unbounded_channel();
        let writer = Arc::new(RecordingWriter {
            notify: Some(notify_tx),
            ..Default::default()
        });

        let (pipeline, tx) = RealtimePipeline::start(
            loader,
            writer.clone(),
            RealtimePipelineConfig {
                queue_capacity: 16,
                batch_size: 2,
                flush_interval: Duration::from_secs(3600),
            },
        );

        tx.send(record(9, "events", 1)).await.unwrap();
        tx.send(record(9, "events", 2)).await.unwrap();
        notify_rx.recv().await.unwrap();

        let batches = writer.batches.lock().unwrap().clone();
        assert_eq!(batches, vec![(Id::new(1), 2)]);

        drop(tx);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_flushes_remainder_on_shutdown() {
        let loader = Arc::new(StaticLoader(vec![binding(1, 9, None)]));
        let writer = Arc::new(RecordingWriter::default());

        let (pipeline, tx) = RealtimePipeline::start(
            loader,
            writer.clone(),
            RealtimePipelineConfig {
                queue_capacity: 16,
                batch_size: 100,
                flush_interval: Duration::from_secs(3600),
            },
        );

        tx.send(record(9, "events", 1)).await.unwrap();
        drop(tx);
        pipeline.shutdown().await;

        assert_eq!(writer.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_routes_by_topic_and_drops_unbound() {
        let loader = Arc::new(StaticLoader(vec![
            binding(1, 9, Some("a")),
            binding(2, 9, Some("b")),
        ]));
        let writer = Arc::new(RecordingWriter::default());

        let (pipeline, tx) = RealtimePipeline::start(
            loader,
            writer.clone(),
            RealtimePipelineConfig {
                queue_capacity: 16,
                batch_size: 100,
                flush_interval: Duration::from_secs(3600),
            },
        );

        tx.send(record(9, "a", 1)).await.unwrap();
        tx.send(record(9, "b", 2)).await.unwrap();
        tx.send(record(9, "unbound", 3)).await.unwrap();
        drop(tx);
        pipeline.shutdown().await;

        let mut batches = writer.batches.lock().unwrap().clone();
        batches.sort();
        assert_eq!(
            batches,
            vec![
                (Id::new(1), 1),
                (Id::new(2), 1),
            ]
        );
    }
}
