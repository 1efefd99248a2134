use crate::{DriverRegistry, Health, RealtimeSender, SourceDriver};
use chrono::{DateTime, Utc};
use models::{DataSource, Error, Id, Result, SourceType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Per-source timeout applied when fanning out health checks.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// A live, initialized driver together with the source record it serves.
pub struct ManagedSource {
    pub source: DataSource,
    pub driver: Arc<dyn SourceDriver>,
}

/// Runtime status of one managed source, refreshed by health probes.
#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub healthy: bool,
    pub last_health_check: DateTime<Utc>,
    pub response_time_ms: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SourceStatistics {
    pub total: usize,
    pub residents: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub by_type: HashMap<String, usize>,
}

/// SourceManager is the process-wide registry of live data sources: a map
/// of source id to initialized driver instance, plus per-instance runtime
/// status. The map lock is never held across driver I/O.
pub struct SourceManager {
    registry: Arc<DriverRegistry>,
    realtime: RealtimeSender,
    sources: RwLock<HashMap<Id, Arc<ManagedSource>>>,
    statuses: RwLock<HashMap<Id, RuntimeStatus>>,
}

impl SourceManager {
    pub fn new(registry: Arc<DriverRegistry>, realtime: RealtimeSender) -> Self {
        Self {
            registry,
            realtime,
            sources: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// Register a source: validate its config, construct and initialize a
    /// fresh driver, and store it. Fails if an instance already exists;
    /// callers must `remove` first.
    pub async fn register(&self, source: DataSource) -> Result<()> {
        if self.sources.read().await.contains_key(&source.id) {
            return Err(Error::conflict(format!(
                "data source {} is already registered",
                source.id
            )));
        }

        let report = self
            .registry
            .validate(source.type_, &source.connection_config)?;
        if !report.is_valid {
            return Err(Error::validation(format!(
                "invalid connection config: {}",
                report.errors.join("; ")
            )));
        }

        let mut driver = self.registry.new_driver(source.type_)?;
        driver.init(&source).await?;

        let managed = Arc::new(ManagedSource {
            source,
            driver: Arc::from(driver),
        });

        let mut sources = self.sources.write().await;
        // Re-check under the write lock: a racing register may have won.
        if sources.contains_key(&managed.source.id) {
            drop(sources);
            let _ = managed.driver.close().await;
            return Err(Error::conflict(format!(
                "data source {} is already registered",
                managed.source.id
            )));
        }
        tracing::info!(
            source_id = %managed.source.id,
            name = %managed.source.name,
            type_ = %managed.source.type_,
            "registered data source"
        );
        sources.insert(managed.source.id, managed);
        Ok(())
    }

    pub async fn get(&self, id: Id) -> Result<Arc<ManagedSource>> {
        self.sources
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("data source instance", id))
    }

    pub async fn contains(&self, id: Id) -> bool {
        self.sources.read().await.contains_key(&id)
    }

    /// Close and drop a source instance. Safe to call on absent ids.
    pub async fn remove(&self, id: Id) -> Result<()> {
        let removed = self.sources.write().await.remove(&id);
        self.statuses.write().await.remove(&id);
        if let Some(managed) = removed {
            if let Err(err) = managed.driver.close().await {
                tracing::warn!(source_id = %id, %err, "error closing data source driver");
            }
            tracing::info!(source_id = %id, "removed data source");
        }
        Ok(())
    }

    /// Fan out health checks with a per-source timeout, returning the
    /// refreshed status map.
    pub async fn health_check_all(&self) -> HashMap<Id, RuntimeStatus> {
        let snapshot: Vec<Arc<ManagedSource>> =
            self.sources.read().await.values().cloned().collect();

        let probes = snapshot.into_iter().map(|managed| async move {
            let health =
                match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, managed.driver.health_check())
                    .await
                {
                    Ok(Ok(health)) => health,
                    Ok(Err(err)) => Health::failed(err.to_string(), HEALTH_CHECK_TIMEOUT),
                    Err(_) => Health::failed("health check timed out", HEALTH_CHECK_TIMEOUT),
                };
            (managed.source.id, health)
        });
        let results = futures::future::join_all(probes).await;

        let now = Utc::now();
        let mut statuses = self.statuses.write().await;
        for (id, health) in results {
            statuses.insert(
                id,
                RuntimeStatus {
                    healthy: health.healthy,
                    last_health_check: now,
                    response_time_ms: health.response_time.as_millis() as i64,
                    error_message: health.message.filter(|_| !health.healthy),
                },
            );
        }
        statuses.clone()
    }

    pub async fn runtime_status(&self, id: Id) -> Option<RuntimeStatus> {
        self.statuses.read().await.get(&id).cloned()
    }

    /// Start delivery for every resident source. Idempotent.
    pub async fn start_all(&self) {
        let snapshot: Vec<Arc<ManagedSource>> =
            self.sources.read().await.values().cloned().collect();
        for managed in snapshot {
            if !managed.driver.is_resident() {
                continue;
            }
            if let Err(err) = managed
                .driver
                .start(managed.source.id, self.realtime.clone())
                .await
            {
                tracing::error!(
                    source_id = %managed.source.id,
                    %err,
                    "failed to start resident data source"
                );
            }
        }
    }

    /// Stop delivery for every resident source. Idempotent.
    pub async fn stop_all(&self) {
        let snapshot: Vec<Arc<ManagedSource>> =
            self.sources.read().await.values().cloned().collect();
        for managed in snapshot {
            if !managed.driver.is_resident() {
                continue;
            }
            if let Err(err) = managed.driver.stop().await {
                tracing::warn!(
                    source_id = %managed.source.id,
                    %err,
                    "failed to stop resident data source"
                );
            }
        }
    }

    /// Restart a resident source by tearing the instance down and
    /// registering a fresh one from the same source record.
    pub async fn restart_resident(&self, id: Id) -> Result<()> {
        let managed = self.get(id).await?;
        if !managed.driver.is_resident() {
            return Err(Error::validation(format!(
                "data source {id} is not resident"
            )));
        }
        let source = managed.source.clone();
        drop(managed);

        self.remove(id).await?;
        self.register(source).await?;

        let managed = self.get(id).await?;
        managed
            .driver
            .start(managed.source.id, self.realtime.clone())
            .await
    }

    /// An unregistered, throwaway instance used for connect-tests. The
    /// caller closes it when done.
    pub async fn create_test_instance(
        &self,
        type_: SourceType,
        source: &DataSource,
    ) -> Result<Box<dyn SourceDriver>> {
        let mut driver = self.registry.new_driver(type_)?;
        driver.init(source).await?;
        Ok(driver)
    }

    pub async fn statistics(&self) -> SourceStatistics {
        let sources = self.sources.read().await;
        let statuses = self.statuses.read().await;

        let mut stats = SourceStatistics {
            total: sources.len(),
            ..Default::default()
        };
        for managed in sources.values() {
            *stats
                .by_type
                .entry(managed.source.type_.to_string())
                .or_default() += 1;
            if managed.driver.is_resident() {
                stats.residents += 1;
            }
            match statuses.get(&managed.source.id) {
                Some(status) if status.healthy => stats.healthy += 1,
                Some(_) => stats.unhealthy += 1,
                None => {}
            }
        }
        stats
    }

    /// Ids of all currently registered sources.
    pub async fn registered_ids(&self) -> Vec<Id> {
        self.sources.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ExecuteRequest, ExecuteResponse};
    use chrono::Utc;
    use models::{SourceCategory, SourceStatus};

    struct NullDriver;

    #[async_trait::async_trait]
    impl SourceDriver for NullDriver {
        async fn init(&mut self, _source: &DataSource) -> Result<()> {
            Ok(())
        }
        async fn health_check(&self) -> Result<Health> {
            Ok(Health::ok(Duration::ZERO))
        }
        async fn execute(&self, _req: ExecuteRequest) -> Result<ExecuteResponse> {
            Ok(ExecuteResponse::default())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn manager() -> SourceManager {
        let mut registry = DriverRegistry::new();
        registry.register(SourceType::File, Vec::new(), || Box::new(NullDriver));
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        SourceManager::new(Arc::new(registry), tx)
    }

    fn source(id: u8) -> DataSource {
        DataSource {
            id: Id::new(id.into()),
            name: format!("source-{id}"),
            type_: SourceType::File,
            category: SourceCategory::File,
            library_id: Id::new(1),
            status: SourceStatus::Active,
            connection_config: serde_json::json!({}),
            params_config: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_register_is_exclusive_per_id() {
        let manager = manager();
        manager.register(source(1)).await.unwrap();

        let err = manager.register(source(1)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        manager.remove(source(1).id).await.unwrap();
        manager.register(source(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_is_safe_on_absent_ids() {
        let manager = manager();
        manager.remove(Id::new(0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_type_is_refused() {
        let manager = manager();
        let mut bad = source(2);
        bad.type_ = SourceType::Kafka;
        assert!(manager.register(bad).await.is_err());
    }

    struct FakeResident {
        source_id: std::sync::Mutex<Option<Id>>,
        started: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait::async_trait]
    impl SourceDriver for FakeResident {
        async fn init(&mut self, source: &DataSource) -> Result<()> {
            *self.source_id.lock().unwrap() = Some(source.id);
            Ok(())
        }
        async fn health_check(&self) -> Result<Health> {
            Ok(Health::ok(Duration::ZERO))
        }
        async fn execute(&self, _req: ExecuteRequest) -> Result<ExecuteResponse> {
            Ok(ExecuteResponse::default())
        }
        async fn close(&self) -> Result<()> {
            self.stop().await
        }
        fn is_resident(&self) -> bool {
            true
        }
        async fn start(&self, source_id: Id, sink: crate::RealtimeSender) -> Result<()> {
            self.started.store(true, std::sync::atomic::Ordering::SeqCst);
            let mut row = crate::Row::new();
            row.insert("id".to_string(), serde_json::json!(1));
            let _ = sink
                .send(crate::RealtimeRecord {
                    source_id,
                    topic: "events".to_string(),
                    row,
                })
                .await;
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.started.store(false, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_residents_start_and_stop() {
        let started = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut registry = DriverRegistry::new();
        let started_for_factory = started.clone();
        registry.register(SourceType::Kafka, Vec::new(), move || {
            Box::new(FakeResident {
                source_id: std::sync::Mutex::new(None),
                started: started_for_factory.clone(),
            })
        });

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let manager = SourceManager::new(Arc::new(registry), tx);

        let mut resident = source(7);
        resident.type_ = SourceType::Kafka;
        manager.register(resident).await.unwrap();

        manager.start_all().await;
        assert!(started.load(std::sync::atomic::Ordering::SeqCst));

        // The record pushed at start reaches the realtime queue.
        let record = rx.recv().await.unwrap();
        assert_eq!(record.source_id, Id::new(7));
        assert_eq!(record.topic, "events");

        manager.stop_all().await;
        assert!(!started.load(std::sync::atomic::Ordering::SeqCst));

        let stats = manager.statistics().await;
        assert_eq!(stats.residents, 1);
    }

    #[tokio::test]
    async fn test_health_check_all_and_statistics() {
        let manager = manager();
        manager.register(source(1)).await.unwrap();
        manager.register(source(2)).await.unwrap();

        let statuses = manager.health_check_all().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.values().all(|s| s.healthy));

        let stats = manager.statistics().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.healthy, 2);
        assert_eq!(stats.by_type["file"], 2);
    }
}
