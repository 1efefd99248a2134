use anyhow::Context;
use models::Result;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Channel on which the database publishes row-change payloads.
pub const CHANGE_CHANNEL: &str = "datahub_changes";

const NOTIFY_FUNCTION: &str = "datahub_notify_change";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// One decoded row-change delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    #[serde(rename = "type")]
    pub type_: ChangeType,
    pub record_id: String,
    #[serde(default)]
    pub old_data: Option<serde_json::Value>,
    #[serde(default)]
    pub new_data: Option<serde_json::Value>,
    pub timestamp: i64,
}

/// ChangeProcessor consumes the change events of one table. Processors are
/// registered at startup; dispatch is single-threaded so deliveries keep
/// publication order.
#[async_trait::async_trait]
pub trait ChangeProcessor: Send + Sync {
    fn table(&self) -> &'static str;

    async fn process(&self, event: ChangeEvent) -> anyhow::Result<()>;
}

/// ChangeListener subscribes to `datahub_changes`, ensures the notify
/// function and per-table triggers exist, and routes payloads by table.
/// Delivery is best-effort: dropped notifications are not replayed.
pub struct ChangeListener {
    pool: sqlx::PgPool,
    processors: HashMap<&'static str, Arc<dyn ChangeProcessor>>,
}

impl ChangeListener {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            processors: HashMap::new(),
        }
    }

    pub fn register(mut self, processor: Arc<dyn ChangeProcessor>) -> Self {
        self.processors.insert(processor.table(), processor);
        self
    }

    /// Create the notify function, and a row trigger on each table that
    /// has a registered processor. Existing triggers are left alone.
    pub async fn ensure_notify_infrastructure(&self) -> Result<()> {
        sqlx::query(&notify_function_ddl())
            .execute(&self.pool)
            .await?;

        for table in self.processors.keys() {
            sqlx::query(&ensure_trigger_ddl(table))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Listen and dispatch until `shutdown` resolves. Reconnects with
    /// exponential backoff after connection loss.
    pub async fn serve(self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut backoff = Duration::from_secs(1);

        loop {
            let result = tokio::select! {
                () = &mut shutdown => return,
                result = self.listen_once() => result,
            };

            match result {
                Ok(()) => return, // Channel closed cleanly.
                Err(err) => {
                    tracing::warn!(%err, backoff_secs = backoff.as_secs(), "change listener lost its connection; reconnecting");
                    tokio::select! {
                        () = &mut shutdown => return,
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
            }
        }
    }

    async fn listen_once(&self) -> anyhow::Result<()> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .context("connecting change listener")?;
        listener
            .listen(CHANGE_CHANNEL)
            .await
            .context("subscribing to change channel")?;
        tracing::info!(channel = CHANGE_CHANNEL, "change listener connected");

        // Long-lived LISTEN connections are prone to silent half-closes;
        // force a little traffic over the socket every 30 seconds so a
        // dead peer surfaces as an error we can handle.
        let mut should_poke_connection = false;
        loop {
            if should_poke_connection {
                should_poke_connection = false;
                listener.listen("datahub_keepalive").await?;
                listener.unlisten("datahub_keepalive").await?;
            }

            let recv_timeout = tokio::time::sleep(Duration::from_secs(30));
            let maybe_notification = tokio::select! {
                _ = recv_timeout => {
                    should_poke_connection = true;
                    continue;
                }
                notify = listener.try_recv() => notify,
            }
            .context("receiving change notification")?;

            let Some(notification) = maybe_notification else {
                anyhow::bail!("notification stream disconnected");
            };

            let event: ChangeEvent = match serde_json::from_str(notification.payload()) {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(%err, payload = notification.payload(), "undecodable change payload; skipping");
                    continue;
                }
            };

            let Some(processor) = self.processors.get(event.table.as_str()) else {
                tracing::debug!(table = %event.table, "no processor registered for table");
                continue;
            };
            if let Err(err) = processor.process(event.clone()).await {
                tracing::error!(table = %event.table, record_id = %event.record_id, ?err, "change processor failed");
            }
        }
    }
}

fn notify_function_ddl() -> String {
    format!(
        r#"
create or replace function {NOTIFY_FUNCTION}() returns trigger as $$
declare
    payload json;
begin
    payload = json_build_object(
        'table', TG_TABLE_NAME,
        'type', TG_OP,
        'record_id', coalesce(new.id::text, old.id::text),
        'old_data', case when TG_OP in ('UPDATE', 'DELETE') then row_to_json(old) end,
        'new_data', case when TG_OP in ('INSERT', 'UPDATE') then row_to_json(new) end,
        'timestamp', extract(epoch from now())::bigint
    );
    perform pg_notify('{CHANGE_CHANNEL}', payload::text);
    return coalesce(new, old);
end;
$$ language plpgsql
"#
    )
}

fn ensure_trigger_ddl(table: &str) -> String {
    let trigger = format!("{table}_datahub_changes");
    format!(
        r#"
do $$
begin
    if not exists (
        select 1 from pg_trigger
        where tgname = '{trigger}' and tgrelid = '{table}'::regclass
    ) then
        create trigger {trigger}
            after insert or update or delete on {table}
            for each row execute function {NOTIFY_FUNCTION}();
    end if;
end
$$
"#
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_decode_change_payload() {
        let event: ChangeEvent = serde_json::from_str(
            r#"{
                "table": "data_sources",
                "type": "UPDATE",
                "record_id": "0000000000000011",
                "old_data": {"status": "inactive"},
                "new_data": {"status": "active"},
                "timestamp": 1717236000
            }"#,
        )
        .unwrap();
        assert_eq!(event.type_, ChangeType::Update);
        assert_eq!(event.table, "data_sources");
        assert_eq!(event.record_id, "0000000000000011");
        assert!(event.old_data.is_some());
    }

    #[test]
    fn test_decode_insert_without_old_data() {
        let event: ChangeEvent = serde_json::from_str(
            r#"{"table": "sync_tasks", "type": "INSERT", "record_id": "aa", "new_data": {}, "timestamp": 1}"#,
        )
        .unwrap();
        assert_eq!(event.type_, ChangeType::Insert);
        assert_eq!(event.old_data, None);
    }

    #[test]
    fn test_trigger_ddl_is_guarded() {
        let ddl = ensure_trigger_ddl("data_sources");
        assert!(ddl.contains("if not exists"));
        assert!(ddl.contains("create trigger data_sources_datahub_changes"));
        assert!(ddl.contains("execute function datahub_notify_change()"));
    }
}
