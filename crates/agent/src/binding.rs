//! Control-database implementations of the realtime pipeline seams: the
//! loader that resolves which interfaces a resident source feeds, and the
//! writer that lands batches in target tables.

use crate::mapping;
use datahub_sql::target;
use drivers::{DataWriter, InterfaceLoader, RealtimeBinding, Row};
use models::{Id, InterfaceType, Result};

pub struct SqlInterfaceLoader {
    pool: sqlx::PgPool,
}

impl SqlInterfaceLoader {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl InterfaceLoader for SqlInterfaceLoader {
    async fn bindings_for_source(&self, source_id: Id) -> Result<Vec<RealtimeBinding>> {
        let interfaces = datahub_sql::interfaces::list_for_source(source_id, &self.pool).await?;

        let mut bindings = Vec::new();
        for interface in interfaces {
            if interface.type_ != InterfaceType::Realtime {
                continue;
            }
            let library =
                datahub_sql::data_sources::fetch_library(interface.library_id, &self.pool).await?;

            bindings.push(RealtimeBinding {
                interface_id: interface.id,
                source_id,
                topic: interface
                    .parse_config
                    .get("topic")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                schema: library.name_en,
                table: interface.name_en.clone(),
                field_map: mapping::field_map(&interface.parse_config),
                fields: interface.fields,
            });
        }
        Ok(bindings)
    }
}

/// UpsertDataWriter maps realtime rows onto the binding's declared fields
/// and upserts them, so repeated deliveries of the same key never create
/// duplicates.
pub struct UpsertDataWriter {
    pool: sqlx::PgPool,
}

impl UpsertDataWriter {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DataWriter for UpsertDataWriter {
    async fn write(&self, binding: &RealtimeBinding, rows: Vec<Row>) -> Result<u64> {
        let mut warnings = Vec::new();
        let mapped = mapping::map_rows(&rows, &binding.fields, &binding.field_map, &mut warnings);
        for warning in warnings {
            tracing::debug!(interface_id = %binding.interface_id, warning, "realtime row coercion");
        }

        target::upsert_rows(
            &binding.schema,
            &binding.table,
            &binding.fields,
            mapped,
            target::DEFAULT_BATCH_SIZE,
            &self.pool,
        )
        .await
    }
}
