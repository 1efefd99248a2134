use chrono::{DateTime, Utc};
use models::{
    DataInterface, Error, Id, IncrementalConfig, InterfaceType, Result, TableField,
};
use sqlx::types::Json;

/// Row shape of `data_interfaces`, with JSON columns wrapped for decoding.
#[derive(Debug, sqlx::FromRow)]
pub struct InterfaceRow {
    pub id: Id,
    pub library_id: Id,
    pub data_source_id: Id,
    pub name_en: String,
    #[sqlx(rename = "type")]
    pub type_: InterfaceType,
    pub fields: Json<Vec<TableField>>,
    pub is_table_created: bool,
    pub parse_config: serde_json::Value,
    pub incremental_config: Option<Json<IncrementalConfig>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<InterfaceRow> for DataInterface {
    fn from(row: InterfaceRow) -> Self {
        DataInterface {
            id: row.id,
            library_id: row.library_id,
            data_source_id: row.data_source_id,
            name_en: row.name_en,
            type_: row.type_,
            fields: row.fields.0,
            is_table_created: row.is_table_created,
            parse_config: row.parse_config,
            incremental_config: row.incremental_config.map(|c| c.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// ResolvedInterface is an interface joined with everything the executor
/// needs: its library's schema name and its owning data source id.
#[derive(Debug)]
pub struct ResolvedInterface {
    pub interface: DataInterface,
    pub schema_name: String,
    pub library_name: String,
}

const COLUMNS: &str = r#"
    id, library_id, data_source_id, name_en, type, fields, is_table_created,
    parse_config, incremental_config, created_at, updated_at
"#;

pub async fn fetch(id: Id, pool: &sqlx::PgPool) -> Result<DataInterface> {
    let row = sqlx::query_as::<_, InterfaceRow>(&format!(
        "select {COLUMNS} from data_interfaces where id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::not_found("interface", id))?;
    Ok(row.into())
}

/// Fetch an interface together with its library's schema name, with its
/// declared fields validated and brought into stable order.
pub async fn resolve(id: Id, pool: &sqlx::PgPool) -> Result<ResolvedInterface> {
    let mut interface = fetch(id, pool).await?;
    interface.fields = models::normalize_fields(std::mem::take(&mut interface.fields))?;

    let library = super::data_sources::fetch_library(interface.library_id, pool).await?;
    Ok(ResolvedInterface {
        schema_name: library.name_en,
        library_name: library.name,
        interface,
    })
}

pub async fn list_for_source(source_id: Id, pool: &sqlx::PgPool) -> Result<Vec<DataInterface>> {
    let rows = sqlx::query_as::<_, InterfaceRow>(&format!(
        "select {COLUMNS} from data_interfaces where data_source_id = $1 order by created_at"
    ))
    .bind(source_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn set_table_created(id: Id, pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        "update data_interfaces set is_table_created = true, updated_at = now() where id = $1",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete an interface row. The caller is responsible for refusing the
/// delete while dependents exist; see [`count_referencing_tasks`].
pub async fn delete(id: Id, pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query("delete from data_interfaces where id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Count of non-terminal tasks that reference this interface; a delete of
/// the interface is refused while this is non-zero.
pub async fn count_referencing_tasks(id: Id, pool: &sqlx::PgPool) -> Result<i64> {
    Ok(sqlx::query_scalar(
        r#"
        select count(*)
        from sync_task_interfaces sti
        join sync_tasks st on st.id = sti.task_id
        where sti.interface_id = $1 and st.execution_status = 'running'
        "#,
    )
    .bind(id)
    .fetch_one(pool)
    .await?)
}
