use models::{DataSource, Error, Id, Result, SourceStatus};

const COLUMNS: &str = r#"
    id, name, type, category, library_id, status,
    connection_config, params_config, created_at, updated_at
"#;

pub async fn fetch(id: Id, pool: &sqlx::PgPool) -> Result<DataSource> {
    sqlx::query_as::<_, DataSource>(&format!(
        "select {COLUMNS} from data_sources where id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::not_found("data source", id))
}

pub async fn list(pool: &sqlx::PgPool) -> Result<Vec<DataSource>> {
    Ok(sqlx::query_as::<_, DataSource>(&format!(
        "select {COLUMNS} from data_sources order by created_at"
    ))
    .fetch_all(pool)
    .await?)
}

/// All sources which should be live in the registry at steady state.
pub async fn list_active(pool: &sqlx::PgPool) -> Result<Vec<DataSource>> {
    Ok(sqlx::query_as::<_, DataSource>(&format!(
        "select {COLUMNS} from data_sources where status = 'active' order by created_at"
    ))
    .fetch_all(pool)
    .await?)
}

pub async fn insert(source: &DataSource, pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        insert into data_sources (
            id, name, type, category, library_id, status,
            connection_config, params_config, created_at, updated_at
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(source.id)
    .bind(&source.name)
    .bind(source.type_)
    .bind(source.category)
    .bind(source.library_id)
    .bind(source.status)
    .bind(&source.connection_config)
    .bind(&source.params_config)
    .bind(source.created_at)
    .bind(source.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_status(id: Id, status: SourceStatus, pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query("update data_sources set status = $2, updated_at = now() where id = $1")
        .bind(id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete a source row. The caller is responsible for refusing the delete
/// while dependents exist; see [`count_dependents`].
pub async fn delete(id: Id, pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query("delete from data_sources where id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Counts of interfaces and non-terminal tasks which reference this source.
pub async fn count_dependents(id: Id, pool: &sqlx::PgPool) -> Result<(i64, i64)> {
    let interfaces: i64 =
        sqlx::query_scalar("select count(*) from data_interfaces where data_source_id = $1")
            .bind(id)
            .fetch_one(pool)
            .await?;
    let tasks: i64 = sqlx::query_scalar(
        r#"
        select count(*) from sync_tasks
        where data_source_id = $1 and execution_status = 'running'
        "#,
    )
    .bind(id)
    .fetch_one(pool)
    .await?;
    Ok((interfaces, tasks))
}

pub async fn fetch_library(id: Id, pool: &sqlx::PgPool) -> Result<models::Library> {
    sqlx::query_as::<_, models::Library>(
        "select id, name, name_en, library_type from libraries where id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::not_found("library", id))
}
