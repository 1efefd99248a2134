use models::Result;

/// Fetch one runtime knob from `system_configs`, scoped to an environment
/// (the default scope is the literal string `default`).
pub async fn get(key: &str, environment: &str, pool: &sqlx::PgPool) -> Result<Option<String>> {
    Ok(sqlx::query_scalar(
        "select value from system_configs where key = $1 and environment = $2",
    )
    .bind(key)
    .bind(environment)
    .fetch_optional(pool)
    .await?)
}

pub async fn set(
    key: &str,
    value: &str,
    environment: &str,
    pool: &sqlx::PgPool,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into system_configs (key, value, environment, updated_at)
        values ($1, $2, $3, now())
        on conflict (key, environment) do update
        set value = excluded.value, updated_at = now()
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(environment)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete(key: &str, environment: &str, pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query("delete from system_configs where key = $1 and environment = $2")
        .bind(key)
        .bind(environment)
        .execute(pool)
        .await?;
    Ok(())
}
