use datahub_sql::quote_ident;
use models::{Error, Result, TableField};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchemaOp {
    CreateTable,
    AlterTable,
    DropTable,
}

/// SchemaService is the seam through which the core asks for target-table
/// DDL. The schema-migration utility is an external collaborator; this
/// trait is its narrow contract.
#[async_trait::async_trait]
pub trait SchemaService: Send + Sync {
    async fn manage_table_schema(
        &self,
        interface_id: models::Id,
        op: SchemaOp,
        schema: &str,
        table: &str,
        fields: &[TableField],
    ) -> Result<()>;

    async fn check_view_exists(&self, schema: &str, name: &str) -> Result<bool>;
}

/// Render one column clause of a CREATE TABLE.
fn column_clause(field: &TableField) -> String {
    let mut clause = format!(
        "{} {}",
        quote_ident(&field.name_en),
        field.data_type.sql_name()
    );
    if !field.is_nullable || field.is_primary_key {
        clause.push_str(" not null");
    }
    if let Some(default) = &field.default_value {
        if !default.is_empty() {
            clause.push_str(&format!(" default {}", quote_literal(default)));
        }
    }
    if field.is_unique && !field.is_primary_key {
        clause.push_str(" unique");
    }
    if let Some(check) = &field.check_constraint {
        if !check.is_empty() {
            clause.push_str(&format!(" check ({check})"));
        }
    }
    clause
}

fn quote_literal(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

/// The full CREATE TABLE statement for an interface's declared fields.
pub fn create_table_ddl(schema: &str, table: &str, fields: &[TableField]) -> String {
    let mut clauses: Vec<String> = fields.iter().map(column_clause).collect();

    let keys: Vec<String> = fields
        .iter()
        .filter(|f| f.is_primary_key)
        .map(|f| quote_ident(&f.name_en))
        .collect();
    if !keys.is_empty() {
        clauses.push(format!("primary key ({})", keys.join(", ")));
    }

    format!(
        "create table if not exists {}.{} (\n    {}\n)",
        quote_ident(schema),
        quote_ident(table),
        clauses.join(",\n    "),
    )
}

/// PgSchemaService issues DDL directly against the target database. It
/// stands in for the external migration utility in a single-database
/// deployment.
pub struct PgSchemaService {
    pool: sqlx::PgPool,
}

impl PgSchemaService {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    async fn existing_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar(
            r#"
            select column_name from information_schema.columns
            where table_schema = $1 and table_name = $2
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait::async_trait]
impl SchemaService for PgSchemaService {
    async fn manage_table_schema(
        &self,
        interface_id: models::Id,
        op: SchemaOp,
        schema: &str,
        table: &str,
        fields: &[TableField],
    ) -> Result<()> {
        match op {
            SchemaOp::CreateTable => {
                if fields.is_empty() {
                    return Err(Error::validation("cannot create a table with no fields"));
                }
                sqlx::query(&format!(
                    "create schema if not exists {}",
                    quote_ident(schema)
                ))
                .execute(&self.pool)
                .await?;
                sqlx::query(&create_table_ddl(schema, table, fields))
                    .execute(&self.pool)
                    .await?;
                tracing::info!(interface_id = %interface_id, schema, table, "created target table");
            }
            SchemaOp::AlterTable => {
                let existing = self.existing_columns(schema, table).await?;
                for field in fields {
                    if existing.contains(&field.name_en) {
                        continue;
                    }
                    sqlx::query(&format!(
                        "alter table {}.{} add column {}",
                        quote_ident(schema),
                        quote_ident(table),
                        column_clause(field),
                    ))
                    .execute(&self.pool)
                    .await?;
                    tracing::info!(schema, table, column = %field.name_en, "added target column");
                }
            }
            SchemaOp::DropTable => {
                sqlx::query(&format!(
                    "drop table if exists {}.{}",
                    quote_ident(schema),
                    quote_ident(table)
                ))
                .execute(&self.pool)
                .await?;
                tracing::info!(schema, table, "dropped target table");
            }
        }
        Ok(())
    }

    async fn check_view_exists(&self, schema: &str, name: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            select exists (
                select 1 from pg_catalog.pg_views
                where schemaname = $1 and viewname = $2
            )
            "#,
        )
        .bind(schema)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

#[cfg(test)]
mod test {
    use super::create_table_ddl;
    use models::{ColumnType, TableField};

    #[test]
    fn test_create_table_ddl() {
        let fields = vec![
            TableField {
                name_en: "user_id".to_string(),
                data_type: ColumnType::Integer,
                is_primary_key: true,
                is_nullable: false,
                is_unique: false,
                is_increment_field: false,
                default_value: None,
                check_constraint: None,
                order_num: 1,
            },
            TableField {
                name_en: "name".to_string(),
                data_type: ColumnType::Varchar,
                is_primary_key: false,
                is_nullable: true,
                is_unique: true,
                is_increment_field: false,
                default_value: Some("unknown".to_string()),
                check_constraint: None,
                order_num: 2,
            },
            TableField {
                name_en: "age".to_string(),
                data_type: ColumnType::Integer,
                is_primary_key: false,
                is_nullable: true,
                is_unique: false,
                is_increment_field: false,
                default_value: None,
                check_constraint: Some("\"age\" >= 0".to_string()),
                order_num: 3,
            },
        ];

        insta::assert_snapshot!(create_table_ddl("staging", "users", &fields), @r#"
        create table if not exists "staging"."users" (
            "user_id" integer not null,
            "name" varchar default 'unknown' unique,
            "age" integer check ("age" >= 0),
            primary key ("user_id")
        )
        "#);
    }
}
