//! Dynamic statements against target tables, whose schema and table names
//! come from interface configuration rather than from this crate's own
//! migrations. Identifiers are quoted and every value is bound with an
//! explicit cast to the column's declared type.

use crate::{quote_ident, value_as_text};
use models::{Error, Result, TableField};

/// Default number of rows written per transactional batch.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// The current high watermark of the target table, as text, or None when
/// the table is empty.
pub async fn max_watermark(
    schema: &str,
    table: &str,
    column: &str,
    pool: &sqlx::PgPool,
) -> Result<Option<String>> {
    let stmt = format!(
        "select max({})::text from {}.{}",
        quote_ident(column),
        quote_ident(schema),
        quote_ident(table),
    );
    let max: Option<String> = sqlx::query_scalar(&stmt).fetch_one(pool).await?;
    Ok(max)
}

/// Build the `insert .. on conflict` statement for one batch of `rows` rows.
/// Non-key columns are overwritten on conflict; a table whose columns are
/// all keys degrades to `do nothing`.
pub fn upsert_statement(schema: &str, table: &str, fields: &[TableField], rows: usize) -> String {
    let columns = fields
        .iter()
        .map(|f| quote_ident(&f.name_en))
        .collect::<Vec<_>>()
        .join(", ");

    let mut tuples = Vec::with_capacity(rows);
    let mut placeholder = 1;
    for _ in 0..rows {
        let tuple = fields
            .iter()
            .map(|f| {
                let cast = f.data_type.sql_name();
                let p = format!("${placeholder}::{cast}");
                placeholder += 1;
                p
            })
            .collect::<Vec<_>>()
            .join(", ");
        tuples.push(format!("({tuple})"));
    }

    let keys = fields
        .iter()
        .filter(|f| f.is_primary_key)
        .map(|f| quote_ident(&f.name_en))
        .collect::<Vec<_>>()
        .join(", ");

    let updates = fields
        .iter()
        .filter(|f| !f.is_primary_key)
        .map(|f| {
            let col = quote_ident(&f.name_en);
            format!("{col} = excluded.{col}")
        })
        .collect::<Vec<_>>()
        .join(", ");

    let conflict = if updates.is_empty() {
        format!("on conflict ({keys}) do nothing")
    } else {
        format!("on conflict ({keys}) do update set {updates}")
    };

    format!(
        "insert into {}.{} ({columns}) values {} {conflict}",
        quote_ident(schema),
        quote_ident(table),
        tuples.join(", "),
    )
}

/// Retain the last occurrence of each primary key. Postgres refuses a
/// single `insert .. on conflict do update` which touches one key twice,
/// so batches must carry each key at most once.
pub fn dedup_by_key(
    fields: &[TableField],
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
) -> Vec<serde_json::Map<String, serde_json::Value>> {
    let keys: Vec<&str> = fields
        .iter()
        .filter(|f| f.is_primary_key)
        .map(|f| f.name_en.as_str())
        .collect();

    let mut index = std::collections::HashMap::with_capacity(rows.len());
    for (at, row) in rows.iter().enumerate() {
        let key: Vec<Option<String>> = keys
            .iter()
            .map(|k| row.get(*k).and_then(value_as_text))
            .collect();
        index.insert(key, at);
    }

    let mut keep: Vec<usize> = index.into_values().collect();
    keep.sort_unstable();

    let mut keep = keep.into_iter().peekable();
    rows.into_iter()
        .enumerate()
        .filter_map(|(at, row)| {
            if keep.peek() == Some(&at) {
                keep.next();
                Some(row)
            } else {
                None
            }
        })
        .collect()
}

/// Upsert `rows` into the target table in transactional batches keyed by
/// the declared primary-key fields. Returns the number of rows written.
/// A failed batch rolls back in full and surfaces as the error.
pub async fn upsert_rows(
    schema: &str,
    table: &str,
    fields: &[TableField],
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
    batch_size: usize,
    pool: &sqlx::PgPool,
) -> Result<u64> {
    if !fields.iter().any(|f| f.is_primary_key) {
        return Err(Error::validation(
            "target table declares no primary-key fields",
        ));
    }
    let batch_size = if batch_size == 0 {
        DEFAULT_BATCH_SIZE
    } else {
        batch_size
    };
    let rows = dedup_by_key(fields, rows);

    let mut written = 0u64;
    for batch in rows.chunks(batch_size) {
        let stmt = upsert_statement(schema, table, fields, batch.len());
        let mut query = sqlx::query(&stmt);
        for row in batch {
            for field in fields {
                let text = row.get(&field.name_en).and_then(value_as_text);
                query = query.bind(text);
            }
        }

        let mut txn = pool.begin().await?;
        let done = query.execute(&mut txn).await?;
        txn.commit().await?;
        written += done.rows_affected();
    }
    Ok(written)
}

#[cfg(test)]
mod test {
    use super::upsert_statement;
    use models::{ColumnType, TableField};

    fn field(name: &str, data_type: ColumnType, pk: bool) -> TableField {
        TableField {
            name_en: name.to_string(),
            data_type,
            is_primary_key: pk,
            is_nullable: !pk,
            is_unique: false,
            is_increment_field: false,
            default_value: None,
            check_constraint: None,
            order_num: 0,
        }
    }

    #[test]
    fn test_upsert_statement_shape() {
        let fields = vec![
            field("user_id", ColumnType::Integer, true),
            field("name", ColumnType::Varchar, false),
            field("updated_at", ColumnType::Timestamp, false),
        ];
        let stmt = upsert_statement("staging", "users", &fields, 2);
        insta::assert_snapshot!(stmt, @r#"insert into "staging"."users" ("user_id", "name", "updated_at") values ($1::integer, $2::varchar, $3::timestamptz), ($4::integer, $5::varchar, $6::timestamptz) on conflict ("user_id") do update set "name" = excluded."name", "updated_at" = excluded."updated_at""#);
    }

    #[test]
    fn test_dedup_keeps_last_occurrence() {
        let fields = vec![
            field("id", ColumnType::Integer, true),
            field("v", ColumnType::Varchar, false),
        ];
        let rows = vec![
            serde_json::json!({"id": 1, "v": "old"}),
            serde_json::json!({"id": 2, "v": "two"}),
            serde_json::json!({"id": 1, "v": "new"}),
        ]
        .into_iter()
        .map(|v| v.as_object().unwrap().clone())
        .collect();

        let deduped = super::dedup_by_key(&fields, rows);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0]["id"], serde_json::json!(2));
        assert_eq!(deduped[1]["v"], serde_json::json!("new"));
    }

    #[test]
    fn test_all_key_columns_do_nothing() {
        let fields = vec![
            field("a", ColumnType::Varchar, true),
            field("b", ColumnType::Varchar, true),
        ];
        let stmt = upsert_statement("s", "t", &fields, 1);
        assert!(stmt.ends_with(r#"on conflict ("a", "b") do nothing"#));
    }
}
