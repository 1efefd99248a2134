//! Shared plumbing for the relational drivers: turning database rows of
//! unknown shape into JSON maps, and building bounded SELECT statements
//! from interface parameters.

use crate::Row;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use models::{Error, Result};
use sqlx::{Column as _, Row as _, TypeInfo as _};

/// Decode one Postgres row into a JSON map, column by column. Columns of a
/// type we cannot decode become null, with a warning naming the column.
pub fn pg_row_to_json(row: &sqlx::postgres::PgRow, warnings: &mut Vec<String>) -> Row {
    let mut out = Row::new();
    for (at, column) in row.columns().iter().enumerate() {
        let value = decode_pg_column(row, at).unwrap_or_else(|| {
            warnings.push(format!(
                "column {:?} of type {} could not be decoded",
                column.name(),
                column.type_info().name()
            ));
            serde_json::Value::Null
        });
        out.insert(column.name().to_string(), value);
    }
    out
}

fn decode_pg_column(row: &sqlx::postgres::PgRow, at: usize) -> Option<serde_json::Value> {
    // Each probe is strictly typed; exactly one matches the column's
    // declared type. NULL decodes successfully at the first compatible
    // probe via the Option.
    if let Ok(v) = row.try_get::<Option<bool>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, Into::into));
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, Into::into));
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, Into::into));
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, Into::into));
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, |f| {
            serde_json::json!(f as f64)
        }));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, |f| serde_json::json!(f)));
    }
    if let Ok(v) = row.try_get::<Option<sqlx::types::Decimal>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, |d| {
            serde_json::Value::String(d.to_string())
        }));
    }
    if let Ok(v) = row.try_get::<Option<DateTime<Utc>>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, |t| {
            serde_json::Value::String(t.to_rfc3339())
        }));
    }
    if let Ok(v) = row.try_get::<Option<NaiveDateTime>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, |t| {
            serde_json::Value::String(t.and_utc().to_rfc3339())
        }));
    }
    if let Ok(v) = row.try_get::<Option<NaiveDate>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, |d| {
            serde_json::Value::String(d.to_string())
        }));
    }
    if let Ok(v) = row.try_get::<Option<sqlx::types::Uuid>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, |u| {
            serde_json::Value::String(u.to_string())
        }));
    }
    if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(at) {
        return Some(v.unwrap_or(serde_json::Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, serde_json::Value::String));
    }
    None
}

/// Decode one MySQL row into a JSON map.
pub fn mysql_row_to_json(row: &sqlx::mysql::MySqlRow, warnings: &mut Vec<String>) -> Row {
    let mut out = Row::new();
    for (at, column) in row.columns().iter().enumerate() {
        let value = decode_mysql_column(row, at).unwrap_or_else(|| {
            warnings.push(format!(
                "column {:?} of type {} could not be decoded",
                column.name(),
                column.type_info().name()
            ));
            serde_json::Value::Null
        });
        out.insert(column.name().to_string(), value);
    }
    out
}

fn decode_mysql_column(row: &sqlx::mysql::MySqlRow, at: usize) -> Option<serde_json::Value> {
    if let Ok(v) = row.try_get::<Option<bool>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, Into::into));
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, Into::into));
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, Into::into));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, |f| serde_json::json!(f)));
    }
    if let Ok(v) = row.try_get::<Option<sqlx::types::Decimal>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, |d| {
            serde_json::Value::String(d.to_string())
        }));
    }
    if let Ok(v) = row.try_get::<Option<DateTime<Utc>>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, |t| {
            serde_json::Value::String(t.to_rfc3339())
        }));
    }
    if let Ok(v) = row.try_get::<Option<NaiveDateTime>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, |t| {
            serde_json::Value::String(t.and_utc().to_rfc3339())
        }));
    }
    if let Ok(v) = row.try_get::<Option<NaiveDate>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, |d| {
            serde_json::Value::String(d.to_string())
        }));
    }
    if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(at) {
        return Some(v.unwrap_or(serde_json::Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(at) {
        return Some(v.map_or(serde_json::Value::Null, serde_json::Value::String));
    }
    None
}

/// Placeholder style of the two relational dialects.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Mysql,
}

impl Dialect {
    fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
            Dialect::Mysql => format!("`{}`", ident.replace('`', "``")),
        }
    }

    fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${n}"),
            Dialect::Mysql => "?".to_string(),
        }
    }
}

/// A query plan built from interface parameters: the statement text plus
/// the watermark argument to bind, if any.
#[derive(Debug, PartialEq)]
pub struct QueryPlan {
    pub statement: String,
    pub watermark: Option<String>,
}

/// Build the SELECT for a sync or preview pull. An explicit `query` wins;
/// otherwise the statement is assembled from `table` and the optional
/// watermark bound. The caller's `_watermark` parameter is bound as the
/// single placeholder.
pub fn build_query(dialect: Dialect, request: &crate::ExecuteRequest) -> Result<QueryPlan> {
    let watermark = request
        .params
        .get("_watermark")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    if let Some(query) = &request.query {
        // An explicit query must carry its own placeholder to consume the
        // watermark; otherwise the watermark is ignored.
        let wants_watermark = match dialect {
            Dialect::Postgres => query.contains("$1"),
            Dialect::Mysql => query.contains('?'),
        };
        return Ok(QueryPlan {
            statement: query.clone(),
            watermark: if wants_watermark { watermark } else { None },
        });
    }

    let table = request
        .params
        .get("table")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::validation("relational pull requires a table or query"))?;

    let mut statement = format!("select * from {}", dialect.quote(table));

    // The bound is inclusive for a configured initial value, and strict
    // once it comes from data already landed in the target.
    let exclusive = request
        .params
        .get("_watermark_exclusive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let operator = if exclusive { ">" } else { ">=" };

    let watermark_column = request.params.get("watermark_column").and_then(|v| v.as_str());
    let watermark = match (watermark_column, watermark) {
        (Some(column), Some(value)) => {
            statement.push_str(&format!(
                " where {} {operator} {}",
                dialect.quote(column),
                dialect.placeholder(1)
            ));
            statement.push_str(&format!(" order by {}", dialect.quote(column)));
            Some(value)
        }
        _ => None,
    };

    if let Some(limit) = request.params.get("limit").and_then(|v| v.as_u64()) {
        statement.push_str(&format!(" limit {limit}"));
    }

    Ok(QueryPlan {
        statement,
        watermark,
    })
}

#[cfg(test)]
mod test {
    use super::{build_query, Dialect, QueryPlan};
    use crate::ExecuteRequest;

    fn request(params: serde_json::Value) -> ExecuteRequest {
        ExecuteRequest {
            operation: "query".to_string(),
            query: None,
            params: params.as_object().unwrap().clone(),
        }
    }

    #[test]
    fn test_builds_watermarked_select() {
        let req = request(serde_json::json!({
            "table": "events",
            "watermark_column": "updated_at",
            "_watermark": "2024-01-01T00:00:00Z",
        }));
        assert_eq!(
            build_query(Dialect::Postgres, &req).unwrap(),
            QueryPlan {
                statement: "select * from \"events\" where \"updated_at\" >= $1 order by \"updated_at\"".to_string(),
                watermark: Some("2024-01-01T00:00:00Z".to_string()),
            }
        );

        let plan = build_query(Dialect::Mysql, &req).unwrap();
        assert_eq!(
            plan.statement,
            "select * from `events` where `updated_at` >= ? order by `updated_at`"
        );
    }

    #[test]
    fn test_exclusive_watermark_bound() {
        let req = request(serde_json::json!({
            "table": "events",
            "watermark_column": "updated_at",
            "_watermark": "2024-06-01T10:00:00Z",
            "_watermark_exclusive": true,
        }));
        let plan = build_query(Dialect::Postgres, &req).unwrap();
        assert!(plan.statement.contains("\"updated_at\" > $1"));
    }

    #[test]
    fn test_full_pull_without_watermark() {
        let req = request(serde_json::json!({"table": "events", "limit": 10}));
        let plan = build_query(Dialect::Postgres, &req).unwrap();
        assert_eq!(plan.statement, "select * from \"events\" limit 10");
        assert_eq!(plan.watermark, None);
    }

    #[test]
    fn test_explicit_query_keeps_placeholder_contract() {
        let mut req = request(serde_json::json!({"_watermark": "5"}));
        req.query = Some("select * from t where v >= $1".to_string());
        let plan = build_query(Dialect::Postgres, &req).unwrap();
        assert_eq!(plan.watermark, Some("5".to_string()));

        req.query = Some("select * from t".to_string());
        let plan = build_query(Dialect::Postgres, &req).unwrap();
        assert_eq!(plan.watermark, None);
    }

    #[test]
    fn test_requires_table_or_query() {
        let req = request(serde_json::json!({}));
        assert!(build_query(Dialect::Postgres, &req).is_err());
    }
}
