//! Field mapping and value coercion between driver rows and target-table
//! columns. Source columns are renamed through the interface's
//! `parse_config.field_map`, then each value is coerced to the column's
//! declared type. Values that cannot be coerced become null with a
//! warning rather than failing the batch.

use chrono::TimeZone;
use drivers::Row;
use models::{ColumnType, TableField};
use std::collections::HashMap;

/// The source-column to target-column rename map of an interface, from
/// `parse_config.field_map`. Missing or empty means identity.
pub fn field_map(parse_config: &serde_json::Value) -> HashMap<String, String> {
    parse_config
        .get("field_map")
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Map one driver row onto the declared fields: rename, keep only declared
/// columns, and coerce each value.
pub fn map_row(
    row: &Row,
    fields: &[TableField],
    renames: &HashMap<String, String>,
    warnings: &mut Vec<String>,
) -> Row {
    let declared: HashMap<&str, &TableField> =
        fields.iter().map(|f| (f.name_en.as_str(), f)).collect();

    let mut out = Row::new();
    for (source_name, value) in row {
        let target_name = renames
            .get(source_name)
            .map(String::as_str)
            .unwrap_or(source_name);
        let Some(field) = declared.get(target_name) else {
            continue; // Undeclared source columns are dropped.
        };
        let coerced = match coerce(value, field.data_type) {
            Ok(coerced) => coerced,
            Err(reason) => {
                warnings.push(format!("column {target_name:?}: {reason}"));
                serde_json::Value::Null
            }
        };
        out.insert(target_name.to_string(), coerced);
    }
    out
}

pub fn map_rows(
    rows: &[Row],
    fields: &[TableField],
    renames: &HashMap<String, String>,
    warnings: &mut Vec<String>,
) -> Vec<Row> {
    rows.iter()
        .map(|row| map_row(row, fields, renames, warnings))
        .collect()
}

/// Coerce one JSON value to a declared column type.
pub fn coerce(
    value: &serde_json::Value,
    data_type: ColumnType,
) -> Result<serde_json::Value, String> {
    use serde_json::Value;

    if value.is_null() {
        return Ok(Value::Null);
    }
    match data_type {
        ColumnType::Varchar => Ok(match value {
            Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }),
        ColumnType::Integer => match value {
            Value::Number(n) if n.as_i64().is_some() => Ok(value.clone()),
            Value::Number(n) => {
                // Accept a float with no fractional part.
                let f = n.as_f64().unwrap_or(f64::NAN);
                if f.fract() == 0.0 && f.is_finite() {
                    Ok(serde_json::json!(f as i64))
                } else {
                    Err(format!("{n} is not an integer"))
                }
            }
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|n| serde_json::json!(n))
                .map_err(|_| format!("{s:?} is not an integer")),
            Value::Bool(b) => Ok(serde_json::json!(if *b { 1 } else { 0 })),
            other => Err(format!("{other} is not an integer")),
        },
        ColumnType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "f" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(format!("{s:?} is not a boolean")),
            },
            other => Err(format!("{other} is not a boolean")),
        },
        ColumnType::Timestamp => match value {
            Value::String(s) => parse_timestamp(s)
                .map(Value::String)
                .ok_or_else(|| format!("{s:?} is not a timestamp")),
            Value::Number(n) => {
                // Epoch seconds, with millisecond precision tolerated.
                let secs = n.as_f64().ok_or_else(|| format!("{n} is not a timestamp"))?;
                let millis = (secs * 1_000.0) as i64;
                chrono::Utc
                    .timestamp_millis_opt(millis)
                    .single()
                    .map(|t| Value::String(t.to_rfc3339()))
                    .ok_or_else(|| format!("{n} is out of timestamp range"))
            }
            other => Err(format!("{other} is not a timestamp")),
        },
        ColumnType::Decimal => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(|_| Value::String(s.trim().to_string()))
                .map_err(|_| format!("{s:?} is not numeric")),
            other => Err(format!("{other} is not numeric")),
        },
        ColumnType::Jsonb => Ok(value.clone()),
    }
}

/// Accept RFC 3339, a bare date, or the common `Y-m-d H:M:S` spelling.
fn parse_timestamp(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if let Ok(t) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&chrono::Utc).to_rfc3339());
    }
    if let Ok(t) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(t.and_utc().to_rfc3339());
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(d.and_hms_opt(0, 0, 0)?.and_utc().to_rfc3339());
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use models::ColumnType;

    fn field(name: &str, data_type: ColumnType) -> TableField {
        TableField {
            name_en: name.to_string(),
            data_type,
            is_primary_key: false,
            is_nullable: true,
            is_unique: false,
            is_increment_field: false,
            default_value: None,
            check_constraint: None,
            order_num: 0,
        }
    }

    #[test]
    fn test_coercions() {
        use serde_json::json;

        assert_eq!(coerce(&json!(42), ColumnType::Varchar).unwrap(), json!("42"));
        assert_eq!(coerce(&json!("7"), ColumnType::Integer).unwrap(), json!(7));
        assert_eq!(coerce(&json!(7.0), ColumnType::Integer).unwrap(), json!(7));
        assert!(coerce(&json!(7.5), ColumnType::Integer).is_err());
        assert_eq!(
            coerce(&json!("true"), ColumnType::Boolean).unwrap(),
            json!(true)
        );
        assert_eq!(coerce(&json!(0), ColumnType::Boolean).unwrap(), json!(false));
        assert_eq!(
            coerce(&json!("2024-06-01T10:00:00Z"), ColumnType::Timestamp).unwrap(),
            json!("2024-06-01T10:00:00+00:00")
        );
        assert_eq!(
            coerce(&json!("2024-06-01 10:00:00"), ColumnType::Timestamp).unwrap(),
            json!("2024-06-01T10:00:00+00:00")
        );
        assert!(coerce(&json!("whenever"), ColumnType::Timestamp).is_err());
        assert_eq!(
            coerce(&json!({"a": 1}), ColumnType::Jsonb).unwrap(),
            json!({"a": 1})
        );
    }

    #[test]
    fn test_map_row_renames_filters_and_warns() {
        let fields = vec![
            field("user_id", ColumnType::Integer),
            field("joined_at", ColumnType::Timestamp),
        ];
        let renames: HashMap<String, String> =
            [("uid".to_string(), "user_id".to_string())].into();

        let row: Row = serde_json::json!({
            "uid": "1001",
            "joined_at": "not a time",
            "extra": "dropped",
        })
        .as_object()
        .unwrap()
        .clone();

        let mut warnings = Vec::new();
        let mapped = map_row(&row, &fields, &renames, &mut warnings);

        assert_eq!(mapped["user_id"], serde_json::json!(1001));
        assert_eq!(mapped["joined_at"], serde_json::Value::Null);
        assert!(!mapped.contains_key("extra"));
        assert_eq!(warnings.len(), 1);
    }
}
