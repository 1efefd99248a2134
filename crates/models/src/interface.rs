use super::{Error, Id, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// ColumnType is the normalized set of column types a target table may
/// declare. Source-level spellings are folded into this set by
/// [`ColumnType::normalize`], which also backs deserialization so stored
/// field configs may carry the loose names.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Varchar,
    Integer,
    Boolean,
    Timestamp,
    Decimal,
    Jsonb,
}

impl<'de> Deserialize<'de> for ColumnType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;
        let raw = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        ColumnType::normalize(&raw).map_err(|err| D::Error::custom(err.to_string()))
    }
}

impl ColumnType {
    /// Fold a declared data type into the normalized set. Accepts both the
    /// canonical names and the loose spellings produced by source systems.
    pub fn normalize(raw: &str) -> Result<Self> {
        let folded = raw.trim().to_ascii_lowercase();
        Ok(match folded.as_str() {
            "varchar" | "string" | "text" | "char" => ColumnType::Varchar,
            "integer" | "int" | "int2" | "int4" | "int8" | "bigint" | "smallint" => {
                ColumnType::Integer
            }
            "boolean" | "bool" => ColumnType::Boolean,
            "timestamp" | "timestamptz" | "datetime" | "date" | "time" => ColumnType::Timestamp,
            "decimal" | "numeric" | "float" | "double" | "real" => ColumnType::Decimal,
            "jsonb" | "json" | "object" | "array" => ColumnType::Jsonb,
            _ => return Err(Error::validation(format!("unknown data type {raw:?}"))),
        })
    }

    /// The SQL spelling used when building DDL and value casts.
    pub fn sql_name(&self) -> &'static str {
        match self {
            ColumnType::Varchar => "varchar",
            ColumnType::Integer => "integer",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamptz",
            ColumnType::Decimal => "numeric",
            ColumnType::Jsonb => "jsonb",
        }
    }
}

/// TableField declares one column of an interface's target table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableField {
    pub name_en: String,
    pub data_type: ColumnType,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default = "default_true")]
    pub is_nullable: bool,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default)]
    pub is_increment_field: bool,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub check_constraint: Option<String>,
    #[serde(default)]
    pub order_num: i32,
}

fn default_true() -> bool {
    true
}

lazy_static::lazy_static! {
    static ref IDENT_RE: regex::Regex = regex::Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap();
}

/// Validate and normalize a declared field list: column names must be sane
/// identifiers, order is made stable, and at least one primary-key field
/// must remain. A varchar primary key with an empty default is allowed.
pub fn normalize_fields(mut fields: Vec<TableField>) -> Result<Vec<TableField>> {
    if fields.is_empty() {
        return Err(Error::validation("an interface requires at least one field"));
    }
    for field in &fields {
        if !IDENT_RE.is_match(&field.name_en) {
            return Err(Error::validation(format!(
                "invalid column name {:?}",
                field.name_en
            )));
        }
        if field.is_primary_key && field.data_type == ColumnType::Varchar {
            if let Some(default) = &field.default_value {
                if !default.is_empty() {
                    return Err(Error::validation(format!(
                        "varchar primary key {:?} must not carry a default",
                        field.name_en
                    )));
                }
            }
        }
    }
    fields.sort_by(|a, b| a.order_num.cmp(&b.order_num).then(a.name_en.cmp(&b.name_en)));

    if !fields.iter().any(|f| f.is_primary_key) {
        return Err(Error::validation(
            "at least one primary-key field is required",
        ));
    }
    Ok(fields)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sqlx-support",
    derive(sqlx::Type),
    sqlx(rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Realtime,
    Batch,
}

/// IncrementalConfig bounds incremental pulls by a monotonically
/// non-decreasing watermark column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalConfig {
    pub watermark_column: String,
    #[serde(default)]
    pub initial_value: Option<String>,
}

/// DataInterface is a named, typed, schema-bearing ingestion unit attached
/// to a data source. `name_en` doubles as the target table name and is
/// unique within its library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataInterface {
    pub id: Id,
    pub library_id: Id,
    pub data_source_id: Id,
    pub name_en: String,
    #[serde(rename = "type")]
    pub type_: InterfaceType,
    pub fields: Vec<TableField>,
    pub is_table_created: bool,
    pub parse_config: serde_json::Value,
    pub incremental_config: Option<IncrementalConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DataInterface {
    pub fn primary_key_fields(&self) -> impl Iterator<Item = &TableField> {
        self.fields.iter().filter(|f| f.is_primary_key)
    }
}

#[cfg(test)]
mod test {
    use super::*;

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
    fn test_normalize_accepts_loose_spellings() {
        assert_eq!(ColumnType::normalize("string").unwrap(), ColumnType::Varchar);
        assert_eq!(ColumnType::normalize("int").unwrap(), ColumnType::Integer);
        assert_eq!(ColumnType::normalize("bool").unwrap(), ColumnType::Boolean);
        assert_eq!(
            ColumnType::normalize("datetime").unwrap(),
            ColumnType::Timestamp
        );
        assert!(ColumnType::normalize("geometry").is_err());
    }

    #[test]
    fn test_deserialize_folds_loose_spellings() {
        let field: TableField = serde_json::from_value(serde_json::json!({
            "name_en": "updated_at",
            "data_type": "datetime",
        }))
        .unwrap();
        assert_eq!(field.data_type, ColumnType::Timestamp);
        assert_eq!(
            serde_json::to_value(field.data_type).unwrap(),
            serde_json::json!("timestamp")
        );

        assert!(serde_json::from_str::<ColumnType>("\"geometry\"").is_err());
    }

    #[test]
    fn test_fields_require_a_primary_key() {
        let err = normalize_fields(vec![field("v", ColumnType::Integer, false)]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let ok = normalize_fields(vec![
            field("v", ColumnType::Integer, false),
            field("id", ColumnType::Varchar, true),
        ])
        .unwrap();
        assert!(ok.iter().any(|f| f.is_primary_key));
    }

    #[test]
    fn test_varchar_pk_rejects_nonempty_default() {
        let mut pk = field("id", ColumnType::Varchar, true);
        pk.default_value = Some("x".to_string());
        assert!(normalize_fields(vec![pk]).is_err());

        let mut pk = field("id", ColumnType::Varchar, true);
        pk.default_value = Some(String::new());
        assert!(normalize_fields(vec![pk]).is_ok());
    }

    #[test]
    fn test_fields_sort_by_order_num() {
        let mut a = field("b", ColumnType::Integer, false);
        a.order_num = 2;
        let mut b = field("a", ColumnType::Varchar, true);
        b.order_num = 1;
        let sorted = normalize_fields(vec![a, b]).unwrap();
        assert_eq!(sorted[0].name_en, "a");
        assert_eq!(sorted[1].name_en, "b");
    }
}
