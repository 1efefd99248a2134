use super::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SourceType enumerates the driver types known to the hub.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sqlx-support",
    derive(sqlx::Type),
    sqlx(rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Postgresql,
    Mysql,
    Http,
    Kafka,
    Mqtt,
    Redis,
    File,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Postgresql => "postgresql",
            SourceType::Mysql => "mysql",
            SourceType::Http => "http",
            SourceType::Kafka => "kafka",
            SourceType::Mqtt => "mqtt",
            SourceType::Redis => "redis",
            SourceType::File => "file",
        }
    }

    pub fn category(&self) -> SourceCategory {
        match self {
            SourceType::Postgresql | SourceType::Mysql | SourceType::Redis => {
                SourceCategory::Database
            }
            SourceType::Kafka | SourceType::Mqtt => SourceCategory::Messaging,
            SourceType::Http => SourceCategory::Api,
            SourceType::File => SourceCategory::File,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sqlx-support",
    derive(sqlx::Type),
    sqlx(rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum SourceCategory {
    Database,
    Messaging,
    Api,
    File,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sqlx-support",
    derive(sqlx::Type),
    sqlx(rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Active,
    Inactive,
}

/// Library is a namespace which owns data sources and interfaces. Its
/// `name_en` doubles as the target schema name for basic-library tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::FromRow))]
pub struct Library {
    pub id: Id,
    pub name: String,
    pub name_en: String,
    pub library_type: LibraryType,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sqlx-support",
    derive(sqlx::Type),
    sqlx(rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum LibraryType {
    Basic,
    Thematic,
}

impl LibraryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LibraryType::Basic => "basic",
            LibraryType::Thematic => "thematic",
        }
    }
}

/// DataSource is a typed, configurable handle on an external system.
///
/// `(library_id, name)` is unique, and `type_` must resolve in the driver
/// registry before the source can be registered with the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::FromRow))]
pub struct DataSource {
    pub id: Id,
    pub name: String,
    #[serde(rename = "type")]
    #[cfg_attr(feature = "sqlx-support", sqlx(rename = "type"))]
    pub type_: SourceType,
    pub category: SourceCategory,
    pub library_id: Id,
    pub status: SourceStatus,
    pub connection_config: serde_json::Value,
    pub params_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DataSource {
    pub fn is_active(&self) -> bool {
        self.status == SourceStatus::Active
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_source_type_serde_round_trip() {
        for (ty, text) in [
            (SourceType::Postgresql, "\"postgresql\""),
            (SourceType::Kafka, "\"kafka\""),
            (SourceType::File, "\"file\""),
        ] {
            assert_eq!(serde_json::to_string(&ty).unwrap(), text);
            assert_eq!(serde_json::from_str::<SourceType>(text).unwrap(), ty);
        }
    }

    #[test]
    fn test_categories() {
        assert_eq!(SourceType::Mysql.category(), SourceCategory::Database);
        assert_eq!(SourceType::Mqtt.category(), SourceCategory::Messaging);
        assert_eq!(SourceType::Http.category(), SourceCategory::Api);
        assert_eq!(SourceType::File.category(), SourceCategory::File);
    }
}
