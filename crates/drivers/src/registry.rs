use crate::validate::{advisory_suggestions, validate_config, FieldKind, FieldSchema};
use crate::{SourceDriver, ValidationReport};
use models::{Error, Result, SourceType};
use std::collections::HashMap;

type Factory = Box<dyn Fn() -> Box<dyn SourceDriver> + Send + Sync>;

struct Entry {
    schema: Vec<FieldSchema>,
    factory: Factory,
}

/// DriverRegistry maps a source type to its driver factory and declarative
/// config schema. One registry is built at startup and shared process-wide
/// through the SourceManager.
pub struct DriverRegistry {
    entries: HashMap<SourceType, Entry>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The registry with every built-in driver type registered.
    pub fn builtin() -> Self {
        use FieldKind::*;

        let mut registry = Self::new();
        registry.register(
            SourceType::Postgresql,
            vec![
                FieldSchema::required("host", String),
                FieldSchema::required("port", Integer).with_range(1, 65535),
                FieldSchema::required("database", String),
                FieldSchema::required("user", String),
                FieldSchema::required("password", String),
                FieldSchema::optional("sslmode", String)
                    .with_options(&["disable", "prefer", "require", "verify-full"]),
            ],
            || Box::<crate::postgres::PostgresDriver>::default(),
        );
        registry.register(
            SourceType::Mysql,
            vec![
                FieldSchema::required("host", String),
                FieldSchema::required("port", Integer).with_range(1, 65535),
                FieldSchema::required("database", String),
                FieldSchema::required("user", String),
                FieldSchema::required("password", String),
            ],
            || Box::<crate::mysql::MysqlDriver>::default(),
        );
        registry.register(
            SourceType::Http,
            vec![
                FieldSchema::required("url", String),
                FieldSchema::required("method", String)
                    .with_options(&["GET", "POST", "PUT", "DELETE", "get", "post", "put", "delete"]),
                FieldSchema::optional("headers", String),
            ],
            || Box::<crate::http::HttpDriver>::default(),
        );
        registry.register(
            SourceType::Kafka,
            vec![
                FieldSchema::required("brokers", List),
                FieldSchema::required("topics", List),
                FieldSchema::optional("group_id", String),
            ],
            || Box::<crate::kafka::KafkaDriver>::default(),
        );
        registry.register(
            SourceType::Mqtt,
            vec![
                FieldSchema::required("broker", String),
                FieldSchema::required("topics", List),
                FieldSchema::optional("client_id", String),
                FieldSchema::optional("username", String),
                FieldSchema::optional("password", String),
            ],
            || Box::<crate::mqtt::MqttDriver>::default(),
        );
        registry.register(
            SourceType::Redis,
            vec![
                FieldSchema::required("host", String),
                FieldSchema::required("port", Integer).with_range(1, 65535),
                FieldSchema::optional("password", String),
                FieldSchema::optional("db", Integer).with_range(0, 15),
            ],
            || Box::<crate::redis::RedisDriver>::default(),
        );
        registry.register(
            SourceType::File,
            vec![
                FieldSchema::required("path", String),
                FieldSchema::required("format", String)
                    .with_options(&["json", "jsonl", "ndjson", "csv"]),
                FieldSchema::optional("delimiter", String),
            ],
            || Box::<crate::file::FileDriver>::default(),
        );
        registry
    }

    pub fn register<F>(&mut self, type_: SourceType, schema: Vec<FieldSchema>, factory: F)
    where
        F: Fn() -> Box<dyn SourceDriver> + Send + Sync + 'static,
    {
        self.entries.insert(
            type_,
            Entry {
                schema,
                factory: Box::new(factory),
            },
        );
    }

    pub fn contains(&self, type_: SourceType) -> bool {
        self.entries.contains_key(&type_)
    }

    pub fn config_schema(&self, type_: SourceType) -> Option<&[FieldSchema]> {
        self.entries.get(&type_).map(|e| e.schema.as_slice())
    }

    /// Construct a fresh, uninitialized driver of the given type.
    pub fn new_driver(&self, type_: SourceType) -> Result<Box<dyn SourceDriver>> {
        let entry = self
            .entries
            .get(&type_)
            .ok_or_else(|| Error::validation(format!("no driver registered for type {type_}")))?;
        Ok((entry.factory)())
    }

    /// Validate a connection config against the type's declarative schema,
    /// with category-level advisory suggestions appended as warnings.
    pub fn validate(&self, type_: SourceType, config: &serde_json::Value) -> Result<ValidationReport> {
        let schema = self
            .config_schema(type_)
            .ok_or_else(|| Error::validation(format!("no driver registered for type {type_}")))?;
        let mut report = validate_config(schema, config);
        report
            .warnings
            .extend(advisory_suggestions(type_.category(), config));
        Ok(report)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod test {
    use super::DriverRegistry;
    use models::SourceType;

    #[test]
    fn test_builtin_covers_every_type() {
        let registry = DriverRegistry::builtin();
        for type_ in [
            SourceType::Postgresql,
            SourceType::Mysql,
            SourceType::Http,
            SourceType::Kafka,
            SourceType::Mqtt,
            SourceType::Redis,
            SourceType::File,
        ] {
            assert!(registry.contains(type_), "missing driver for {type_}");
            assert!(registry.new_driver(type_).is_ok());
        }
    }

    #[test]
    fn test_validate_required_minima() {
        let registry = DriverRegistry::builtin();

        let report = registry
            .validate(SourceType::Kafka, &serde_json::json!({"brokers": "k:9092"}))
            .unwrap();
        assert!(!report.is_valid);
        assert!(report.errors.iter().any(|e| e.contains("topics")));

        let report = registry
            .validate(
                SourceType::Kafka,
                &serde_json::json!({"brokers": ["k:9092"], "topics": ["events"]}),
            )
            .unwrap();
        assert!(report.is_valid);
        // Unauthenticated broker advisory lands in warnings only.
        assert!(!report.warnings.is_empty());
    }
}
