pub mod data_sources;
pub mod executions;
pub mod interfaces;
pub mod schedule_configs;
pub mod statuses;
pub mod system_configs;
pub mod target;
pub mod tasks;

pub use models::{Error, Id, Result};

/// Quote a schema/table/column identifier for interpolation into dynamic
/// statements targeting tables whose names come from interface config.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Render a JSON scalar as its canonical text form, for binding with an
/// explicit SQL cast. Objects and arrays render as their JSON text.
pub fn value_as_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::{quote_ident, value_as_text};

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_value_as_text() {
        assert_eq!(value_as_text(&serde_json::Value::Null), None);
        assert_eq!(
            value_as_text(&serde_json::json!("hi")),
            Some("hi".to_string())
        );
        assert_eq!(value_as_text(&serde_json::json!(true)), Some("true".into()));
        assert_eq!(value_as_text(&serde_json::json!(42)), Some("42".into()));
        assert_eq!(
            value_as_text(&serde_json::json!({"a": 1})),
            Some("{\"a\":1}".to_string())
        );
    }
}
