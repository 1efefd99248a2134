use models::SourceCategory;

/// FieldKind of a declarative config field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Boolean,
    List,
}

/// FieldSchema declares one config field of a driver type: whether it is
/// required, its bounds, an optional pattern, and an optional closed set of
/// accepted values.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub pattern: Option<&'static str>,
    pub options: &'static [&'static str],
}

impl FieldSchema {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            min: None,
            max: None,
            pattern: None,
            options: &[],
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            min: None,
            max: None,
            pattern: None,
            options: &[],
        }
    }

    pub const fn with_range(mut self, min: i64, max: i64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub const fn with_options(mut self, options: &'static [&'static str]) -> Self {
        self.options = options;
        self
    }
}

/// ValidationReport is the outcome of checking a connection config against
/// its declarative schema. Warnings are advisory and never affect
/// `is_valid`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub score: i32,
}

pub fn validate_config(schema: &[FieldSchema], config: &serde_json::Value) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for field in schema {
        let value = config.get(field.name);
        let Some(value) = value else {
            if field.required {
                errors.push(format!("missing required field {:?}", field.name));
            }
            continue;
        };
        if value.is_null() {
            if field.required {
                errors.push(format!("required field {:?} is null", field.name));
            }
            continue;
        }

        match field.kind {
            FieldKind::String => match value.as_str() {
                None => errors.push(format!("field {:?} must be a string", field.name)),
                Some(s) => {
                    if field.required && s.is_empty() {
                        errors.push(format!("required field {:?} is empty", field.name));
                    }
                    if let Some(min) = field.min {
                        if (s.len() as i64) < min {
                            warnings.push(format!(
                                "field {:?} is shorter than {min} characters",
                                field.name
                            ));
                        }
                    }
                    if let Some(pattern) = field.pattern {
                        // Schemas are static; the pattern is known-good.
                        let re = regex::Regex::new(pattern).expect("invalid field pattern");
                        if !re.is_match(s) {
                            errors.push(format!(
                                "field {:?} does not match pattern {pattern:?}",
                                field.name
                            ));
                        }
                    }
                    if !field.options.is_empty() && !field.options.contains(&s) {
                        errors.push(format!(
                            "field {:?} must be one of {:?}",
                            field.name, field.options
                        ));
                    }
                }
            },
            FieldKind::Integer => {
                let parsed = match value {
                    serde_json::Value::Number(n) => n.as_i64(),
                    serde_json::Value::String(s) => s.parse().ok(),
                    _ => None,
                };
                match parsed {
                    None => errors.push(format!("field {:?} must be an integer", field.name)),
                    Some(n) => {
                        if let Some(min) = field.min {
                            if n < min {
                                errors.push(format!("field {:?} must be >= {min}", field.name));
                            }
                        }
                        if let Some(max) = field.max {
                            if n > max {
                                errors.push(format!("field {:?} must be <= {max}", field.name));
                            }
                        }
                    }
                }
            }
            FieldKind::Boolean => {
                if !value.is_boolean() {
                    errors.push(format!("field {:?} must be a boolean", field.name));
                }
            }
            FieldKind::List => {
                let ok = value.is_array()
                    || matches!(value, serde_json::Value::String(s) if !s.is_empty());
                if !ok {
                    errors.push(format!(
                        "field {:?} must be an array or comma-separated string",
                        field.name
                    ));
                }
            }
        }
    }

    // Score starts from full marks and loses 20 per error, 5 per warning.
    let score = (100i32 - 20 * errors.len() as i32 - 5 * warnings.len() as i32).clamp(0, 100);

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        score,
    }
}

/// Category-level advisory suggestions. These are appended to the report's
/// warnings and never alter validity.
pub fn advisory_suggestions(
    category: SourceCategory,
    config: &serde_json::Value,
) -> Vec<String> {
    let mut out = Vec::new();
    match category {
        SourceCategory::Database => {
            if let Some(password) = config.get("password").and_then(|v| v.as_str()) {
                if password.len() < 8 {
                    out.push("password is shorter than 8 characters".to_string());
                }
            }
            if config.get("sslmode").and_then(|v| v.as_str()).is_none() {
                out.push("consider enabling TLS (sslmode)".to_string());
            }
        }
        SourceCategory::Api => {
            if let Some(url) = config.get("url").and_then(|v| v.as_str()) {
                if url.starts_with("http://") {
                    out.push("use TLS: the endpoint URL is plain http".to_string());
                }
            }
        }
        SourceCategory::Messaging => {
            if config.get("username").is_none() && config.get("sasl_username").is_none() {
                out.push("broker connection is unauthenticated".to_string());
            }
        }
        SourceCategory::File => {}
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn schema() -> Vec<FieldSchema> {
        vec![
            FieldSchema::required("host", FieldKind::String),
            FieldSchema::required("port", FieldKind::Integer).with_range(1, 65535),
            FieldSchema::optional("sslmode", FieldKind::String)
                .with_options(&["disable", "require", "verify-full"]),
        ]
    }

    #[test]
    fn test_missing_required_field() {
        let report = validate_config(&schema(), &serde_json::json!({"host": "db"}));
        assert!(!report.is_valid);
        assert_eq!(report.errors, vec!["missing required field \"port\""]);
    }

    #[test]
    fn test_integer_bounds_and_string_coercion() {
        let report =
            validate_config(&schema(), &serde_json::json!({"host": "db", "port": "70000"}));
        assert!(!report.is_valid);
        assert!(report.errors[0].contains("<= 65535"));

        let report = validate_config(&schema(), &serde_json::json!({"host": "db", "port": 5432}));
        assert!(report.is_valid);
        assert_eq!(report.score, 100);
    }

    #[test]
    fn test_closed_option_set() {
        let report = validate_config(
            &schema(),
            &serde_json::json!({"host": "db", "port": 5432, "sslmode": "maybe"}),
        );
        assert!(!report.is_valid);
    }

    #[test]
    fn test_advisories_never_alter_validity() {
        let config = serde_json::json!({"host": "db", "port": 5432, "password": "short"});
        let mut report = validate_config(&schema(), &config);
        report
            .warnings
            .extend(advisory_suggestions(SourceCategory::Database, &config));
        assert!(report.is_valid);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("shorter than 8 characters")));
    }
}
