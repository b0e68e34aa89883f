//! Per-category extraction schemas
//!
//! These are configuration data, not code: each schema describes the
//! fields the extraction engine must produce for its category, and the
//! validator walks the LLM output against them. Built-in defaults cover
//! the standard categories; config.yaml may replace any category's field
//! list or add schemas for new categories. Extraction output shape:
//!
//! ```json
//! { "summary": "...", "data": { <category fields> } }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CategoryConfig;

/// Field value constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    /// Floating-point number within an inclusive range
    Number { min: f64, max: f64 },
    /// Integer within an inclusive range (Likert scales are 1-10)
    Integer { min: i64, max: i64 },
    Text,
    /// One of a fixed set of strings
    Choice { options: Vec<String> },
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

/// Schema for one category's structured payload
#[derive(Debug, Clone)]
pub struct CategorySchema {
    pub category: String,
    pub fields: Vec<FieldSpec>,
}

impl CategorySchema {
    /// Compact schema description embedded in the extraction prompt
    pub fn schema_text(&self) -> String {
        let mut lines = Vec::new();
        for field in &self.fields {
            let kind = match &field.kind {
                FieldKind::Number { min, max } => format!("number {}-{}", min, max),
                FieldKind::Integer { min, max } => format!("integer {}-{}", min, max),
                FieldKind::Text => "string".to_string(),
                FieldKind::Choice { options } => format!("one of: {}", options.join(", ")),
                FieldKind::List => "array".to_string(),
            };
            let req = if field.required { ", required" } else { ", optional" };
            lines.push(format!("  \"{}\": <{}{}>", field.name, kind, req));
        }
        format!(
            "{{\n  \"summary\": <string, required>,\n  \"data\": {{\n{}\n  }}\n}}",
            lines.join(",\n")
        )
    }

    /// Validate an extraction result. Returns every violation so the
    /// corrective-feedback prompt can name all of them at once.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let obj = match value.as_object() {
            Some(o) => o,
            None => return Err(vec!["top-level value must be a JSON object".to_string()]),
        };

        match obj.get("summary") {
            Some(Value::String(_)) => {}
            Some(_) => errors.push("\"summary\" must be a string".to_string()),
            None => errors.push("missing required field \"summary\"".to_string()),
        }

        let data = match obj.get("data") {
            Some(Value::Object(d)) => d,
            Some(_) => {
                errors.push("\"data\" must be a JSON object".to_string());
                return Err(errors);
            }
            None => {
                errors.push("missing required field \"data\"".to_string());
                return Err(errors);
            }
        };

        for field in &self.fields {
            let value = data.get(&field.name);
            match value {
                None | Some(Value::Null) => {
                    if field.required {
                        errors.push(format!("data.{}: missing required field", field.name));
                    }
                }
                Some(v) => {
                    if let Err(msg) = check_kind(field, v) {
                        errors.push(msg);
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn check_kind(field: &FieldSpec, value: &Value) -> Result<(), String> {
    match &field.kind {
        FieldKind::Number { min, max } => match value.as_f64() {
            Some(n) if n >= *min && n <= *max => Ok(()),
            Some(n) => {
                Err(format!("data.{}: {} outside range {}-{}", field.name, n, min, max))
            }
            None => Err(format!("data.{}: expected a number", field.name)),
        },
        FieldKind::Integer { min, max } => {
            let n = value
                .as_i64()
                .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64));
            match n {
                Some(n) if n >= *min && n <= *max => Ok(()),
                Some(n) => {
                    Err(format!("data.{}: {} outside range {}-{}", field.name, n, min, max))
                }
                None => Err(format!("data.{}: expected an integer", field.name)),
            }
        }
        FieldKind::Text => {
            if value.is_string() {
                Ok(())
            } else {
                Err(format!("data.{}: expected a string", field.name))
            }
        }
        FieldKind::Choice { options } => match value.as_str() {
            Some(s) if options.iter().any(|o| o == s) => Ok(()),
            Some(s) => Err(format!(
                "data.{}: \"{}\" is not one of: {}",
                field.name,
                s,
                options.join(", ")
            )),
            None => Err(format!("data.{}: expected a string", field.name)),
        },
        FieldKind::List => {
            if value.is_array() {
                Ok(())
            } else {
                Err(format!("data.{}: expected an array", field.name))
            }
        }
    }
}

fn field(name: &str, kind: FieldKind, required: bool) -> FieldSpec {
    FieldSpec { name: name.to_string(), kind, required }
}

fn likert() -> FieldKind {
    FieldKind::Integer { min: 1, max: 10 }
}

fn choice(options: &[&str]) -> FieldKind {
    FieldKind::Choice { options: options.iter().map(|o| o.to_string()).collect() }
}

/// The full per-category schema set, plus a permissive fallback for
/// unknown categories.
#[derive(Debug)]
pub struct SchemaSet {
    schemas: Vec<CategorySchema>,
    fallback: CategorySchema,
}

impl SchemaSet {
    /// Built-in defaults with config.yaml field overrides applied
    pub fn from_config(overrides: &[CategoryConfig]) -> Self {
        let mut set = Self::default();
        for cfg in overrides {
            let fields = match &cfg.fields {
                Some(fields) => fields.clone(),
                None => continue,
            };
            let schema = CategorySchema { category: cfg.name.clone(), fields };
            match set.schemas.iter_mut().find(|s| s.category == cfg.name) {
                Some(existing) => *existing = schema,
                None => set.schemas.push(schema),
            }
        }
        set
    }

    pub fn get(&self, category: &str) -> &CategorySchema {
        self.schemas.iter().find(|s| s.category == category).unwrap_or(&self.fallback)
    }
}

impl Default for SchemaSet {
    fn default() -> Self {
        let schemas = vec![
            CategorySchema {
                category: "sleep".into(),
                fields: vec![
                    field("duration_hours", FieldKind::Number { min: 0.0, max: 24.0 }, true),
                    field("quality", likert(), false),
                    field("bed_time", FieldKind::Text, false),
                    field("wake_time", FieldKind::Text, false),
                    field("interruptions", FieldKind::Integer { min: 0, max: 50 }, false),
                ],
            },
            CategorySchema {
                category: "nutrition".into(),
                fields: vec![
                    field("items", FieldKind::List, true),
                    field(
                        "meal_type",
                        choice(&["breakfast", "lunch", "dinner", "snack", "drink"]),
                        false,
                    ),
                    field("time_eaten", FieldKind::Text, false),
                    field("quantity", FieldKind::Text, false),
                ],
            },
            CategorySchema {
                category: "substances".into(),
                fields: vec![
                    field("substance_type", FieldKind::Text, true),
                    field("amount", FieldKind::Text, false),
                    field("time_consumed", FieldKind::Text, false),
                ],
            },
            CategorySchema {
                category: "physical_activity".into(),
                fields: vec![
                    field("activity_type", FieldKind::Text, true),
                    field("duration_minutes", FieldKind::Number { min: 0.0, max: 1440.0 }, false),
                    field("intensity", choice(&["low", "medium", "high"]), false),
                ],
            },
            CategorySchema {
                category: "mental_state".into(),
                fields: vec![
                    field("mood", likert(), true),
                    field("emotions", FieldKind::List, false),
                    field("notable_thoughts", FieldKind::Text, false),
                ],
            },
            CategorySchema {
                category: "stress_anxiety".into(),
                fields: vec![
                    field("level", likert(), true),
                    field("triggers", FieldKind::List, false),
                    field("physical_symptoms", FieldKind::List, false),
                ],
            },
            CategorySchema {
                category: "physical_symptoms".into(),
                fields: vec![
                    field("symptom_type", FieldKind::Text, true),
                    field("severity", likert(), true),
                    field("duration", FieldKind::Text, false),
                ],
            },
            CategorySchema {
                category: "social_interaction".into(),
                fields: vec![
                    field("interaction_type", FieldKind::Text, true),
                    field("duration_minutes", FieldKind::Number { min: 0.0, max: 1440.0 }, false),
                    field("people", FieldKind::List, false),
                    field("quality", likert(), false),
                ],
            },
            CategorySchema {
                category: "work_productivity".into(),
                fields: vec![
                    field("focus_level", likert(), true),
                    field("tasks_completed", FieldKind::List, false),
                    field("interruptions", FieldKind::Integer { min: 0, max: 100 }, false),
                ],
            },
            CategorySchema {
                category: "environment".into(),
                fields: vec![
                    field("location", FieldKind::Text, true),
                    field("noise_level", choice(&["quiet", "moderate", "loud"]), false),
                    field("temperature_comfort", FieldKind::Text, false),
                ],
            },
        ];
        let fallback = CategorySchema { category: "general".into(), fields: Vec::new() };
        Self { schemas, fallback }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sleep_schema_accepts_valid_payload() {
        let schemas = SchemaSet::default();
        let value = json!({
            "summary": "Slept 7 hours, quality 6/10",
            "data": {
                "duration_hours": 7,
                "quality": 6,
                "bed_time": "23:00",
                "wake_time": "06:00"
            }
        });
        assert!(schemas.get("sleep").validate(&value).is_ok());
    }

    #[test]
    fn test_likert_out_of_range_rejected() {
        let schemas = SchemaSet::default();
        let value = json!({
            "summary": "mood check",
            "data": { "mood": 99 }
        });
        let errors = schemas.get("mental_state").validate(&value).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("outside range 1-10"));
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let schemas = SchemaSet::default();
        let value = json!({ "summary": "slept ok", "data": {} });
        let errors = schemas.get("sleep").validate(&value).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("duration_hours")));
    }

    #[test]
    fn test_choice_field_rejects_unknown_value() {
        let schemas = SchemaSet::default();
        let value = json!({
            "summary": "ran",
            "data": { "activity_type": "run", "intensity": "extreme" }
        });
        let errors = schemas.get("physical_activity").validate(&value).unwrap_err();
        assert!(errors[0].contains("not one of"));
    }

    #[test]
    fn test_non_object_rejected() {
        let schemas = SchemaSet::default();
        let errors = schemas.get("sleep").validate(&json!([1, 2, 3])).unwrap_err();
        assert!(errors[0].contains("JSON object"));
    }

    #[test]
    fn test_unknown_category_uses_permissive_fallback() {
        let schemas = SchemaSet::default();
        let value = json!({ "summary": "anything", "data": { "whatever": true } });
        assert!(schemas.get("no_such_category").validate(&value).is_ok());
    }

    #[test]
    fn test_schema_text_mentions_fields() {
        let schemas = SchemaSet::default();
        let text = schemas.get("stress_anxiety").schema_text();
        assert!(text.contains("\"level\": <integer 1-10, required>"));
        assert!(text.contains("\"summary\""));
    }

    #[test]
    fn test_field_spec_parses_from_yaml() {
        let yaml = r#"
- name: glasses_of_water
  type: integer
  min: 0
  max: 30
  required: true
- name: beverage
  type: choice
  options: [water, tea, coffee]
"#;
        let fields: Vec<FieldSpec> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].kind, FieldKind::Integer { min: 0, max: 30 });
        assert!(fields[0].required);
        assert!(!fields[1].required);
    }

    #[test]
    fn test_config_override_replaces_and_adds() {
        let overrides = vec![
            CategoryConfig {
                name: "sleep".into(),
                fields: Some(vec![field("hours", FieldKind::Number { min: 0.0, max: 24.0 }, true)]),
                ..Default::default()
            },
            CategoryConfig {
                name: "hydration".into(),
                fields: Some(vec![field(
                    "glasses",
                    FieldKind::Integer { min: 0, max: 30 },
                    true,
                )]),
                ..Default::default()
            },
        ];
        let schemas = SchemaSet::from_config(&overrides);

        let sleep = schemas.get("sleep");
        assert_eq!(sleep.fields.len(), 1);
        assert_eq!(sleep.fields[0].name, "hours");

        let hydration = schemas.get("hydration");
        assert_eq!(hydration.category, "hydration");
        assert_eq!(hydration.fields[0].name, "glasses");
    }
}
