//! PolicyEngine metadata schema
//!
//! The simulation API publishes three metadata collections that together
//! describe everything a client can edit:
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │ /parameters  │  │ /variables   │  │ /entities    │   (any arrival order)
//! └──────┬───────┘  └──────┬───────┘  └──────┬───────┘
//!        │                 │                 │
//!        ▼                 ▼                 ▼
//! ┌─────────────────────────────────────────────────┐
//! │                  SchemaStore                    │──► is_complete()
//! └───────────────────────┬─────────────────────────┘
//!                         │
//!                         ▼          ┌──────────────────────────┐
//!                  ┌─────────────┐   │ CountryProfile           │
//!                  │ merge       │◄──│  extra parameter/variable│
//!                  └──────┬──────┘   │  metadata (overrides)    │
//!                         │          └──────────────────────────┘
//!                         ▼
//!                      Schema
//! ```
//!
//! Records are typed ([`Parameter`], [`Variable`], [`Entity`]); the
//! identifier space is data-defined, so collections are ordered maps keyed by
//! identifier.

pub mod merge;
pub mod profile;
pub mod record;
pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use merge::{merge, merge_schema, ParameterOverride, VariableOverride};
pub use profile::CountryProfile;
pub use record::{Entity, Parameter, Role, Variable};
pub use store::{Resource, SchemaFragment, SchemaStore};

// ============================================================================
// Scalar values
// ============================================================================

/// A single parameter or variable value.
///
/// Serialized untagged so the JSON form is the plain scalar the API uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ScalarValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Int(i) => Some(*i as f64),
            ScalarValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ScalarValue::Bool(b) => serde_json::Value::Bool(*b),
            ScalarValue::Int(i) => serde_json::Value::from(*i),
            ScalarValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ScalarValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// String encoding used in share URLs. Floats use Rust's shortest
/// round-trip representation, so parsing the output yields the same bits.
impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bool(b) => write!(f, "{}", b),
            ScalarValue::Int(i) => write!(f, "{}", i),
            ScalarValue::Float(x) => write!(f, "{}", x),
            ScalarValue::Text(s) => f.write_str(s),
        }
    }
}

/// Declared type of a parameter or variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    Int,
    Float,
    Enum { possible_values: Vec<String> },
    Text,
}

impl ValueType {
    /// Parse the API's `valueType` spelling. Unknown spellings yield `None`
    /// so the caller can fall back to inferring from the default value.
    pub fn from_api_name(name: &str, possible_values: Vec<String>) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Some(ValueType::Bool),
            "int" | "integer" => Some(ValueType::Int),
            "float" | "number" | "numeric" => Some(ValueType::Float),
            "enum" => Some(ValueType::Enum { possible_values }),
            "str" | "string" | "text" | "date" => Some(ValueType::Text),
            _ => None,
        }
    }

    /// Infer a type from a JSON default value. Numbers are always `Float`:
    /// a rate published as `0` must still accept `0.25`.
    pub fn infer(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(_) => ValueType::Bool,
            serde_json::Value::Number(_) => ValueType::Float,
            _ => ValueType::Text,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ValueType::Int | ValueType::Float)
    }

    /// Represent a JSON value in this type, exactly or not at all.
    ///
    /// Strings are parsed (URL query values always arrive as strings).
    /// Integers written with a fractional part, non-finite floats and enum
    /// members outside `possible_values` are rejected.
    pub fn coerce(&self, value: &serde_json::Value) -> Result<ScalarValue, String> {
        use serde_json::Value;
        match (self, value) {
            (_, Value::Null) => Err("value is null".to_string()),
            (_, Value::Array(_) | Value::Object(_)) => {
                Err(format!("expected a scalar, got {}", json_kind(value)))
            }

            (ValueType::Bool, Value::Bool(b)) => Ok(ScalarValue::Bool(*b)),
            (ValueType::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(ScalarValue::Bool(true)),
                "false" => Ok(ScalarValue::Bool(false)),
                other => Err(format!("`{}` is not a boolean", other)),
            },
            (ValueType::Bool, Value::Number(n)) => match n.as_i64() {
                Some(0) => Ok(ScalarValue::Bool(false)),
                Some(1) => Ok(ScalarValue::Bool(true)),
                _ => Err(format!("`{}` is not a boolean", n)),
            },

            (ValueType::Int, Value::Number(n)) => match n.as_i64() {
                Some(i) => Ok(ScalarValue::Int(i)),
                None => n
                    .as_f64()
                    .and_then(integral)
                    .map(ScalarValue::Int)
                    .ok_or_else(|| format!("`{}` is not an integer", n)),
            },
            (ValueType::Int, Value::String(s)) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(integral))
                    .map(ScalarValue::Int)
                    .ok_or_else(|| format!("`{}` is not an integer", s))
            }

            (ValueType::Float, Value::Number(n)) => n
                .as_f64()
                .filter(|f| f.is_finite())
                .map(ScalarValue::Float)
                .ok_or_else(|| format!("`{}` is not a finite number", n)),
            (ValueType::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(ScalarValue::Float)
                .ok_or_else(|| format!("`{}` is not a number", s.trim())),

            (ValueType::Enum { possible_values }, Value::String(s)) => {
                if possible_values.is_empty() || possible_values.iter().any(|p| p == s) {
                    Ok(ScalarValue::Text(s.clone()))
                } else {
                    Err(format!(
                        "`{}` is not one of {}",
                        s,
                        possible_values.join(", ")
                    ))
                }
            }

            (ValueType::Text, Value::String(s)) => Ok(ScalarValue::Text(s.clone())),
            (ValueType::Text, Value::Number(n)) => Ok(ScalarValue::Text(n.to_string())),
            (ValueType::Text, Value::Bool(b)) => Ok(ScalarValue::Text(b.to_string())),

            (ty, other) => Err(format!("expected {:?}, got {}", ty, json_kind(other))),
        }
    }

    /// Zero value used when a record publishes no default.
    pub fn zero(&self) -> ScalarValue {
        match self {
            ValueType::Bool => ScalarValue::Bool(false),
            ValueType::Int => ScalarValue::Int(0),
            ValueType::Float => ScalarValue::Float(0.0),
            ValueType::Enum { possible_values } => {
                ScalarValue::Text(possible_values.first().cloned().unwrap_or_default())
            }
            ValueType::Text => ScalarValue::Text(String::new()),
        }
    }
}

fn integral(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

// ============================================================================
// Merged schema
// ============================================================================

/// Canonical merged metadata used by every downstream component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub parameters: BTreeMap<String, Parameter>,
    pub variables: BTreeMap<String, Variable>,
    pub entities: BTreeMap<String, Entity>,
}

impl Schema {
    /// Find the entity a situation group key refers to. Groups are normally
    /// keyed by plural (`people`), but the singular key is accepted too.
    pub fn entity_for_group(&self, group: &str) -> Option<&Entity> {
        self.entities
            .values()
            .find(|e| e.plural == group)
            .or_else(|| self.entities.get(group))
    }

    pub fn person_entity(&self) -> Option<&Entity> {
        self.entities.values().find(|e| e.is_person)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("`{resource}` payload must be a JSON object, got {found}")]
    NotAnObject { resource: Resource, found: String },
    #[error("malformed {resource} record `{id}`: {message}")]
    MalformedRecord {
        resource: Resource,
        id: String,
        message: String,
    },
    #[error("schema incomplete, still waiting for: {missing:?}")]
    Incomplete { missing: Vec<Resource> },
    #[error("unknown metadata resource `{0}`")]
    UnknownResource(String),
    #[error("invalid country profile: {0}")]
    Profile(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_display_is_round_trippable() {
        assert_eq!(ScalarValue::Float(0.25).to_string(), "0.25");
        assert_eq!(ScalarValue::Float(3.0).to_string(), "3");
        assert_eq!(ScalarValue::Int(-12).to_string(), "-12");
        assert_eq!(ScalarValue::Bool(true).to_string(), "true");
        let x = 0.1 + 0.2;
        let back: f64 = ScalarValue::Float(x).to_string().parse().unwrap();
        assert_eq!(back, x);
    }

    #[test]
    fn scalar_deserializes_untagged() {
        let v: ScalarValue = serde_json::from_value(json!(30)).unwrap();
        assert_eq!(v, ScalarValue::Int(30));
        let v: ScalarValue = serde_json::from_value(json!(0.2)).unwrap();
        assert_eq!(v, ScalarValue::Float(0.2));
        let v: ScalarValue = serde_json::from_value(json!("SINGLE")).unwrap();
        assert_eq!(v, ScalarValue::Text("SINGLE".to_string()));
    }

    #[test]
    fn value_type_api_names() {
        assert_eq!(ValueType::from_api_name("bool", vec![]), Some(ValueType::Bool));
        assert_eq!(ValueType::from_api_name("Float", vec![]), Some(ValueType::Float));
        assert_eq!(ValueType::from_api_name("mystery", vec![]), None);
        assert_eq!(ValueType::infer(&json!(0)), ValueType::Float);
    }

    #[test]
    fn coerce_parses_query_strings() {
        assert_eq!(ValueType::Float.coerce(&json!(" 0.25 ")), Ok(ScalarValue::Float(0.25)));
        assert_eq!(ValueType::Int.coerce(&json!("12")), Ok(ScalarValue::Int(12)));
        assert_eq!(ValueType::Int.coerce(&json!("12.0")), Ok(ScalarValue::Int(12)));
        assert_eq!(ValueType::Bool.coerce(&json!("TRUE")), Ok(ScalarValue::Bool(true)));
        assert_eq!(ValueType::Bool.coerce(&json!(0)), Ok(ScalarValue::Bool(false)));
    }

    #[test]
    fn coerce_rejects_inexact_values() {
        assert!(ValueType::Int.coerce(&json!(2.5)).is_err());
        assert!(ValueType::Int.coerce(&json!("2.5")).is_err());
        assert!(ValueType::Float.coerce(&json!("inf")).is_err());
        assert!(ValueType::Float.coerce(&json!("")).is_err());
        assert!(ValueType::Float.coerce(&json!(true)).is_err());
        assert!(ValueType::Bool.coerce(&json!("yes")).is_err());
        assert!(ValueType::Float.coerce(&json!(null)).is_err());
        assert!(ValueType::Text.coerce(&json!([1])).is_err());

        let regions = ValueType::Enum {
            possible_values: vec!["LONDON".to_string(), "WALES".to_string()],
        };
        assert_eq!(
            regions.coerce(&json!("WALES")),
            Ok(ScalarValue::Text("WALES".to_string()))
        );
        assert!(regions.coerce(&json!("MARS")).unwrap_err().contains("not one of"));
    }

    #[test]
    fn schema_group_lookup_by_plural_or_key() {
        let mut schema = Schema::default();
        schema.entities.insert(
            "person".to_string(),
            Entity::from_record("person", &json!({"plural": "people"})).unwrap(),
        );
        assert_eq!(schema.entity_for_group("people").map(|e| e.key.as_str()), Some("person"));
        assert_eq!(schema.entity_for_group("person").map(|e| e.key.as_str()), Some("person"));
        assert!(schema.entity_for_group("pets").is_none());
        assert_eq!(schema.person_entity().map(|e| e.key.as_str()), Some("person"));
    }
}
