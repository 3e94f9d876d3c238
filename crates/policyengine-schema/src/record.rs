//! Typed metadata records parsed from the API's JSON payloads.
//!
//! The API spells fields in camelCase (`defaultValue`, `valueType`,
//! `possibleValues`); snake_case spellings are accepted as well. Fields a
//! record type does not name are kept in `extra` so nothing fetched is lost.

use crate::{json_kind, Resource, ScalarValue, SchemaError, ValueType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// ============================================================================
// Parameter
// ============================================================================

/// An adjustable policy input, identified by a dotted path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub default_value: ScalarValue,
    /// Current-law value as published. Always type-compatible with
    /// `value_type`.
    pub value: ScalarValue,
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

const PARAMETER_FIELDS: &[&str] = &[
    "name",
    "defaultValue",
    "default_value",
    "value",
    "valueType",
    "value_type",
    "type",
    "possibleValues",
    "possible_values",
    "unit",
    "period",
    "min",
    "max",
    "label",
    "description",
    "documentation",
];

impl Parameter {
    pub fn from_record(id: &str, record: &Value) -> Result<Self, SchemaError> {
        let obj = record_object(Resource::Parameters, id, record)?;
        let malformed = |message: String| SchemaError::MalformedRecord {
            resource: Resource::Parameters,
            id: id.to_string(),
            message,
        };

        let default_json = field(obj, &["defaultValue", "default_value", "value"])
            .ok_or_else(|| malformed("missing default value".to_string()))?;
        let value_type = declared_type(obj).unwrap_or_else(|| ValueType::infer(default_json));
        let default_value = value_type
            .coerce(default_json)
            .map_err(|e| malformed(format!("default value: {}", e)))?;
        let value = match obj.get("value") {
            Some(v) => value_type
                .coerce(v)
                .map_err(|e| malformed(format!("value: {}", e)))?,
            None => default_value.clone(),
        };

        Ok(Self {
            name: id.to_string(),
            default_value,
            value,
            value_type,
            unit: string_field(obj, &["unit"]),
            period: string_field(obj, &["period"]),
            min: obj.get("min").and_then(Value::as_f64),
            max: obj.get("max").and_then(Value::as_f64),
            label: string_field(obj, &["label"]),
            description: string_field(obj, &["description", "documentation"]),
            extra: extra_fields(obj, PARAMETER_FIELDS),
        })
    }
}

/// Override keys that change how a parameter's values are typed.
pub(crate) const PARAMETER_TYPED_FIELDS: &[&str] = &[
    "defaultValue",
    "default_value",
    "value",
    "valueType",
    "value_type",
    "type",
    "possibleValues",
    "possible_values",
];

impl Parameter {
    /// Re-derive type, default and value with `fields` laid over this record.
    ///
    /// A value that tracked the default keeps tracking it.
    pub(crate) fn retype(&mut self, fields: &Map<String, Value>) -> Result<(), SchemaError> {
        let malformed = |message: String| SchemaError::MalformedRecord {
            resource: Resource::Parameters,
            id: self.name.clone(),
            message,
        };

        let value_type = overridden_type(fields, &self.value_type);
        let default_value = match field(fields, &["defaultValue", "default_value", "value"]) {
            Some(v) => value_type.coerce(v),
            None => value_type.coerce(&self.default_value.to_json()),
        }
        .map_err(|e| malformed(format!("default value: {}", e)))?;
        let value = match fields.get("value") {
            Some(v) => value_type.coerce(v),
            None if self.value == self.default_value => Ok(default_value.clone()),
            None => value_type.coerce(&self.value.to_json()),
        }
        .map_err(|e| malformed(format!("value: {}", e)))?;

        self.value_type = value_type;
        self.default_value = default_value;
        self.value = value;
        Ok(())
    }
}

// ============================================================================
// Variable
// ============================================================================

/// A household input or simulation output, attached to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    /// Key of the owning entity (`person`, `household`, ...).
    pub entity: String,
    pub value_type: ValueType,
    pub default_value: ScalarValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

const VARIABLE_FIELDS: &[&str] = &[
    "name",
    "entity",
    "valueType",
    "value_type",
    "type",
    "possibleValues",
    "possible_values",
    "defaultValue",
    "default_value",
    "unit",
    "definitionPeriod",
    "definition_period",
    "label",
    "description",
    "documentation",
    "hidden",
];

impl Variable {
    pub fn from_record(id: &str, record: &Value) -> Result<Self, SchemaError> {
        let obj = record_object(Resource::Variables, id, record)?;
        let malformed = |message: String| SchemaError::MalformedRecord {
            resource: Resource::Variables,
            id: id.to_string(),
            message,
        };

        let entity = string_field(obj, &["entity"])
            .ok_or_else(|| malformed("missing entity".to_string()))?;
        let default_json = field(obj, &["defaultValue", "default_value"]);
        let value_type = declared_type(obj)
            .or_else(|| default_json.filter(|v| !v.is_null()).map(ValueType::infer))
            .unwrap_or(ValueType::Float);
        let default_value = match default_json {
            Some(Value::Null) | None => value_type.zero(),
            Some(v) => value_type
                .coerce(v)
                .map_err(|e| malformed(format!("default value: {}", e)))?,
        };

        Ok(Self {
            name: id.to_string(),
            entity,
            value_type,
            default_value,
            unit: string_field(obj, &["unit"]),
            definition_period: string_field(obj, &["definitionPeriod", "definition_period"]),
            label: string_field(obj, &["label"]),
            description: string_field(obj, &["description", "documentation"]),
            hidden: obj.get("hidden").and_then(Value::as_bool).unwrap_or(false),
            extra: extra_fields(obj, VARIABLE_FIELDS),
        })
    }
}

/// Override keys that change a variable's entity or how its values are typed.
pub(crate) const VARIABLE_TYPED_FIELDS: &[&str] = &[
    "entity",
    "defaultValue",
    "default_value",
    "valueType",
    "value_type",
    "type",
    "possibleValues",
    "possible_values",
];

impl Variable {
    /// Re-derive entity, type and default with `fields` laid over this record.
    pub(crate) fn retype(&mut self, fields: &Map<String, Value>) -> Result<(), SchemaError> {
        let malformed = |message: String| SchemaError::MalformedRecord {
            resource: Resource::Variables,
            id: self.name.clone(),
            message,
        };

        let entity = match fields.get("entity") {
            Some(Value::String(entity)) => entity.clone(),
            Some(other) => {
                return Err(malformed(format!(
                    "entity must be a string, got {}",
                    json_kind(other)
                )))
            }
            None => self.entity.clone(),
        };
        let value_type = overridden_type(fields, &self.value_type);
        let default_value = match field(fields, &["defaultValue", "default_value"]) {
            Some(Value::Null) => Ok(value_type.zero()),
            Some(v) => value_type.coerce(v),
            None => value_type.coerce(&self.default_value.to_json()),
        }
        .map_err(|e| malformed(format!("default value: {}", e)))?;

        self.entity = entity;
        self.value_type = value_type;
        self.default_value = default_value;
        Ok(())
    }
}

// ============================================================================
// Entity
// ============================================================================

/// A role a person can play inside a group entity (`members`, `adults`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub key: String,
    pub plural: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: String,
    pub plural: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_person: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub roles: BTreeMap<String, Role>,
}

impl Entity {
    pub fn from_record(id: &str, record: &Value) -> Result<Self, SchemaError> {
        let obj = record_object(Resource::Entities, id, record)?;

        let mut roles = BTreeMap::new();
        match obj.get("roles") {
            Some(Value::Object(map)) => {
                for (key, role) in map {
                    let role = parse_role(id, Some(key), role)?;
                    roles.insert(role.key.clone(), role);
                }
            }
            Some(Value::Array(items)) => {
                for role in items {
                    let role = parse_role(id, None, role)?;
                    roles.insert(role.key.clone(), role);
                }
            }
            Some(Value::Null) | None => {}
            Some(other) => {
                return Err(SchemaError::MalformedRecord {
                    resource: Resource::Entities,
                    id: id.to_string(),
                    message: format!("roles must be an object or array, got {}", json_kind(other)),
                })
            }
        }

        // OpenFisca marks persons explicitly; older payloads only imply it by
        // the absence of roles.
        let is_person = field(obj, &["is_person", "isPerson"])
            .and_then(Value::as_bool)
            .unwrap_or(roles.is_empty());

        Ok(Self {
            key: id.to_string(),
            plural: string_field(obj, &["plural"]).unwrap_or_else(|| format!("{}s", id)),
            label: string_field(obj, &["label"]),
            description: string_field(obj, &["description", "documentation"]),
            is_person,
            roles,
        })
    }

    /// Role addressed by a situation field, by plural or key.
    pub fn role_for(&self, field: &str) -> Option<&Role> {
        self.roles
            .values()
            .find(|r| r.plural == field)
            .or_else(|| self.roles.get(field))
    }
}

fn parse_role(entity: &str, key: Option<&str>, value: &Value) -> Result<Role, SchemaError> {
    let malformed = |message: &str| SchemaError::MalformedRecord {
        resource: Resource::Entities,
        id: entity.to_string(),
        message: message.to_string(),
    };
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("role must be an object"))?;
    let key = key
        .map(str::to_string)
        .or_else(|| string_field(obj, &["key"]))
        .ok_or_else(|| malformed("role without key"))?;
    Ok(Role {
        plural: string_field(obj, &["plural"]).unwrap_or_else(|| format!("{}s", key)),
        label: string_field(obj, &["label"]),
        max: obj.get("max").and_then(Value::as_u64).map(|m| m as u32),
        key,
    })
}

// ============================================================================
// Field helpers
// ============================================================================

fn record_object<'a>(
    resource: Resource,
    id: &str,
    record: &'a Value,
) -> Result<&'a Map<String, Value>, SchemaError> {
    record.as_object().ok_or_else(|| SchemaError::MalformedRecord {
        resource,
        id: id.to_string(),
        message: format!("expected an object, got {}", json_kind(record)),
    })
}

fn field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|n| obj.get(*n))
}

fn string_field(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    field(obj, names).and_then(Value::as_str).map(str::to_string)
}

fn declared_type(obj: &Map<String, Value>) -> Option<ValueType> {
    let possible = possible_values(field(obj, &["possibleValues", "possible_values"]));
    match field(obj, &["valueType", "value_type", "type"]).and_then(Value::as_str) {
        Some(name) => ValueType::from_api_name(name, possible),
        None if !possible.is_empty() => Some(ValueType::Enum {
            possible_values: possible,
        }),
        None => None,
    }
}

/// Declared type from override fields, falling back to `current`. An enum
/// declared without members keeps the current members.
fn overridden_type(fields: &Map<String, Value>, current: &ValueType) -> ValueType {
    match (declared_type(fields), current) {
        (
            Some(ValueType::Enum { possible_values }),
            ValueType::Enum {
                possible_values: current_values,
            },
        ) if possible_values.is_empty() => ValueType::Enum {
            possible_values: current_values.clone(),
        },
        (Some(declared), _) => declared,
        (None, _) => current.clone(),
    }
}

/// `possibleValues` comes as a list of keys, a list of `{key, value}`
/// objects, or a key → label map depending on the API version.
fn possible_values(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => o.get("key").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect(),
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

fn extra_fields(obj: &Map<String, Value>, known: &[&str]) -> BTreeMap<String, Value> {
    obj.iter()
        .filter(|(k, _)| !known.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parameter_from_api_record() {
        let p = Parameter::from_record(
            "tax.income_tax.rates.basic",
            &json!({
                "label": "Basic rate",
                "defaultValue": 0.2,
                "value": 0.2,
                "unit": "/1",
                "max": 1.0,
                "min": 0,
                "period": "year",
                "tags": ["income"]
            }),
        )
        .unwrap();
        assert_eq!(p.value_type, ValueType::Float);
        assert_eq!(p.default_value, ScalarValue::Float(0.2));
        assert_eq!(p.min, Some(0.0));
        assert_eq!(p.max, Some(1.0));
        assert_eq!(p.label.as_deref(), Some("Basic rate"));
        assert_eq!(p.extra.get("tags"), Some(&json!(["income"])));
    }

    #[test]
    fn parameter_integer_default_stays_float() {
        let p = Parameter::from_record("benefit.amount", &json!({"defaultValue": 0})).unwrap();
        assert_eq!(p.default_value, ScalarValue::Float(0.0));
        assert_eq!(p.value, ScalarValue::Float(0.0));
    }

    #[test]
    fn parameter_enum_from_possible_values() {
        let p = Parameter::from_record(
            "tax.scheme",
            &json!({"defaultValue": "flat", "possibleValues": [{"key": "flat"}, {"key": "banded"}]}),
        )
        .unwrap();
        assert_eq!(
            p.value_type,
            ValueType::Enum {
                possible_values: vec!["flat".to_string(), "banded".to_string()]
            }
        );
    }

    #[test]
    fn parameter_without_default_is_malformed() {
        let err = Parameter::from_record("x", &json!({"label": "X"})).unwrap_err();
        assert!(matches!(err, SchemaError::MalformedRecord { .. }));
        let err = Parameter::from_record("x", &json!(3)).unwrap_err();
        assert!(err.to_string().contains("expected an object"));
    }

    #[test]
    fn parameter_retype_follows_overridden_type_and_default() {
        let mut p = Parameter::from_record("benefit.count", &json!({"defaultValue": 2})).unwrap();
        let fields = json!({"valueType": "int", "defaultValue": 3});
        p.retype(fields.as_object().unwrap()).unwrap();
        assert_eq!(p.value_type, ValueType::Int);
        assert_eq!(p.default_value, ScalarValue::Int(3));
        assert_eq!(p.value, ScalarValue::Int(3));

        let mut p = Parameter::from_record("benefit.count", &json!({"defaultValue": 2.5})).unwrap();
        let err = p.retype(json!({"valueType": "int"}).as_object().unwrap()).unwrap_err();
        assert!(err.to_string().contains("default value"));
    }

    #[test]
    fn variable_retype_moves_entity() {
        let mut v = Variable::from_record(
            "region",
            &json!({"entity": "person", "possibleValues": ["LONDON", "WALES"], "defaultValue": "LONDON"}),
        )
        .unwrap();
        let fields = json!({"entity": "household", "valueType": "Enum", "defaultValue": "WALES"});
        v.retype(fields.as_object().unwrap()).unwrap();
        assert_eq!(v.entity, "household");
        assert_eq!(v.default_value, ScalarValue::Text("WALES".to_string()));
        assert_eq!(
            v.value_type,
            ValueType::Enum {
                possible_values: vec!["LONDON".to_string(), "WALES".to_string()]
            }
        );
    }

    #[test]
    fn variable_defaults_to_type_zero() {
        let v = Variable::from_record(
            "employment_income",
            &json!({"entity": "person", "valueType": "float", "definitionPeriod": "year"}),
        )
        .unwrap();
        assert_eq!(v.default_value, ScalarValue::Float(0.0));
        assert_eq!(v.definition_period.as_deref(), Some("year"));
        assert!(!v.hidden);

        assert!(Variable::from_record("orphan", &json!({"valueType": "float"})).is_err());
    }

    #[test]
    fn entity_roles_from_map_and_person_inference() {
        let household = Entity::from_record(
            "household",
            &json!({
                "plural": "households",
                "roles": {"member": {"plural": "members", "label": "Member"}}
            }),
        )
        .unwrap();
        assert!(!household.is_person);
        assert_eq!(household.role_for("members").map(|r| r.key.as_str()), Some("member"));
        assert_eq!(household.role_for("member").map(|r| r.key.as_str()), Some("member"));

        let person = Entity::from_record("person", &json!({"plural": "people"})).unwrap();
        assert!(person.is_person);
    }

    #[test]
    fn entity_roles_from_array() {
        let family = Entity::from_record(
            "family",
            &json!({"roles": [{"key": "adult", "max": 2}, {"key": "child"}]}),
        )
        .unwrap();
        assert_eq!(family.plural, "familys");
        assert_eq!(family.roles["adult"].max, Some(2));
        assert_eq!(family.roles["child"].plural, "childs");
    }
}
