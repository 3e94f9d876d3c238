//! Local metadata overrides merged onto fetched records.
//!
//! Overrides carry presentation fields the API does not publish (labels,
//! descriptions, sensible slider bounds). A field set in the override
//! replaces the fetched one; fields the override leaves unset keep the
//! fetched value. Overriding a default, type or entity re-derives the
//! record's typed values. Override keys that name nothing fetched are
//! ignored: an override table can never invent a parameter or variable.

use crate::record::{PARAMETER_TYPED_FIELDS, VARIABLE_TYPED_FIELDS};
use crate::{CountryProfile, Parameter, Schema, SchemaError, SchemaStore, Variable};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Partial parameter metadata supplied locally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Partial variable metadata supplied locally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ParameterOverride {
    /// Fails when an overridden default or type cannot be reconciled with the
    /// fetched record.
    pub fn apply(&self, parameter: &mut Parameter) -> Result<(), SchemaError> {
        assign(&mut parameter.label, &self.label);
        assign(&mut parameter.description, &self.description);
        assign(&mut parameter.unit, &self.unit);
        assign(&mut parameter.period, &self.period);
        assign(&mut parameter.min, &self.min);
        assign(&mut parameter.max, &self.max);
        let (typed, rest) = split_typed(&self.extra, PARAMETER_TYPED_FIELDS);
        if !typed.is_empty() {
            parameter.retype(&typed)?;
        }
        parameter.extra.extend(rest);
        Ok(())
    }
}

impl VariableOverride {
    pub fn apply(&self, variable: &mut Variable) -> Result<(), SchemaError> {
        assign(&mut variable.label, &self.label);
        assign(&mut variable.description, &self.description);
        assign(&mut variable.unit, &self.unit);
        if let Some(hidden) = self.hidden {
            variable.hidden = hidden;
        }
        let (typed, rest) = split_typed(&self.extra, VARIABLE_TYPED_FIELDS);
        if !typed.is_empty() {
            variable.retype(&typed)?;
        }
        variable.extra.extend(rest);
        Ok(())
    }
}

fn split_typed(
    extra: &BTreeMap<String, Value>,
    typed_keys: &[&str],
) -> (Map<String, Value>, BTreeMap<String, Value>) {
    let mut typed = Map::new();
    let mut rest = BTreeMap::new();
    for (k, v) in extra {
        if typed_keys.contains(&k.as_str()) {
            typed.insert(k.clone(), v.clone());
        } else {
            rest.insert(k.clone(), v.clone());
        }
    }
    (typed, rest)
}

fn assign<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
    if let Some(v) = value {
        *target = Some(v.clone());
    }
}

fn apply_overrides<R, O>(
    kind: &str,
    mut fetched: BTreeMap<String, R>,
    overrides: &BTreeMap<String, O>,
    apply: impl Fn(&O, &mut R) -> Result<(), SchemaError>,
) -> Result<BTreeMap<String, R>, SchemaError> {
    for (id, o) in overrides {
        match fetched.get_mut(id) {
            Some(record) => apply(o, record)
                .map_err(|e| SchemaError::Profile(format!("{} override `{}`: {}", kind, id, e)))?,
            None => tracing::debug!(kind, id = %id, "override names no fetched record; ignored"),
        }
    }
    Ok(fetched)
}

/// Merge override tables into fetched parameters and variables.
pub fn merge(
    fetched_parameters: BTreeMap<String, Parameter>,
    override_parameters: &BTreeMap<String, ParameterOverride>,
    fetched_variables: BTreeMap<String, Variable>,
    override_variables: &BTreeMap<String, VariableOverride>,
) -> Result<(BTreeMap<String, Parameter>, BTreeMap<String, Variable>), SchemaError> {
    let parameters = apply_overrides(
        "parameter",
        fetched_parameters,
        override_parameters,
        ParameterOverride::apply,
    )?;
    let variables = apply_overrides(
        "variable",
        fetched_variables,
        override_variables,
        VariableOverride::apply,
    )?;
    Ok((parameters, variables))
}

/// Build the canonical schema from a complete store and a country profile.
pub fn merge_schema(store: &SchemaStore, profile: &CountryProfile) -> Result<Schema, SchemaError> {
    match (store.parameters(), store.variables(), store.entities()) {
        (Some(parameters), Some(variables), Some(entities)) => {
            let (parameters, variables) = merge(
                parameters.clone(),
                &profile.extra_parameter_metadata,
                variables.clone(),
                &profile.extra_variable_metadata,
            )?;
            Ok(Schema {
                parameters,
                variables,
                entities: entities.clone(),
            })
        }
        _ => Err(SchemaError::Incomplete {
            missing: store.missing(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Resource, ScalarValue, SchemaFragment, ValueType};
    use serde_json::json;

    fn fetched_parameters() -> BTreeMap<String, Parameter> {
        let mut out = BTreeMap::new();
        out.insert(
            "tax.rate".to_string(),
            Parameter::from_record(
                "tax.rate",
                &json!({"defaultValue": 0.2, "label": "Tax rate", "unit": "/1", "max": 1}),
            )
            .unwrap(),
        );
        out
    }

    #[test]
    fn override_wins_only_on_fields_it_sets() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "tax.rate".to_string(),
            ParameterOverride {
                label: Some("Income tax rate".to_string()),
                max: Some(0.6),
                ..Default::default()
            },
        );
        let (params, _) =
            merge(fetched_parameters(), &overrides, BTreeMap::new(), &BTreeMap::new()).unwrap();
        let p = &params["tax.rate"];
        assert_eq!(p.label.as_deref(), Some("Income tax rate"));
        assert_eq!(p.max, Some(0.6));
        assert_eq!(p.unit.as_deref(), Some("/1"));
    }

    #[test]
    fn override_only_keys_are_not_invented() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "benefit.invented".to_string(),
            ParameterOverride {
                label: Some("Invented".to_string()),
                ..Default::default()
            },
        );
        let mut variable_overrides = BTreeMap::new();
        variable_overrides.insert("ghost_income".to_string(), VariableOverride::default());

        let (params, vars) = merge(
            fetched_parameters(),
            &overrides,
            BTreeMap::new(),
            &variable_overrides,
        )
        .unwrap();
        assert_eq!(params.keys().collect::<Vec<_>>(), vec!["tax.rate"]);
        assert!(vars.is_empty());
    }

    #[test]
    fn override_extra_fields_are_shallow_assigned() {
        let overrides: BTreeMap<String, ParameterOverride> = serde_json::from_value(json!({
            "tax.rate": {"label": "Rate", "reformable": true, "summary": "Applied to all income"}
        }))
        .unwrap();
        let (params, _) =
            merge(fetched_parameters(), &overrides, BTreeMap::new(), &BTreeMap::new()).unwrap();
        let p = &params["tax.rate"];
        assert_eq!(p.extra.get("reformable"), Some(&json!(true)));
        assert_eq!(p.extra.get("summary"), Some(&json!("Applied to all income")));
        assert!(!p.extra.contains_key("label"));
    }

    #[test]
    fn overridden_type_and_default_are_rederived() {
        let mut fetched = BTreeMap::new();
        fetched.insert(
            "benefit.count".to_string(),
            Parameter::from_record("benefit.count", &json!({"defaultValue": 2})).unwrap(),
        );
        let overrides: BTreeMap<String, ParameterOverride> = serde_json::from_value(json!({
            "benefit.count": {"valueType": "int", "defaultValue": 3, "summary": "Children counted"}
        }))
        .unwrap();
        let (params, _) = merge(fetched, &overrides, BTreeMap::new(), &BTreeMap::new()).unwrap();
        let p = &params["benefit.count"];
        assert_eq!(p.value_type, ValueType::Int);
        assert_eq!(p.default_value, ScalarValue::Int(3));
        assert_eq!(p.value, ScalarValue::Int(3));
        assert_eq!(p.extra.keys().collect::<Vec<_>>(), vec!["summary"]);
    }

    #[test]
    fn irreconcilable_override_is_a_profile_error() {
        let mut fetched = BTreeMap::new();
        fetched.insert(
            "age".to_string(),
            Variable::from_record("age", &json!({"entity": "person", "defaultValue": 18})).unwrap(),
        );
        let overrides: BTreeMap<String, VariableOverride> = serde_json::from_value(json!({
            "age": {"entity": "household", "valueType": "bool"}
        }))
        .unwrap();
        let err = merge(BTreeMap::new(), &BTreeMap::new(), fetched.clone(), &overrides).unwrap_err();
        assert!(matches!(err, SchemaError::Profile(_)), "{}", err);

        let overrides: BTreeMap<String, VariableOverride> =
            serde_json::from_value(json!({"age": {"entity": "household"}})).unwrap();
        let (_, vars) = merge(BTreeMap::new(), &BTreeMap::new(), fetched, &overrides).unwrap();
        assert_eq!(vars["age"].entity, "household");
        assert!(vars["age"].extra.is_empty());
    }

    #[test]
    fn merge_schema_requires_complete_store() {
        let mut store = SchemaStore::new();
        store.record_fetch(
            SchemaFragment::parse(Resource::Parameters, json!({"tax.rate": {"defaultValue": 0.2}}))
                .unwrap(),
        );
        let err = merge_schema(&store, &CountryProfile::default()).unwrap_err();
        match err {
            SchemaError::Incomplete { missing } => {
                assert_eq!(missing, vec![Resource::Variables, Resource::Entities])
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
