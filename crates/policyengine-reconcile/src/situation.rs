//! Household situation normalization against the entity/variable schema.
//!
//! Input follows the OpenFisca situation shape:
//!
//! ```json
//! {
//!   "people":     {"you": {"age": 30, "employment_income": {"2021": 30000}}},
//!   "households": {"household": {"members": ["you"], "region": "LONDON"}}
//! }
//! ```
//!
//! Groups are keyed by entity plural, instances by a free-form name, and
//! each instance mixes role member lists with variable values. Variables
//! the user did not describe are left out; every leaf that is present
//! carries the schema default next to its value.

use crate::issue::{IssueKind, ValidationIssue};
use policyengine_schema::{Entity, ScalarValue, Schema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SituationValue {
    pub value: ScalarValue,
    pub default_value: ScalarValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SituationInstance {
    /// Role plural → member names.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub roles: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub variables: BTreeMap<String, SituationValue>,
}

/// Entity plural → instance name → instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SituationTree(BTreeMap<String, BTreeMap<String, SituationInstance>>);

impl SituationTree {
    pub fn group(&self, plural: &str) -> Option<&BTreeMap<String, SituationInstance>> {
        self.0.get(plural)
    }

    pub fn instance(&self, plural: &str, name: &str) -> Option<&SituationInstance> {
        self.0.get(plural)?.get(name)
    }

    pub fn value(&self, plural: &str, name: &str, variable: &str) -> Option<&ScalarValue> {
        self.instance(plural, name)?
            .variables
            .get(variable)
            .map(|v| &v.value)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, SituationInstance>)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Back to the raw situation shape, e.g. for the next edit.
    pub fn to_raw(&self) -> Value {
        let mut groups = Map::new();
        for (plural, instances) in &self.0 {
            let mut out_instances = Map::new();
            for (name, instance) in instances {
                let mut fields = Map::new();
                for (role, members) in &instance.roles {
                    fields.insert(role.clone(), Value::from(members.clone()));
                }
                for (variable, v) in &instance.variables {
                    fields.insert(variable.clone(), v.value.to_json());
                }
                out_instances.insert(name.clone(), Value::Object(fields));
            }
            groups.insert(plural.clone(), Value::Object(out_instances));
        }
        Value::Object(groups)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SituationValidation {
    pub situation: SituationTree,
    pub issues: Vec<ValidationIssue>,
}

/// Normalize a raw situation. Never fails; problems become issues.
pub fn validate_situation(raw: &Value, schema: &Schema) -> SituationValidation {
    let mut issues = Vec::new();
    let mut tree: BTreeMap<String, BTreeMap<String, SituationInstance>> = BTreeMap::new();

    let groups = match raw {
        Value::Null => {
            return SituationValidation {
                situation: SituationTree::default(),
                issues,
            }
        }
        Value::Object(groups) => groups,
        _ => {
            issues.push(ValidationIssue::new(
                IssueKind::MalformedInput,
                "",
                "situation must be an object of entity groups",
            ));
            return SituationValidation {
                situation: SituationTree::default(),
                issues,
            };
        }
    };

    let persons = person_names(groups, schema);

    // Plural keys first, so they win when a singular key repeats an instance.
    let is_plural = |group: &String| {
        schema
            .entity_for_group(group)
            .is_some_and(|entity| entity.plural == *group)
    };
    let ordered = groups
        .iter()
        .filter(|(group, _)| is_plural(*group))
        .chain(groups.iter().filter(|(group, _)| !is_plural(*group)));

    for (group, instances) in ordered {
        let Some(entity) = schema.entity_for_group(group) else {
            issues.push(ValidationIssue::new(
                IssueKind::UnknownEntity,
                group.as_str(),
                format!("no entity with plural or key `{}`", group),
            ));
            continue;
        };
        let Some(instances) = instances.as_object() else {
            issues.push(ValidationIssue::new(
                IssueKind::MalformedInput,
                group.as_str(),
                "group must map instance names to objects",
            ));
            continue;
        };
        let out_group = tree.entry(entity.plural.clone()).or_default();
        for (name, fields) in instances {
            let path = format!("{}.{}", group, name);
            if out_group.contains_key(name) {
                issues.push(ValidationIssue::new(
                    IssueKind::DuplicateIdentifier,
                    path,
                    format!("`{}` is already described under `{}`", name, entity.plural),
                ));
                continue;
            }
            let Some(fields) = fields.as_object() else {
                issues.push(ValidationIssue::new(
                    IssueKind::MalformedInput,
                    path,
                    "instance must be an object",
                ));
                continue;
            };
            let instance = validate_instance(&path, fields, entity, schema, &persons, &mut issues);
            out_group.insert(name.clone(), instance);
        }
    }

    tracing::debug!(
        groups = tree.len(),
        issues = issues.len(),
        "validated situation"
    );

    SituationValidation {
        situation: SituationTree(tree),
        issues,
    }
}

fn person_names<'a>(groups: &'a Map<String, Value>, schema: &Schema) -> BTreeSet<&'a str> {
    groups
        .iter()
        .filter(|(group, _)| {
            schema
                .entity_for_group(group)
                .map_or(false, |e| e.is_person)
        })
        .filter_map(|(_, instances)| instances.as_object())
        .flat_map(|instances| instances.keys().map(String::as_str))
        .collect()
}

fn validate_instance(
    path: &str,
    fields: &Map<String, Value>,
    entity: &Entity,
    schema: &Schema,
    persons: &BTreeSet<&str>,
    issues: &mut Vec<ValidationIssue>,
) -> SituationInstance {
    let mut instance = SituationInstance::default();
    for (field, value) in fields {
        let field_path = format!("{}.{}", path, field);

        if let Some(role) = entity.role_for(field) {
            let members = validate_members(&field_path, value, persons, issues);
            instance.roles.insert(role.plural.clone(), members);
            continue;
        }

        let Some(variable) = schema.variables.get(field) else {
            issues.push(ValidationIssue::new(
                IssueKind::UnknownIdentifier,
                field_path,
                format!("no variable or role `{}` on `{}`", field, entity.key),
            ));
            continue;
        };
        if variable.entity != entity.key {
            issues.push(ValidationIssue::new(
                IssueKind::EntityMismatch,
                field_path,
                format!(
                    "`{}` belongs to `{}`, not `{}`",
                    field, variable.entity, entity.key
                ),
            ));
            continue;
        }

        let value = match latest_period_value(value) {
            None => variable.default_value.clone(),
            Some(v) => match variable.value_type.coerce(v) {
                Ok(v) => v,
                Err(reason) => {
                    issues.push(ValidationIssue::new(
                        IssueKind::TypeCoercionFailure,
                        field_path,
                        format!("{}; using default {}", reason, variable.default_value),
                    ));
                    variable.default_value.clone()
                }
            },
        };
        instance.variables.insert(
            field.clone(),
            SituationValue {
                value,
                default_value: variable.default_value.clone(),
            },
        );
    }
    instance
}

fn validate_members(
    path: &str,
    value: &Value,
    persons: &BTreeSet<&str>,
    issues: &mut Vec<ValidationIssue>,
) -> Vec<String> {
    let Some(items) = value.as_array() else {
        issues.push(ValidationIssue::new(
            IssueKind::MalformedInput,
            path,
            "role members must be a list of names",
        ));
        return Vec::new();
    };
    let mut members: Vec<String> = Vec::new();
    for item in items {
        match item.as_str() {
            Some(name) if persons.contains(name) => {
                if !members.iter().any(|m| m == name) {
                    members.push(name.to_string());
                }
            }
            Some(name) => issues.push(ValidationIssue::new(
                IssueKind::UnknownMember,
                path,
                format!("`{}` is not a person in this situation", name),
            )),
            None => issues.push(ValidationIssue::new(
                IssueKind::MalformedInput,
                path,
                "role members must be names",
            )),
        }
    }
    members
}

/// Unwrap OpenFisca period maps (`{"2021": 30000}`) to the latest period's
/// value. `None` means "not supplied": null, or an empty period map.
fn latest_period_value(value: &Value) -> Option<&Value> {
    match value {
        Value::Null => None,
        Value::Object(periods) if periods.keys().all(|k| is_period(k)) => periods
            .iter()
            .max_by(|a, b| a.0.cmp(b.0))
            .map(|(_, v)| v)
            .filter(|v| !v.is_null()),
        other => Some(other),
    }
}

fn is_period(key: &str) -> bool {
    key == "ETERNITY" || key.starts_with(|c: char| c.is_ascii_digit()) || key.starts_with("year:")
}
