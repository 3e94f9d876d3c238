//! Policy normalization: raw `id → value` maps into a full [`PolicyTree`].
//!
//! Every call yields one entry per schema parameter. Entries the user did
//! not touch sit at their default; supplied values are renamed, checked
//! against the schema, coerced to the declared type and clamped to bounds.
//! Anything that cannot be honoured is dropped or defaulted and reported as
//! a [`ValidationIssue`].

use crate::issue::{IssueKind, ValidationIssue};
use policyengine_schema::{Parameter, ScalarValue, Schema, ValueType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Unvalidated policy: identifier → supplied value, as decoded from a URL
/// or received from an editor.
pub type RawPolicy = BTreeMap<String, Value>;

/// Parameter metadata carried alongside each policy entry for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterMetadata {
    pub value_type: ValueType,
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
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl From<&Parameter> for ParameterMetadata {
    fn from(p: &Parameter) -> Self {
        Self {
            value_type: p.value_type.clone(),
            label: p.label.clone(),
            description: p.description.clone(),
            unit: p.unit.clone(),
            period: p.period.clone(),
            min: p.min,
            max: p.max,
            extra: p.extra.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEntry {
    pub value: ScalarValue,
    pub default_value: ScalarValue,
    pub metadata: ParameterMetadata,
}

impl PolicyEntry {
    /// An entry at its default is logically unset and never encoded.
    pub fn is_unset(&self) -> bool {
        self.value == self.default_value
    }
}

/// Normalized policy: exactly one entry per applicable schema parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyTree(BTreeMap<String, PolicyEntry>);

impl PolicyTree {
    pub fn get(&self, id: &str) -> Option<&PolicyEntry> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PolicyEntry)> {
        self.0.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Entries whose value differs from the default, in identifier order.
    pub fn deltas(&self) -> impl Iterator<Item = (&String, &PolicyEntry)> {
        self.0.iter().filter(|(_, e)| !e.is_unset())
    }

    /// The same tree with every value reset to its default.
    pub fn baseline(&self) -> PolicyTree {
        PolicyTree(
            self.0
                .iter()
                .map(|(id, e)| {
                    let mut e = e.clone();
                    e.value = e.default_value.clone();
                    (id.clone(), e)
                })
                .collect(),
        )
    }

    /// Deltas as a raw policy, the shape editors and validators exchange.
    pub fn to_raw(&self) -> RawPolicy {
        self.deltas()
            .map(|(id, e)| (id.clone(), e.value.to_json()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyValidation {
    pub policy: PolicyTree,
    pub issues: Vec<ValidationIssue>,
}

/// Follow the rename table from a supplied identifier to a current one.
///
/// Identifiers not in the table resolve to themselves. Empty identifiers
/// and rename cycles are unresolvable.
pub fn resolve_identifier(
    raw_id: &str,
    renames: &BTreeMap<String, String>,
) -> Result<String, String> {
    if raw_id.is_empty() {
        return Err("empty parameter path".to_string());
    }
    let mut current = raw_id;
    let mut seen = BTreeSet::new();
    while let Some(next) = renames.get(current) {
        if !seen.insert(current) {
            return Err(format!("rename chain from `{}` loops", raw_id));
        }
        current = next.as_str();
    }
    Ok(current.to_string())
}

/// Only consulted for ids the schema does not know, to tell a typo'd path
/// from garbage.
fn is_well_formed(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && !id.ends_with('.')
        && !id.contains("..")
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '[' | ']' | '-'))
}

/// Normalize a raw policy against the schema's parameters.
pub fn validate_policy(
    raw: &RawPolicy,
    schema: &Schema,
    renames: &BTreeMap<String, String>,
) -> PolicyValidation {
    let mut issues = Vec::new();

    // resolved id -> (id as supplied, value)
    let mut supplied: BTreeMap<String, (&str, &Value)> = BTreeMap::new();
    for (raw_id, value) in raw {
        let id = match resolve_identifier(raw_id, renames) {
            Ok(id) => id,
            Err(reason) => {
                issues.push(ValidationIssue::new(
                    IssueKind::UnresolvableIdentifier,
                    raw_id.as_str(),
                    reason,
                ));
                continue;
            }
        };
        if !schema.parameters.contains_key(&id) {
            let (kind, message) = if is_well_formed(&id) {
                (
                    IssueKind::UnknownIdentifier,
                    format!("no parameter `{}` in the schema", id),
                )
            } else {
                (
                    IssueKind::UnresolvableIdentifier,
                    format!("`{}` is not a well-formed parameter path", id),
                )
            };
            issues.push(ValidationIssue::new(kind, raw_id.as_str(), message));
            continue;
        }
        match supplied.get(&id) {
            None => {
                supplied.insert(id, (raw_id.as_str(), value));
            }
            // The current id always beats a legacy alias.
            Some(&(prev_raw, _)) if prev_raw != id && raw_id == &id => {
                issues.push(duplicate(prev_raw, &id));
                supplied.insert(id, (raw_id.as_str(), value));
            }
            Some(_) => issues.push(duplicate(raw_id, &id)),
        }
    }

    let mut entries = BTreeMap::new();
    for (id, parameter) in &schema.parameters {
        let value = match supplied.get(id) {
            Some((_, v)) if !v.is_null() => normalize_value(id, v, parameter, &mut issues),
            _ => parameter.default_value.clone(),
        };
        entries.insert(
            id.clone(),
            PolicyEntry {
                value,
                default_value: parameter.default_value.clone(),
                metadata: ParameterMetadata::from(parameter),
            },
        );
    }

    tracing::debug!(
        parameters = entries.len(),
        supplied = raw.len(),
        issues = issues.len(),
        "validated policy"
    );

    PolicyValidation {
        policy: PolicyTree(entries),
        issues,
    }
}

fn duplicate(raw_id: &str, id: &str) -> ValidationIssue {
    ValidationIssue::new(
        IssueKind::DuplicateIdentifier,
        raw_id,
        format!("`{}` was also supplied; this value is ignored", id),
    )
}

fn normalize_value(
    id: &str,
    value: &Value,
    parameter: &Parameter,
    issues: &mut Vec<ValidationIssue>,
) -> ScalarValue {
    let coerced = match parameter.value_type.coerce(value) {
        Ok(v) => v,
        Err(reason) => {
            issues.push(ValidationIssue::new(
                IssueKind::TypeCoercionFailure,
                id,
                format!("{}; using default {}", reason, parameter.default_value),
            ));
            return parameter.default_value.clone();
        }
    };
    match clamp(&coerced, parameter.min, parameter.max) {
        Some(clamped) => {
            issues.push(ValidationIssue::new(
                IssueKind::ValueClamped,
                id,
                format!("{} is out of bounds; clamped to {}", coerced, clamped),
            ));
            clamped
        }
        None => coerced,
    }
}

/// Clamp a numeric value into `[min, max]`; `None` when already in range.
fn clamp(value: &ScalarValue, min: Option<f64>, max: Option<f64>) -> Option<ScalarValue> {
    match value {
        ScalarValue::Float(f) => {
            let mut c = *f;
            if let Some(lo) = min {
                c = c.max(lo);
            }
            if let Some(hi) = max {
                c = c.min(hi);
            }
            (c != *f).then_some(ScalarValue::Float(c))
        }
        ScalarValue::Int(i) => {
            let mut c = *i;
            if let Some(lo) = min.filter(|lo| (*i as f64) < *lo) {
                c = lo.ceil() as i64;
            }
            if let Some(hi) = max.filter(|hi| (c as f64) > *hi) {
                c = hi.floor() as i64;
            }
            (c != *i).then_some(ScalarValue::Int(c))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::count_kind;
    use serde_json::json;

    fn schema() -> Schema {
        let mut schema = Schema::default();
        for (id, record) in [
            ("tax.rate.income", json!({"defaultValue": 0.2, "min": 0, "max": 1})),
            ("new.benefit.name", json!({"defaultValue": 100})),
            ("tax.allowance.count", json!({"defaultValue": 2, "valueType": "int", "max": 5.5})),
            ("benefit.abolish", json!({"defaultValue": false})),
        ] {
            schema
                .parameters
                .insert(id.to_string(), Parameter::from_record(id, &record).unwrap());
        }
        schema
    }

    fn renames() -> BTreeMap<String, String> {
        let mut r = BTreeMap::new();
        r.insert("old.benefit.name".to_string(), "new.benefit.name".to_string());
        r
    }

    fn raw(v: Value) -> RawPolicy {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn empty_raw_yields_all_defaults() {
        let out = validate_policy(&RawPolicy::new(), &schema(), &renames());
        assert!(out.issues.is_empty());
        assert_eq!(out.policy.len(), 4);
        assert!(out.policy.iter().all(|(_, e)| e.is_unset()));
        assert_eq!(out.policy.deltas().count(), 0);
    }

    #[test]
    fn supplied_value_overrides_default() {
        let out = validate_policy(&raw(json!({"tax.rate.income": 0.25})), &schema(), &renames());
        let e = out.policy.get("tax.rate.income").unwrap();
        assert_eq!(e.value, ScalarValue::Float(0.25));
        assert_eq!(e.default_value, ScalarValue::Float(0.2));
        assert!(out.issues.is_empty());
    }

    #[test]
    fn legacy_identifier_is_renamed() {
        let out = validate_policy(&raw(json!({"old.benefit.name": "150"})), &schema(), &renames());
        assert!(!out.policy.contains("old.benefit.name"));
        assert_eq!(
            out.policy.get("new.benefit.name").unwrap().value,
            ScalarValue::Float(150.0)
        );
        assert!(out.issues.is_empty());
    }

    #[test]
    fn current_identifier_beats_legacy_alias() {
        let out = validate_policy(
            &raw(json!({"old.benefit.name": 150, "new.benefit.name": 175})),
            &schema(),
            &renames(),
        );
        assert_eq!(
            out.policy.get("new.benefit.name").unwrap().value,
            ScalarValue::Float(175.0)
        );
        assert_eq!(out.issues.len(), 1);
        assert_eq!(out.issues[0].kind, IssueKind::DuplicateIdentifier);
        assert_eq!(out.issues[0].identifier, "old.benefit.name");
    }

    #[test]
    fn unknown_and_malformed_identifiers_are_dropped() {
        let out = validate_policy(
            &raw(json!({"tax.rate.capital": 0.3, "bad id!": 1, "": 2})),
            &schema(),
            &renames(),
        );
        assert_eq!(out.policy.len(), 4);
        assert!(!out.policy.contains("tax.rate.capital"));
        assert_eq!(count_kind(&out.issues, IssueKind::UnknownIdentifier), 1);
        assert_eq!(count_kind(&out.issues, IssueKind::UnresolvableIdentifier), 2);
    }

    #[test]
    fn schema_ids_outside_the_path_charset_are_accepted() {
        let mut schema = schema();
        for id in ["gov.hmrc.rate/basic", "gov.dwp.benefit cap.amount"] {
            schema.parameters.insert(
                id.to_string(),
                Parameter::from_record(id, &json!({"defaultValue": 0.2})).unwrap(),
            );
        }
        let mut renames = renames();
        renames.insert("gov.hmrc.old/basic".to_string(), "gov.hmrc.rate/basic".to_string());

        let out = validate_policy(
            &raw(json!({"gov.hmrc.old/basic": 0.3, "gov.dwp.benefit cap.amount": 0.4})),
            &schema,
            &renames,
        );
        assert!(out.issues.is_empty(), "{:?}", out.issues);
        assert_eq!(out.policy.get("gov.hmrc.rate/basic").unwrap().value, ScalarValue::Float(0.3));
        assert_eq!(
            out.policy.get("gov.dwp.benefit cap.amount").unwrap().value,
            ScalarValue::Float(0.4)
        );
    }

    #[test]
    fn rename_cycle_is_unresolvable() {
        let mut r = BTreeMap::new();
        r.insert("a.b".to_string(), "c.d".to_string());
        r.insert("c.d".to_string(), "a.b".to_string());
        assert!(resolve_identifier("a.b", &r).unwrap_err().contains("loops"));

        r.insert("e.f".to_string(), "g.h".to_string());
        r.insert("g.h".to_string(), "tax.rate.income".to_string());
        assert_eq!(resolve_identifier("e.f", &r).unwrap(), "tax.rate.income");
    }

    #[test]
    fn uncoercible_value_falls_back_to_default() {
        let out = validate_policy(
            &raw(json!({"tax.rate.income": "a lot", "tax.allowance.count": "2.5"})),
            &schema(),
            &renames(),
        );
        assert!(out.policy.iter().all(|(_, e)| e.is_unset()));
        assert_eq!(count_kind(&out.issues, IssueKind::TypeCoercionFailure), 2);
    }

    #[test]
    fn out_of_bounds_values_are_clamped() {
        let out = validate_policy(
            &raw(json!({"tax.rate.income": 1.5, "tax.allowance.count": 9})),
            &schema(),
            &renames(),
        );
        assert_eq!(out.policy.get("tax.rate.income").unwrap().value, ScalarValue::Float(1.0));
        assert_eq!(out.policy.get("tax.allowance.count").unwrap().value, ScalarValue::Int(5));
        assert_eq!(count_kind(&out.issues, IssueKind::ValueClamped), 2);
    }

    #[test]
    fn null_value_means_default_without_issue() {
        let out = validate_policy(&raw(json!({"benefit.abolish": null})), &schema(), &renames());
        assert!(out.issues.is_empty());
        assert!(out.policy.get("benefit.abolish").unwrap().is_unset());
    }

    #[test]
    fn baseline_and_to_raw() {
        let out = validate_policy(
            &raw(json!({"tax.rate.income": 0.3, "benefit.abolish": "true"})),
            &schema(),
            &renames(),
        );
        let raw_out = out.policy.to_raw();
        assert_eq!(raw_out.len(), 2);
        assert_eq!(raw_out["benefit.abolish"], json!(true));
        assert_eq!(raw_out["tax.rate.income"], json!(0.3));

        let baseline = out.policy.baseline();
        assert_eq!(baseline.len(), out.policy.len());
        assert_eq!(baseline.deltas().count(), 0);
    }

    #[test]
    fn metadata_travels_with_entries() {
        let mut schema = schema();
        schema.parameters.get_mut("tax.rate.income").unwrap().label =
            Some("Income tax rate".to_string());
        let out = validate_policy(&RawPolicy::new(), &schema, &renames());
        let entry = out.policy.get("tax.rate.income").unwrap();
        assert_eq!(entry.metadata.label.as_deref(), Some("Income tax rate"));
        assert_eq!(entry.metadata.value_type, ValueType::Float);
    }
}
