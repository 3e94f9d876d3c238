//! Property tests for schema merging and store completeness.

use policyengine_schema::*;
use proptest::prelude::*;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

fn param_id() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z]{1,6}(\\.[a-z_]{1,8}){0,3}").unwrap()
}

fn fetched(ids: &BTreeSet<String>) -> BTreeMap<String, Parameter> {
    ids.iter()
        .map(|id| {
            (
                id.clone(),
                Parameter::from_record(id, &json!({"defaultValue": 1.5, "label": "fetched"}))
                    .unwrap(),
            )
        })
        .collect()
}

fn overrides(ids: &BTreeSet<String>) -> BTreeMap<String, ParameterOverride> {
    ids.iter()
        .map(|id| {
            (
                id.clone(),
                ParameterOverride {
                    label: Some(format!("override {}", id)),
                    ..Default::default()
                },
            )
        })
        .collect()
}

proptest! {
    #[test]
    fn merge_never_invents_keys(
        fetched_ids in proptest::collection::btree_set(param_id(), 0..12),
        override_ids in proptest::collection::btree_set(param_id(), 0..12),
    ) {
        let (params, _) = merge(
            fetched(&fetched_ids),
            &overrides(&override_ids),
            BTreeMap::new(),
            &BTreeMap::new(),
        )
        .unwrap();
        let keys: BTreeSet<String> = params.keys().cloned().collect();
        prop_assert_eq!(keys, fetched_ids.clone());

        for (id, p) in &params {
            if override_ids.contains(id) {
                prop_assert_eq!(p.label.clone(), Some(format!("override {}", id)));
            } else {
                prop_assert_eq!(p.label.as_deref(), Some("fetched"));
            }
            // Fields the override leaves unset survive.
            prop_assert_eq!(&p.default_value, &ScalarValue::Float(1.5));
        }
    }

    #[test]
    fn arrival_order_does_not_change_merged_schema(order in Just(vec![0usize, 1, 2]).prop_shuffle()) {
        let fragments = vec![
            SchemaFragment::parse(
                Resource::Parameters,
                json!({"tax.rate": {"defaultValue": 0.2}, "benefit.amount": {"defaultValue": 100}}),
            ).unwrap(),
            SchemaFragment::parse(
                Resource::Variables,
                json!({"age": {"entity": "person", "valueType": "int", "defaultValue": 18}}),
            ).unwrap(),
            SchemaFragment::parse(
                Resource::Entities,
                json!({"person": {"plural": "people"}, "household": {"roles": {"member": {"plural": "members"}}}}),
            ).unwrap(),
        ];

        let mut reference = SchemaStore::new();
        for f in &fragments {
            reference.record_fetch(f.clone());
        }
        let profile = CountryProfile::new("uk");
        let expected = merge_schema(&reference, &profile).unwrap();

        let mut store = SchemaStore::new();
        for (step, idx) in order.iter().enumerate() {
            prop_assert!(!store.is_complete());
            prop_assert!(merge_schema(&store, &profile).is_err());
            let complete = store.record_fetch(fragments[*idx].clone());
            prop_assert_eq!(complete, step == 2);
        }
        prop_assert_eq!(merge_schema(&store, &profile).unwrap(), expected);
    }
}
