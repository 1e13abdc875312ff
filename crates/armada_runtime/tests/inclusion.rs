//! Property tests for structural inclusion.
//!
//! These tests verify:
//! - Every value includes itself
//! - Dropping keys from the reference preserves inclusion
//! - Adding keys to the output preserves inclusion
//! - A reference with a key the output lacks is never included

use proptest::prelude::*;
use serde_json::{Map, Value, json};

use armada_runtime::validation::dict_included;

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        "[a-z]{0,8}".prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
    ]
}

fn document() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

fn object() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-z]{1,4}", document(), 1..6)
        .prop_map(|map| map.into_iter().collect())
}

proptest! {
    #[test]
    fn a_value_includes_itself(value in document()) {
        prop_assert!(dict_included(&value, &value));
    }

    #[test]
    fn sub_objects_are_included(output in object(), keep in prop::collection::vec(any::<bool>(), 6)) {
        let reference: Map<String, Value> = output
            .iter()
            .zip(keep.iter().cycle())
            .filter(|(_, keep)| **keep)
            .map(|((key, value), _)| (key.clone(), value.clone()))
            .collect();
        prop_assert!(dict_included(&Value::Object(output), &Value::Object(reference)));
    }

    #[test]
    fn extra_output_keys_are_tolerated(reference in object(), extra in document()) {
        let mut output = reference.clone();
        output.insert("zz_extra".into(), extra);
        prop_assert!(dict_included(&Value::Object(output), &Value::Object(reference)));
    }

    #[test]
    fn missing_keys_are_never_included(output in object(), value in document()) {
        let mut reference = output.clone();
        reference.insert("zz_missing".into(), value);
        prop_assert!(!dict_included(&Value::Object(output), &Value::Object(reference)));
    }
}

#[test]
fn list_items_are_consumed_once() {
    let output = json!({"vlans": [10, 20]});
    assert!(dict_included(&output, &json!({"vlans": [20]})));
    assert!(!dict_included(&output, &json!({"vlans": [10, 10]})));
}
