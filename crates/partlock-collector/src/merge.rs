//! Deep merge of dynamic YAML values.
//!
//! Rules, right side wins:
//! - mapping + mapping: merge keys recursively;
//! - sequence of scalars + sequence: append unique right-hand values;
//! - sequence of mappings + sequence: concatenate;
//! - null right-hand side: reset to the empty value of the left kind;
//! - anything else of the same kind: right replaces left;
//! - differing kinds: merge error.

use crate::{CollectorError, CollectorResult};
use serde_yaml::Value;

/// Merge `b` into `a` and return the combined value.
pub fn deep_merge(a: Value, b: Value) -> CollectorResult<Value> {
    if a.is_null() {
        return Ok(b);
    }
    if b.is_null() {
        return Ok(empty_of_kind(&a));
    }

    match (a, b) {
        (Value::Mapping(mut left), Value::Mapping(right)) => {
            for (key, value) in right {
                match left.remove(&key) {
                    Some(current) => {
                        left.insert(key, deep_merge(current, value)?);
                    }
                    None => {
                        left.insert(key, value);
                    }
                }
            }
            Ok(Value::Mapping(left))
        }
        (Value::Sequence(left), Value::Sequence(right)) => {
            Ok(Value::Sequence(merge_sequences(left, right)))
        }
        (left, right) if kind_name(&left) == kind_name(&right) => Ok(right),
        (left, right) => Err(CollectorError::MergeKind {
            left: kind_name(&left),
            right: kind_name(&right),
        }),
    }
}

fn merge_sequences(mut left: Vec<Value>, right: Vec<Value>) -> Vec<Value> {
    if left.is_empty() {
        return right;
    }
    // A sequence of mappings is a list of documents: order matters and
    // duplicates are meaningful, so concatenate.
    if left[0].is_mapping() {
        left.extend(right);
        return left;
    }
    for value in right {
        if !left.contains(&value) {
            left.push(value);
        }
    }
    left
}

fn empty_of_kind(value: &Value) -> Value {
    match value {
        Value::Mapping(_) => Value::Mapping(Default::default()),
        Value::Sequence(_) => Value::Sequence(Vec::new()),
        Value::String(_) => Value::String(String::new()),
        Value::Number(_) => Value::from(0),
        Value::Bool(_) => Value::from(false),
        Value::Null | Value::Tagged(_) => Value::Null,
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(doc: &str) -> Value {
        serde_yaml::from_str(doc).unwrap()
    }

    #[test]
    fn right_side_replaces_scalars() {
        let merged = deep_merge(yaml("a: 1"), yaml("a: 2")).unwrap();
        assert_eq!(merged, yaml("a: 2"));
    }

    #[test]
    fn mappings_merge_recursively() {
        let merged = deep_merge(
            yaml("kcrypt: {challenger: {challenger_server: old, mdns: true}}"),
            yaml("kcrypt: {challenger: {challenger_server: new}}"),
        )
        .unwrap();
        assert_eq!(
            merged,
            yaml("kcrypt: {challenger: {challenger_server: new, mdns: true}}")
        );
    }

    #[test]
    fn disjoint_maps_merge_associatively() {
        let left_first = deep_merge(deep_merge(yaml("{}"), yaml("a: 1")).unwrap(), yaml("b: 2"))
            .unwrap();
        let right_first = deep_merge(deep_merge(yaml("{}"), yaml("b: 2")).unwrap(), yaml("a: 1"))
            .unwrap();
        assert_eq!(left_first, yaml("{a: 1, b: 2}"));
        // Mapping equality ignores insertion order.
        assert_eq!(left_first, right_first);
    }

    #[test]
    fn scalar_sequences_append_unique() {
        let merged = deep_merge(yaml("[a, b]"), yaml("[b, c]")).unwrap();
        assert_eq!(merged, yaml("[a, b, c]"));
    }

    #[test]
    fn mapping_sequences_concatenate() {
        let merged = deep_merge(yaml("[{a: 1}]"), yaml("[{a: 1}, {b: 2}]")).unwrap();
        assert_eq!(merged, yaml("[{a: 1}, {a: 1}, {b: 2}]"));
    }

    #[test]
    fn kind_mismatch_is_an_error() {
        let err = deep_merge(yaml("a"), yaml("[a]")).unwrap_err();
        assert!(matches!(
            err,
            CollectorError::MergeKind {
                left: "string",
                right: "sequence"
            }
        ));
    }

    #[test]
    fn null_right_resets_to_empty_of_left_kind() {
        assert_eq!(deep_merge(yaml("[a, b]"), Value::Null).unwrap(), yaml("[]"));
        assert_eq!(deep_merge(yaml("{a: 1}"), Value::Null).unwrap(), yaml("{}"));
        assert_eq!(
            deep_merge(yaml("hello"), Value::Null).unwrap(),
            yaml("\"\"")
        );
    }

    #[test]
    fn null_left_takes_right() {
        assert_eq!(deep_merge(Value::Null, yaml("{a: 1}")).unwrap(), yaml("{a: 1}"));
    }
}
