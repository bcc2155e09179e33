//! Deep-merge semantics for document patches.

use serde_json::{Map, Value};

/// Recursively merges `patch` into `target`, returning a new value.
///
/// Rules, applied top-down:
///
/// - a `null` patch leaves the target unchanged
/// - a non-object patch (scalar or array) replaces the target outright;
///   arrays are replaced whole, never merged element-wise
/// - for an object patch, each key is merged into the target: when both
///   sides hold objects the merge recurses, otherwise the patch value
///   overwrites
///
/// Neither input is mutated.
#[must_use]
pub fn deep_merge(target: &Value, patch: &Value) -> Value {
    match patch {
        Value::Null => target.clone(),
        Value::Object(fields) => {
            let mut merged = match target {
                Value::Object(existing) => existing.clone(),
                _ => Map::new(),
            };
            for (name, value) in fields {
                let entry = match (merged.get(name), value) {
                    (Some(current @ Value::Object(_)), Value::Object(_)) => {
                        deep_merge(current, value)
                    }
                    _ => value.clone(),
                };
                merged.insert(name.clone(), entry);
            }
            Value::Object(merged)
        }
        replacement => replacement.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_patch_keeps_target() {
        let target = json!({"a": 1});
        assert_eq!(deep_merge(&target, &Value::Null), target);
    }

    #[test]
    fn scalar_patch_replaces() {
        assert_eq!(deep_merge(&json!({"a": 1}), &json!(42)), json!(42));
    }

    #[test]
    fn arrays_replace_not_merge() {
        let target = json!({"tags": ["a", "b", "c"]});
        let patch = json!({"tags": ["z"]});
        assert_eq!(deep_merge(&target, &patch), json!({"tags": ["z"]}));
    }

    #[test]
    fn disjoint_fields_accumulate() {
        let target = json!({"a": 1});
        let patch = json!({"b": 2});
        assert_eq!(deep_merge(&target, &patch), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn nested_siblings_survive() {
        let target = json!({"user": {"profile": {"name": "John", "age": 30}}});
        let patch = json!({"user": {"profile": {"age": 31}, "preferences": {"lang": "en"}}});
        assert_eq!(
            deep_merge(&target, &patch),
            json!({
                "user": {
                    "profile": {"name": "John", "age": 31},
                    "preferences": {"lang": "en"}
                }
            })
        );
    }

    #[test]
    fn null_field_overwrites() {
        let target = json!({"a": {"b": 1}});
        let patch = json!({"a": null});
        assert_eq!(deep_merge(&target, &patch), json!({"a": null}));
    }

    #[test]
    fn object_patch_over_scalar_target() {
        let merged = deep_merge(&json!(7), &json!({"a": 1}));
        assert_eq!(merged, json!({"a": 1}));
    }

    #[test]
    fn object_field_replaces_scalar_field() {
        let target = json!({"a": 1});
        let patch = json!({"a": {"nested": true}});
        assert_eq!(deep_merge(&target, &patch), json!({"a": {"nested": true}}));
    }

    #[test]
    fn inputs_are_untouched() {
        let target = json!({"a": {"x": 1}});
        let patch = json!({"a": {"y": 2}});
        let before_target = target.clone();
        let before_patch = patch.clone();

        let _ = deep_merge(&target, &patch);

        assert_eq!(target, before_target);
        assert_eq!(patch, before_patch);
    }
}
