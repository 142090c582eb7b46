//! Patch primitives operating on generic document trees.
//!
//! Three dialects are supported:
//!
//! - [RFC 7396] merge patches ([`apply_merge_patch`]): objects are merged recursively, `null`
//!   removes a key and every other value (including arrays) replaces the target.
//! - [RFC 6902] JSON patches ([`apply_json_patch`]): a sequence of operations addressed by JSON
//!   pointers.
//! - Strategic merge patches ([`apply_strategic_merge`]): like a merge patch, but lists are
//!   appended (or merged by a well-known key) and keys are removed with a `$patch: delete`
//!   directive instead of `null`.
//!
//! [RFC 7396]: https://www.rfc-editor.org/rfc/rfc7396
//! [RFC 6902]: https://www.rfc-editor.org/rfc/rfc6902
use json_patch::{Patch, PatchOperation};
use serde_json::Value;
use snafu::{ResultExt, Snafu};

/// The directive key used by strategic merge patches.
pub const PATCH_DIRECTIVE_KEY: &str = "$patch";
const DELETE_DIRECTIVE: &str = "delete";

/// Lists which are merged item by item (identified by the given key) instead of being appended.
const LIST_MERGE_KEYS: &[(&str, &str)] = &[
    ("interfaces", "interface"),
    ("vlans", "vlanId"),
    ("modules", "name"),
];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to deserialize JSON patch operations"))]
    DeserializeJsonPatch { source: serde_json::Error },

    #[snafu(display("failed to apply JSON patch"))]
    ApplyJsonPatch { source: json_patch::PatchError },
}

/// The dialect of a free-form patch, determined by its shape.
#[derive(Clone, Debug, PartialEq)]
pub enum PatchDialect {
    /// A sequence of RFC 6902 operations.
    JsonPatch(Vec<Value>),

    /// A mapping which is merged strategically into the target.
    StrategicMerge(Value),

    /// Neither a sequence nor a mapping, nothing we know how to apply.
    Opaque(Value),
}

impl PatchDialect {
    pub fn classify(value: Value) -> Self {
        match value {
            Value::Array(operations) => Self::JsonPatch(operations),
            Value::Object(_) => Self::StrategicMerge(value),
            other => Self::Opaque(other),
        }
    }
}

/// Applies an RFC 7396 merge patch to `base`.
pub fn apply_merge_patch(base: &mut Value, patch: &Value) {
    json_patch::merge(base, patch);
}

/// Parses a list of generic values into typed JSON patch operations.
pub fn parse_json_patch(operations: Vec<Value>) -> Result<Vec<PatchOperation>, Error> {
    let patch: Patch =
        serde_json::from_value(Value::Array(operations)).context(DeserializeJsonPatchSnafu)?;
    Ok(patch.0)
}

/// Applies RFC 6902 operations to `base`.
///
/// The operations are applied atomically: if one of them fails, `base` is left untouched.
pub fn apply_json_patch(base: &mut Value, operations: &[PatchOperation]) -> Result<(), Error> {
    json_patch::patch(base, operations).context(ApplyJsonPatchSnafu)
}

/// Applies a strategic merge patch to `base`.
pub fn apply_strategic_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                if key == PATCH_DIRECTIVE_KEY {
                    continue;
                }

                if is_delete_directive(patch_value) {
                    base_map.remove(key);
                    continue;
                }

                match base_map.get_mut(key) {
                    Some(base_value) => merge_value(key, base_value, patch_value),
                    None => {
                        base_map.insert(key.clone(), without_directives(patch_value));
                    }
                }
            }
        }
        (base, patch) => *base = without_directives(patch),
    }
}

fn merge_value(key: &str, base: &mut Value, patch: &Value) {
    if base.is_object() && patch.is_object() {
        apply_strategic_merge(base, patch);
        return;
    }

    match (base, patch) {
        (Value::Array(base_items), Value::Array(patch_items)) => {
            merge_list(key, base_items, patch_items);
        }
        (base, patch) => *base = without_directives(patch),
    }
}

fn merge_list(key: &str, base_items: &mut Vec<Value>, patch_items: &[Value]) {
    let merge_key = LIST_MERGE_KEYS
        .iter()
        .find_map(|(list, merge_key)| (*list == key).then_some(*merge_key));

    for patch_item in patch_items {
        let id = merge_key.and_then(|merge_key| patch_item.get(merge_key).map(|id| (merge_key, id)));

        let Some((merge_key, id)) = id else {
            base_items.push(without_directives(patch_item));
            continue;
        };

        let position = base_items
            .iter()
            .position(|base_item| base_item.get(merge_key) == Some(id));

        match position {
            Some(position) if is_delete_directive(patch_item) => {
                base_items.remove(position);
            }
            Some(position) => apply_strategic_merge(&mut base_items[position], patch_item),
            None if is_delete_directive(patch_item) => {}
            None => base_items.push(without_directives(patch_item)),
        }
    }
}

fn is_delete_directive(value: &Value) -> bool {
    value
        .get(PATCH_DIRECTIVE_KEY)
        .and_then(Value::as_str)
        .is_some_and(|directive| directive == DELETE_DIRECTIVE)
}

fn without_directives(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, value)| *key != PATCH_DIRECTIVE_KEY && !is_delete_directive(value))
                .map(|(key, value)| (key.clone(), without_directives(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(without_directives).collect()),
        other => other.clone(),
    }
}
