use std::path::Path;

use serde_yaml::Value;

/// Keys whose values may hold `@path` file references.
///
/// Only these are rewritten: any other string starting with `@` is left alone.
pub const FILE_REFERENCE_KEYS: &[&str] = &["patches", "extraManifests", "content"];

const REFERENCE_PREFIX: &str = "@";
const LITERAL_REFERENCE_PREFIX: &str = "@!";

/// Rewrites relative `@path` and `@!path` references below [`FILE_REFERENCE_KEYS`] into
/// absolute paths rooted at `base_dir`.
///
/// `patches` and `extraManifests` are expected to be sequences of strings, `content` a string.
/// Absolute references are kept as they are.
pub fn resolve_relative_paths(tree: &mut Value, base_dir: &Path) {
    match tree {
        Value::Mapping(mapping) => {
            for (key, value) in mapping.iter_mut() {
                let is_reference_key = key
                    .as_str()
                    .is_some_and(|key| FILE_REFERENCE_KEYS.contains(&key));

                match value {
                    Value::Sequence(items) if is_reference_key => {
                        for item in items.iter_mut() {
                            resolve_reference(item, base_dir);
                        }
                    }
                    Value::String(_) if is_reference_key => resolve_reference(value, base_dir),
                    _ => resolve_relative_paths(value, base_dir),
                }
            }
        }
        Value::Sequence(items) => {
            for item in items {
                resolve_relative_paths(item, base_dir);
            }
        }
        Value::Tagged(tagged) => resolve_relative_paths(&mut tagged.value, base_dir),
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
    }
}

fn resolve_reference(value: &mut Value, base_dir: &Path) {
    match value {
        Value::String(reference) => resolve_reference_string(reference, base_dir),
        // e.g. a machine file, whose own `content` is handled by the recursion
        other => resolve_relative_paths(other, base_dir),
    }
}

fn resolve_reference_string(reference: &mut String, base_dir: &Path) {
    let (prefix, path) = match reference.strip_prefix(LITERAL_REFERENCE_PREFIX) {
        Some(path) => (LITERAL_REFERENCE_PREFIX, path),
        None => match reference.strip_prefix(REFERENCE_PREFIX) {
            Some(path) => (REFERENCE_PREFIX, path),
            None => return,
        },
    };

    if Path::new(path).is_absolute() {
        return;
    }

    let relative = path.strip_prefix("./").unwrap_or(path);
    let resolved = format!("{prefix}{}", base_dir.join(relative).display());
    tracing::trace!(%reference, %resolved, "resolved relative file reference");
    *reference = resolved;
}
