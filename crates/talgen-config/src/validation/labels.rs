//! Node label, annotation and taint syntax.
//!
//! Keys have the format `(<PREFIX>/)<NAME>`, see the [Kubernetes documentation][k8s-labels].
//!
//! [k8s-labels]: https://kubernetes.io/docs/concepts/overview/working-with-objects/labels/
use std::sync::LazyLock;

use regex::Regex;
use snafu::{Snafu, ensure};

const KEY_PREFIX_MAX_LENGTH: usize = 253;
const KEY_NAME_MAX_LENGTH: usize = 63;
const LABEL_VALUE_MAX_LENGTH: usize = 63;

/// The effects a taint may have on pods which do not tolerate it.
pub const TAINT_EFFECTS: &[&str] = &["NoSchedule", "PreferNoSchedule", "NoExecute"];

static KEY_PREFIX_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("failed to compile key prefix regex")
});

// Label values share the format of key names, but may be empty
static KEY_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9]([-a-zA-Z0-9_.]*[a-zA-Z0-9])?$")
        .expect("failed to compile key name regex")
});

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("key cannot be empty"))]
    EmptyKey,

    #[snafu(display("key prefixes cannot be nested, only use a single slash"))]
    NestedPrefix,

    #[snafu(display("key prefix {prefix:?} must be a lower case DNS subdomain of at most {KEY_PREFIX_MAX_LENGTH} characters"))]
    InvalidPrefix { prefix: String },

    #[snafu(display("key name {name:?} must be at most {KEY_NAME_MAX_LENGTH} alphanumeric characters, '-', '_' or '.', starting and ending with an alphanumeric character"))]
    InvalidName { name: String },

    #[snafu(display("value {value:?} must be at most {LABEL_VALUE_MAX_LENGTH} alphanumeric characters, '-', '_' or '.', starting and ending with an alphanumeric character"))]
    InvalidValue { value: String },

    #[snafu(display("taint {value:?} must have the format [VALUE]:EFFECT with EFFECT one of {TAINT_EFFECTS:?}"))]
    InvalidTaint { value: String },
}

/// Checks a label, annotation or taint key.
pub fn check_key(key: &str) -> Result<(), Error> {
    let key = key.trim();
    ensure!(!key.is_empty(), EmptyKeySnafu);

    let (prefix, name) = match key.split('/').collect::<Vec<_>>()[..] {
        [name] => (None, name),
        [prefix, name] => (Some(prefix), name),
        _ => return NestedPrefixSnafu.fail(),
    };

    if let Some(prefix) = prefix {
        ensure!(
            !prefix.is_empty()
                && prefix.len() <= KEY_PREFIX_MAX_LENGTH
                && KEY_PREFIX_REGEX.is_match(prefix),
            InvalidPrefixSnafu { prefix }
        );
    }

    ensure!(
        name.len() <= KEY_NAME_MAX_LENGTH && KEY_NAME_REGEX.is_match(name),
        InvalidNameSnafu { name }
    );
    Ok(())
}

/// Checks a label value. Only applies to values without templates, which are checked once
/// they are rendered.
pub fn check_label_value(value: &str) -> Result<(), Error> {
    ensure!(
        value.is_empty() || (value.len() <= LABEL_VALUE_MAX_LENGTH && KEY_NAME_REGEX.is_match(value)),
        InvalidValueSnafu { value }
    );
    Ok(())
}

/// Checks a taint given as `value:Effect` (or `:Effect` without value).
pub fn check_taint(value: &str) -> Result<(), Error> {
    let Some((taint_value, effect)) = value.rsplit_once(':') else {
        return InvalidTaintSnafu { value }.fail();
    };

    ensure!(TAINT_EFFECTS.contains(&effect), InvalidTaintSnafu { value });
    check_label_value(taint_value)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("zone")]
    #[case("topology.kubernetes.io/zone")]
    #[case("node-role.kubernetes.io/control-plane")]
    #[case("example.com/My_Key.v1")]
    fn valid_keys(#[case] key: &str) {
        check_key(key).unwrap();
    }

    #[rstest]
    #[case("", Error::EmptyKey)]
    #[case("a/b/c", Error::NestedPrefix)]
    #[case("/zone", Error::InvalidPrefix { prefix: String::new() })]
    #[case("Example.com/zone", Error::InvalidPrefix { prefix: "Example.com".to_owned() })]
    #[case("example.com/-zone", Error::InvalidName { name: "-zone".to_owned() })]
    #[case("example.com/", Error::InvalidName { name: String::new() })]
    fn invalid_keys(#[case] key: &str, #[case] expected: Error) {
        assert_eq!(check_key(key), Err(expected));
    }

    #[rstest]
    #[case("", true)]
    #[case("rack-1", true)]
    #[case("has space", false)]
    #[case(&"a".repeat(64), false)]
    fn label_values(#[case] value: &str, #[case] valid: bool) {
        assert_eq!(check_label_value(value).is_ok(), valid);
    }

    #[rstest]
    #[case("infra:NoSchedule", true)]
    #[case(":NoExecute", true)]
    #[case("infra", false)]
    #[case("infra:Sometimes", false)]
    fn taints(#[case] value: &str, #[case] valid: bool) {
        assert_eq!(check_taint(value).is_ok(), valid);
    }
}
