//! The structural check every JSON patch operation has to pass before it is applied.
use serde_json::Value;
use snafu::{OptionExt, Snafu, ensure};
use strum::{EnumString, IntoStaticStr};

use crate::config::ConfigPatch;

/// The operations defined by RFC 6902.
#[derive(Clone, Copy, Debug, EnumString, IntoStaticStr, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Add,
    Remove,
    Replace,
    Move,
    Copy,
    Test,
}

#[derive(Debug, PartialEq, Snafu)]
pub enum ShapeError {
    #[snafu(display("operation is not a mapping"))]
    NotAMapping,

    #[snafu(display("operation is malformed: {message}"))]
    Malformed { message: String },

    #[snafu(display("operation has no \"op\""))]
    MissingOp,

    #[snafu(display("unknown operation {op:?}, expected one of add, remove, replace, move, copy, test"))]
    UnknownOp { op: String },

    #[snafu(display("{op:?} operation has no \"path\""))]
    MissingPath { op: &'static str },

    #[snafu(display("\"path\" {path:?} is not a JSON pointer, it must be empty or start with '/'"))]
    InvalidPointer { path: String },

    #[snafu(display("\"add\" operation has no \"value\""))]
    MissingValue,

    #[snafu(display("{op:?} operation has no \"from\""))]
    MissingFrom { op: &'static str },
}

/// Checks a typed operation.
///
/// `path` is required, `op` must be known, `add` requires a `value` and `move`/`copy` require
/// a `from`. Other fields are accepted even where RFC 6902 ignores them.
pub fn check_operation(patch: &ConfigPatch) -> Result<Operation, ShapeError> {
    let op = patch.op.as_deref().context(MissingOpSnafu)?;
    let operation: Operation = op.parse().ok().context(UnknownOpSnafu { op })?;
    let name: &'static str = operation.into();

    let path = patch.path.as_deref().context(MissingPathSnafu { op: name })?;
    check_pointer(path)?;

    match operation {
        Operation::Add => ensure!(patch.value.is_some(), MissingValueSnafu),
        Operation::Move | Operation::Copy => {
            let from = patch.from.as_deref().context(MissingFromSnafu { op: name })?;
            check_pointer(from)?;
        }
        Operation::Remove | Operation::Replace | Operation::Test => {}
    }

    Ok(operation)
}

/// Checks an untyped operation, for example one item of a patch file.
pub fn check_value(value: &Value) -> Result<Operation, ShapeError> {
    ensure!(value.is_object(), NotAMappingSnafu);
    let patch: ConfigPatch = serde_json::from_value(value.clone()).map_err(|error| {
        MalformedSnafu {
            message: error.to_string(),
        }
        .build()
    })?;
    check_operation(&patch)
}

fn check_pointer(pointer: &str) -> Result<(), ShapeError> {
    ensure!(
        pointer.is_empty() || pointer.starts_with('/'),
        InvalidPointerSnafu { path: pointer }
    );
    Ok(())
}

/// Checks every operation of `operations`, returning the failures with their index.
pub fn check_all(operations: &[Value]) -> Vec<(usize, ShapeError)> {
    operations
        .iter()
        .enumerate()
        .filter_map(|(index, operation)| check_value(operation).err().map(|error| (index, error)))
        .collect()
}
