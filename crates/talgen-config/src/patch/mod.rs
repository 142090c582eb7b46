//! Applies the patches of a node to its machine configuration.
//!
//! Patches come in three tiers, applied in this order:
//!
//! 1. merge patches from `inlinePatch` ([RFC 7396], `null` removes a key),
//! 2. JSON patches from `configPatches` ([RFC 6902]),
//! 3. references from `patches`, each resolved on its own. `@path` is read, decrypted and
//!    substituted like the cluster description, `@!path` is read literally and anything else
//!    is inline YAML. The resolved patch is a JSON patch if it is a sequence and a strategic
//!    merge patch if it is a mapping. Anything else is skipped with a warning.
//!
//! Within every tier the role defaults come first, so node patches are applied last and win.
//!
//! [RFC 7396]: https://www.rfc-editor.org/rfc/rfc7396
//! [RFC 6902]: https://www.rfc-editor.org/rfc/rfc6902
use std::path::Path;

use serde_json::Value;
use snafu::{ResultExt, Snafu, ensure};
use talgen_shared::patchinator::{self, PatchDialect};
use tracing::instrument;

use crate::{
    config::{ConfigPatch, loader, merge::MergedNodeConfig},
    secret::Decryptor,
    substitution::SubstitutionContext,
};

pub mod shape;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("inline merge patch #{index} is not a mapping"))]
    MergePatchNotAMapping { index: usize },

    #[snafu(display("JSON patch operation #{index} is malformed"))]
    MalformedOperation {
        source: shape::ShapeError,
        index: usize,
    },

    #[snafu(display("failed to serialize JSON patch operation #{index}"))]
    SerializeOperation {
        source: serde_json::Error,
        index: usize,
    },

    #[snafu(display("failed to convert JSON patch operation #{index}"))]
    ConvertOperation {
        source: patchinator::Error,
        index: usize,
    },

    #[snafu(display("failed to apply JSON patch operation #{index}"))]
    ApplyOperation {
        source: patchinator::Error,
        index: usize,
    },

    #[snafu(display("failed to read patch {reference:?}"))]
    ReadReference {
        source: std::io::Error,
        reference: String,
    },

    #[snafu(display("failed to load patch {reference:?}"))]
    LoadReference {
        source: loader::Error,
        reference: String,
    },

    #[snafu(display("patch {reference:?} is not valid YAML"))]
    ParseReference {
        source: serde_yaml::Error,
        reference: String,
    },

    #[snafu(display("operation #{index} of patch {reference:?} is malformed"))]
    MalformedReferenceOperation {
        source: shape::ShapeError,
        reference: String,
        index: usize,
    },

    #[snafu(display("failed to apply patch {reference:?}"))]
    ApplyReference {
        source: patchinator::Error,
        reference: String,
    },
}

/// A parsed entry of `patches`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reference<'a> {
    /// `@path`: read, decrypted and substituted.
    File(&'a Path),

    /// `@!path`: read as is.
    Literal(&'a Path),

    /// Patch text given directly.
    Inline(&'a str),
}

impl<'a> Reference<'a> {
    pub fn parse(reference: &'a str) -> Self {
        if let Some(path) = reference.strip_prefix("@!") {
            Self::Literal(Path::new(path))
        } else if let Some(path) = reference.strip_prefix('@') {
            Self::File(Path::new(path))
        } else {
            Self::Inline(reference)
        }
    }
}

/// The patches of one node, role defaults first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PatchSet {
    pub merge_patches: Vec<Value>,
    pub json_patches: Vec<ConfigPatch>,
    pub references: Vec<String>,
}

impl PatchSet {
    /// Collects the patches of `node`. Merging already put the role defaults first.
    pub fn for_node(node: &MergedNodeConfig) -> Self {
        Self {
            merge_patches: node.config.inline_patch.clone(),
            json_patches: node.config.config_patches.clone(),
            references: node.config.patches.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.merge_patches.is_empty() && self.json_patches.is_empty() && self.references.is_empty()
    }
}

/// Applies every patch of `set` to `document`.
///
/// Variables in `@path` references are substituted from `context`, which is updated by
/// assigning expansions like `${VAR:=default}`.
#[instrument(skip_all, fields(
    merge_patches = set.merge_patches.len(),
    json_patches = set.json_patches.len(),
    references = set.references.len(),
))]
pub fn apply(
    document: &mut Value,
    set: &PatchSet,
    context: &mut SubstitutionContext,
    decryptor: &dyn Decryptor,
) -> Result<(), Error> {
    for (index, patch) in set.merge_patches.iter().enumerate() {
        ensure!(patch.is_object(), MergePatchNotAMappingSnafu { index });
        patchinator::apply_merge_patch(document, patch);
    }

    for (index, operation) in set.json_patches.iter().enumerate() {
        shape::check_operation(operation).context(MalformedOperationSnafu { index })?;
        let operation =
            serde_json::to_value(operation).context(SerializeOperationSnafu { index })?;
        let operations = patchinator::parse_json_patch(vec![operation])
            .context(ConvertOperationSnafu { index })?;
        patchinator::apply_json_patch(document, &operations)
            .context(ApplyOperationSnafu { index })?;
    }

    for reference in &set.references {
        let text = resolve_reference(reference, context, decryptor)?;
        apply_reference(document, reference, &text)?;
    }

    tracing::debug!("applied patches");
    Ok(())
}

fn resolve_reference(
    reference: &str,
    context: &mut SubstitutionContext,
    decryptor: &dyn Decryptor,
) -> Result<String, Error> {
    match Reference::parse(reference) {
        Reference::File(path) => {
            let raw = std::fs::read(path).context(ReadReferenceSnafu { reference })?;
            loader::read_bytes(raw, path, decryptor, context)
                .context(LoadReferenceSnafu { reference })
        }
        Reference::Literal(path) => {
            std::fs::read_to_string(path).context(ReadReferenceSnafu { reference })
        }
        Reference::Inline(text) => Ok(text.to_owned()),
    }
}

fn apply_reference(document: &mut Value, reference: &str, text: &str) -> Result<(), Error> {
    let patch: Value = serde_yaml::from_str(text).context(ParseReferenceSnafu { reference })?;

    match PatchDialect::classify(patch) {
        PatchDialect::JsonPatch(operations) => {
            if let Some((index, error)) = shape::check_all(&operations).into_iter().next() {
                return Err(error).context(MalformedReferenceOperationSnafu { reference, index });
            }
            let operations = patchinator::parse_json_patch(operations)
                .context(ApplyReferenceSnafu { reference })?;
            patchinator::apply_json_patch(document, &operations)
                .context(ApplyReferenceSnafu { reference })?;
            tracing::debug!(reference, operations = operations.len(), "applied JSON patch");
        }
        PatchDialect::StrategicMerge(patch) => {
            patchinator::apply_strategic_merge(document, &patch);
            tracing::debug!(reference, "applied strategic merge patch");
        }
        PatchDialect::Opaque(_) => {
            tracing::warn!(reference, "patch is neither a sequence nor a mapping, skipping it");
        }
    }

    Ok(())
}
