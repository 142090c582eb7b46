//! Folds role defaults into nodes.
//!
//! The rules, per field kind:
//!
//! - [`Option`]al fields: the node's value wins if set.
//! - Maps: the union of both, the node's value wins for keys present in both.
//! - Plain lists: the node's list wins if it is non-empty.
//! - Overridable lists (see [`OverridableList`]): the default entries come first, followed by
//!   the node's own, unless the node asks for [`ListMode::Replace`].
//! - Patch tiers (`inlinePatch`, `configPatches`): always the default entries first.
//!
//! Merging is pure and idempotent: merging a [`MergedNodeConfig`] again against an empty
//! [`NodeConfigs`] leaves it unchanged.
use std::ops::Deref;

use indexmap::IndexMap;
use strum::IntoEnumIterator;
use tracing::instrument;

use crate::config::{
    ClusterSpec, InstallDiskSelector, ListMode, NodeConfigs, NodeSpec, OverridableList, Schematic,
};

/// A type that can be merged with defaults of the same type.
pub trait Merge {
    /// Merge with `defaults`, preferring values from `self` if they are set there.
    fn merge(&mut self, defaults: &Self);
}

/// A marker trait for types that are merged as one single value rather than field by field.
pub trait Atomic: Clone {}
impl Atomic for bool {}
impl Atomic for u16 {}
impl Atomic for u32 {}
impl Atomic for String {}
impl Atomic for InstallDiskSelector {}
impl Atomic for Schematic {}

impl<T: Atomic> Merge for Option<T> {
    fn merge(&mut self, defaults: &Self) {
        if self.is_none() {
            self.clone_from(defaults);
        }
    }
}

impl<V: Atomic> Merge for IndexMap<String, V> {
    fn merge(&mut self, defaults: &Self) {
        if defaults.is_empty() {
            return;
        }

        // Default keys keep their position, node-only keys are appended after them.
        let mut merged = defaults.clone();
        for (key, value) in self.drain(..) {
            merged.insert(key, value);
        }
        *self = merged;
    }
}

impl<T: Clone> Merge for Vec<T> {
    fn merge(&mut self, defaults: &Self) {
        if self.is_empty() {
            self.clone_from(defaults);
        }
    }
}

/// Combines an overridable list with its default.
pub fn merge_list<T: Clone>(values: &mut Vec<T>, defaults: &[T], mode: ListMode) {
    match mode {
        ListMode::Replace => {}
        ListMode::Prepend => prepend(values, defaults),
    }
}

fn prepend<T: Clone>(values: &mut Vec<T>, defaults: &[T]) {
    if defaults.is_empty() {
        return;
    }

    let own = std::mem::take(values);
    values.reserve(defaults.len() + own.len());
    values.extend_from_slice(defaults);
    values.extend(own);
}

impl Merge for NodeConfigs {
    fn merge(&mut self, defaults: &Self) {
        self.install_disk.merge(&defaults.install_disk);
        self.install_disk_selector
            .merge(&defaults.install_disk_selector);
        self.machine_disks.merge(&defaults.machine_disks);
        self.network_interfaces.merge(&defaults.network_interfaces);
        self.nameservers.merge(&defaults.nameservers);
        self.node_labels.merge(&defaults.node_labels);
        self.node_annotations.merge(&defaults.node_annotations);
        self.node_taints.merge(&defaults.node_taints);
        self.kernel_modules.merge(&defaults.kernel_modules);
        self.volumes.merge(&defaults.volumes);
        self.machine_files.merge(&defaults.machine_files);
        self.schematic.merge(&defaults.schematic);
        self.talos_image_url.merge(&defaults.talos_image_url);

        for list in OverridableList::iter() {
            let mode = self.list_mode(list);
            merge_list(self.list_mut(list), defaults.list(list), mode);
        }

        prepend(&mut self.inline_patch, &defaults.inline_patch);
        prepend(&mut self.config_patches, &defaults.config_patches);
    }
}

/// A node with the defaults of its role folded in.
///
/// Only obtainable through [`merge_node`], so holding one guarantees the merge happened.
#[derive(Clone, Debug, PartialEq)]
pub struct MergedNodeConfig(NodeSpec);

impl MergedNodeConfig {
    pub fn into_inner(self) -> NodeSpec {
        self.0
    }
}

impl Deref for MergedNodeConfig {
    type Target = NodeSpec;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Merges `defaults` into `node`.
#[instrument(skip_all, fields(hostname = %node.hostname))]
pub fn merge_node(mut node: NodeSpec, defaults: &NodeConfigs) -> MergedNodeConfig {
    node.config.merge(defaults);
    tracing::trace!(
        patches = node.config.patches.len(),
        inline_patches = node.config.inline_patch.len(),
        json_patches = node.config.config_patches.len(),
        "merged role defaults into node"
    );
    MergedNodeConfig(node)
}

impl ClusterSpec {
    /// Every node with the defaults of its role folded in, in declaration order.
    pub fn merged_nodes(&self) -> impl Iterator<Item = MergedNodeConfig> + '_ {
        self.nodes
            .iter()
            .map(|node| merge_node(node.clone(), self.role_defaults(node.role())))
    }
}
