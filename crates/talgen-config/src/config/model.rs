use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use strum::{Display, EnumIter};

use crate::constants::{
    DEFAULT_CLUSTER_DOMAIN, DEFAULT_KUBERNETES_VERSION, DEFAULT_POD_SUBNET,
    DEFAULT_SERVICE_SUBNET, DEFAULT_TALOS_VERSION,
};

/// The top level cluster description, usually read from a `talconfig.yaml` file.
///
/// Required fields are deserialized with empty defaults, so that a missing field is reported
/// by [`crate::validation`] together with every other problem instead of aborting the parse.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub cluster_name: String,

    #[serde(default)]
    pub talos_version: String,

    #[serde(default)]
    pub kubernetes_version: String,

    /// The control plane endpoint, e.g. `https://10.0.0.10:6443`.
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub domain: String,

    #[serde(default)]
    pub allow_scheduling_on_control_planes: bool,

    /// Deprecated spelling of [`Self::allow_scheduling_on_control_planes`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_scheduling_on_masters: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_machine_cert_sans: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_api_server_cert_sans: Vec<String>,

    #[serde(default)]
    pub cluster_pod_nets: Vec<String>,

    #[serde(default)]
    pub cluster_svc_nets: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cni_config: Option<CniConfig>,

    /// Manifests applied by every control plane node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_manifests: Vec<String>,

    #[serde(default)]
    pub nodes: Vec<NodeSpec>,

    /// Defaults for every control plane node.
    #[serde(default)]
    pub control_plane: NodeConfigs,

    /// Defaults for every worker node.
    #[serde(default)]
    pub worker: NodeConfigs,
}

impl ClusterSpec {
    /// Fills in computed defaults for optional cluster wide settings.
    pub fn apply_defaults(&mut self) {
        fill(&mut self.talos_version, DEFAULT_TALOS_VERSION);
        fill(&mut self.kubernetes_version, DEFAULT_KUBERNETES_VERSION);
        fill(&mut self.domain, DEFAULT_CLUSTER_DOMAIN);

        if self.cluster_pod_nets.is_empty() {
            self.cluster_pod_nets = vec![DEFAULT_POD_SUBNET.to_owned()];
        }
        if self.cluster_svc_nets.is_empty() {
            self.cluster_svc_nets = vec![DEFAULT_SERVICE_SUBNET.to_owned()];
        }
    }

    /// The role defaults for nodes of `role`.
    pub fn role_defaults(&self, role: Role) -> &NodeConfigs {
        match role {
            Role::ControlPlane => &self.control_plane,
            Role::Worker => &self.worker,
        }
    }

    pub fn control_plane_nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(|node| node.control_plane)
    }

    pub fn find_node(&self, hostname: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|node| node.hostname == hostname)
    }

    /// Whether workloads may be scheduled on control plane nodes, honouring the deprecated
    /// spelling when the current one is not set.
    pub fn scheduling_on_control_planes(&self) -> bool {
        self.allow_scheduling_on_control_planes || self.allow_scheduling_on_masters == Some(true)
    }

    /// The file name of the machine configuration generated for `hostname`.
    pub fn artifact_file_name(&self, hostname: &str) -> String {
        format!("{cluster}-{hostname}.yaml", cluster = self.cluster_name)
    }
}

fn fill(field: &mut String, default: &str) {
    if field.is_empty() {
        default.clone_into(field);
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Role {
    #[strum(serialize = "controlplane")]
    ControlPlane,

    #[strum(serialize = "worker")]
    Worker,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CniConfig {
    pub name: CniName,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CniName {
    #[default]
    Flannel,
    Custom,
    None,
}

/// A single physical or virtual machine of the cluster.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    #[serde(default)]
    pub hostname: String,

    /// One or more comma separated IP addresses or resolvable names.
    #[serde(default)]
    pub ip_address: String,

    #[serde(default)]
    pub control_plane: bool,

    #[serde(flatten)]
    pub config: NodeConfigs,
}

impl NodeSpec {
    pub fn role(&self) -> Role {
        if self.control_plane {
            Role::ControlPlane
        } else {
            Role::Worker
        }
    }

    /// Every address listed in [`Self::ip_address`], in order.
    pub fn addresses(&self) -> Vec<&str> {
        self.ip_address
            .split(',')
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .collect()
    }
}

/// Settings that can be given both per node and as role defaults.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_disk: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_disk_selector: Option<InstallDiskSelector>,

    /// Additional disks to partition and mount.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_disks: Vec<MachineDisk>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<NetworkInterface>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,

    /// Values may contain templates like `{{ .hostname }}`, see [`crate::synthesis::template`].
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub node_labels: IndexMap<String, String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub node_annotations: IndexMap<String, String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub node_taints: IndexMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kernel_modules: Vec<KernelModule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_files: Vec<MachineFile>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schematic: Option<Schematic>,

    #[serde(
        default,
        rename = "talosImageURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub talos_image_url: Option<String>,

    #[serde(default, rename = "certSANs", skip_serializing_if = "Vec::is_empty")]
    pub cert_sans: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_manifests: Vec<String>,

    /// RFC 7396 merge patches. Accepts a single mapping or a list of mappings.
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub inline_patch: Vec<Value>,

    /// RFC 6902 operations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_patches: Vec<ConfigPatch>,

    /// References to patches: `@path` (a file), `@!path` (a file read literally) or inline
    /// YAML text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub override_patches: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub override_extra_manifests: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub override_machine_cert_sans: bool,
}

/// The lists whose role defaults a node can either extend or replace.
#[derive(Clone, Copy, Debug, Display, EnumIter, PartialEq, Eq)]
#[strum(serialize_all = "camelCase")]
pub enum OverridableList {
    Patches,
    ExtraManifests,
    #[strum(serialize = "certSANs")]
    MachineCertSans,
}

/// How a node's overridable list is combined with its role default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListMode {
    /// Role default entries come first, followed by the node's own entries.
    #[default]
    Prepend,

    /// The node's entries replace the role default entirely.
    Replace,
}

impl NodeConfigs {
    pub fn list_mode(&self, list: OverridableList) -> ListMode {
        let replace = match list {
            OverridableList::Patches => self.override_patches,
            OverridableList::ExtraManifests => self.override_extra_manifests,
            OverridableList::MachineCertSans => self.override_machine_cert_sans,
        };

        if replace {
            ListMode::Replace
        } else {
            ListMode::Prepend
        }
    }

    pub fn list(&self, list: OverridableList) -> &Vec<String> {
        match list {
            OverridableList::Patches => &self.patches,
            OverridableList::ExtraManifests => &self.extra_manifests,
            OverridableList::MachineCertSans => &self.cert_sans,
        }
    }

    pub fn list_mut(&mut self, list: OverridableList) -> &mut Vec<String> {
        match list {
            OverridableList::Patches => &mut self.patches,
            OverridableList::ExtraManifests => &mut self.extra_manifests,
            OverridableList::MachineCertSans => &mut self.cert_sans,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallDiskSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modalias: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wwid: Option<String>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub disk_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_path: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineDisk {
    #[serde(default)]
    pub device: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<DiskPartition>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskPartition {
    #[serde(default)]
    pub mountpoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_selector: Option<IndexMap<String, Value>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bond: Option<Bond>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<Bridge>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vlans: Vec<Vlan>,
}

impl NetworkInterface {
    /// A human readable name for messages, falling back to the position in the list.
    pub fn display_name(&self, index: usize) -> String {
        self.interface
            .clone()
            .unwrap_or_else(|| format!("networkInterfaces[{index}]"))
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bond {
    #[serde(default)]
    pub interfaces: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bridge {
    #[serde(default)]
    pub interfaces: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Vlan {
    pub vlan_id: u16,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelModule {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    #[serde(default)]
    pub name: String,

    /// A disk selector expression, e.g. `disk.transport == "nvme"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_selector: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineFile {
    /// The file content, or `@path` to read it from a file.
    #[serde(default)]
    pub content: String,

    #[serde(default)]
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,

    #[serde(default = "default_file_op")]
    pub op: String,
}

fn default_file_op() -> String {
    "create".to_owned()
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Schematic {
    #[serde(default)]
    pub customization: Customization,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Customization {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_kernel_args: Vec<String>,

    #[serde(default)]
    pub system_extensions: SystemExtensions,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemExtensions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub official_extensions: Vec<String>,
}

/// A single, loosely typed RFC 6902 operation.
///
/// Every field is optional so that malformed operations survive deserialization and can be
/// reported by [`crate::validation`] together with every other problem.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// `Some(Value::Null)` when the document has an explicit `value: null`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<Value>),
        One(Value),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(values) => values,
        OneOrMany::One(Value::Null) => Vec::new(),
        OneOrMany::One(value) => vec![value],
    })
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use serde_json::json;

    use super::*;

    #[test]
    fn deserialize_node_with_flattened_configs() {
        let node: NodeSpec = serde_yaml::from_str(indoc! {"
            hostname: cp-1
            ipAddress: 10.0.0.11, 10.0.0.12
            controlPlane: true
            installDisk: /dev/sda
            certSANs: [cp-1.lab]
            talosImageURL: factory.talos.dev/installer/abc
            inlinePatch:
              machine:
                network:
                  mtu: 9000
            overridePatches: true
        "})
        .expect("test input is valid YAML");

        assert_eq!(node.role(), Role::ControlPlane);
        assert_eq!(node.addresses(), vec!["10.0.0.11", "10.0.0.12"]);
        assert_eq!(node.config.install_disk.as_deref(), Some("/dev/sda"));
        assert_eq!(node.config.cert_sans, vec!["cp-1.lab"]);
        assert_eq!(
            node.config.inline_patch,
            vec![json!({ "machine": { "network": { "mtu": 9000 } } })]
        );
        assert_eq!(
            node.config.list_mode(OverridableList::Patches),
            ListMode::Replace
        );
        assert_eq!(
            node.config.list_mode(OverridableList::ExtraManifests),
            ListMode::Prepend
        );
    }

    #[test]
    fn inline_patch_accepts_list() {
        let configs: NodeConfigs = serde_yaml::from_str(indoc! {"
            inlinePatch:
              - machine: {}
              - cluster: {}
        "})
        .expect("test input is valid YAML");

        assert_eq!(configs.inline_patch.len(), 2);
    }

    #[test]
    fn defaults_are_applied() {
        let mut cluster = ClusterSpec::default();
        cluster.apply_defaults();

        assert_eq!(cluster.talos_version, DEFAULT_TALOS_VERSION);
        assert_eq!(cluster.domain, DEFAULT_CLUSTER_DOMAIN);
        assert_eq!(cluster.cluster_pod_nets, vec![DEFAULT_POD_SUBNET]);
    }

    #[test]
    fn overridable_list_names() {
        assert_eq!(OverridableList::Patches.to_string(), "patches");
        assert_eq!(OverridableList::ExtraManifests.to_string(), "extraManifests");
        assert_eq!(OverridableList::MachineCertSans.to_string(), "certSANs");
    }
}
