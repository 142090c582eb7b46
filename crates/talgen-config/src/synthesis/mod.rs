//! Turns merged nodes into base machine configurations.
//!
//! A [`MachineConfigGenerator`] produces the base document of a role from the cluster wide
//! settings and the secrets bundle. [`synthesize`] then sets everything that is specific to
//! one node: hostname, install target, network, labels, kernel modules, disks and files.
//! Volumes are not part of the machine configuration, they become separate
//! `UserVolumeConfig` documents.
use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Value, json};
use snafu::{ResultExt, Snafu};
use tracing::instrument;

use crate::{
    config::{ClusterSpec, MachineFile, Role, Volume, merge::MergedNodeConfig},
    constants::INSTALLER_IMAGE_REPOSITORY,
    secrets::{self, SecretsBundle, VersionContract},
};

pub mod template;
mod v1alpha1;

pub use template::TemplateContext;
pub use v1alpha1::V1Alpha1Generator;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to determine the version contract"))]
    ResolveVersionContract { source: secrets::Error },

    #[snafu(display("failed to render the template of {field}"))]
    RenderTemplate {
        source: template::Error,
        field: String,
    },

    #[snafu(display("failed to read the content of machine file {path:?}"))]
    ReadMachineFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to convert {field} into the machine configuration"))]
    ConvertSetting {
        source: serde_json::Error,
        field: &'static str,
    },
}

/// Everything a [`MachineConfigGenerator`] gets to see.
#[derive(Clone, Copy, Debug)]
pub struct GeneratorInput<'a> {
    pub cluster: &'a ClusterSpec,
    pub role: Role,
    pub bundle: &'a SecretsBundle,
    pub contract: VersionContract,
}

/// Produces the base machine configuration of a role.
pub trait MachineConfigGenerator {
    fn generate(&self, input: &GeneratorInput<'_>) -> Result<Value, Error>;
}

/// The documents synthesized for one node, before patching.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeDocuments {
    /// The machine configuration, which patches apply to.
    pub machine_config: Value,

    /// Documents emitted after the machine configuration, like `UserVolumeConfig`s.
    pub extra: Vec<Value>,
}

/// Synthesizes the documents of `node`.
#[instrument(skip_all, fields(hostname = %node.hostname))]
pub fn synthesize(
    node: &MergedNodeConfig,
    cluster: &ClusterSpec,
    bundle: &SecretsBundle,
    generator: &dyn MachineConfigGenerator,
) -> Result<NodeDocuments, Error> {
    let contract = bundle
        .version_contract(&cluster.talos_version)
        .context(ResolveVersionContractSnafu)?;

    let mut document = generator.generate(&GeneratorInput {
        cluster,
        role: node.role(),
        bundle,
        contract,
    })?;
    apply_node_settings(&mut document, node, cluster)?;

    let extra = if node.config.volumes.is_empty() {
        Vec::new()
    } else if contract.user_volumes_supported() {
        node.config.volumes.iter().map(user_volume_config).collect()
    } else {
        tracing::warn!(
            %contract,
            volumes = node.config.volumes.len(),
            "user volumes require version contract v1.10 or newer, skipping them"
        );
        Vec::new()
    };

    tracing::debug!(extra_documents = extra.len(), "synthesized node documents");
    Ok(NodeDocuments {
        machine_config: document,
        extra,
    })
}

fn apply_node_settings(
    document: &mut Value,
    node: &MergedNodeConfig,
    cluster: &ClusterSpec,
) -> Result<(), Error> {
    let config = &node.config;
    let templates = TemplateContext::for_node(node, cluster);

    set(document, &["machine", "network", "hostname"], json!(node.hostname));

    if let Some(disk) = &config.install_disk {
        set(document, &["machine", "install", "disk"], json!(disk));
    }
    if let Some(selector) = &config.install_disk_selector {
        remove(document, &["machine", "install", "disk"]);
        set(
            document,
            &["machine", "install", "diskSelector"],
            to_value(selector, "installDiskSelector")?,
        );
    }
    let image = config.talos_image_url.as_ref().map_or_else(
        || format!("{INSTALLER_IMAGE_REPOSITORY}:{version}", version = cluster.talos_version),
        |url| format!("{url}:{version}", version = cluster.talos_version),
    );
    set(document, &["machine", "install", "image"], json!(image));
    if let Some(schematic) = &config.schematic {
        let arguments = &schematic.customization.extra_kernel_args;
        if !arguments.is_empty() {
            set(document, &["machine", "install", "extraKernelArgs"], json!(arguments));
        }
    }

    if !config.network_interfaces.is_empty() {
        set(
            document,
            &["machine", "network", "interfaces"],
            to_value(&config.network_interfaces, "networkInterfaces")?,
        );
    }
    if !config.nameservers.is_empty() {
        set(document, &["machine", "network", "nameservers"], json!(config.nameservers));
    }

    for (field, entries) in [
        ("nodeLabels", &config.node_labels),
        ("nodeAnnotations", &config.node_annotations),
        ("nodeTaints", &config.node_taints),
    ] {
        for (key, value) in entries {
            let rendered = templates
                .render(value)
                .with_context(|_| RenderTemplateSnafu {
                    field: format!("{field}[{key:?}]"),
                })?;
            set(document, &["machine", field, key.as_str()], json!(rendered));
        }
    }

    if !config.kernel_modules.is_empty() {
        set(
            document,
            &["machine", "kernel", "modules"],
            to_value(&config.kernel_modules, "kernelModules")?,
        );
    }

    let cert_sans: Vec<&String> = cluster
        .additional_machine_cert_sans
        .iter()
        .chain(&config.cert_sans)
        .collect();
    if !cert_sans.is_empty() {
        set(document, &["machine", "certSANs"], json!(cert_sans));
    }

    if !config.machine_disks.is_empty() {
        set(
            document,
            &["machine", "disks"],
            to_value(&config.machine_disks, "machineDisks")?,
        );
    }
    if !config.machine_files.is_empty() {
        let files = config
            .machine_files
            .iter()
            .map(machine_file)
            .collect::<Result<Vec<_>, _>>()?;
        set(document, &["machine", "files"], Value::Array(files));
    }

    let manifests: Vec<&String> = cluster
        .extra_manifests
        .iter()
        .chain(&config.extra_manifests)
        .collect();
    if !manifests.is_empty() {
        set(document, &["cluster", "extraManifests"], json!(manifests));
    }

    Ok(())
}

/// Inlines the content of files referenced with `@path`.
fn machine_file(file: &MachineFile) -> Result<Value, Error> {
    let content = match file
        .content
        .strip_prefix("@!")
        .or_else(|| file.content.strip_prefix('@'))
    {
        Some(path) => std::fs::read_to_string(path).context(ReadMachineFileSnafu { path })?,
        None => file.content.clone(),
    };

    let mut value = json!({
        "content": content,
        "path": file.path,
        "op": file.op,
    });
    if let Some(permissions) = file.permissions {
        value["permissions"] = json!(permissions);
    }
    Ok(value)
}

fn user_volume_config(volume: &Volume) -> Value {
    let mut provisioning = json!({});
    if let Some(selector) = &volume.disk_selector {
        provisioning["diskSelector"] = json!({ "match": selector });
    }
    if let Some(min_size) = &volume.min_size {
        provisioning["minSize"] = json!(min_size);
    }
    if let Some(max_size) = &volume.max_size {
        provisioning["maxSize"] = json!(max_size);
    }

    json!({
        "apiVersion": "v1alpha1",
        "kind": "UserVolumeConfig",
        "name": volume.name,
        "provisioning": provisioning,
    })
}

fn to_value(value: &impl Serialize, field: &'static str) -> Result<Value, Error> {
    serde_json::to_value(value).context(ConvertSettingSnafu { field })
}

/// Sets the value at `path`, creating (or replacing non-mapping) parents as needed.
fn set(document: &mut Value, path: &[&str], value: Value) {
    let mut current = document;
    for key in path {
        if !current.is_object() {
            *current = json!({});
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map.entry(*key).or_insert(Value::Null);
    }
    *current = value;
}

fn remove(document: &mut Value, path: &[&str]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let parent = parents
        .iter()
        .try_fold(document, |current, key| current.get_mut(*key));
    if let Some(Value::Object(map)) = parent {
        map.remove(*last);
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::{config::loader::parse_cluster, secrets::tests::test_bundle};

    fn load(yaml: &str) -> ClusterSpec {
        parse_cluster(yaml, std::path::Path::new("/cluster")).unwrap()
    }

    fn synthesize_all(cluster: &ClusterSpec) -> Vec<NodeDocuments> {
        let bundle = test_bundle();
        cluster
            .merged_nodes()
            .map(|node| synthesize(&node, cluster, &bundle, &V1Alpha1Generator).unwrap())
            .collect()
    }

    #[test]
    fn applies_node_settings() {
        let cluster = load(indoc! {"
            clusterName: lab
            endpoint: https://10.0.0.10:6443
            additionalMachineCertSans: [10.0.0.10]
            worker:
              nodeLabels:
                rack: '{{ .hostname }}-rack'
            nodes:
              - hostname: worker-1
                ipAddress: 10.0.0.21
                installDiskSelector:
                  model: Samsung*
                certSANs: [worker-1.lab]
                talosImageURL: factory.talos.dev/installer/abc123
                networkInterfaces:
                  - interface: eth0
                    addresses: [10.0.0.21/24]
                    routes:
                      - network: 0.0.0.0/0
                        gateway: 10.0.0.1
                nameservers: [1.1.1.1]
                nodeTaints:
                  dedicated: '{{ .role }}:NoSchedule'
                kernelModules:
                  - name: drbd
                    parameters: [usermode_helper=disabled]
                schematic:
                  customization:
                    extraKernelArgs: [net.ifnames=0]
        "});
        let documents = synthesize_all(&cluster);
        let machine = &documents[0].machine_config["machine"];

        assert_eq!(machine["network"]["hostname"], "worker-1");
        assert_eq!(machine["install"]["diskSelector"], json!({ "model": "Samsung*" }));
        assert!(machine["install"].get("disk").is_none());
        assert_eq!(machine["install"]["image"], "factory.talos.dev/installer/abc123:v1.9.5");
        assert_eq!(machine["install"]["extraKernelArgs"], json!(["net.ifnames=0"]));
        assert_eq!(
            machine["network"]["interfaces"],
            json!([{
                "interface": "eth0",
                "addresses": ["10.0.0.21/24"],
                "routes": [{ "network": "0.0.0.0/0", "gateway": "10.0.0.1" }],
            }])
        );
        assert_eq!(machine["network"]["nameservers"], json!(["1.1.1.1"]));
        assert_eq!(machine["nodeLabels"]["rack"], "worker-1-rack");
        assert_eq!(machine["nodeTaints"]["dedicated"], "worker:NoSchedule");
        assert_eq!(machine["kernel"]["modules"][0]["name"], "drbd");
        assert_eq!(machine["certSANs"], json!(["10.0.0.10", "worker-1.lab"]));
        assert!(documents[0].extra.is_empty());
    }

    #[test]
    fn control_plane_keeps_generated_labels() {
        let cluster = load(indoc! {"
            clusterName: lab
            endpoint: https://10.0.0.10:6443
            extraManifests: [https://example.com/cluster.yaml]
            nodes:
              - hostname: cp-1
                ipAddress: 10.0.0.11
                controlPlane: true
                installDisk: /dev/nvme0n1
                nodeLabels:
                  zone: a
                extraManifests: [https://example.com/node.yaml]
        "});
        let document = &synthesize_all(&cluster)[0].machine_config;

        assert_eq!(document["machine"]["install"]["disk"], "/dev/nvme0n1");
        assert_eq!(
            document["machine"]["nodeLabels"],
            json!({
                "node.kubernetes.io/exclude-from-external-load-balancers": "",
                "zone": "a",
            })
        );
        assert_eq!(
            document["cluster"]["extraManifests"],
            json!(["https://example.com/cluster.yaml", "https://example.com/node.yaml"])
        );
    }

    #[test]
    fn volumes_become_documents() {
        let cluster = load(indoc! {"
            clusterName: lab
            talosVersion: v1.10.2
            kubernetesVersion: v1.33.0
            endpoint: https://10.0.0.10:6443
            nodes:
              - hostname: worker-1
                ipAddress: 10.0.0.21
                installDisk: /dev/sda
                volumes:
                  - name: data
                    diskSelector: disk.transport == \"nvme\"
                    maxSize: 50GiB
        "});
        let documents = synthesize_all(&cluster);

        assert_eq!(
            documents[0].extra,
            vec![json!({
                "apiVersion": "v1alpha1",
                "kind": "UserVolumeConfig",
                "name": "data",
                "provisioning": {
                    "diskSelector": { "match": "disk.transport == \"nvme\"" },
                    "maxSize": "50GiB",
                },
            })]
        );
    }

    #[test]
    fn volumes_need_a_recent_contract() {
        let cluster = load(indoc! {"
            clusterName: lab
            endpoint: https://10.0.0.10:6443
            nodes:
              - hostname: worker-1
                ipAddress: 10.0.0.21
                installDisk: /dev/sda
                volumes:
                  - name: data
        "});
        assert!(synthesize_all(&cluster)[0].extra.is_empty());
    }

    #[test]
    fn inlines_machine_file_content() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("registries.toml");
        std::fs::write(&source, "[plugins]\n").unwrap();

        let cluster = load(&format!(
            indoc! {"
                clusterName: lab
                endpoint: https://10.0.0.10:6443
                nodes:
                  - hostname: worker-1
                    ipAddress: 10.0.0.21
                    installDisk: /dev/sda
                    machineFiles:
                      - content: '@{source}'
                        path: /etc/cri/conf.d/20-customization.part
                        permissions: 420
                        op: create
                      - content: literal
                        path: /var/etc/note
            "},
            source = source.display()
        ));
        let files = &synthesize_all(&cluster)[0].machine_config["machine"]["files"];

        assert_eq!(files[0]["content"], "[plugins]\n");
        assert_eq!(files[0]["permissions"], 420);
        assert_eq!(files[1]["content"], "literal");
        assert_eq!(files[1]["op"], "create");
    }

    #[test]
    fn unknown_template_field_fails_the_node() {
        let cluster = load(indoc! {"
            clusterName: lab
            endpoint: https://10.0.0.10:6443
            nodes:
              - hostname: worker-1
                ipAddress: 10.0.0.21
                installDisk: /dev/sda
                nodeLabels:
                  serial: '{{ .serial }}'
        "});
        let node = cluster.merged_nodes().next().unwrap();
        let error = synthesize(&node, &cluster, &test_bundle(), &V1Alpha1Generator).unwrap_err();

        assert!(matches!(error, Error::RenderTemplate { ref field, .. } if field == r#"nodeLabels["serial"]"#));
    }

    #[test]
    fn set_creates_parents() {
        let mut document = json!({ "machine": { "network": "replaced" } });
        set(&mut document, &["machine", "network", "hostname"], json!("cp-1"));
        assert_eq!(document, json!({ "machine": { "network": { "hostname": "cp-1" } } }));

        remove(&mut document, &["machine", "network", "hostname"]);
        remove(&mut document, &["does", "not", "exist"]);
        assert_eq!(document, json!({ "machine": { "network": {} } }));
    }
}
