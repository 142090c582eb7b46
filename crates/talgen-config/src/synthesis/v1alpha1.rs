//! The built-in generator for `v1alpha1` machine configurations.
use serde_json::{Value, json};

use crate::{
    config::{CniName, Role},
    constants::{INSTALLER_IMAGE_REPOSITORY, KUBELET_IMAGE_REPOSITORY, KUBERNETES_IMAGE_REGISTRY},
    synthesis::{Error, GeneratorInput, MachineConfigGenerator},
};

const KUBE_PRISM_PORT: u16 = 7445;
const DEFAULT_INSTALL_DISK: &str = "/dev/sda";

/// Generates the base `v1alpha1` machine configuration of a role.
///
/// Control plane secrets (CA keys, etcd, the service account key, the aggregator CA and the
/// secretbox secret) are only embedded into control plane configurations.
#[derive(Clone, Copy, Debug, Default)]
pub struct V1Alpha1Generator;

impl MachineConfigGenerator for V1Alpha1Generator {
    fn generate(&self, input: &GeneratorInput<'_>) -> Result<Value, Error> {
        let GeneratorInput {
            cluster,
            role,
            bundle,
            contract,
        } = *input;
        let control_plane = role == Role::ControlPlane;
        let certs = &bundle.certs;

        // Workers only get the public half of the CAs
        let private = |key: &str| if control_plane { key.to_owned() } else { String::new() };

        let mut features = json!({
            "rbac": true,
            "stableHostname": true,
            "apidCheckExtKeyUsage": true,
            "diskQuotaSupport": true,
        });
        if contract.kube_prism_enabled() {
            features["kubePrism"] = json!({ "enabled": true, "port": KUBE_PRISM_PORT });
        }
        if contract.host_dns_enabled() {
            features["hostDNS"] = json!({ "enabled": true, "forwardKubeDNSToHost": true });
        }

        let mut machine = json!({
            "type": role.to_string(),
            "token": bundle.trustd_info.token,
            "ca": {
                "crt": certs.os.crt,
                "key": private(&certs.os.key),
            },
            "certSANs": [],
            "kubelet": {
                "image": format!("{KUBELET_IMAGE_REPOSITORY}:{version}", version = cluster.kubernetes_version),
                "defaultRuntimeSeccompProfileEnabled": true,
                "disableManifestsDirectory": true,
            },
            "network": {},
            "install": {
                "disk": DEFAULT_INSTALL_DISK,
                "image": format!("{INSTALLER_IMAGE_REPOSITORY}:{version}", version = cluster.talos_version),
                "wipe": false,
            },
            "features": features,
        });
        if control_plane {
            machine["nodeLabels"] = json!({
                "node.kubernetes.io/exclude-from-external-load-balancers": "",
            });
        }

        let mut network = json!({
            "dnsDomain": cluster.domain,
            "podSubnets": cluster.cluster_pod_nets,
            "serviceSubnets": cluster.cluster_svc_nets,
        });
        if let Some(cni) = &cluster.cni_config {
            network["cni"] = match cni.name {
                CniName::Custom => json!({ "name": cni.name.to_string(), "urls": cni.urls }),
                CniName::Flannel | CniName::None => json!({ "name": cni.name.to_string() }),
            };
        }

        let mut cluster_section = json!({
            "id": bundle.cluster.id,
            "secret": bundle.cluster.secret,
            "controlPlane": { "endpoint": cluster.endpoint },
            "clusterName": cluster.cluster_name,
            "network": network,
            "token": bundle.secrets.bootstrap_token,
            "ca": {
                "crt": certs.k8s.crt,
                "key": private(&certs.k8s.key),
            },
            "discovery": {
                "enabled": true,
                "registries": {
                    "kubernetes": { "disabled": true },
                    "service": {},
                },
            },
        });

        if control_plane {
            let image = |component: &str| {
                format!(
                    "{KUBERNETES_IMAGE_REGISTRY}/{component}:{version}",
                    version = cluster.kubernetes_version
                )
            };
            let mut api_server_sans: Vec<String> = endpoint_host(&cluster.endpoint).into_iter().collect();
            api_server_sans.extend(cluster.additional_api_server_cert_sans.iter().cloned());

            cluster_section["secretboxEncryptionSecret"] = json!(bundle.secrets.secretbox_encryption_secret);
            cluster_section["aggregatorCA"] = json!(certs.k8s_aggregator);
            cluster_section["serviceAccount"] = json!({ "key": certs.k8s_service_account.key });
            cluster_section["apiServer"] = json!({
                "image": image("kube-apiserver"),
                "certSANs": api_server_sans,
            });
            cluster_section["controllerManager"] = json!({ "image": image("kube-controller-manager") });
            cluster_section["proxy"] = json!({ "image": image("kube-proxy") });
            cluster_section["scheduler"] = json!({ "image": image("kube-scheduler") });
            cluster_section["etcd"] = json!({ "ca": certs.etcd });
            cluster_section["allowSchedulingOnControlPlanes"] = json!(cluster.scheduling_on_control_planes());
        }

        Ok(json!({
            "version": "v1alpha1",
            "debug": false,
            "persist": true,
            "machine": machine,
            "cluster": cluster_section,
        }))
    }
}

fn endpoint_host(endpoint: &str) -> Option<String> {
    url::Url::parse(endpoint)
        .ok()?
        .host_str()
        .map(|host| host.trim_matches(['[', ']']).to_owned())
}
