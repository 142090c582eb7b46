//! Renders control CLI invocations for a compiled cluster.
//!
//! Commands are only printed, never executed. Node specific commands (`apply-config`, `reset`,
//! `upgrade`) produce one command per targeted address, cluster wide commands target a single
//! control plane address.
use std::{net::IpAddr, path::Path, str::FromStr};

use snafu::{OptionExt, Snafu};
use strum::{Display, EnumIter, EnumString};

use crate::{
    config::{ClusterSpec, merge::MergedNodeConfig},
    constants::{CONTROL_CLI, INSTALLER_IMAGE_REPOSITORY},
};

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("no node has the address {address}"))]
    UnknownAddress { address: String },

    #[snafu(display("no node has the hostname {hostname:?}"))]
    UnknownHostname { hostname: String },

    #[snafu(display("the cluster has no control plane node to run {kind} against"))]
    NoControlPlane { kind: CommandKind },
}

#[derive(Clone, Copy, Debug, Display, EnumIter, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "kebab-case")]
pub enum CommandKind {
    ApplyConfig,
    Bootstrap,
    Reset,
    Upgrade,
    UpgradeK8s,
    Kubeconfig,
    Health,
}

impl CommandKind {
    /// Whether the command acts on the whole cluster through one control plane node.
    pub fn is_cluster_wide(self) -> bool {
        matches!(
            self,
            Self::Bootstrap | Self::UpgradeK8s | Self::Kubeconfig | Self::Health
        )
    }
}

/// Which nodes a command targets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Selector {
    /// Every node for node specific commands, the first control plane node otherwise.
    #[default]
    All,

    /// Exactly this address.
    Address(IpAddr),

    /// Every address of the node with this hostname.
    Hostname(String),
}

impl FromStr for Selector {
    type Err = std::convert::Infallible;

    /// IP addresses select an address, everything else a hostname.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(match input.trim().parse::<IpAddr>() {
            Ok(address) => Self::Address(address),
            Err(_) => Self::Hostname(input.trim().to_owned()),
        })
    }
}

/// One command target: a node and the address to reach it at.
struct Target {
    node: MergedNodeConfig,
    address: String,
}

/// Renders the `kind` commands for the nodes selected by `selector`.
///
/// `extra_flags` are appended verbatim to every command.
pub fn generate(
    cluster: &ClusterSpec,
    kind: CommandKind,
    selector: &Selector,
    talosconfig: &Path,
    out_dir: &Path,
    extra_flags: &[String],
) -> Result<Vec<String>, Error> {
    let targets = targets(cluster, kind, selector)?;

    let commands = targets
        .iter()
        .map(|target| {
            let mut command = vec![
                CONTROL_CLI.to_owned(),
                kind.to_string(),
                format!("--talosconfig={}", talosconfig.display()),
                format!("--nodes={}", target.address),
            ];
            command.extend(kind_flags(cluster, kind, &target.node, out_dir));
            command.extend(extra_flags.iter().cloned());
            command.join(" ")
        })
        .collect();
    Ok(commands)
}

fn targets(cluster: &ClusterSpec, kind: CommandKind, selector: &Selector) -> Result<Vec<Target>, Error> {
    let nodes: Vec<MergedNodeConfig> = cluster.merged_nodes().collect();
    let expand = |node: &MergedNodeConfig| -> Vec<Target> {
        node.addresses()
            .into_iter()
            .map(|address| Target {
                node: node.clone(),
                address: address.to_owned(),
            })
            .collect()
    };

    match selector {
        Selector::Address(address) => {
            let wanted = address.to_string();
            let node = nodes
                .into_iter()
                .find(|node| node.addresses().iter().any(|candidate| is_same_address(candidate, address)))
                .context(UnknownAddressSnafu { address: &wanted })?;
            Ok(vec![Target {
                node,
                address: wanted,
            }])
        }
        Selector::Hostname(hostname) => {
            let node = nodes
                .iter()
                .find(|node| &node.hostname == hostname)
                .context(UnknownHostnameSnafu { hostname })?;
            Ok(expand(node))
        }
        Selector::All if kind.is_cluster_wide() => {
            let node = nodes
                .iter()
                .find(|node| node.control_plane)
                .context(NoControlPlaneSnafu { kind })?;
            Ok(expand(node).into_iter().take(1).collect())
        }
        Selector::All => Ok(nodes.iter().flat_map(expand).collect()),
    }
}

fn is_same_address(candidate: &str, address: &IpAddr) -> bool {
    candidate.parse::<IpAddr>().is_ok_and(|candidate| candidate == *address)
}

fn kind_flags(
    cluster: &ClusterSpec,
    kind: CommandKind,
    node: &MergedNodeConfig,
    out_dir: &Path,
) -> Vec<String> {
    match kind {
        CommandKind::ApplyConfig => vec![format!(
            "--file={}",
            out_dir.join(cluster.artifact_file_name(&node.hostname)).display()
        )],
        CommandKind::Upgrade => {
            let repository = node
                .config
                .talos_image_url
                .as_deref()
                .unwrap_or(INSTALLER_IMAGE_REPOSITORY);
            vec![format!(
                "--image={repository}:{version}",
                version = cluster.talos_version
            )]
        }
        CommandKind::UpgradeK8s => vec![format!("--to={}", cluster.kubernetes_version)],
        CommandKind::Reset => vec!["--graceful=false".to_owned(), "--reboot".to_owned()],
        CommandKind::Bootstrap | CommandKind::Kubeconfig | CommandKind::Health => Vec::new(),
    }
}
