//! Finds every problem of a cluster description in one pass.
//!
//! [`validate`] never fails: problems are returned as [`Issue`]s, classified by their [`Kind`]
//! as errors (which block generating configurations) or warnings (which don't). Every check
//! runs regardless of the outcome of the others.
//!
//! Each issue carries the path of the offending element in the source document, like
//! `nodes[0].networkInterfaces[1].bond.interfaces`. Paths are built with a [`Validator`]
//! chain while walking the description.
use std::fmt::Display;

use indexmap::IndexMap;
use serde::Serialize;
use strum::{Display as StrumDisplay, EnumIter, IntoStaticStr};
use tracing::instrument;

use crate::config::{ClusterSpec, CniName, NodeSpec, merge::merge_node};

pub mod labels;
mod node;
pub mod syntax;
pub mod versions;

/// The category of an [`Issue`]. The names are stable and safe to match on.
#[derive(
    Clone, Copy, Debug, EnumIter, IntoStaticStr, PartialEq, Eq, Hash, Serialize, StrumDisplay,
)]
pub enum Kind {
    Required,
    InvalidVersion,
    UnsupportedVersion,
    UnknownVersion,
    InvalidEndpoint,
    InvalidDomain,
    InvalidCidr,
    InvalidAddress,
    InvalidHostname,
    InvalidInstallTarget,
    InvalidPatch,
    InvalidLabel,
    InvalidTemplate,
    InterfaceConflict,
    DuplicateHostname,
    DuplicateVolume,
    DuplicateExtension,
    DuplicateKernelModule,
    Deprecated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, StrumDisplay)]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl Kind {
    pub fn severity(self) -> Severity {
        match self {
            Self::Deprecated | Self::UnknownVersion => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

/// A dotted path into the source document, with 0-indexed list positions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FieldPath(String);

impl FieldPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            f.write_str("<root>")
        } else {
            f.write_str(&self.0)
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Segment<'a> {
    Field(&'a str),
    Index(usize),
    Key(&'a str),
}

/// Tracks where in the document a check currently is.
///
/// Validators form a chain through their parents, so creating one for a nested element is
/// cheap and the path is only rendered when an issue is reported.
#[derive(Clone, Copy, Debug, Default)]
pub struct Validator<'a> {
    segment: Option<Segment<'a>>,
    parent: Option<&'a Validator<'a>>,
}

impl<'a> Validator<'a> {
    pub fn root() -> Self {
        Self::default()
    }

    /// A `Validator` for the field `name` of the current object.
    pub fn field<'b>(&'b self, name: &'b str) -> Validator<'b> {
        self.child(Segment::Field(name))
    }

    /// A `Validator` for the item at `index` of the current list.
    pub fn index(&self, index: usize) -> Validator<'_> {
        self.child(Segment::Index(index))
    }

    /// A `Validator` for the entry `key` of the current map.
    pub fn key<'b>(&'b self, key: &'b str) -> Validator<'b> {
        self.child(Segment::Key(key))
    }

    fn child<'b>(&'b self, segment: Segment<'b>) -> Validator<'b> {
        Validator {
            segment: Some(segment),
            parent: Some(self),
        }
    }

    pub fn path(&self) -> FieldPath {
        let mut segments = Vec::new();
        let mut current = Some(self);
        while let Some(validator) = current {
            if let Some(segment) = validator.segment {
                segments.push(segment);
            }
            current = validator.parent;
        }

        let mut path = String::new();
        for segment in segments.iter().rev() {
            match segment {
                Segment::Field(name) => {
                    if !path.is_empty() {
                        path.push('.');
                    }
                    path.push_str(name);
                }
                Segment::Index(index) => path.push_str(&format!("[{index}]")),
                Segment::Key(key) => path.push_str(&format!("[{key:?}]")),
            }
        }
        FieldPath(path)
    }

    pub fn issue(&self, kind: Kind, message: impl Into<String>) -> Issue {
        Issue {
            kind,
            field: self.path(),
            message: message.into(),
        }
    }
}

/// A single problem of the cluster description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub kind: Kind,
    pub field: FieldPath,
    pub message: String,
}

impl Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{field}: {message} ({kind})",
            field = self.field,
            message = self.message,
            kind = self.kind
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
}

impl Report {
    /// Files `issue` as an error or a warning, depending on its kind.
    pub fn push(&mut self, issue: Issue) {
        match issue.kind.severity() {
            Severity::Error => self.errors.push(issue),
            Severity::Warning => self.warnings.push(issue),
        }
    }

    pub fn report(&mut self, validator: &Validator<'_>, kind: Kind, message: impl Into<String>) {
        self.push(validator.issue(kind, message));
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Every issue, errors first, grouped by the field they refer to in order of appearance.
    pub fn by_field(&self) -> IndexMap<&FieldPath, Vec<&Issue>> {
        let mut grouped: IndexMap<&FieldPath, Vec<&Issue>> = IndexMap::new();
        for issue in self.errors.iter().chain(&self.warnings) {
            grouped.entry(&issue.field).or_default().push(issue);
        }
        grouped
    }

    pub fn kinds(&self) -> impl Iterator<Item = Kind> + '_ {
        self.errors
            .iter()
            .chain(&self.warnings)
            .map(|issue| issue.kind)
    }
}

/// Checks `cluster`, returning every problem found.
#[instrument(skip_all, fields(cluster_name = %cluster.cluster_name))]
pub fn validate(cluster: &ClusterSpec) -> Report {
    let mut report = Report::default();
    let root = Validator::root();

    check_cluster(cluster, &root, &mut report);
    check_versions(cluster, &root, &mut report);

    for (field, defaults) in [
        ("controlPlane", &cluster.control_plane),
        ("worker", &cluster.worker),
    ] {
        node::check_node_configs(defaults, &root.field(field), &mut report);
    }

    let nodes = root.field("nodes");
    if cluster.nodes.is_empty() {
        report.report(&nodes, Kind::Required, "at least one node is required");
    }
    for (index, node) in cluster.nodes.iter().enumerate() {
        check_node(cluster, node, &nodes.index(index), &mut report);
    }
    check_duplicate_hostnames(cluster, &nodes, &mut report);

    tracing::debug!(
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        "validated cluster description"
    );
    report
}

fn check_cluster(cluster: &ClusterSpec, root: &Validator<'_>, report: &mut Report) {
    let cluster_name = root.field("clusterName");
    if cluster.cluster_name.trim().is_empty() {
        report.report(&cluster_name, Kind::Required, "a cluster name is required");
    }

    check_endpoint(&cluster.endpoint, &root.field("endpoint"), report);

    if let Err(error) = syntax::is_domain(&cluster.domain) {
        report.report(
            &root.field("domain"),
            Kind::InvalidDomain,
            format!("domain {domain:?} {error}", domain = cluster.domain),
        );
    }

    for (field, networks) in [
        ("clusterPodNets", &cluster.cluster_pod_nets),
        ("clusterSvcNets", &cluster.cluster_svc_nets),
    ] {
        let validator = root.field(field);
        for (index, network) in networks.iter().enumerate() {
            if let Err(error) = syntax::is_cidr(network) {
                report.report(
                    &validator.index(index),
                    Kind::InvalidCidr,
                    format!("network {network:?} {error}"),
                );
            }
        }
    }

    for (field, sans) in [
        ("additionalMachineCertSans", &cluster.additional_machine_cert_sans),
        ("additionalApiServerCertSans", &cluster.additional_api_server_cert_sans),
    ] {
        let validator = root.field(field);
        for (index, san) in sans.iter().enumerate() {
            if let Err(error) = syntax::is_address(san) {
                report.report(
                    &validator.index(index),
                    Kind::InvalidAddress,
                    format!("certificate SAN {san:?} {error}"),
                );
            }
        }
    }

    if let Some(cni) = &cluster.cni_config {
        if cni.name == CniName::Custom && cni.urls.is_empty() {
            report.report(
                &root.field("cniConfig").field("urls"),
                Kind::Required,
                "a custom CNI requires at least one manifest URL",
            );
        }
    }

    if cluster.allow_scheduling_on_masters.is_some() {
        report.report(
            &root.field("allowSchedulingOnMasters"),
            Kind::Deprecated,
            "allowSchedulingOnMasters is deprecated, use allowSchedulingOnControlPlanes instead",
        );
    }
}

fn check_endpoint(endpoint: &str, validator: &Validator<'_>, report: &mut Report) {
    if endpoint.trim().is_empty() {
        report.report(validator, Kind::Required, "a control plane endpoint is required");
        return;
    }

    let problem = match url::Url::parse(endpoint) {
        Err(error) => Some(format!("is not a URL: {error}")),
        Ok(url) if url.scheme() != "https" => Some(format!(
            "must use the https scheme, not {scheme:?}",
            scheme = url.scheme()
        )),
        Ok(url) if url.host_str().is_none_or(str::is_empty) => Some("has no host".to_owned()),
        Ok(url) if url.port().is_none() => {
            Some("has no explicit port, e.g. https://10.0.0.10:6443".to_owned())
        }
        Ok(_) => None,
    };

    if let Some(problem) = problem {
        report.report(
            validator,
            Kind::InvalidEndpoint,
            format!("endpoint {endpoint:?} {problem}"),
        );
    }
}

fn check_versions(cluster: &ClusterSpec, root: &Validator<'_>, report: &mut Report) {
    let talos_field = root.field("talosVersion");
    let kubernetes_field = root.field("kubernetesVersion");

    let talos = versions::parse_version(&cluster.talos_version);
    let kubernetes = versions::parse_version(&cluster.kubernetes_version);

    if let Err(error) = &talos {
        report.report(&talos_field, Kind::InvalidVersion, error.to_string());
    }
    if let Err(error) = &kubernetes {
        report.report(&kubernetes_field, Kind::InvalidVersion, error.to_string());
    }

    let (Ok(talos), Ok(kubernetes)) = (talos, kubernetes) else {
        return;
    };

    match versions::compatibility(&talos, &kubernetes) {
        versions::Compatibility::Supported => {}
        versions::Compatibility::Unsupported { supported } => report.report(
            &kubernetes_field,
            Kind::UnsupportedVersion,
            format!(
                "Kubernetes {kubernetes} is not supported by Talos {talos}, which supports \
                 Kubernetes 1.{start} to 1.{end}",
                start = supported.start(),
                end = supported.end(),
            ),
        ),
        versions::Compatibility::Unknown => report.report(
            &talos_field,
            Kind::UnknownVersion,
            format!("Talos {talos} is unknown, Kubernetes compatibility can not be checked"),
        ),
    }
}

fn check_node(cluster: &ClusterSpec, node: &NodeSpec, validator: &Validator<'_>, report: &mut Report) {
    let hostname = validator.field("hostname");
    if node.hostname.trim().is_empty() {
        report.report(&hostname, Kind::Required, "a hostname is required");
    } else if let Err(error) = syntax::is_rfc_1123_subdomain(&node.hostname) {
        report.report(
            &hostname,
            Kind::InvalidHostname,
            format!("hostname {name:?} {error}", name = node.hostname),
        );
    }

    let ip_address = validator.field("ipAddress");
    let addresses = node.addresses();
    if addresses.is_empty() {
        report.report(&ip_address, Kind::Required, "an IP address or DNS name is required");
    }
    for address in addresses {
        if let Err(error) = syntax::is_address(address) {
            report.report(
                &ip_address,
                Kind::InvalidAddress,
                format!("address {address:?} {error}"),
            );
        }
    }

    // The install target may come from the role defaults
    let merged = merge_node(node.clone(), cluster.role_defaults(node.role()));
    match (&merged.config.install_disk, &merged.config.install_disk_selector) {
        (None, None) => report.report(
            &validator.field("installDisk"),
            Kind::InvalidInstallTarget,
            "one of installDisk or installDiskSelector is required",
        ),
        (Some(_), Some(_)) => report.report(
            &validator.field("installDiskSelector"),
            Kind::InvalidInstallTarget,
            "installDisk and installDiskSelector are mutually exclusive",
        ),
        _ => {}
    }

    node::check_node_configs(&node.config, validator, report);
}

fn check_duplicate_hostnames(cluster: &ClusterSpec, nodes: &Validator<'_>, report: &mut Report) {
    for (hostname, indices) in node::group_by_name(cluster.nodes.iter().map(|node| node.hostname.as_str())) {
        if let [first, second, ..] = indices[..] {
            report.report(
                &nodes.index(second).field("hostname"),
                Kind::DuplicateHostname,
                format!("hostname {hostname:?} is already used by nodes[{first}]"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;
    use crate::config::loader::parse_cluster;

    pub(super) fn load(yaml: &str) -> ClusterSpec {
        parse_cluster(yaml, std::path::Path::new("/cluster")).unwrap()
    }

    pub(super) const VALID: &str = indoc! {"
        clusterName: lab
        endpoint: https://10.0.0.10:6443
        nodes:
          - hostname: cp-1
            ipAddress: 10.0.0.11
            controlPlane: true
            installDisk: /dev/sda
          - hostname: worker-1
            ipAddress: 10.0.0.21, worker-1.lab
            installDiskSelector:
              size: '>= 100GB'
    "};

    #[test]
    fn valid_cluster_has_no_issues() {
        let report = validate(&load(VALID));
        assert_eq!(report, Report::default());
    }

    #[test]
    fn collects_every_problem() {
        let report = validate(&load(indoc! {"
            endpoint: http://10.0.0.10
            domain: -invalid
            clusterPodNets: [10.244.0.0/99]
            nodes:
              - ipAddress: 10.0.0.11
                controlPlane: true
        "}));

        let kinds: Vec<_> = report.errors.iter().map(|issue| (issue.kind, issue.field.as_str())).collect();
        assert_eq!(
            kinds,
            vec![
                (Kind::Required, "clusterName"),
                (Kind::InvalidEndpoint, "endpoint"),
                (Kind::InvalidDomain, "domain"),
                (Kind::InvalidCidr, "clusterPodNets[0]"),
                (Kind::Required, "nodes[0].hostname"),
                (Kind::InvalidInstallTarget, "nodes[0].installDisk"),
            ]
        );
    }

    #[test]
    fn no_nodes_is_an_error() {
        let report = validate(&load("clusterName: lab\nendpoint: https://10.0.0.10:6443\n"));
        assert_eq!(report.kinds().collect::<Vec<_>>(), vec![Kind::Required]);
        assert_eq!(report.errors[0].field.as_str(), "nodes");
    }

    #[rstest]
    #[case("https://10.0.0.10:6443", None)]
    #[case("https://cp.lab.example.com:6443", None)]
    #[case("", Some(Kind::Required))]
    #[case("http://10.0.0.10:6443", Some(Kind::InvalidEndpoint))]
    #[case("https://10.0.0.10", Some(Kind::InvalidEndpoint))]
    #[case("10.0.0.10:6443", Some(Kind::InvalidEndpoint))]
    fn endpoint(#[case] value: &str, #[case] expected: Option<Kind>) {
        let mut report = Report::default();
        check_endpoint(value, &Validator::root().field("endpoint"), &mut report);
        assert_eq!(report.kinds().next(), expected);
    }

    #[rstest]
    #[case("v1.9.5", "v1.32.3", vec![])]
    #[case("v1.9.5", "v1.34.0", vec![(Kind::UnsupportedVersion, "kubernetesVersion")])]
    #[case("v1.99.0", "v1.32.3", vec![(Kind::UnknownVersion, "talosVersion")])]
    #[case("1.9", "latest", vec![
        (Kind::InvalidVersion, "talosVersion"),
        (Kind::InvalidVersion, "kubernetesVersion"),
    ])]
    fn versions(#[case] talos: &str, #[case] kubernetes: &str, #[case] expected: Vec<(Kind, &str)>) {
        let cluster = ClusterSpec {
            talos_version: talos.to_owned(),
            kubernetes_version: kubernetes.to_owned(),
            ..ClusterSpec::default()
        };
        let mut report = Report::default();
        check_versions(&cluster, &Validator::root(), &mut report);

        let actual: Vec<_> = report
            .errors
            .iter()
            .chain(&report.warnings)
            .map(|issue| (issue.kind, issue.field.as_str()))
            .collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn unknown_version_is_only_a_warning() {
        let cluster = load(&VALID.replace("clusterName: lab", "clusterName: lab\ntalosVersion: v1.42.0"));
        let report = validate(&cluster);

        assert!(!report.has_errors());
        assert_eq!(report.warnings[0].kind, Kind::UnknownVersion);
    }

    #[test]
    fn deprecated_fields_are_warnings() {
        let cluster = load(&VALID.replace(
            "clusterName: lab",
            "clusterName: lab\nallowSchedulingOnMasters: true",
        ));
        let report = validate(&cluster);

        assert!(!report.has_errors());
        assert_eq!(
            report.warnings,
            vec![Issue {
                kind: Kind::Deprecated,
                field: FieldPath("allowSchedulingOnMasters".to_owned()),
                message: "allowSchedulingOnMasters is deprecated, use allowSchedulingOnControlPlanes instead".to_owned(),
            }]
        );
    }

    #[test]
    fn install_target_from_role_defaults() {
        let cluster = load(indoc! {"
            clusterName: lab
            endpoint: https://10.0.0.10:6443
            worker:
              installDisk: /dev/sda
            nodes:
              - hostname: worker-1
                ipAddress: 10.0.0.21
              - hostname: worker-2
                ipAddress: 10.0.0.22
                installDiskSelector:
                  model: Samsung*
        "});
        let report = validate(&cluster);

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, Kind::InvalidInstallTarget);
        assert_eq!(report.errors[0].field.as_str(), "nodes[1].installDiskSelector");
    }

    #[test]
    fn duplicate_hostnames() {
        let cluster = load(&format!(
            "{VALID}  - hostname: cp-1\n    ipAddress: 10.0.0.12\n    controlPlane: true\n    installDisk: /dev/sda\n"
        ));
        let report = validate(&cluster);

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, Kind::DuplicateHostname);
        assert_eq!(report.errors[0].field.as_str(), "nodes[2].hostname");
    }

    #[test]
    fn field_paths() {
        let root = Validator::root();
        let nodes = root.field("nodes");
        let node = nodes.index(0);
        let interfaces = node.field("networkInterfaces");
        let interface = interfaces.index(1);
        let bond = interface.field("bond");
        assert_eq!(
            bond.field("interfaces").path().as_str(),
            "nodes[0].networkInterfaces[1].bond.interfaces"
        );

        let labels = node.field("nodeLabels");
        assert_eq!(
            labels.key("topology.kubernetes.io/zone").path().as_str(),
            r#"nodes[0].nodeLabels["topology.kubernetes.io/zone"]"#
        );
        assert_eq!(root.path().to_string(), "<root>");
    }

    #[test]
    fn groups_issues_by_field() {
        let mut report = Report::default();
        let root = Validator::root();
        report.report(&root.field("a"), Kind::Required, "one");
        report.report(&root.field("b"), Kind::Deprecated, "two");
        report.report(&root.field("a"), Kind::InvalidCidr, "three");

        let grouped = report.by_field();
        let fields: Vec<_> = grouped.keys().map(|field| field.as_str()).collect();
        assert_eq!(fields, vec!["a", "b"]);
        assert_eq!(grouped[0].len(), 2);
    }
}
