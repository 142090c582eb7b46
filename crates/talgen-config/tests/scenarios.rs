use std::path::{Path, PathBuf};

use indoc::indoc;
use serde_json::Value;
use talgen_config::{
    config::loader::Loader,
    emission::{ClientConfig, CompileReport, Compiler},
    secret::NoDecryptor,
    secrets::SecretsBundle,
    shared::yaml,
    substitution::SubstitutionContext,
    synthesis::V1Alpha1Generator,
    validation::{self, Kind},
};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Loads `talconfig` from `dir` and compiles it against the fixture bundle.
fn compile(dir: &Path, talconfig: &str) -> CompileReport {
    let path = dir.join("talconfig.yaml");
    std::fs::write(&path, talconfig).unwrap();

    let mut loader = Loader::new(&NoDecryptor, SubstitutionContext::new());
    let cluster = loader.load_cluster(&path).unwrap();
    let report = validation::validate(&cluster);
    assert!(!report.has_errors(), "{:?}", report.errors);

    let bundle = SecretsBundle::from_file(&fixture("secrets.yaml"), &mut loader).unwrap();
    let compiler = Compiler::new(
        bundle.freeze(),
        &V1Alpha1Generator,
        &NoDecryptor,
        loader.into_context(),
    );
    compiler.compile(&cluster)
}

fn machine_config<'a>(report: &'a CompileReport, hostname: &str) -> &'a Value {
    report
        .artifacts
        .iter()
        .find(|artifact| artifact.hostname == hostname)
        .and_then(|artifact| artifact.machine_config())
        .unwrap()
}

#[test]
fn control_plane_and_worker_share_cluster_identity() {
    let dir = tempfile::tempdir().unwrap();
    let report = compile(dir.path(), indoc! {"
        clusterName: lab
        endpoint: https://10.0.0.10:6443
        nodes:
          - hostname: cp-1
            ipAddress: 10.0.0.11
            controlPlane: true
            installDisk: /dev/sda
          - hostname: worker-1
            ipAddress: 10.0.0.21
            installDisk: /dev/sda
    "});
    assert!(report.is_success());

    let control_plane = machine_config(&report, "cp-1");
    let worker = machine_config(&report, "worker-1");

    assert_eq!(control_plane["machine"]["type"], "controlplane");
    assert_eq!(worker["machine"]["type"], "worker");
    assert_eq!(control_plane["machine"]["network"]["hostname"], "cp-1");
    assert_eq!(worker["machine"]["network"]["hostname"], "worker-1");

    let shared_paths: [&[&str]; 7] = [
        &["cluster", "id"],
        &["cluster", "secret"],
        &["cluster", "token"],
        &["cluster", "controlPlane", "endpoint"],
        &["machine", "token"],
        &["machine", "ca", "crt"],
        &["machine", "install", "image"],
    ];
    for shared in shared_paths {
        let lookup = |document: &Value| {
            shared
                .iter()
                .fold(document.clone(), |value, key| value[key].clone())
        };
        assert_eq!(lookup(control_plane), lookup(worker), "{shared:?}");
    }
    assert_eq!(worker["machine"]["ca"]["key"], "");
    assert!(worker["cluster"].get("etcd").is_none());
    assert!(control_plane["cluster"].get("etcd").is_some());

    let written = report.write_artifacts(dir.path()).unwrap();
    assert_eq!(written.len(), 3);

    let client_config = ClientConfig::read(&dir.path().join("talosconfig"))
        .unwrap()
        .unwrap();
    let context = client_config.active_context().unwrap();
    assert_eq!(context.ca, control_plane["machine"]["ca"]["crt"]);
    assert_eq!(context.endpoints, vec!["10.0.0.11"]);
    assert_eq!(context.nodes, vec!["10.0.0.11", "10.0.0.21"]);

    let reparsed =
        yaml::parse_documents(std::fs::read_to_string(dir.path().join("lab-cp-1.yaml")).unwrap())
            .unwrap();
    assert_eq!(&reparsed[0], control_plane);
}

#[test]
fn node_patches_win_over_role_patches() {
    let dir = tempfile::tempdir().unwrap();
    let report = compile(dir.path(), indoc! {"
        clusterName: lab
        endpoint: https://10.0.0.10:6443
        worker:
          patches:
            - |-
              machine:
                network:
                  mtu: 1500
                  kubespan:
                    enabled: true
        nodes:
          - hostname: worker-1
            ipAddress: 10.0.0.21
            installDisk: /dev/sda
            patches:
              - |-
                machine:
                  network:
                    mtu: 9000
          - hostname: worker-2
            ipAddress: 10.0.0.22
            installDisk: /dev/sda
    "});
    assert!(report.is_success());

    let tuned = machine_config(&report, "worker-1");
    assert_eq!(tuned["machine"]["network"]["mtu"], 9000);
    assert_eq!(tuned["machine"]["network"]["kubespan"]["enabled"], true);
    assert_eq!(machine_config(&report, "worker-2")["machine"]["network"]["mtu"], 1500);
}

#[test]
fn node_inline_patch_applies_after_role_inline_patch() {
    let dir = tempfile::tempdir().unwrap();
    let report = compile(dir.path(), indoc! {"
        clusterName: lab
        endpoint: https://10.0.0.10:6443
        worker:
          inlinePatch:
            - machine:
                network:
                  mtu: 1500
        nodes:
          - hostname: worker-1
            ipAddress: 10.0.0.21
            installDisk: /dev/sda
            inlinePatch:
              - machine:
                  network:
                    mtu: 9000
          - hostname: worker-2
            ipAddress: 10.0.0.22
            installDisk: /dev/sda
    "});
    assert!(report.is_success());

    assert_eq!(machine_config(&report, "worker-1")["machine"]["network"]["mtu"], 9000);
    assert_eq!(machine_config(&report, "worker-2")["machine"]["network"]["mtu"], 1500);

    let emitted = yaml::parse_documents(report.artifacts[0].to_yaml().unwrap()).unwrap();
    assert_eq!(emitted[0]["machine"]["network"]["mtu"], 9000);
}

#[test]
fn patch_files_are_substituted_and_json_patches_apply_in_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("patches")).unwrap();
    std::fs::write(
        dir.path().join("patches/sysctls.yaml"),
        indoc! {"
            - op: add
              path: /machine/sysctls
              value:
                vm.nr_hugepages: \"${HUGEPAGES:=128}\"
            - op: replace
              path: /machine/sysctls/vm.nr_hugepages
              value: \"256\"
        "},
    )
    .unwrap();

    let report = compile(dir.path(), indoc! {"
        clusterName: lab
        endpoint: https://10.0.0.10:6443
        nodes:
          - hostname: cp-1
            ipAddress: 10.0.0.11
            controlPlane: true
            installDisk: /dev/sda
            patches:
              - '@./patches/sysctls.yaml'
    "});
    assert!(report.is_success());
    assert_eq!(
        machine_config(&report, "cp-1")["machine"]["sysctls"]["vm.nr_hugepages"],
        "256"
    );
}

#[test]
fn missing_patch_file_only_fails_its_node() {
    let dir = tempfile::tempdir().unwrap();
    let report = compile(dir.path(), indoc! {"
        clusterName: lab
        endpoint: https://10.0.0.10:6443
        nodes:
          - hostname: cp-1
            ipAddress: 10.0.0.11
            controlPlane: true
            installDisk: /dev/sda
            patches:
              - '@./missing.yaml'
          - hostname: worker-1
            ipAddress: 10.0.0.21
            installDisk: /dev/sda
    "});

    assert!(!report.is_success());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].hostname, "cp-1");
    assert!(report.failures[0].to_string().starts_with("nodes[0] (cp-1): "));
    assert_eq!(report.file_names(), vec!["lab-worker-1.yaml", "talosconfig"]);

    report.write_artifacts(dir.path()).unwrap();
    assert!(dir.path().join("lab-worker-1.yaml").exists());
    assert!(!dir.path().join("lab-cp-1.yaml").exists());
}

#[test]
fn compiling_twice_is_deterministic() {
    let talconfig = indoc! {"
        clusterName: lab
        endpoint: https://10.0.0.10:6443
        controlPlane:
          nodeLabels:
            rack: '{{ .hostname }}-rack'
        nodes:
          - hostname: cp-1
            ipAddress: 10.0.0.11
            controlPlane: true
            installDisk: /dev/sda
            nodeLabels:
              zone: a
    "};

    let first = compile(tempfile::tempdir().unwrap().path(), talconfig);
    let second = compile(tempfile::tempdir().unwrap().path(), talconfig);
    assert_eq!(
        first.artifacts[0].to_yaml().unwrap(),
        second.artifacts[0].to_yaml().unwrap()
    );

    let labels = &machine_config(&first, "cp-1")["machine"]["nodeLabels"];
    assert_eq!(labels["rack"], "cp-1-rack");
    assert_eq!(labels["zone"], "a");
}

#[test]
fn invalid_cluster_is_reported_before_compiling() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("talconfig.yaml");
    std::fs::write(&path, indoc! {"
        clusterName: lab
        endpoint: https://10.0.0.10:6443
        nodes:
          - hostname: cp-1
            ipAddress: 10.0.0.11
            controlPlane: true
            installDisk: sda
          - hostname: cp-1
            ipAddress: 10.0.0.12
            installDisk: /dev/sda
    "})
    .unwrap();

    let cluster = Loader::new(&NoDecryptor, SubstitutionContext::new())
        .load_cluster(&path)
        .unwrap();
    let report = validation::validate(&cluster);

    let kinds: Vec<Kind> = report.kinds().collect();
    assert!(kinds.contains(&Kind::DuplicateHostname), "{kinds:?}");
    assert!(kinds.contains(&Kind::InvalidInstallTarget), "{kinds:?}");
}
