//! Compiles every node and writes the results.
//!
//! Nodes are compiled one at a time. A node that fails to synthesize or patch is recorded as
//! a [`NodeFailure`] and the remaining nodes are still compiled, so one run reports every
//! broken node. Artifacts are written whole (after creating the target directory), one file
//! per node plus the client configuration.
use std::{
    fmt::Display,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde_json::Value;
use snafu::{ResultExt, Snafu};
use talgen_shared::yaml;
use tracing::instrument;

use crate::{
    config::ClusterSpec,
    constants::{CLIENT_CONFIG_FILE_NAME, GITIGNORE_FILE_NAME},
    patch::{self, PatchSet},
    secret::Decryptor,
    secrets::SecretsBundle,
    substitution::SubstitutionContext,
    synthesis::{self, MachineConfigGenerator},
};

pub mod client;

pub use client::{ClientConfig, ClientContext};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create output directory {path:?}"))]
    CreateOutputDirectory {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to serialize {file_name}"))]
    SerializeArtifact {
        source: yaml::Error,
        file_name: String,
    },

    #[snafu(display("failed to write {path:?}"))]
    WriteArtifact {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to read {path:?}"))]
    ReadGitignore {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to update {path:?}"))]
    WriteGitignore {
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Why a single node could not be compiled.
#[derive(Debug, Snafu)]
pub enum NodeError {
    #[snafu(display("failed to synthesize the machine configuration"))]
    Synthesize { source: synthesis::Error },

    #[snafu(display("failed to apply patches"))]
    ApplyPatches { source: patch::Error },
}

#[derive(Debug)]
pub struct NodeFailure {
    /// Position of the node in `nodes`.
    pub index: usize,
    pub hostname: String,
    pub error: NodeError,
}

impl Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "nodes[{index}] ({hostname}): {error}",
            index = self.index,
            hostname = self.hostname,
            error = snafu::Report::from_error(&self.error),
        )
    }
}

/// The compiled documents of one node.
#[derive(Clone, Debug, PartialEq)]
pub struct Artifact {
    pub hostname: String,
    pub file_name: String,

    /// The machine configuration, followed by additional documents.
    pub documents: Vec<Value>,
}

impl Artifact {
    pub fn machine_config(&self) -> Option<&Value> {
        self.documents.first()
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        let mut buffer = Vec::new();
        yaml::serialize_documents(&self.documents, &mut buffer).context(SerializeArtifactSnafu {
            file_name: &self.file_name,
        })?;
        // serde_yaml only ever produces UTF-8
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[derive(Debug)]
pub struct CompileReport {
    pub artifacts: Vec<Artifact>,
    pub failures: Vec<NodeFailure>,
    pub client_config: ClientConfig,
}

impl CompileReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Writes every compiled artifact and the client configuration into `dir`, returning the
    /// written paths.
    #[instrument(skip(self))]
    pub fn write_artifacts(&self, dir: &Path) -> Result<Vec<PathBuf>, Error> {
        std::fs::create_dir_all(dir).context(CreateOutputDirectorySnafu { path: dir })?;

        let mut written = Vec::with_capacity(self.artifacts.len() + 1);
        for artifact in &self.artifacts {
            let path = dir.join(&artifact.file_name);
            write_file(&path, &artifact.to_yaml()?)?;
            tracing::info!(hostname = %artifact.hostname, ?path, "wrote machine configuration");
            written.push(path);
        }

        let client_config = yaml::to_string(&self.client_config, yaml::SerializeOptions::default())
            .context(SerializeArtifactSnafu {
                file_name: CLIENT_CONFIG_FILE_NAME,
            })?;
        let path = dir.join(CLIENT_CONFIG_FILE_NAME);
        write_file(&path, &client_config)?;
        tracing::info!(?path, "wrote client configuration");
        written.push(path);

        Ok(written)
    }

    /// The file names of everything [`Self::write_artifacts`] writes.
    pub fn file_names(&self) -> Vec<&str> {
        self.artifacts
            .iter()
            .map(|artifact| artifact.file_name.as_str())
            .chain([CLIENT_CONFIG_FILE_NAME])
            .collect()
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context(CreateOutputDirectorySnafu { path: parent })?;
    }
    std::fs::write(path, contents).context(WriteArtifactSnafu { path })
}

/// Settings of one compilation run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompileOptions {
    pub out_dir: PathBuf,

    /// Add the generated files to the `.gitignore` of [`Self::out_dir`].
    pub update_gitignore: bool,
}

/// Compiles the nodes of cluster descriptions, sharing one secrets bundle.
pub struct Compiler<'a> {
    bundle: Arc<SecretsBundle>,
    generator: &'a dyn MachineConfigGenerator,
    decryptor: &'a dyn Decryptor,
    context: SubstitutionContext,
}

impl<'a> Compiler<'a> {
    pub fn new(
        bundle: Arc<SecretsBundle>,
        generator: &'a dyn MachineConfigGenerator,
        decryptor: &'a dyn Decryptor,
        context: SubstitutionContext,
    ) -> Self {
        Self {
            bundle,
            generator,
            decryptor,
            context,
        }
    }

    /// Compiles every node of `cluster`. Failing nodes don't stop the others.
    #[instrument(skip_all, fields(cluster_name = %cluster.cluster_name))]
    pub fn compile(&self, cluster: &ClusterSpec) -> CompileReport {
        let mut artifacts = Vec::new();
        let mut failures = Vec::new();

        for (index, node) in cluster.merged_nodes().enumerate() {
            let hostname = node.hostname.clone();
            match self.compile_node(&node, cluster) {
                Ok(documents) => artifacts.push(Artifact {
                    file_name: cluster.artifact_file_name(&hostname),
                    hostname,
                    documents,
                }),
                Err(error) => {
                    tracing::error!(
                        index,
                        %hostname,
                        error = &error as &dyn std::error::Error,
                        "failed to compile node"
                    );
                    failures.push(NodeFailure {
                        index,
                        hostname,
                        error,
                    });
                }
            }
        }

        tracing::info!(
            compiled = artifacts.len(),
            failed = failures.len(),
            "compiled cluster"
        );
        CompileReport {
            artifacts,
            failures,
            client_config: ClientConfig::from_bundle(cluster, &self.bundle),
        }
    }

    fn compile_node(
        &self,
        node: &crate::config::merge::MergedNodeConfig,
        cluster: &ClusterSpec,
    ) -> Result<Vec<Value>, NodeError> {
        let synthesis::NodeDocuments {
            mut machine_config,
            extra,
        } = synthesis::synthesize(node, cluster, &self.bundle, self.generator)
            .context(SynthesizeSnafu)?;

        // `${VAR:=default}` assignments in patch files stay local to the node
        let mut context = self.context.clone();
        let patches = PatchSet::for_node(node);
        patch::apply(&mut machine_config, &patches, &mut context, self.decryptor)
            .context(ApplyPatchesSnafu)?;

        let mut documents = vec![machine_config];
        documents.extend(extra);
        Ok(documents)
    }
}

/// Appends the `names` missing from the `.gitignore` in `dir`, returning how many were added.
#[instrument]
pub fn update_gitignore(dir: &Path, names: &[&str]) -> Result<usize, Error> {
    let path = dir.join(GITIGNORE_FILE_NAME);
    let existing = match std::fs::read_to_string(&path) {
        Ok(existing) => existing,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(error) => return Err(error).context(ReadGitignoreSnafu { path }),
    };

    let mut present: Vec<&str> = existing.lines().map(str::trim).collect();
    let mut contents = existing.clone();
    let mut added = 0;
    for name in names {
        if present.contains(name) {
            continue;
        }
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(name);
        contents.push('\n');
        present.push(*name);
        added += 1;
    }

    if added > 0 {
        std::fs::create_dir_all(dir).context(CreateOutputDirectorySnafu { path: dir })?;
        std::fs::write(&path, contents).context(WriteGitignoreSnafu { path })?;
        tracing::debug!(added, "updated .gitignore");
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::{
        config::loader::parse_cluster,
        secret::NoDecryptor,
        secrets::tests::test_bundle,
        synthesis::V1Alpha1Generator,
    };

    fn compile(yaml: &str) -> CompileReport {
        let cluster = parse_cluster(yaml, Path::new("/cluster")).unwrap();
        let compiler = Compiler::new(
            test_bundle().freeze(),
            &V1Alpha1Generator,
            &NoDecryptor,
            SubstitutionContext::new(),
        );
        compiler.compile(&cluster)
    }

    const CLUSTER: &str = indoc! {"
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
            patches:
              - '@/does/not/exist.yaml'
          - hostname: worker-2
            ipAddress: 10.0.0.22
            installDisk: /dev/sda
    "};

    #[test]
    fn failing_node_does_not_stop_the_others() {
        let report = compile(CLUSTER);

        let compiled: Vec<_> = report.artifacts.iter().map(|artifact| artifact.file_name.as_str()).collect();
        assert_eq!(compiled, vec!["lab-cp-1.yaml", "lab-worker-2.yaml"]);

        assert!(!report.is_success());
        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!((failure.index, failure.hostname.as_str()), (1, "worker-1"));
        assert!(matches!(failure.error, NodeError::ApplyPatches { .. }));
        assert!(failure.to_string().starts_with("nodes[1] (worker-1): "));
    }

    #[test]
    fn patch_variables_do_not_leak_between_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let assigning = dir.path().join("assigning.yaml");
        let reading = dir.path().join("reading.yaml");
        std::fs::write(&assigning, "machine:\n  sysctls:\n    a: \"${SHARED:=from-sibling}\"\n").unwrap();
        std::fs::write(&reading, "machine:\n  sysctls:\n    b: \"$SHARED\"\n").unwrap();

        let node = |hostname: &str, address: &str, patch: &Path| {
            format!(
                "  - hostname: {hostname}\n    ipAddress: {address}\n    installDisk: /dev/sda\n    \
                 patches:\n      - '@{patch}'\n",
                patch = patch.display()
            )
        };
        let worker_a = node("worker-a", "10.0.0.21", &assigning);
        let worker_b = node("worker-b", "10.0.0.22", &reading);
        let header = "clusterName: lab\nendpoint: https://10.0.0.10:6443\nnodes:\n";

        for nodes in [[&worker_a, &worker_b], [&worker_b, &worker_a]] {
            let report = compile(&format!("{header}{}{}", nodes[0], nodes[1]));

            let failed: Vec<_> = report.failures.iter().map(|failure| failure.hostname.as_str()).collect();
            assert_eq!(failed, vec!["worker-b"]);
            let compiled: Vec<_> = report.artifacts.iter().map(|artifact| artifact.hostname.as_str()).collect();
            assert_eq!(compiled, vec!["worker-a"]);
            assert_eq!(
                report.artifacts[0].documents[0]["machine"]["sysctls"]["a"],
                "from-sibling"
            );
        }
    }

    #[test]
    fn writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("clusterconfig");
        let report = compile(CLUSTER);

        let written = report.write_artifacts(&out_dir).unwrap();
        assert_eq!(written.len(), 3);

        let text = std::fs::read_to_string(out_dir.join("lab-cp-1.yaml")).unwrap();
        let documents = yaml::parse_documents(&text).unwrap();
        assert_eq!(documents, report.artifacts[0].documents);

        let client_config: ClientConfig =
            serde_yaml::from_str(&std::fs::read_to_string(out_dir.join("talosconfig")).unwrap()).unwrap();
        assert_eq!(client_config, report.client_config);
    }

    #[test]
    fn multi_document_artifacts() {
        let report = compile(indoc! {"
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
        "});

        let text = report.artifacts[0].to_yaml().unwrap();
        assert!(text.starts_with("version: v1alpha1\n"));
        assert!(text.contains("\n---\napiVersion: v1alpha1\nkind: UserVolumeConfig\n"));
        assert_eq!(yaml::parse_documents(&text).unwrap().len(), 2);
    }

    #[test]
    fn gitignore_is_only_appended() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "*.swp\nlab-cp-1.yaml").unwrap();

        let names = ["lab-cp-1.yaml", "lab-worker-1.yaml", "talosconfig"];
        assert_eq!(update_gitignore(dir.path(), &names).unwrap(), 2);
        assert_eq!(update_gitignore(dir.path(), &names).unwrap(), 0);

        let contents = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(contents, "*.swp\nlab-cp-1.yaml\nlab-worker-1.yaml\ntalosconfig\n");
    }
}
