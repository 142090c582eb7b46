//! Reads cluster descriptions and the documents they reference.
//!
//! Every document goes through the same steps: read, decrypt if encrypted, strip comments,
//! substitute variables. Cluster descriptions are then parsed, get their relative file
//! references resolved and are deserialized into a [`ClusterSpec`].
use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};
use tracing::instrument;

use crate::{
    config::ClusterSpec,
    secret::{self, Decryptor},
    substitution::{self, SubstitutionContext},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read {path:?}"))]
    ReadDocument {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to decrypt {path:?}"))]
    UnwrapDocument {
        source: secret::Error,
        path: PathBuf,
    },

    #[snafu(display("{path:?} is not valid UTF-8"))]
    DocumentNotUtf8 {
        source: std::string::FromUtf8Error,
        path: PathBuf,
    },

    #[snafu(display("failed to substitute variables in {path:?}"))]
    SubstituteDocument {
        source: substitution::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to deserialize the cluster description in {path:?}"))]
    DeserializeCluster {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to resolve the directory of {path:?}"))]
    ResolveBaseDirectory {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to load env file"))]
    LoadEnvFile { source: substitution::Error },
}

/// Loads documents, sharing one [`SubstitutionContext`] across all of them.
pub struct Loader<'a> {
    decryptor: &'a dyn Decryptor,
    context: SubstitutionContext,
}

impl<'a> Loader<'a> {
    pub fn new(decryptor: &'a dyn Decryptor, context: SubstitutionContext) -> Self {
        Self { decryptor, context }
    }

    /// Makes the variables of the env file at `path` available, without overriding variables
    /// which are already defined.
    pub fn with_env_file(mut self, path: &Path) -> Result<Self, Error> {
        self.context
            .load_env_file(path)
            .context(LoadEnvFileSnafu)?;
        Ok(self)
    }

    pub fn decryptor(&self) -> &'a dyn Decryptor {
        self.decryptor
    }

    pub fn context(&self) -> &SubstitutionContext {
        &self.context
    }

    /// The variables after loading, including assignments made by `${VAR:=default}`.
    pub fn into_context(self) -> SubstitutionContext {
        self.context
    }

    /// Reads the document at `path`, decrypting it and substituting variables.
    #[instrument(skip(self))]
    pub fn read_document(&mut self, path: &Path) -> Result<String, Error> {
        let raw = std::fs::read(path).context(ReadDocumentSnafu { path })?;
        read_bytes(raw, path, self.decryptor, &mut self.context)
    }

    /// Loads the cluster description at `path`.
    #[instrument(skip(self))]
    pub fn load_cluster(&mut self, path: &Path) -> Result<ClusterSpec, Error> {
        let text = self.read_document(path)?;
        let base_dir = std::path::absolute(path)
            .context(ResolveBaseDirectorySnafu { path })?
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let cluster = parse_cluster(&text, &base_dir).context(DeserializeClusterSnafu { path })?;
        tracing::info!(
            cluster_name = %cluster.cluster_name,
            nodes = cluster.nodes.len(),
            "loaded cluster description"
        );
        Ok(cluster)
    }
}

/// Decrypts, strips comments and substitutes variables in `raw`, the contents of `path`.
pub fn read_bytes(
    raw: Vec<u8>,
    path: &Path,
    decryptor: &dyn Decryptor,
    context: &mut SubstitutionContext,
) -> Result<String, Error> {
    let plain = secret::unwrap(raw, decryptor).context(UnwrapDocumentSnafu { path })?;
    let text = String::from_utf8(plain).context(DocumentNotUtf8Snafu { path })?;
    let text = substitution::strip_comments(&text);
    substitution::substitute(&text, context).context(SubstituteDocumentSnafu { path })
}

/// Parses an already substituted cluster description, resolving file references relative to
/// `base_dir`.
pub fn parse_cluster(text: &str, base_dir: &Path) -> Result<ClusterSpec, serde_yaml::Error> {
    let mut tree: serde_yaml::Value = serde_yaml::from_str(text)?;
    substitution::resolve_relative_paths(&mut tree, base_dir);

    let mut cluster: ClusterSpec = serde_yaml::from_value(tree)?;
    cluster.apply_defaults();
    Ok(cluster)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::{secret::NoDecryptor, secret::tests::FixedDecryptor};

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_substituted_cluster() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "talenv.yaml", "ENDPOINT_IP=10.0.0.10\nDISK=/dev/sda\n");
        let path = write(
            dir.path(),
            "talconfig.yaml",
            indoc! {"
                # $COMMENTED_OUT is never substituted
                clusterName: ${CLUSTER_NAME:-lab}
                endpoint: https://${ENDPOINT_IP}:6443
                nodes:
                  - hostname: cp-1
                    ipAddress: 10.0.0.11
                    controlPlane: true
                    installDisk: $DISK
                    patches:
                      - '@./patches/cp-1.yaml'
            "},
        );

        let mut loader = Loader::new(&NoDecryptor, SubstitutionContext::new())
            .with_env_file(&dir.path().join("talenv.yaml"))
            .unwrap();
        let cluster = loader.load_cluster(&path).unwrap();

        assert_eq!(cluster.cluster_name, "lab");
        assert_eq!(cluster.endpoint, "https://10.0.0.10:6443");
        assert_eq!(cluster.talos_version, crate::constants::DEFAULT_TALOS_VERSION);
        assert_eq!(cluster.nodes[0].config.install_disk.as_deref(), Some("/dev/sda"));

        let absolute_dir = std::path::absolute(dir.path()).unwrap();
        assert_eq!(
            cluster.nodes[0].config.patches,
            vec![format!("@{}", absolute_dir.join("patches/cp-1.yaml").display())]
        );
    }

    #[test]
    fn decrypts_encrypted_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "talconfig.yaml",
            "clusterName: ENC[data]\nsops:\n  mac: ENC[mac]\n",
        );

        let decryptor = FixedDecryptor("clusterName: ${NAME}\nnodes: []\n");
        let mut loader = Loader::new(&decryptor, [("NAME", "secret-lab")].into_iter().collect());
        let cluster = loader.load_cluster(&path).unwrap();

        assert_eq!(cluster.cluster_name, "secret-lab");
    }

    #[test]
    fn unset_variable_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "talconfig.yaml", "clusterName: $UNSET\n");

        let error = Loader::new(&NoDecryptor, SubstitutionContext::new())
            .load_cluster(&path)
            .unwrap_err();
        assert!(matches!(error, Error::SubstituteDocument { .. }));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "talconfig.yaml", "nodes: [\n");

        let error = Loader::new(&NoDecryptor, SubstitutionContext::new())
            .load_cluster(&path)
            .unwrap_err();
        assert!(matches!(error, Error::DeserializeCluster { .. }));
    }

    #[test]
    fn missing_file_is_reported_with_path() {
        let error = Loader::new(&NoDecryptor, SubstitutionContext::new())
            .load_cluster(Path::new("/nonexistent/talconfig.yaml"))
            .unwrap_err();
        assert!(error.to_string().contains("/nonexistent/talconfig.yaml"));
    }
}
