//! The client configuration (`talosconfig`) of the control CLI.
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::{config::ClusterSpec, secrets::SecretsBundle};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read the client configuration {path:?}"))]
    ReadClientConfig {
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    #[snafu(display("failed to deserialize the client configuration {path:?}"))]
    DeserializeClientConfig {
        source: serde_yaml::Error,
        path: std::path::PathBuf,
    },
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct ClientConfig {
    /// The name of the active context.
    pub context: String,
    pub contexts: IndexMap<String, ClientContext>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct ClientContext {
    #[serde(default)]
    pub endpoints: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,

    /// The machine CA, identical to `machine.ca.crt` of every machine configuration.
    #[serde(default)]
    pub ca: String,

    #[serde(default)]
    pub crt: String,

    #[serde(default)]
    pub key: String,
}

impl ClientConfig {
    /// Builds the client configuration of `cluster`, with the control plane nodes as
    /// endpoints and every node as a target.
    pub fn from_bundle(cluster: &ClusterSpec, bundle: &SecretsBundle) -> Self {
        let endpoints = cluster
            .control_plane_nodes()
            .flat_map(|node| node.addresses())
            .map(str::to_owned)
            .collect();
        let nodes = cluster
            .nodes
            .iter()
            .flat_map(|node| node.addresses())
            .map(str::to_owned)
            .collect();

        let (crt, key) = match &bundle.certs.admin {
            Some(admin) => (admin.crt.clone(), admin.key.clone()),
            None => {
                tracing::warn!(
                    "secrets bundle has no client credentials, the client configuration only \
                     carries the CA"
                );
                Default::default()
            }
        };

        let context = ClientContext {
            endpoints,
            nodes,
            ca: bundle.certs.os.crt.clone(),
            crt,
            key,
        };
        Self {
            context: cluster.cluster_name.clone(),
            contexts: [(cluster.cluster_name.clone(), context)].into_iter().collect(),
        }
    }

    /// Reads an existing client configuration, `None` if there is none at `path`.
    pub fn read(path: &Path) -> Result<Option<Self>, Error> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error).context(ReadClientConfigSnafu { path }),
        };
        serde_yaml::from_str(&text)
            .map(Some)
            .context(DeserializeClientConfigSnafu { path })
    }

    pub fn active_context(&self) -> Option<&ClientContext> {
        self.contexts.get(&self.context)
    }
}

/// Reuses the client credentials of the client configuration at `path` for `cluster_name`, so
/// that they stay valid across runs.
///
/// Must run before the bundle is frozen.
pub fn reconcile_existing(
    bundle: &mut SecretsBundle,
    path: &Path,
    cluster_name: &str,
) -> Result<bool, Error> {
    let Some(existing) = ClientConfig::read(path)? else {
        return Ok(false);
    };
    let Some(context) = existing.contexts.get(cluster_name) else {
        tracing::debug!(?path, "existing client configuration has no context for this cluster");
        return Ok(false);
    };
    if context.crt.is_empty() || context.key.is_empty() {
        return Ok(false);
    }

    Ok(bundle.reconcile_admin_credentials(&context.ca, &context.crt, &context.key))
}
