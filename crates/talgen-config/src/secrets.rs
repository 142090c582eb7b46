//! The secrets bundle shared by every artifact of a run.
//!
//! Bundles use the layout of the `secrets.yaml` file written by `talosctl gen secrets`.
//! Certificates and keys are base64 encoded PEM blocks and are embedded into the machine
//! configurations and the client configuration exactly as they appear in the bundle.
use std::{cmp::Ordering, fmt::Display, path::Path, str::FromStr, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::instrument;

use crate::config::loader::{self, Loader};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read the secrets bundle"))]
    ReadBundle { source: loader::Error },

    #[snafu(display("failed to deserialize the secrets bundle in {path:?}"))]
    DeserializeBundle {
        source: serde_yaml::Error,
        path: std::path::PathBuf,
    },

    #[snafu(display("{field} is not valid base64"))]
    DecodeMaterial {
        source: base64::DecodeError,
        field: &'static str,
    },

    #[snafu(display("{field} is not a PEM encoded block"))]
    NotPem { field: &'static str },

    #[snafu(display("invalid version contract {input:?}, expected vMAJOR.MINOR"))]
    InvalidVersionContract { input: String },
}

/// The Talos version a bundle (and the configuration generated with it) is compatible with.
///
/// Features which change the shape of the generated machine configuration are gated on the
/// contract rather than on the exact Talos version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VersionContract {
    pub major: u64,
    pub minor: u64,
}

impl VersionContract {
    pub const fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    /// The node local Kubernetes API load balancer, enabled by default since v1.6.
    pub fn kube_prism_enabled(&self) -> bool {
        *self >= Self::new(1, 6)
    }

    /// The node local DNS cache, enabled by default since v1.7.
    pub fn host_dns_enabled(&self) -> bool {
        *self >= Self::new(1, 7)
    }

    /// Disk encryption and user volumes as separate documents, since v1.10.
    pub fn user_volumes_supported(&self) -> bool {
        *self >= Self::new(1, 10)
    }
}

impl PartialOrd for VersionContract {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionContract {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }
}

impl FromStr for VersionContract {
    type Err = Error;

    /// Accepts `v1.9`, `1.9` and full versions like `v1.9.5`, whose patch level is ignored.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let version = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let mut parts = version.split('.');

        let mut next_number = || parts.next().and_then(|part| part.parse::<u64>().ok());
        let major = next_number().context(InvalidVersionContractSnafu { input })?;
        let minor = next_number().context(InvalidVersionContractSnafu { input })?;

        Ok(Self { major, minor })
    }
}

impl Display for VersionContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{major}.{minor}", major = self.major, minor = self.minor)
    }
}

/// A base64 encoded certificate together with its private key.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct CertificateAndKey {
    pub crt: String,
    pub key: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct KeyOnly {
    pub key: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct ClusterSecrets {
    pub id: String,
    pub secret: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct Secrets {
    #[serde(rename = "bootstraptoken")]
    pub bootstrap_token: String,

    #[serde(rename = "secretboxencryptionsecret")]
    pub secretbox_encryption_secret: String,

    #[serde(
        default,
        rename = "aescbcencryptionsecret",
        skip_serializing_if = "Option::is_none"
    )]
    pub aescbc_encryption_secret: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct TrustdInfo {
    pub token: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct Certs {
    pub etcd: CertificateAndKey,
    pub k8s: CertificateAndKey,

    #[serde(rename = "k8saggregator")]
    pub k8s_aggregator: CertificateAndKey,

    #[serde(rename = "k8sserviceaccount")]
    pub k8s_service_account: KeyOnly,

    /// The machine CA, which is also the CA of the client configuration.
    pub os: CertificateAndKey,

    /// Client credentials from a previous run, reused so that existing client configurations
    /// keep working.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<CertificateAndKey>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsBundle {
    pub cluster: ClusterSecrets,
    pub secrets: Secrets,

    #[serde(rename = "trustdinfo")]
    pub trustd_info: TrustdInfo,

    pub certs: Certs,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_contract: Option<String>,
}

impl SecretsBundle {
    /// Reads the bundle at `path` through `loader`, so it may be encrypted and may use
    /// variables like any other document.
    #[instrument(skip(loader))]
    pub fn from_file(path: &Path, loader: &mut Loader<'_>) -> Result<Self, Error> {
        let text = loader.read_document(path).context(ReadBundleSnafu)?;
        let bundle = Self::from_yaml(&text).context(DeserializeBundleSnafu { path })?;
        bundle.check_material()?;

        tracing::debug!(cluster_id = %bundle.cluster.id, "loaded secrets bundle");
        Ok(bundle)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// The version contract of the bundle, falling back to the contract of `talos_version`
    /// when the bundle does not pin one.
    pub fn version_contract(&self, talos_version: &str) -> Result<VersionContract, Error> {
        self.version_contract
            .as_deref()
            .unwrap_or(talos_version)
            .parse()
    }

    /// Checks that every certificate and key is a base64 encoded PEM block.
    pub fn check_material(&self) -> Result<(), Error> {
        let certs = &self.certs;
        let mut material = vec![
            ("certs.etcd.crt", &certs.etcd.crt),
            ("certs.etcd.key", &certs.etcd.key),
            ("certs.k8s.crt", &certs.k8s.crt),
            ("certs.k8s.key", &certs.k8s.key),
            ("certs.k8saggregator.crt", &certs.k8s_aggregator.crt),
            ("certs.k8saggregator.key", &certs.k8s_aggregator.key),
            ("certs.k8sserviceaccount.key", &certs.k8s_service_account.key),
            ("certs.os.crt", &certs.os.crt),
            ("certs.os.key", &certs.os.key),
        ];
        if let Some(admin) = &certs.admin {
            material.push(("certs.admin.crt", &admin.crt));
            material.push(("certs.admin.key", &admin.key));
        }

        for (field, encoded) in material {
            let decoded = STANDARD
                .decode(encoded.trim())
                .context(DecodeMaterialSnafu { field })?;
            ensure!(decoded.starts_with(b"-----BEGIN "), NotPemSnafu { field });
        }

        Ok(())
    }

    /// Reuses the client credentials of an existing client configuration if it was issued by
    /// the machine CA of this bundle.
    ///
    /// Must be called before the bundle is shared, see [`Self::freeze`].
    pub fn reconcile_admin_credentials(&mut self, ca: &str, crt: &str, key: &str) -> bool {
        if ca != self.certs.os.crt {
            tracing::warn!("existing client configuration was issued by a different CA, ignoring it");
            return false;
        }

        self.certs.admin = Some(CertificateAndKey {
            crt: crt.to_owned(),
            key: key.to_owned(),
        });
        tracing::info!("reusing client credentials of the existing client configuration");
        true
    }

    /// Finishes preparing the bundle. From here on it is shared read only by every artifact.
    pub fn freeze(self) -> Arc<Self> {
        Arc::new(self)
    }
}
