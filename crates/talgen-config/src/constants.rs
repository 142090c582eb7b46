/// The Talos version used when the cluster description does not pin one.
pub const DEFAULT_TALOS_VERSION: &str = "v1.9.5";

/// The Kubernetes version used when the cluster description does not pin one.
pub const DEFAULT_KUBERNETES_VERSION: &str = "v1.32.3";

pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
pub const DEFAULT_POD_SUBNET: &str = "10.244.0.0/16";
pub const DEFAULT_SERVICE_SUBNET: &str = "10.96.0.0/12";

pub const INSTALLER_IMAGE_REPOSITORY: &str = "ghcr.io/siderolabs/installer";
pub const KUBELET_IMAGE_REPOSITORY: &str = "ghcr.io/siderolabs/kubelet";
pub const KUBERNETES_IMAGE_REGISTRY: &str = "registry.k8s.io";

/// File name of the client configuration written next to the machine configurations.
pub const CLIENT_CONFIG_FILE_NAME: &str = "talosconfig";
pub const GITIGNORE_FILE_NAME: &str = ".gitignore";

/// The control CLI every generated command invokes.
pub const CONTROL_CLI: &str = "talosctl";

/// Env var holding the log filter, see [`crate::logging::initialize_logging`].
pub const LOG_ENV: &str = "TALGEN_LOG";
