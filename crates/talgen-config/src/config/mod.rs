//! The cluster description and how its layers are combined.
//!
//! # Layers
//!
//! Configuration can be given at two levels: once per role (the `controlPlane` and `worker`
//! sections, called *role defaults*) and once per node. Only nodes are ever realized into
//! machine configurations, but every node inherits the defaults of its role:
//!
//! ```yaml
//! clusterName: lab
//! endpoint: https://10.0.0.10:6443
//! controlPlane:
//!   patches:
//!     - "@./shared-ca.yaml"
//! nodes:
//!   - hostname: cp-1
//!     ipAddress: 10.0.0.11
//!     controlPlane: true
//!     installDisk: /dev/sda
//!     patches:
//!       - "@./cp-1.yaml"
//! ```
//!
//! `cp-1` above ends up with both patches, the role default first. See [`merge`] for the exact
//! rules, [`loader`] for how the document is read.

pub mod loader;
pub mod merge;
pub mod model;

pub use model::*;
