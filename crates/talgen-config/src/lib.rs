//! Compiles one declarative cluster description into per-node machine configurations.
//!
//! The pipeline, in the order the modules are used:
//!
//! 1. [`config::loader`] reads the source document, decrypts it ([`secret`]), substitutes
//!    environment variables and resolves relative file references ([`substitution`]).
//! 2. [`validation`] classifies every problem of the loaded [`config::ClusterSpec`] as an error
//!    or a warning.
//! 3. [`config::merge`] folds the role defaults into every node.
//! 4. [`synthesis`] turns each merged node into a base machine configuration, which
//!    [`patch`] then patches.
//! 5. [`emission`] writes the per-node documents and the client configuration, [`command`]
//!    renders control CLI invocations for them.

pub mod command;
pub mod config;
pub mod constants;
pub mod emission;
pub mod logging;
pub mod patch;
pub mod secret;
pub mod secrets;
pub mod substitution;
pub mod synthesis;
pub mod validation;

// Internal re-exports
pub use talgen_shared as shared;
