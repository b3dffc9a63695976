//! Common types for Weld: the Bundle CRD, conditions, errors and the
//! resource dependency graph

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod graph;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the Weld CRDs
pub const API_GROUP: &str = "weld.dev";

/// Finalizer owned by the bundle controller.
///
/// Its presence guarantees that objects materialized by a Bundle are cleaned
/// up before the Bundle itself is allowed to go away.
pub const DELETE_RESOURCES_FINALIZER: &str = "weld.dev/deleteResources";

/// The platform-owned foreground deletion finalizer.
///
/// Weld only ever reads this one; it is added and removed by the API server
/// when foreground cascading deletion is requested.
pub const FOREGROUND_DELETION_FINALIZER: &str = "foregroundDeletion";

/// Field manager / user-agent style identity used for API writes
pub const CONTROLLER_NAME: &str = "weld-bundle-controller";
