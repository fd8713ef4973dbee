//! Common types for Tessera: CRDs, errors, object stores, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod store;
pub mod telemetry;

pub use error::{ApplyFailure, Error};
pub use store::{ObjectKey, ObjectStore};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for Tessera system resources (credentials, CAPI objects, operator)
pub const TESSERA_SYSTEM_NAMESPACE: &str = "tessera-system";

/// Default field manager for server-side apply
pub const DEFAULT_FIELD_MANAGER: &str = "tessera-controller";

/// Label key marking resources managed by Tessera
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Label value for [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "tessera";
