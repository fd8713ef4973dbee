//! vSphere provider
//!
//! Credentials and vCenter access, machine config validation, worker CAPI
//! objects, and the reconciler that sequences them.

pub mod credentials;
pub mod govc;
pub mod reconciler;
pub mod validator;
pub mod workers;

pub use credentials::{read_credentials, VSphereConnection, VSphereCredentials};
pub use govc::{GovcInventory, VSphereInventory};
pub use reconciler::{Reconciler, VSpherePhase};
pub use validator::{validate_structure, MachineConfigValidator, Validator};
pub use workers::workers_spec;
