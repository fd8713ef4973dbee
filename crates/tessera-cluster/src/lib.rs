//! Cluster reconciliation for Tessera
//!
//! This crate provides the phased reconciliation engine and the vSphere
//! reconciler built on it:
//! - [`phase`]: ordered phases with continue/stop/fail outcomes
//! - [`applier`]: converges a store toward a set of desired objects
//! - [`remote`]: cached clients for workload clusters
//! - [`vsphere`]: the vSphere phase sequence and its collaborators
//! - [`controller`]: kube-runtime glue

#![deny(missing_docs)]

pub mod applier;
pub mod capi;
pub mod cni;
pub mod config;
pub mod controller;
pub mod phase;
pub mod remote;
pub mod spec;
pub mod vsphere;

#[cfg(test)]
mod testing;

pub use applier::{ApplyReport, ObjectApplier};
pub use config::ControllerConfig;
pub use controller::{
    clusters_using_datacenter, clusters_using_machine_config, error_policy, reconcile, Context,
    ContextBuilder,
};
pub use phase::{PassResult, Phase, PhaseOutcome, PhaseRunner};
pub use remote::{ClientRegistry, RemoteClientRegistry};
pub use spec::{build_spec, ClusterSpec};

pub use tessera_common::{Error, Result};
