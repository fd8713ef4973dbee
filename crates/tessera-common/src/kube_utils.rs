//! Shared Kubernetes utilities using kube-rs
//!
//! Helpers for addressing untyped objects, building clients from raw
//! kubeconfig bytes, and hashing content for stable resource names.

use std::time::Duration;

use kube::api::DynamicObject;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};

use crate::Error;

/// Connect timeout for clients built from a kubeconfig
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read timeout for clients built from a kubeconfig
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a kube client from raw kubeconfig YAML
///
/// Used for workload clusters, whose kubeconfig lives in a secret on the
/// management cluster rather than on disk.
pub async fn client_from_kubeconfig_yaml(yaml: &str) -> Result<Client, Error> {
    client_from_kubeconfig_yaml_with_timeout(yaml, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
        .await
}

/// Build a kube client from raw kubeconfig YAML with custom timeouts
pub async fn client_from_kubeconfig_yaml_with_timeout(
    yaml: &str,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|e| {
        Error::internal_with_context("create_client", format!("invalid kubeconfig: {}", e))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig: {}", e),
            )
        })?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use tessera_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("apps/v1");
/// assert_eq!(group, "apps");
/// assert_eq!(version, "v1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an `ApiResource` from an apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Resolve the `ApiResource` an untyped object belongs to
pub fn api_resource_of(obj: &DynamicObject) -> Result<ApiResource, Error> {
    let types = obj.types.as_ref().ok_or_else(|| {
        Error::serialization(format!(
            "object {} has no apiVersion/kind",
            obj.metadata.name.as_deref().unwrap_or("<unnamed>")
        ))
    })?;
    Ok(build_api_resource(&types.api_version, &types.kind))
}

/// Human-readable `Kind namespace/name` reference for logs and errors
pub fn describe_object(obj: &DynamicObject) -> String {
    let kind = obj
        .types
        .as_ref()
        .map(|t| t.kind.as_str())
        .unwrap_or("Unknown");
    let name = obj.metadata.name.as_deref().unwrap_or("<unnamed>");
    match obj.metadata.namespace.as_deref() {
        Some(ns) => format!("{} {}/{}", kind, ns, name),
        None => format!("{} {}", kind, name),
    }
}

/// Known plural forms for kinds the operator writes
const KIND_PLURALS: &[(&str, &str)] = &[
    ("machinedeployment", "machinedeployments"),
    ("kubeadmconfigtemplate", "kubeadmconfigtemplates"),
    ("vspheremachinetemplate", "vspheremachinetemplates"),
    ("vspheremachineconfig", "vspheremachineconfigs"),
    ("vspheredatacenterconfig", "vspheredatacenterconfigs"),
    ("tesseracluster", "tesseraclusters"),
    ("networkpolicy", "networkpolicies"),
    ("ingress", "ingresses"),
    ("endpoints", "endpoints"),
    ("ciliumnetworkpolicy", "ciliumnetworkpolicies"),
    ("ciliumclusterwidenetworkpolicy", "ciliumclusterwidenetworkpolicies"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for known types, falling back to simple
/// pluralization rules for unknown types.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 so names derived from it are stable across
/// toolchain versions.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
